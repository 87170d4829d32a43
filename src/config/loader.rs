//! Configuration loading and config-file discovery

use std::path::{Path, PathBuf};

use super::types::{validate_unique_proxy_users, Config};
use crate::error::{ProxyError, Result};

/// Outcome of config-file discovery: the chosen path, where it came from,
/// and every location that was checked (for diagnostics).
#[derive(Debug, Clone)]
pub struct ConfigResolution {
    pub path: PathBuf,
    pub source: String,
    pub checked: Vec<PathBuf>,
}

/// Load and validate a config file.
pub fn load(path: &Path) -> Result<Config> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| ProxyError::Config(format!("read config {}: {}", path.display(), e)))?;

    let mut cfg: Config = serde_yaml::from_str(&raw)?;
    if cfg.profiles.is_empty() {
        return Err(ProxyError::Config("config has no profiles".into()));
    }

    let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
    for profile in &mut cfg.profiles {
        profile.apply_defaults();
        profile.resolve_relative_paths(base_dir);
    }
    for profile in &cfg.profiles {
        profile
            .validate()
            .map_err(|e| ProxyError::Config(format!("profile {:?}: {}", profile.name, e)))?;
    }
    validate_unique_proxy_users(&cfg.profiles)?;

    Ok(cfg)
}

/// Locate the config file when --config was not passed.
///
/// Search order: working directory, its parent, the executable's directory,
/// its parent, then ~/.config/rds-iam-proxy/config.yaml.
pub fn resolve_config_path(flag_path: Option<&Path>) -> Result<ConfigResolution> {
    resolve_with(
        flag_path,
        std::env::current_dir().ok(),
        std::env::current_exe().ok().and_then(|p| p.parent().map(Path::to_path_buf)),
        std::env::var_os("HOME").map(PathBuf::from),
    )
}

fn resolve_with(
    flag_path: Option<&Path>,
    cwd: Option<PathBuf>,
    exe_dir: Option<PathBuf>,
    home: Option<PathBuf>,
) -> Result<ConfigResolution> {
    let mut checked: Vec<PathBuf> = Vec::new();

    if let Some(flag) = flag_path {
        let path = if flag.is_absolute() {
            flag.to_path_buf()
        } else {
            cwd.as_deref().unwrap_or_else(|| Path::new(".")).join(flag)
        };
        checked.push(path.clone());
        return Ok(ConfigResolution {
            path,
            source: "flag --config".into(),
            checked,
        });
    }

    if let Some(cwd) = cwd {
        for (dir, source) in dir_and_parent(&cwd, "current working directory", "parent directory") {
            let candidate = dir.join("config.yaml");
            checked.push(candidate.clone());
            if candidate.is_file() {
                return Ok(ConfigResolution {
                    path: candidate,
                    source,
                    checked,
                });
            }
        }
    }

    if let Some(exe_dir) = exe_dir {
        for (dir, source) in dir_and_parent(&exe_dir, "executable directory", "executable parent directory") {
            let candidate = dir.join("config.yaml");
            checked.push(candidate.clone());
            if candidate.is_file() {
                return Ok(ConfigResolution {
                    path: candidate,
                    source,
                    checked,
                });
            }
        }
    }

    if let Some(home) = home {
        let candidate = home.join(".config").join("rds-iam-proxy").join("config.yaml");
        checked.push(candidate.clone());
        if candidate.is_file() {
            return Ok(ConfigResolution {
                path: candidate,
                source: "home config".into(),
                checked,
            });
        }
    }

    let listed: Vec<String> = checked.iter().map(|p| p.display().to_string()).collect();
    Err(ProxyError::Config(format!(
        "config file not found; checked: {}; use --config <path> or create config.yaml in \
         cwd/cwd-parent, executable-dir/executable-parent, or ~/.config/rds-iam-proxy/config.yaml",
        listed.join(", ")
    )))
}

fn dir_and_parent(start: &Path, here: &str, above: &str) -> Vec<(PathBuf, String)> {
    let mut out = vec![(start.to_path_buf(), here.to_string())];
    if let Some(parent) = start.parent() {
        if parent != start {
            out.push((parent.to_path_buf(), format!("{} ({})", above, parent.display())));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("config.yaml");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(body.as_bytes()).unwrap();
        path
    }

    const MINIMAL: &str = r#"
profiles:
  - name: one
    proxy_user: local_one
    proxy_password: pw
    rds_host: db.example
    rds_region: eu-west-1
    rds_db_user: app
    ca_bundle: bundle.pem
"#;

    #[test]
    fn test_load_applies_defaults_and_resolves_ca_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(dir.path(), MINIMAL);

        let cfg = load(&path).unwrap();
        let p = &cfg.profiles[0];
        assert_eq!(p.listen_addr, "127.0.0.1:3307");
        assert_eq!(p.rds_port, 3306);
        assert_eq!(p.max_conns, 20);
        assert_eq!(p.ca_bundle, dir.path().join("bundle.pem"));
    }

    #[test]
    fn test_load_rejects_empty_profiles() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(dir.path(), "profiles: []\n");
        assert!(load(&path).is_err());
    }

    #[test]
    fn test_load_error_names_bad_profile() {
        let dir = tempfile::tempdir().unwrap();
        let body = MINIMAL.replace("rds_region: eu-west-1\n", "");
        let path = write_config(dir.path(), &body);
        let err = load(&path).unwrap_err().to_string();
        assert!(err.contains("one"), "error should name the profile: {}", err);
        assert!(err.contains("rds_region"));
    }

    #[test]
    fn test_load_rejects_duplicate_proxy_users() {
        let dir = tempfile::tempdir().unwrap();
        let body = format!(
            "{}  - name: two\n    listen_addr: \"127.0.0.1:3308\"\n    proxy_user: local_one\n    \
             proxy_password: pw\n    rds_host: db2.example\n    rds_region: eu-west-1\n    \
             rds_db_user: app2\n    ca_bundle: bundle.pem\n",
            MINIMAL
        );
        let path = write_config(dir.path(), &body);
        let err = load(&path).unwrap_err().to_string();
        assert!(err.contains("local_one"));
    }

    #[test]
    fn test_resolve_flag_path_wins() {
        let res = resolve_with(
            Some(Path::new("/etc/proxy/config.yaml")),
            Some(PathBuf::from("/ignored")),
            None,
            None,
        )
        .unwrap();
        assert_eq!(res.path, PathBuf::from("/etc/proxy/config.yaml"));
        assert_eq!(res.source, "flag --config");
    }

    #[test]
    fn test_resolve_finds_cwd_config() {
        let dir = tempfile::tempdir().unwrap();
        write_config(dir.path(), MINIMAL);

        let res = resolve_with(None, Some(dir.path().to_path_buf()), None, None).unwrap();
        assert_eq!(res.path, dir.path().join("config.yaml"));
        assert_eq!(res.source, "current working directory");
    }

    #[test]
    fn test_resolve_finds_parent_config() {
        let dir = tempfile::tempdir().unwrap();
        write_config(dir.path(), MINIMAL);
        let child = dir.path().join("sub");
        std::fs::create_dir(&child).unwrap();

        let res = resolve_with(None, Some(child), None, None).unwrap();
        assert_eq!(res.path, dir.path().join("config.yaml"));
        assert!(res.source.starts_with("parent directory"));
    }

    #[test]
    fn test_resolve_falls_back_to_home() {
        let home = tempfile::tempdir().unwrap();
        let cfg_dir = home.path().join(".config").join("rds-iam-proxy");
        std::fs::create_dir_all(&cfg_dir).unwrap();
        write_config(&cfg_dir, MINIMAL);

        let missing = tempfile::tempdir().unwrap();
        let res = resolve_with(
            None,
            Some(missing.path().to_path_buf()),
            None,
            Some(home.path().to_path_buf()),
        )
        .unwrap();
        assert_eq!(res.source, "home config");
    }

    #[test]
    fn test_resolve_error_lists_checked_paths() {
        let dir = tempfile::tempdir().unwrap();
        let err = resolve_with(None, Some(dir.path().to_path_buf()), None, None)
            .unwrap_err()
            .to_string();
        assert!(err.contains("config.yaml"));
        assert!(err.contains(&dir.path().display().to_string()));
    }
}
