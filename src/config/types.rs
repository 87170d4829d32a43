//! Configuration types

use std::net::SocketAddr;
use std::path::PathBuf;

use serde::Deserialize;

use crate::error::{ProxyError, Result};

pub(crate) const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:3307";
pub(crate) const DEFAULT_RDS_PORT: u16 = 3306;
pub(crate) const DEFAULT_MAX_CONNS: usize = 20;

/// Upper bound on per-profile concurrent client connections, regardless of
/// configuration or CLI overrides.
pub const MAX_CONNS_HARD_LIMIT: usize = 200;

/// Root configuration structure
///
/// ```yaml
/// profiles:
///   - name: staging
///     listen_addr: "127.0.0.1:3307"
///     proxy_user: staging_local
///     proxy_password: "not-the-db-password"
///     rds_host: staging.cluster-abc.eu-west-1.rds.amazonaws.com
///     rds_region: eu-west-1
///     rds_db_user: app_rw
///     ca_bundle: rds-ca-bundle.pem
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Proxy instances, one listener each
    #[serde(default)]
    pub profiles: Vec<Profile>,
}

/// One proxy instance: a local listener bridged to one RDS endpoint.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Profile {
    /// Unique profile name
    #[serde(default)]
    pub name: String,
    /// Loopback host:port to listen on
    #[serde(default)]
    pub listen_addr: String,
    /// Cap on concurrent client connections (1..=200)
    #[serde(default)]
    pub max_conns: usize,
    /// Username desktop clients authenticate with
    #[serde(default)]
    pub proxy_user: String,
    /// Password desktop clients authenticate with
    #[serde(default)]
    pub proxy_password: String,
    /// RDS endpoint hostname (also the TLS verification identity)
    #[serde(default)]
    pub rds_host: String,
    /// RDS endpoint port
    #[serde(default)]
    pub rds_port: u16,
    /// AWS region the endpoint lives in
    #[serde(default)]
    pub rds_region: String,
    /// Database user authenticated via IAM on the backend
    #[serde(default)]
    pub rds_db_user: String,
    /// Named AWS credential profile (shared config), if any
    #[serde(default)]
    pub aws_profile: Option<String>,
    /// Schema selected on backend connect, if any
    #[serde(default)]
    pub default_db: Option<String>,
    /// PEM trust bundle used to verify the backend certificate
    #[serde(default)]
    pub ca_bundle: PathBuf,
}

impl Config {
    /// Select one profile by name, or the only configured profile.
    pub fn select_profile(&self, name: &str) -> Result<&Profile> {
        if !name.is_empty() {
            return self
                .profiles
                .iter()
                .find(|p| p.name == name)
                .ok_or_else(|| ProxyError::Config(format!("profile {:?} not found", name)));
        }
        if self.profiles.len() == 1 {
            return Ok(&self.profiles[0]);
        }
        let names: Vec<&str> = self.profiles.iter().map(|p| p.name.as_str()).collect();
        Err(ProxyError::Config(format!(
            "multiple profiles configured; pass --profile <name>. available: {}",
            names.join(", ")
        )))
    }
}

impl Profile {
    /// Backend endpoint as host:port
    pub fn backend_addr(&self) -> String {
        format!("{}:{}", self.rds_host, self.rds_port)
    }

    pub(crate) fn apply_defaults(&mut self) {
        if self.listen_addr.is_empty() {
            self.listen_addr = DEFAULT_LISTEN_ADDR.to_string();
        }
        if self.rds_port == 0 {
            self.rds_port = DEFAULT_RDS_PORT;
        }
        if self.max_conns == 0 {
            self.max_conns = DEFAULT_MAX_CONNS;
        }
        // Treat an explicitly-empty aws_profile the same as an absent one.
        if self.aws_profile.as_deref() == Some("") {
            self.aws_profile = None;
        }
        if self.default_db.as_deref() == Some("") {
            self.default_db = None;
        }
    }

    pub(crate) fn resolve_relative_paths(&mut self, base_dir: &std::path::Path) {
        if !self.ca_bundle.as_os_str().is_empty() && self.ca_bundle.is_relative() {
            self.ca_bundle = base_dir.join(&self.ca_bundle);
        }
    }

    /// Structural validation performed at config load.
    pub(crate) fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(ProxyError::Config("name is required".into()));
        }
        if self.proxy_user.is_empty() {
            return Err(ProxyError::Config("proxy_user is required".into()));
        }
        if self.max_conns < 1 {
            return Err(ProxyError::Config("max_conns must be >= 1".into()));
        }
        if self.max_conns > MAX_CONNS_HARD_LIMIT {
            return Err(ProxyError::Config(format!(
                "max_conns must be <= {}",
                MAX_CONNS_HARD_LIMIT
            )));
        }
        if self.rds_host.is_empty() {
            return Err(ProxyError::Config("rds_host is required".into()));
        }
        if self.rds_region.is_empty() {
            return Err(ProxyError::Config("rds_region is required".into()));
        }
        if self.rds_db_user.is_empty() {
            return Err(ProxyError::Config("rds_db_user is required".into()));
        }
        if self.proxy_user == self.rds_db_user {
            return Err(ProxyError::Config(
                "proxy_user and rds_db_user must be different".into(),
            ));
        }
        if self.ca_bundle.as_os_str().is_empty() {
            return Err(ProxyError::Config("ca_bundle is required".into()));
        }
        if self.listen_addr.parse::<SocketAddr>().is_err() {
            return Err(ProxyError::Config(format!(
                "invalid listen_addr {:?}: expected ip:port",
                self.listen_addr
            )));
        }
        Ok(())
    }

    /// Validation of facts only knowable at startup time.
    pub fn validate_runtime(&self, allow_dev_empty_password: bool) -> Result<()> {
        if self.proxy_password.is_empty() && !allow_dev_empty_password {
            return Err(ProxyError::Config("proxy_password is empty".into()));
        }
        if self.proxy_password == "change-me" || self.proxy_password == "change-me-too" {
            return Err(ProxyError::Config(
                "proxy_password must not use example default value".into(),
            ));
        }
        if !self.listens_on_loopback() {
            return Err(ProxyError::Config(format!(
                "listen_addr {:?} is not loopback",
                self.listen_addr
            )));
        }
        if std::fs::metadata(&self.ca_bundle).is_err() {
            return Err(ProxyError::Config(format!(
                "ca_bundle not readable: {}",
                self.ca_bundle.display()
            )));
        }
        Ok(())
    }

    fn listens_on_loopback(&self) -> bool {
        self.listen_addr
            .parse::<SocketAddr>()
            .map(|addr| addr.ip().is_loopback())
            .unwrap_or(false)
    }
}

/// Reject proxy_user values shared between profiles. Each local username maps
/// to exactly one backend identity so clients cannot land on the wrong one.
pub(crate) fn validate_unique_proxy_users(profiles: &[Profile]) -> Result<()> {
    let mut seen: std::collections::HashMap<&str, &str> = std::collections::HashMap::new();
    for p in profiles {
        if let Some(prev) = seen.insert(&p.proxy_user, &p.name) {
            return Err(ProxyError::Config(format!(
                "proxy_user {:?} is reused by profiles {:?} and {:?}; use unique proxy_user values per profile",
                p.proxy_user, prev, p.name
            )));
        }
    }
    Ok(())
}

/// Reject listen_addr values shared between the profiles selected for this run.
pub fn validate_unique_listen_addrs(profiles: &[Profile]) -> Result<()> {
    let mut seen: std::collections::HashMap<&str, &str> = std::collections::HashMap::new();
    for p in profiles {
        if let Some(prev) = seen.insert(&p.listen_addr, &p.name) {
            return Err(ProxyError::Config(format!(
                "listen_addr {:?} is reused by profiles {:?} and {:?}",
                p.listen_addr, prev, p.name
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_profile() -> Profile {
        let mut p = Profile {
            name: "p1".into(),
            proxy_user: "local_user".into(),
            proxy_password: "secret".into(),
            rds_host: "db.example".into(),
            rds_region: "eu-west-1".into(),
            rds_db_user: "db_user".into(),
            ca_bundle: PathBuf::from("/tmp/bundle.pem"),
            ..Profile::default()
        };
        p.apply_defaults();
        p
    }

    #[test]
    fn test_defaults_applied() {
        let p = valid_profile();
        assert_eq!(p.listen_addr, DEFAULT_LISTEN_ADDR);
        assert_eq!(p.rds_port, DEFAULT_RDS_PORT);
        assert_eq!(p.max_conns, DEFAULT_MAX_CONNS);
    }

    #[test]
    fn test_valid_profile_passes() {
        assert!(valid_profile().validate().is_ok());
    }

    #[test]
    fn test_same_proxy_and_db_user_rejected() {
        let mut p = valid_profile();
        p.proxy_user = "shared".into();
        p.rds_db_user = "shared".into();
        assert!(p.validate().is_err());
    }

    #[test]
    fn test_max_conns_above_hard_limit_rejected() {
        let mut p = valid_profile();
        p.max_conns = MAX_CONNS_HARD_LIMIT + 1;
        let err = p.validate().unwrap_err();
        assert!(err.to_string().contains("200"));
    }

    #[test]
    fn test_hostname_listen_addr_rejected() {
        let mut p = valid_profile();
        p.listen_addr = "localhost:3307".into();
        assert!(p.validate().is_err());
    }

    #[test]
    fn test_non_loopback_listen_addr_fails_runtime_validation() {
        let mut p = valid_profile();
        p.listen_addr = "0.0.0.0:3307".into();
        assert!(p.validate().is_ok());
        assert!(p.validate_runtime(true).is_err());
    }

    #[test]
    fn test_loopback_runtime_validation_checks_ca_bundle() {
        let dir = tempfile::tempdir().unwrap();
        let bundle = dir.path().join("ca.pem");
        std::fs::write(&bundle, "not-a-cert").unwrap();

        let mut p = valid_profile();
        p.ca_bundle = bundle.clone();
        assert!(p.validate_runtime(false).is_ok());

        p.ca_bundle = dir.path().join("missing.pem");
        assert!(p.validate_runtime(false).is_err());
    }

    #[test]
    fn test_empty_password_needs_dev_flag() {
        let dir = tempfile::tempdir().unwrap();
        let bundle = dir.path().join("ca.pem");
        std::fs::write(&bundle, "x").unwrap();

        let mut p = valid_profile();
        p.ca_bundle = bundle;
        p.proxy_password = String::new();
        assert!(p.validate_runtime(false).is_err());
        assert!(p.validate_runtime(true).is_ok());
    }

    #[test]
    fn test_placeholder_password_rejected() {
        let mut p = valid_profile();
        p.proxy_password = "change-me".into();
        assert!(p.validate_runtime(true).is_err());
    }

    #[test]
    fn test_duplicate_proxy_users_rejected() {
        let mut a = valid_profile();
        let mut b = valid_profile();
        b.name = "p2".into();
        b.listen_addr = "127.0.0.1:3308".into();
        assert!(validate_unique_proxy_users(&[a.clone(), b.clone()]).is_err());

        b.proxy_user = "other_user".into();
        a.name = "p1".into();
        assert!(validate_unique_proxy_users(&[a, b]).is_ok());
    }

    #[test]
    fn test_duplicate_listen_addrs_rejected() {
        let a = valid_profile();
        let mut b = valid_profile();
        b.name = "p2".into();
        b.proxy_user = "other".into();
        assert!(validate_unique_listen_addrs(&[a.clone(), b.clone()]).is_err());

        b.listen_addr = "127.0.0.1:3400".into();
        assert!(validate_unique_listen_addrs(&[a, b]).is_ok());
    }

    #[test]
    fn test_select_profile_by_name() {
        let cfg = Config {
            profiles: vec![valid_profile()],
        };
        assert_eq!(cfg.select_profile("p1").unwrap().name, "p1");
        assert!(cfg.select_profile("nope").is_err());
        // Single profile auto-selects.
        assert_eq!(cfg.select_profile("").unwrap().name, "p1");
    }

    #[test]
    fn test_select_profile_ambiguous_lists_names() {
        let mut b = valid_profile();
        b.name = "p2".into();
        b.proxy_user = "other".into();
        let cfg = Config {
            profiles: vec![valid_profile(), b],
        };
        let err = cfg.select_profile("").unwrap_err().to_string();
        assert!(err.contains("p1") && err.contains("p2"));
    }
}
