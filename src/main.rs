//! rds-iam-proxy - Loopback MySQL proxy for RDS IAM authentication
//!
//! Binds one local listener per selected profile, authenticates desktop
//! clients with static credentials, and bridges them onto TLS backend
//! sessions authenticated with short-lived IAM tokens.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use rds_iam_proxy::config::{self, MAX_CONNS_HARD_LIMIT};
use rds_iam_proxy::{supervisor, Profile, RuntimeSettings, TokenCache};

/// Tokens younger than this are served from the cache.
const TOKEN_REFRESH_BEFORE: Duration = Duration::from_secs(5 * 60);
/// Cache-side token lifetime; matches the RDS-side 15 minute window.
const TOKEN_TTL: Duration = Duration::from_secs(15 * 60);
/// Pooled sessions older than this are replaced on borrow. Kept below the
/// token lifetime so a pooled session never outlives its credential.
const POOL_MAX_AGE: Duration = Duration::from_secs(14 * 60);

#[derive(Parser)]
#[command(name = "rds-iam-proxy")]
#[command(version)]
#[command(about = "Loopback MySQL proxy that authenticates to RDS with IAM tokens")]
struct Cli {
    /// Path to config YAML (searched for when omitted)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Profile name from config
    #[arg(long, conflicts_with_all = ["profiles", "all_profiles"])]
    profile: Option<String>,

    /// Comma-separated profile names to run together
    #[arg(long, conflicts_with = "all_profiles")]
    profiles: Option<String>,

    /// Run all configured profiles
    #[arg(long)]
    all_profiles: bool,

    /// Log level: debug|info|warn|error
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Shorthand for --log-level debug
    #[arg(short, long)]
    verbose: bool,

    /// Mint IAM token metadata per profile and exit
    #[arg(long)]
    dry_run: bool,

    /// Allow empty proxy_password (dev only)
    #[arg(long)]
    allow_dev_empty_password: bool,

    /// Number of pre-warmed backend connections per profile
    #[arg(long, default_value_t = 5)]
    pool_size: usize,

    /// Override max concurrent client connections (0 = use profile value)
    #[arg(long, default_value_t = 0)]
    max_conns: usize,

    /// Graceful shutdown timeout in seconds
    #[arg(long, default_value_t = 30)]
    shutdown_timeout_secs: u64,

    /// Backend connect timeout in seconds
    #[arg(long, default_value_t = 8)]
    connect_timeout_secs: u64,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        "debug".to_string()
    } else {
        std::env::var("RUST_LOG").unwrap_or_else(|_| cli.log_level.clone())
    };
    tracing_subscriber::fmt().with_env_filter(log_level).init();

    if let Err(e) = run(cli).await {
        error!(error = %e, "exiting");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> rds_iam_proxy::Result<()> {
    if cli.max_conns > MAX_CONNS_HARD_LIMIT {
        return Err(rds_iam_proxy::ProxyError::Config(format!(
            "--max-conns {} exceeds hard limit {}",
            cli.max_conns, MAX_CONNS_HARD_LIMIT
        )));
    }

    let resolution = config::resolve_config_path(cli.config.as_deref())?;
    info!(path = %resolution.path.display(), source = %resolution.source, "config resolved");
    for checked in &resolution.checked {
        debug!(path = %checked.display(), "config lookup checked");
    }

    let cfg = config::load(&resolution.path)?;
    let selected = select_profiles(&cfg, &cli)?;
    config::validate_unique_listen_addrs(&selected)?;
    for profile in &selected {
        profile
            .validate_runtime(cli.allow_dev_empty_password)
            .map_err(|e| {
                rds_iam_proxy::ProxyError::Config(format!("profile {:?}: {}", profile.name, e))
            })?;
    }

    let tokens = Arc::new(TokenCache::new(TOKEN_REFRESH_BEFORE, TOKEN_TTL));

    if cli.dry_run {
        return dry_run(&tokens, &selected).await;
    }

    let settings = RuntimeSettings {
        pool_size: cli.pool_size,
        pool_max_age: POOL_MAX_AGE,
        connect_timeout: Duration::from_secs(cli.connect_timeout_secs),
        shutdown_timeout: Duration::from_secs(cli.shutdown_timeout_secs),
        max_conns_override: cli.max_conns,
    };

    let shutdown = CancellationToken::new();
    supervisor::spawn_signal_handler(shutdown.clone());
    supervisor::run(selected, settings, tokens, shutdown).await
}

fn select_profiles(cfg: &rds_iam_proxy::Config, cli: &Cli) -> rds_iam_proxy::Result<Vec<Profile>> {
    if let Some(ref name) = cli.profile {
        return Ok(vec![cfg.select_profile(name)?.clone()]);
    }
    if let Some(ref csv) = cli.profiles {
        let names: Vec<&str> = csv
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect();
        if names.is_empty() {
            return Err(rds_iam_proxy::ProxyError::Config(
                "--profiles provided but empty".into(),
            ));
        }
        let mut out = Vec::with_capacity(names.len());
        let mut seen = std::collections::HashSet::new();
        for name in names {
            if seen.insert(name) {
                out.push(cfg.select_profile(name)?.clone());
            }
        }
        return Ok(out);
    }
    if cli.all_profiles {
        return Ok(cfg.profiles.clone());
    }
    // No selection flag: a lone profile runs, anything else is ambiguous.
    Ok(vec![cfg.select_profile("")?.clone()])
}

/// Mint one token per profile and print its metadata without serving.
async fn dry_run(tokens: &TokenCache, profiles: &[Profile]) -> rds_iam_proxy::Result<()> {
    for profile in profiles {
        let token = tokio::time::timeout(Duration::from_secs(10), tokens.get(profile))
            .await
            .map_err(|_| {
                rds_iam_proxy::ProxyError::Timeout(format!("dry-run mint for {}", profile.name))
            })??;

        let digest = Sha256::digest(token.value.as_bytes());
        let prefix: String = digest.iter().take(6).map(|b| format!("{:02x}", b)).collect();
        println!(
            "profile={} token_len={} token_sha256_prefix={} expires_at={}",
            profile.name,
            token.value.len(),
            prefix,
            token.expires_at.to_rfc3339(),
        );
    }
    Ok(())
}
