//! Multi-profile supervisor
//!
//! Builds one pool + factory + proxy server per selected profile and runs
//! them under a shared cancellation scope. The first instance to fail takes
//! the whole process down: its error is logged, the scope is cancelled so
//! every other instance drains, and the supervisor returns the error.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::Profile;
use crate::error::{ProxyError, Result};
use crate::server::{BackendFactory, BackendPool, ProxyServer};
use crate::token::TokenCache;

/// Knobs shared by every proxy instance in one run.
#[derive(Debug, Clone)]
pub struct RuntimeSettings {
    /// Prewarmed backend sessions per profile
    pub pool_size: usize,
    /// Maximum pooled session age before lazy replacement
    pub pool_max_age: Duration,
    /// Backend connect timeout (also the pool refill timeout)
    pub connect_timeout: Duration,
    /// Graceful drain window before force-closing sessions
    pub shutdown_timeout: Duration,
    /// Per-profile max concurrent clients; 0 keeps each profile's own value
    pub max_conns_override: usize,
}

/// Run every selected profile until shutdown or first failure.
pub async fn run(
    profiles: Vec<Profile>,
    settings: RuntimeSettings,
    tokens: Arc<TokenCache>,
    shutdown: CancellationToken,
) -> Result<()> {
    let mut instances: JoinSet<(String, Result<()>)> = JoinSet::new();

    for profile in profiles {
        let factory =
            BackendFactory::new(profile.clone(), Arc::clone(&tokens), settings.connect_timeout)
                .map_err(|e| {
                    ProxyError::Config(format!("profile {:?}: backend factory: {}", profile.name, e))
                })?;

        let pool = Arc::new(BackendPool::new(
            settings.pool_size,
            settings.pool_max_age,
            settings.connect_timeout,
            Arc::new(factory),
        ));
        pool.start();

        let max_conns = if settings.max_conns_override > 0 {
            settings.max_conns_override
        } else {
            profile.max_conns
        };
        let name = profile.name.clone();
        let server = Arc::new(ProxyServer::new(
            profile,
            pool,
            settings.shutdown_timeout,
            max_conns,
        ));

        let scope = shutdown.child_token();
        instances.spawn(async move { (name, server.run(scope).await) });
    }

    let mut first_error: Option<ProxyError> = None;
    while let Some(joined) = instances.join_next().await {
        match joined {
            Ok((_, Ok(()))) => {}
            Ok((name, Err(e))) => {
                error!(profile = %name, error = %e, "proxy stopped with error");
                if first_error.is_none() {
                    first_error = Some(ProxyError::Connection(format!("profile {}: {}", name, e)));
                }
                // Bring the remaining instances down too.
                shutdown.cancel();
            }
            Err(join_err) => {
                error!(error = %join_err, "proxy task aborted");
                if first_error.is_none() {
                    first_error = Some(ProxyError::Connection(join_err.to_string()));
                }
                shutdown.cancel();
            }
        }
    }

    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Two-stage interrupt handling: the first SIGINT/SIGTERM starts a graceful
/// shutdown, the second forces the process down with exit code 130.
pub fn spawn_signal_handler(shutdown: CancellationToken) {
    tokio::spawn(async move {
        wait_for_interrupt().await;
        info!("interrupt received, starting graceful shutdown (interrupt again to force exit)");
        shutdown.cancel();

        wait_for_interrupt().await;
        info!("second interrupt received, forcing exit");
        std::process::exit(130);
    });
}

async fn wait_for_interrupt() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(term) => term,
            Err(e) => {
                warn!(error = %e, "SIGTERM handler unavailable, watching Ctrl+C only");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> RuntimeSettings {
        RuntimeSettings {
            pool_size: 1,
            pool_max_age: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(1),
            shutdown_timeout: Duration::from_secs(1),
            max_conns_override: 0,
        }
    }

    #[tokio::test]
    async fn test_unreadable_ca_bundle_is_startup_fatal() {
        let profile = Profile {
            name: "broken".into(),
            listen_addr: "127.0.0.1:0".into(),
            max_conns: 5,
            proxy_user: "local".into(),
            proxy_password: "pw".into(),
            rds_host: "db.example".into(),
            rds_port: 3306,
            rds_region: "eu-west-1".into(),
            rds_db_user: "app".into(),
            ca_bundle: "/nonexistent/bundle.pem".into(),
            ..Profile::default()
        };

        let tokens = Arc::new(TokenCache::new(
            Duration::from_secs(300),
            Duration::from_secs(900),
        ));
        let err = run(vec![profile], settings(), tokens, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::Config(_)), "got {:?}", err);
        assert!(err.to_string().contains("broken"));
    }

    #[tokio::test]
    async fn test_no_profiles_is_a_clean_run() {
        let tokens = Arc::new(TokenCache::new(
            Duration::from_secs(300),
            Duration::from_secs(900),
        ));
        run(Vec::new(), settings(), tokens, CancellationToken::new())
            .await
            .unwrap();
    }
}
