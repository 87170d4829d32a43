//! rds-iam-proxy - Loopback MySQL proxy for RDS IAM authentication
//!
//! Desktop MySQL clients authenticate against this proxy with a static
//! local username/password; the proxy mints short-lived IAM auth tokens,
//! opens TLS-verified sessions to the RDS endpoint, and relays raw MySQL
//! wire bytes in both directions for the life of each client connection.
//!
//! The library is organized around four subsystems:
//! - [`token`]: per-profile IAM token cache with provider memoization
//! - [`server::pool`]: prewarmed single-use backend session pool
//! - [`server::proxy`]: per-profile accept loop, workers, and byte pipe
//! - [`supervisor`]: multi-profile runner under one cancellation scope

#[macro_use]
mod logging;

pub mod config;
pub mod error;
pub mod protocol;
pub mod server;
pub mod supervisor;
pub mod tls;
pub mod token;

pub use config::{Config, Profile};
pub use error::{ProxyError, Result};
pub use server::{BackendConn, BackendConnector, BackendFactory, BackendPool, ProxyServer};
pub use supervisor::RuntimeSettings;
pub use token::{CachedToken, TokenCache};
