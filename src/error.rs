//! Error types for rds-iam-proxy

use thiserror::Error;

/// Main error type for the proxy
#[derive(Error, Debug)]
pub enum ProxyError {
    /// I/O error (network, file)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// MySQL protocol error
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Authentication error (client-facing or backend-facing)
    #[error("Authentication error: {0}")]
    Auth(String),

    /// Connection error
    #[error("Connection error: {0}")]
    Connection(String),

    /// Timeout error
    #[error("Timeout: {0}")]
    Timeout(String),

    /// IAM token minting failure
    #[error("Token error: {0}")]
    Token(String),

    /// TLS configuration or handshake failure
    #[error("TLS error: {0}")]
    Tls(String),

    /// Operation aborted by shutdown
    #[error("operation canceled")]
    Canceled,
}

/// Result type alias for ProxyError
pub type Result<T> = std::result::Result<T, ProxyError>;

impl From<serde_yaml::Error> for ProxyError {
    fn from(err: serde_yaml::Error) -> Self {
        ProxyError::Config(err.to_string())
    }
}

/// Reduce an error to its first line, trimmed.
///
/// Pool discard reasons and prewarm failures are logged on hot-ish paths;
/// multi-line SDK errors would flood the log otherwise.
pub fn compact_err(err: &dyn std::fmt::Display) -> String {
    let msg = err.to_string();
    match msg.split_once('\n') {
        Some((first, _)) => first.trim().to_string(),
        None => msg.trim().to_string(),
    }
}
