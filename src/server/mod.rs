//! Connection-handling engine
//!
//! This module contains:
//! - Client-facing MySQL handshake
//! - Backend session factory
//! - Prewarmed backend pool
//! - Session tracker
//! - Per-profile proxy server (accept loop, workers, byte pipe)
//! - Network stream abstraction (TCP/TLS)

pub mod backend;
pub mod handshake;
pub mod pool;
pub mod proxy;
pub mod stream;
pub mod tracker;

pub use backend::{establish_mysql_session, BackendConn, BackendConnector, BackendFactory};
pub use pool::BackendPool;
pub use proxy::{is_conn_close_err, ProxyServer};
pub use stream::NetworkStream;
pub use tracker::SessionTracker;
