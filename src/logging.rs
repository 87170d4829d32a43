//! Logging macros that set target to "rds_iam_proxy" for all log calls.
//!
//! Without an explicit target, tracing uses the full module path
//! (e.g., "rds_iam_proxy::server::pool") as the logger name, which makes
//! per-level filtering awkward for operators. These macros pin every log
//! line from this crate to a single "rds_iam_proxy" target.

macro_rules! trace {
    ($($arg:tt)*) => { ::tracing::trace!(target: "rds_iam_proxy", $($arg)*) };
}

macro_rules! debug {
    ($($arg:tt)*) => { ::tracing::debug!(target: "rds_iam_proxy", $($arg)*) };
}

macro_rules! info {
    ($($arg:tt)*) => { ::tracing::info!(target: "rds_iam_proxy", $($arg)*) };
}

macro_rules! warn {
    ($($arg:tt)*) => { ::tracing::warn!(target: "rds_iam_proxy", $($arg)*) };
}

macro_rules! error {
    ($($arg:tt)*) => { ::tracing::error!(target: "rds_iam_proxy", $($arg)*) };
}
