//! Configuration types, YAML loading, and config-file discovery

mod loader;
mod types;

pub use loader::{load, resolve_config_path, ConfigResolution};
pub use types::{validate_unique_listen_addrs, Config, Profile, MAX_CONNS_HARD_LIMIT};
