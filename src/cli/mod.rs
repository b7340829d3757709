//! CLI command implementations.

pub mod check;
pub mod serve;

use std::path::PathBuf;

use leasepool::config::{ServerConfig, DEFAULT_CONFIG_FILE};

/// Resolve `--config`, defaulting to `leasepool.toml` in the working
/// directory, and load it.
pub fn load_config(path: Option<&PathBuf>) -> leasepool::Result<ServerConfig> {
    let path = path
        .cloned()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));
    ServerConfig::load(&path)
}
