//! Configuration loader and defaults for the gxvnsweb hub.
//!
//! Exposes a lazily-initialized `CONFIG` which reads values from environment
//! variables (with sensible defaults). `PORT` is the knob the deployment
//! contract declares (default 8765); `GXVNS_DATA_DIR` relocates the
//! persistence root, mainly for containerized volumes.
//!
use std::env;
use std::path::PathBuf;

use once_cell::sync::Lazy;

/// Default listening port, fixed by the deployment contract
const DEFAULT_PORT: u16 = 8765;

/// Default directory for persisted user data
const DEFAULT_DATA_DIR: &str = "server_data";

/// Application configuration resolved at process start
pub struct Config {
    /// TCP port the hub listens on (all interfaces)
    pub port: u16,
    /// Directory holding `users.json`
    pub data_dir: PathBuf,
}

/// Global application configuration instance, lazily initialized
pub static CONFIG: Lazy<Config> = Lazy::new(|| Config {
    port: env::var("PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(DEFAULT_PORT),
    data_dir: env::var("GXVNS_DATA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_DATA_DIR)),
});
