//! Server configuration loaded from environment variables.
//!
//! All settings have sensible defaults so the relay can start with zero
//! configuration for local development.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use parlor_shared::constants::{DEFAULT_PORT, MAX_FILE_SIZE};

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// TCP socket address to listen on.
    /// Env: `LISTEN_ADDR`
    /// Default: `0.0.0.0:9000`
    pub listen_addr: SocketAddr,

    /// Filesystem path where uploaded files are stored.
    /// Env: `UPLOAD_DIR`
    /// Default: `./uploads`
    pub upload_dir: PathBuf,

    /// Path of the room key file (base64 of 32 raw bytes). Deleting this
    /// file before start rotates the room key.
    /// Env: `ROOM_KEY_FILE`
    /// Default: `./room.key`
    pub room_key_file: PathBuf,

    /// Path of the persisted state file written on shutdown.
    /// Env: `STATE_FILE`
    /// Default: `./server_state.json`
    pub state_file: PathBuf,

    /// How long shutdown waits for active connections to drain.
    /// Env: `SHUTDOWN_TIMEOUT_SECS`
    /// Default: `10`
    pub shutdown_timeout: Duration,

    /// Maximum upload size in bytes (50 MiB).
    pub max_file_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: ([0, 0, 0, 0], DEFAULT_PORT).into(),
            upload_dir: PathBuf::from("./uploads"),
            room_key_file: PathBuf::from("./room.key"),
            state_file: PathBuf::from("./server_state.json"),
            shutdown_timeout: Duration::from_secs(10),
            max_file_size: MAX_FILE_SIZE,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables, falling back to
    /// defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("LISTEN_ADDR") {
            if let Ok(parsed) = addr.parse::<SocketAddr>() {
                config.listen_addr = parsed;
            } else {
                tracing::warn!(value = %addr, "invalid LISTEN_ADDR, using default");
            }
        }

        if let Ok(path) = std::env::var("UPLOAD_DIR") {
            config.upload_dir = PathBuf::from(path);
        }

        if let Ok(path) = std::env::var("ROOM_KEY_FILE") {
            config.room_key_file = PathBuf::from(path);
        }

        if let Ok(path) = std::env::var("STATE_FILE") {
            config.state_file = PathBuf::from(path);
        }

        if let Ok(val) = std::env::var("SHUTDOWN_TIMEOUT_SECS") {
            if let Ok(secs) = val.parse::<u64>() {
                config.shutdown_timeout = Duration::from_secs(secs);
            } else {
                tracing::warn!(value = %val, "invalid SHUTDOWN_TIMEOUT_SECS, using default");
            }
        }

        // RUST_LOG is handled directly by tracing-subscriber's EnvFilter,
        // so we do not store it here.

        config
    }
}
