//! Meshprov Common Library
//!
//! Shared types, storage and key handling for the meshprov provisioning engine.

pub mod crypto;
pub mod db;
pub mod error;
pub mod types;

// Re-export commonly used types
pub use crypto::{generate_key_pair, public_key_from_private, WgKeyPair};
pub use db::Database;
pub use error::{Error, Result};
pub use types::*;

/// Meshprov version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default store path
pub fn default_store_path() -> std::path::PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| std::path::PathBuf::from("."))
        .join(".meshprov")
}

/// Default configuration file path
pub fn default_config_path() -> std::path::PathBuf {
    default_store_path().join("config.toml")
}

/// Current time as unix seconds
pub fn now_epoch_secs() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Home directory helper
mod dirs {
    pub fn home_dir() -> Option<std::path::PathBuf> {
        std::env::var_os("HOME").map(std::path::PathBuf::from)
    }
}
