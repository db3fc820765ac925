//! Local persistence.
//!
//! Two key-value areas back the engines: a durable SQLite store that
//! survives restarts and logout/login cycles, and an ephemeral in-memory
//! store scoped to one application instance. Writes are last-writer-wins
//! per key. Callers never touch raw keys; they go through the typed
//! [`SnapshotStore`] and [`AuthStore`] facades.

mod auth;
mod config;
mod memory;
mod snapshots;
mod sqlite;

pub use auth::{AuthSession, AuthStore};
pub use config::{ApiConfig, Config, TimerConfig, WeeklyConfig};
pub use memory::MemoryStore;
pub use snapshots::{keys, SnapshotSource, SnapshotStore};
pub use sqlite::SqliteStore;

use std::path::PathBuf;

use tokio::sync::broadcast;

use crate::error::{ConfigError, StorageError};

/// Notification sent to every handle sharing a store after a write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageChange {
    pub key: String,
    /// `None` when the key was removed.
    pub value: Option<String>,
}

/// Minimal string key-value area.
pub trait KvStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError>;
    fn set(&self, key: &str, value: &str) -> Result<(), StorageError>;
    fn remove(&self, key: &str) -> Result<(), StorageError>;

    /// Change feed for other handles on the same store.
    fn changes(&self) -> broadcast::Receiver<StorageChange>;
}

const CHANGE_CAPACITY: usize = 64;

pub(crate) fn change_channel() -> broadcast::Sender<StorageChange> {
    broadcast::channel(CHANGE_CAPACITY).0
}

/// Returns `~/.config/focusflow[-dev]/` based on FOCUSFLOW_ENV.
///
/// Set FOCUSFLOW_ENV=dev to use development data directory.
///
/// # Errors
/// Returns an error if creating the config directory fails.
pub fn data_dir() -> Result<PathBuf, ConfigError> {
    let base_dir = dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config");

    let env = std::env::var("FOCUSFLOW_ENV").unwrap_or_else(|_| "production".to_string());

    let dir = if env == "dev" {
        base_dir.join("focusflow-dev")
    } else {
        base_dir.join("focusflow")
    };

    std::fs::create_dir_all(&dir).map_err(|e| ConfigError::DataDir(e.to_string()))?;
    Ok(dir)
}
