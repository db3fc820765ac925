//! Typed access to every persisted entity the engines own.
//!
//! Malformed or unreadable entries are reported as absent. Storage write
//! failures are returned to the caller, which logs them and keeps running
//! on in-memory state.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::broadcast;

use super::{KvStore, StorageChange};
use crate::error::CoreError;
use crate::timer::ActiveTaskSnapshot;
use crate::weekly::{OptimisticDelta, WeeklySnapshot};

/// Storage key layout. Everything except the legacy entry is namespaced by
/// user id.
pub mod keys {
    /// Pre-namespacing active-task entry, read only as a fallback.
    pub const LEGACY_ACTIVE_TASK: &str = "active_task";

    pub fn active_task(user_id: &str) -> String {
        format!("active_task:{user_id}")
    }

    pub fn completion_guard(user_id: &str) -> String {
        format!("completion_fired:{user_id}")
    }

    pub fn weekly(user_id: &str) -> String {
        format!("weekly:{user_id}")
    }

    pub fn weekly_optimistic(user_id: &str) -> String {
        format!("weekly_optimistic:{user_id}")
    }

    pub fn weekly_deltas(user_id: &str) -> String {
        format!("weekly_deltas:{user_id}")
    }

    pub fn longest_streak(user_id: &str) -> String {
        format!("longest_streak:{user_id}")
    }
}

/// Where an active-task snapshot was read from, in restore priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotSource {
    UserDurable,
    LegacyDurable,
    Ephemeral,
}

impl SnapshotSource {
    pub const RESTORE_ORDER: [SnapshotSource; 3] = [
        SnapshotSource::UserDurable,
        SnapshotSource::LegacyDurable,
        SnapshotSource::Ephemeral,
    ];
}

#[derive(Clone)]
pub struct SnapshotStore {
    durable: Arc<dyn KvStore>,
    ephemeral: Arc<dyn KvStore>,
}

impl SnapshotStore {
    pub fn new(durable: Arc<dyn KvStore>, ephemeral: Arc<dyn KvStore>) -> Self {
        Self { durable, ephemeral }
    }

    pub fn durable(&self) -> &Arc<dyn KvStore> {
        &self.durable
    }

    pub fn ephemeral(&self) -> &Arc<dyn KvStore> {
        &self.ephemeral
    }

    /// Change feeds of both areas, durable first.
    pub fn changes(
        &self,
    ) -> (
        broadcast::Receiver<StorageChange>,
        broadcast::Receiver<StorageChange>,
    ) {
        (self.durable.changes(), self.ephemeral.changes())
    }

    // ── Active task ──────────────────────────────────────────────────

    pub fn load_active(&self, source: SnapshotSource, user_id: &str) -> Option<ActiveTaskSnapshot> {
        match source {
            SnapshotSource::UserDurable => read_json(&*self.durable, &keys::active_task(user_id)),
            SnapshotSource::LegacyDurable => read_json(&*self.durable, keys::LEGACY_ACTIVE_TASK),
            SnapshotSource::Ephemeral => read_json(&*self.ephemeral, &keys::active_task(user_id)),
        }
    }

    /// Write the snapshot to both areas under its owner's key.
    pub fn save_active(&self, snapshot: &ActiveTaskSnapshot) -> Result<(), CoreError> {
        let key = keys::active_task(&snapshot.user_id);
        let json = serde_json::to_string(snapshot)?;
        self.durable.set(&key, &json)?;
        self.ephemeral.set(&key, &json)?;
        Ok(())
    }

    pub fn clear_active(&self, user_id: &str) -> Result<(), CoreError> {
        let key = keys::active_task(user_id);
        self.durable.remove(&key)?;
        self.ephemeral.remove(&key)?;
        Ok(())
    }

    pub fn clear_legacy_active(&self) -> Result<(), CoreError> {
        self.durable.remove(keys::LEGACY_ACTIVE_TASK)?;
        Ok(())
    }

    /// Drop a snapshot read from `source` that turned out to be unusable.
    pub fn discard_active(&self, source: SnapshotSource, user_id: &str) -> Result<(), CoreError> {
        match source {
            SnapshotSource::UserDurable => self.durable.remove(&keys::active_task(user_id))?,
            SnapshotSource::LegacyDurable => self.durable.remove(keys::LEGACY_ACTIVE_TASK)?,
            SnapshotSource::Ephemeral => self.ephemeral.remove(&keys::active_task(user_id))?,
        }
        Ok(())
    }

    pub fn completion_guard(&self, user_id: &str) -> Option<String> {
        self.durable
            .get(&keys::completion_guard(user_id))
            .ok()
            .flatten()
    }

    pub fn set_completion_guard(&self, user_id: &str, task_id: &str) -> Result<(), CoreError> {
        self.durable.set(&keys::completion_guard(user_id), task_id)?;
        Ok(())
    }

    // ── Weekly aggregate ─────────────────────────────────────────────

    pub fn load_weekly(&self, user_id: &str) -> Option<WeeklySnapshot> {
        read_json(&*self.durable, &keys::weekly(user_id))
    }

    pub fn save_weekly(&self, snapshot: &WeeklySnapshot) -> Result<(), CoreError> {
        write_json(&*self.durable, &keys::weekly(&snapshot.user_id), snapshot)
    }

    pub fn load_weekly_optimistic(&self, user_id: &str) -> Option<WeeklySnapshot> {
        read_json(&*self.ephemeral, &keys::weekly_optimistic(user_id))
    }

    pub fn save_weekly_optimistic(&self, snapshot: &WeeklySnapshot) -> Result<(), CoreError> {
        write_json(
            &*self.ephemeral,
            &keys::weekly_optimistic(&snapshot.user_id),
            snapshot,
        )
    }

    pub fn load_deltas(&self, user_id: &str) -> Vec<OptimisticDelta> {
        read_json(&*self.ephemeral, &keys::weekly_deltas(user_id)).unwrap_or_default()
    }

    pub fn save_deltas(&self, user_id: &str, deltas: &[OptimisticDelta]) -> Result<(), CoreError> {
        let key = keys::weekly_deltas(user_id);
        if deltas.is_empty() {
            self.ephemeral.remove(&key)?;
            return Ok(());
        }
        write_json(&*self.ephemeral, &key, &deltas)
    }

    pub fn longest_streak(&self, user_id: &str) -> u32 {
        self.durable
            .get(&keys::longest_streak(user_id))
            .ok()
            .flatten()
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    }

    /// Store `candidate` if it beats the remembered maximum; returns the
    /// maximum after the update.
    pub fn record_longest_streak(&self, user_id: &str, candidate: u32) -> Result<u32, CoreError> {
        let current = self.longest_streak(user_id);
        if candidate > current {
            self.durable
                .set(&keys::longest_streak(user_id), &candidate.to_string())?;
            return Ok(candidate);
        }
        Ok(current)
    }

    // ── Session teardown ─────────────────────────────────────────────

    /// Remove every cached entry for `user_id`. The historical longest
    /// streak is a record, not a cache, and survives.
    pub fn clear_user(&self, user_id: &str) -> Result<(), CoreError> {
        self.clear_active(user_id)?;
        self.durable.remove(&keys::completion_guard(user_id))?;
        self.durable.remove(&keys::weekly(user_id))?;
        self.ephemeral.remove(&keys::weekly_optimistic(user_id))?;
        self.ephemeral.remove(&keys::weekly_deltas(user_id))?;
        if let Some(legacy) = self.load_active(SnapshotSource::LegacyDurable, user_id) {
            if legacy.user_id == user_id {
                self.clear_legacy_active()?;
            }
        }
        Ok(())
    }
}

fn read_json<T: DeserializeOwned>(store: &dyn KvStore, key: &str) -> Option<T> {
    let raw = match store.get(key) {
        Ok(Some(raw)) => raw,
        Ok(None) => return None,
        Err(e) => {
            tracing::debug!(key, error = %e, "storage read failed, treating as absent");
            return None;
        }
    };
    match serde_json::from_str(&raw) {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::debug!(key, error = %e, "malformed persisted entry, treating as absent");
            None
        }
    }
}

fn write_json<T: Serialize + ?Sized>(store: &dyn KvStore, key: &str, value: &T) -> Result<(), CoreError> {
    let json = serde_json::to_string(value)?;
    store.set(key, &json)?;
    Ok(())
}
