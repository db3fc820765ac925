//! # FocusFlow Core Library
//!
//! Client-side engines for a task, break and mood tracker backed by a REST
//! API. All state lives behind explicit stores and an explicit event bus;
//! the CLI is a thin driver over the same library.
//!
//! ## Architecture
//!
//! - **Timer Engine**: tracks the one task that is in progress or next up,
//!   computes progress from the wall clock and fires completion once
//! - **Weekly Reconciler**: seven-day counters and streaks, merging server
//!   data with short-lived optimistic deltas
//! - **Storage**: SQLite-backed durable store, in-memory ephemeral store,
//!   typed snapshot access and TOML configuration
//! - **Runtime**: one cooperative loop driving both engines
//!
//! ## Key Components
//!
//! - [`TaskTimerEngine`]: active-task state machine
//! - [`WeeklyReconciler`]: weekly aggregate and merge policy
//! - [`SnapshotStore`]: typed persistence for both engines
//! - [`Runtime`]: event loop, polling and session teardown

pub mod clock;
pub mod error;
pub mod events;
pub mod gateway;
pub mod model;
pub mod runtime;
pub mod storage;
pub mod throttle;
pub mod timer;
pub mod weekly;

#[cfg(test)]
mod test_support;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{ConfigError, CoreError, GatewayError, StorageError, ValidationError};
pub use events::{Counter, Event, EventBus, UpdateSource};
pub use gateway::{Gateway, HttpGateway, UserStats, WeeklyData};
pub use model::{Break, Mood, NewBreak, NewMood, NewTask, Task, TaskCompletion, TaskKind, TaskPhase};
pub use runtime::Runtime;
pub use storage::{AuthSession, AuthStore, Config, KvStore, MemoryStore, SnapshotStore, SqliteStore};
pub use timer::{ActiveTaskSnapshot, ReconcileSource, TaskTimerEngine};
pub use weekly::{OptimisticDelta, WeeklyAggregate, WeeklyReconciler, WeeklySnapshot};
