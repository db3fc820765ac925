mod engine;
mod snapshot;

#[cfg(test)]
mod engine_tests;

pub use engine::{
    CompletionRequest, ReconcileSource, RestoreOutcome, StorageOutcome, TaskTimerEngine,
};
pub use snapshot::ActiveTaskSnapshot;
