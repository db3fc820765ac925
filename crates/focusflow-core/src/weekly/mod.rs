mod aggregate;
mod delta;
mod reconciler;
mod streak;


pub use aggregate::{window, WeeklyAggregate, WeeklySnapshot, DAYS};
pub use delta::OptimisticDelta;
pub use reconciler::{Highlight, RefreshPayload, WeeklyReconciler};
pub use streak::{compute_streaks, longest_run, Streaks};
