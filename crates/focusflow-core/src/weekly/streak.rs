//! Streak computation over the seven-day activity window.
//!
//! The current streak is the run of active days ending today. The longest
//! streak is a historical maximum: a quiet week never lowers it.

use serde::{Deserialize, Serialize};

use super::aggregate::DAYS;

/// Streak values shown alongside the weekly buckets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Streaks {
    /// Consecutive active days ending today; 0 when today is inactive
    pub current: u32,
    /// Longest run ever observed for the user
    pub longest: u32,
}

/// Compute streaks for `active` (oldest first, index 6 is today) against
/// the remembered historical maximum.
pub fn compute_streaks(active: &[bool; DAYS], remembered_longest: u32) -> Streaks {
    let current = active.iter().rev().take_while(|day| **day).count() as u32;
    Streaks {
        current,
        longest: longest_run(active).max(remembered_longest),
    }
}

/// Longest run of `true` anywhere in the window.
pub fn longest_run(active: &[bool]) -> u32 {
    let mut best = 0u32;
    let mut run = 0u32;
    for day in active {
        if *day {
            run += 1;
            best = best.max(run);
        } else {
            run = 0;
        }
    }
    best
}
