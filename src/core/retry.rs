//! Retry schedules for external calls.
//!
//! A policy is a table of delays measured from a fixed `base_time`, not
//! from the previous attempt. Together with the task's `stage` that base
//! time is the whole retry cursor, so a restarted process resumes at the
//! right position without any extra bookkeeping.

use serde::{Deserialize, Serialize};

/// Outcome of consulting a retry policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Run again at `exec_time`, recording `stage` on the task
    Retry { exec_time: i64, stage: i32 },

    /// Schedule exhausted
    GiveUp,
}

/// Delay table consulted after a failed attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Offsets from the base time, in seconds, ascending
    pub delays_secs: Vec<u64>,

    /// Give up once this long has passed since the base time
    #[serde(default)]
    pub max_elapsed_secs: Option<u64>,
}

impl RetryPolicy {
    pub fn new(delays_secs: Vec<u64>) -> Self {
        Self {
            delays_secs,
            max_elapsed_secs: None,
        }
    }

    pub fn with_max_elapsed(mut self, secs: u64) -> Self {
        self.max_elapsed_secs = Some(secs);
        self
    }

    /// Default for publishing to the distribution service
    pub fn publish_default() -> Self {
        Self::new(vec![60, 300, 1_800, 7_200, 21_600])
    }

    /// Default for mainshock lookups during intake
    pub fn intake_default() -> Self {
        Self::new(vec![30, 120, 600, 1_800, 3_600])
    }

    /// Default for forecast model runs
    pub fn forecast_default() -> Self {
        Self::new(vec![60, 300, 900])
    }

    /// Decide the next attempt after a failure at `now`.
    ///
    /// Picks the first delay at index `stage` or later whose deadline is
    /// still in the future; delays that already passed while the process
    /// was down are skipped rather than fired back to back.
    pub fn next_retry(&self, base_time: i64, now: i64, stage: i32) -> RetryDecision {
        if let Some(max) = self.max_elapsed_secs {
            if now.saturating_sub(base_time) > secs_to_ms(max) {
                return RetryDecision::GiveUp;
            }
        }

        let start = usize::try_from(stage).unwrap_or(0);

        self.delays_secs
            .iter()
            .enumerate()
            .skip(start)
            .map(|(i, &delay)| (i, base_time.saturating_add(secs_to_ms(delay))))
            .find(|&(_, exec_time)| exec_time > now)
            .map_or(RetryDecision::GiveUp, |(i, exec_time)| RetryDecision::Retry {
                exec_time,
                stage: i32::try_from(i + 1).unwrap_or(i32::MAX),
            })
    }
}

fn secs_to_ms(secs: u64) -> i64 {
    i64::try_from(secs).unwrap_or(i64::MAX / 1000).saturating_mul(1000)
}
