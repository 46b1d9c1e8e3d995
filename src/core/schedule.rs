//! Forecast schedule: the lags after mainshock origin at which a
//! forecast is produced.

use serde::{Deserialize, Serialize};

const HOUR_SECS: u64 = 3_600;
const DAY_SECS: u64 = 24 * HOUR_SECS;

/// Ascending list of forecast lags
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForecastSchedule {
    /// Lags in seconds after origin
    pub lags_secs: Vec<u64>,
}

impl Default for ForecastSchedule {
    fn default() -> Self {
        Self {
            lags_secs: vec![
                HOUR_SECS / 3,
                HOUR_SECS,
                6 * HOUR_SECS,
                DAY_SECS,
                3 * DAY_SECS,
                7 * DAY_SECS,
                14 * DAY_SECS,
                30 * DAY_SECS,
                90 * DAY_SECS,
                365 * DAY_SECS,
            ],
        }
    }
}

impl ForecastSchedule {
    pub fn new(mut lags_secs: Vec<u64>) -> Self {
        lags_secs.sort_unstable();
        lags_secs.dedup();
        Self { lags_secs }
    }

    fn lags_ms(&self) -> impl Iterator<Item = i64> + '_ {
        self.lags_secs
            .iter()
            .map(|&secs| i64::try_from(secs).unwrap_or(i64::MAX / 1000).saturating_mul(1000))
    }

    /// Next lag (ms) to forecast after `last`, given `elapsed` ms since
    /// origin.
    ///
    /// Normally the first configured lag beyond `last`. When that lag is
    /// already behind us but the schedule continues, the forecast runs now
    /// for the elapsed lag. `None` once the schedule is exhausted.
    pub fn next_lag(&self, last: Option<i64>, elapsed: i64) -> Option<i64> {
        let floor = last.unwrap_or(i64::MIN);
        let candidate = self.lags_ms().find(|&lag| lag > floor)?;

        if candidate >= elapsed {
            return Some(candidate);
        }

        self.lags_ms()
            .any(|lag| lag > elapsed)
            .then_some(elapsed)
    }
}
