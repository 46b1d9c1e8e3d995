//! Timeline snapshots and the per-event state machine.
//!
//! A snapshot is an immutable record of one event's state at one
//! `action_time`. Snapshots are never edited: every transition builds a
//! new value from the previous one and appends it to the event's log.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::commands::CommandGuard;

/// Lifecycle state of an event timeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TimelineState {
    /// Waiting for the mainshock to resolve
    IntakePending,

    /// Following the forecast schedule
    ActiveNormal,

    /// Following the forecast schedule with analyst parameters
    ActiveAnalystOverride,

    /// Forecast computed, first publish attempt outstanding
    PublishPending,

    /// At least one publish attempt failed, retries outstanding
    PublishRetry,

    /// Terminal
    Stopped,
}

impl TimelineState {
    pub fn is_active(self) -> bool {
        matches!(
            self,
            TimelineState::ActiveNormal | TimelineState::ActiveAnalystOverride
        )
    }

    pub fn is_publishing(self) -> bool {
        matches!(
            self,
            TimelineState::PublishPending | TimelineState::PublishRetry
        )
    }

    pub fn is_terminal(self) -> bool {
        self == TimelineState::Stopped
    }

    /// States a timeline may start in
    pub fn can_start(self) -> bool {
        matches!(
            self,
            TimelineState::IntakePending | TimelineState::ActiveNormal
        )
    }

    /// Legal transition table
    pub fn can_transition_to(self, next: TimelineState) -> bool {
        use TimelineState::*;

        match self {
            IntakePending => matches!(next, IntakePending | ActiveNormal | Stopped),
            ActiveNormal | ActiveAnalystOverride => matches!(
                next,
                ActiveNormal | ActiveAnalystOverride | PublishPending | Stopped
            ),
            // Self-transitions attach an analyst payload mid-cycle
            PublishPending => matches!(
                next,
                PublishPending | PublishRetry | ActiveNormal | Stopped
            ),
            PublishRetry => matches!(next, PublishRetry | ActiveNormal | Stopped),
            Stopped => false,
        }
    }
}

impl fmt::Display for TimelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TimelineState::IntakePending => "INTAKE_PENDING",
            TimelineState::ActiveNormal => "ACTIVE_NORMAL",
            TimelineState::ActiveAnalystOverride => "ACTIVE_ANALYST_OVERRIDE",
            TimelineState::PublishPending => "PUBLISH_PENDING",
            TimelineState::PublishRetry => "PUBLISH_RETRY",
            TimelineState::Stopped => "STOPPED",
        };
        f.write_str(s)
    }
}

/// Outcome of the most recent publish cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PublishStatus {
    #[default]
    None,
    Pending,
    Success,
    Failure,
}

/// Why a timeline was stopped
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StopReason {
    /// Operator request
    Explicit,

    /// The event id was merged into another event
    AliasRetired { superseded_by: String },

    /// The forecast schedule ran out of lags
    Expired,

    /// The mainshock never resolved
    IntakeFailed,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::Explicit => f.write_str("explicit"),
            StopReason::AliasRetired { superseded_by } => {
                write!(f, "alias retired (superseded by {})", superseded_by)
            }
            StopReason::Expired => f.write_str("expired"),
            StopReason::IntakeFailed => f.write_str("intake failed"),
        }
    }
}

/// Mainshock parameters as returned by the event source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mainshock {
    pub event_id: String,

    /// Origin time (epoch ms)
    pub origin_time: i64,

    pub magnitude: f64,
    pub latitude: f64,
    pub longitude: f64,
    pub depth_km: f64,

    /// Network that authored the solution, if reported
    #[serde(default)]
    pub network: Option<String>,
}

/// Analyst-supplied forecast parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalystOverride {
    pub analyst_id: String,
    pub params: Value,
    pub submitted_at: i64,
}

/// Inputs and output of one computed forecast
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastRef {
    /// Forecast lag (ms after mainshock origin)
    pub lag: i64,

    pub computed_at: i64,

    /// Analyst parameters the model ran with
    pub analyst_params: Option<Value>,

    /// Opaque product returned by the model
    pub product: Value,
}

/// Immutable timeline snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub event_id: String,
    pub state: TimelineState,

    /// Strictly increasing per event
    pub action_time: i64,

    /// Action time of the snapshot that issued the outstanding command
    pub cycle_time: i64,

    pub last_forecast_lag: Option<i64>,

    #[serde(default)]
    pub publish_status: PublishStatus,

    #[serde(default)]
    pub analyst: Option<AnalystOverride>,

    #[serde(default)]
    pub mainshock: Option<Mainshock>,

    #[serde(default)]
    pub forecast: Option<ForecastRef>,

    #[serde(default)]
    pub stop_reason: Option<StopReason>,
}

impl Snapshot {
    /// First snapshot of a timeline whose mainshock has not resolved yet
    pub fn intake_pending(event_id: impl Into<String>, action_time: i64) -> Self {
        Self {
            event_id: event_id.into(),
            state: TimelineState::IntakePending,
            action_time,
            cycle_time: action_time,
            last_forecast_lag: None,
            publish_status: PublishStatus::None,
            analyst: None,
            mainshock: None,
            forecast: None,
            stop_reason: None,
        }
    }

    /// First snapshot of a timeline whose mainshock resolved on intake
    pub fn activated(event_id: impl Into<String>, action_time: i64, mainshock: Mainshock) -> Self {
        Self {
            state: TimelineState::ActiveNormal,
            mainshock: Some(mainshock),
            ..Self::intake_pending(event_id, action_time)
        }
    }

    /// Successor with a new state and action time
    fn successor(&self, state: TimelineState, action_time: i64) -> Self {
        Self {
            state,
            action_time,
            cycle_time: action_time,
            ..self.clone()
        }
    }

    /// State an active timeline settles in given its analyst payload
    fn resting_state(&self) -> TimelineState {
        if self.analyst.is_some() {
            TimelineState::ActiveAnalystOverride
        } else {
            TimelineState::ActiveNormal
        }
    }

    /// Intake conversion of a pending timeline. Any analyst payload stays
    /// attached and feeds the first forecast.
    pub fn activate(&self, action_time: i64, mainshock: Mainshock) -> Self {
        Self {
            mainshock: Some(mainshock),
            ..self.successor(TimelineState::ActiveNormal, action_time)
        }
    }

    /// Set or clear the analyst override.
    ///
    /// A pending timeline keeps the payload for activation. An open
    /// publish cycle keeps its state and guard so the outstanding publish
    /// still completes; the payload takes effect once it finishes.
    pub fn with_override(&self, action_time: i64, analyst: Option<AnalystOverride>) -> Self {
        let mut next = self.successor(self.state, action_time);
        next.analyst = analyst;
        match next.state {
            TimelineState::IntakePending => {}
            TimelineState::PublishPending | TimelineState::PublishRetry => {
                next.cycle_time = self.cycle_time;
            }
            _ => next.state = next.resting_state(),
        }
        next
    }

    /// Forecast computed, publish outstanding
    pub fn forecast_computed(&self, action_time: i64, forecast: ForecastRef) -> Self {
        Self {
            last_forecast_lag: Some(forecast.lag),
            publish_status: PublishStatus::Pending,
            forecast: Some(forecast),
            ..self.successor(TimelineState::PublishPending, action_time)
        }
    }

    /// Forecast retries exhausted for `lag`; the schedule moves on
    pub fn forecast_failed(&self, action_time: i64, lag: i64) -> Self {
        Self {
            last_forecast_lag: Some(lag),
            publish_status: PublishStatus::Failure,
            ..self.successor(self.state, action_time)
        }
    }

    /// First publish failure. The cycle time is inherited so the
    /// outstanding publish command still matches.
    pub fn publish_retrying(&self, action_time: i64) -> Self {
        Self {
            cycle_time: self.cycle_time,
            ..self.successor(TimelineState::PublishRetry, action_time)
        }
    }

    /// Publish cycle over, successfully or not. The timeline returns to
    /// `ActiveNormal`; an analyst payload stays attached until cleared.
    pub fn publish_finished(&self, action_time: i64, status: PublishStatus) -> Self {
        Self {
            publish_status: status,
            ..self.successor(TimelineState::ActiveNormal, action_time)
        }
    }

    pub fn stopped(&self, action_time: i64, reason: StopReason) -> Self {
        Self {
            stop_reason: Some(reason),
            ..self.successor(TimelineState::Stopped, action_time)
        }
    }

    /// Guard to embed in commands issued from this snapshot
    pub fn guard(&self) -> CommandGuard {
        CommandGuard {
            action_time: self.cycle_time,
            last_forecast_lag: self.last_forecast_lag,
        }
    }

    /// Whether a command issued with `guard` still applies
    pub fn accepts(&self, guard: &CommandGuard) -> bool {
        guard.action_time == self.cycle_time && guard.last_forecast_lag == self.last_forecast_lag
    }
}

/// Action time for a new snapshot: `max(now, previous + 1)`
pub fn next_action_time(previous: Option<&Snapshot>, now: i64) -> i64 {
    match previous {
        Some(prev) => now.max(prev.action_time + 1),
        None => now,
    }
}
