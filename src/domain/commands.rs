//! Command payloads carried by task records.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::payload::Payload;
use super::snapshot::StopReason;

/// Identifies the timeline cycle a command was issued for.
///
/// Executors compare it with the latest snapshot and drop the command
/// as stale when they differ.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandGuard {
    /// `cycle_time` of the issuing snapshot
    pub action_time: i64,

    pub last_forecast_lag: Option<i64>,
}

/// Create or convert a timeline
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntakeCommand {
    /// Origin of the intake retry schedule; defaults to the task's sched_time
    #[serde(default)]
    pub base_time: Option<i64>,
}

impl Payload for IntakeCommand {
    const KIND: &'static str = "intake";
    const VERSION: u32 = 1;
}

/// Compute the forecast for one lag
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForecastCommand {
    pub guard: CommandGuard,

    /// Lag to forecast (ms after mainshock origin)
    pub forecast_lag: i64,

    /// Origin of the forecast retry schedule
    pub base_time: i64,
}

impl Payload for ForecastCommand {
    const KIND: &'static str = "exec_forecast";
    const VERSION: u32 = 1;
}

/// Publish the forecast held by the timeline
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishCommand {
    pub guard: CommandGuard,

    /// Origin of the publish retry schedule
    pub base_time: i64,
}

impl Payload for PublishCommand {
    const KIND: &'static str = "publish";
    const VERSION: u32 = 1;
}

/// Set (`params = Some`) or clear (`None`) the analyst override
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalystCommand {
    pub analyst_id: String,

    #[serde(default)]
    pub params: Option<Value>,
}

impl Payload for AnalystCommand {
    const KIND: &'static str = "analyst_intervene";
    const VERSION: u32 = 1;
}

/// Stop a timeline
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopCommand {
    pub reason: StopReason,

    /// Absent for operator stops, which apply to any cycle
    #[serde(default)]
    pub guard: Option<CommandGuard>,
}

impl Payload for StopCommand {
    const KIND: &'static str = "stop";
    const VERSION: u32 = 1;
}
