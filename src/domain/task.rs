//! Task records: the persisted unit of scheduled work.
//!
//! A task is created by `submit`, claimed by the dispatcher, optionally
//! re-armed in place by `stage`, and finally removed by `delete`.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Reserved `exec_time` marking a record as claimed and in flight.
pub const EXEC_TIME_CLAIMED: i64 = 0;

/// Identifier assigned by the task store on insert
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(i64);

impl TaskId {
    pub fn new(value: i64) -> Self {
        Self(value)
    }

    pub fn get(self) -> i64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

/// Operation codes understood by the standard executor registry.
///
/// Records store the raw integer so that a record written by a newer
/// deployment still loads; `Opcode::from_code` returns `None` for those.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Opcode {
    /// Create or convert an event timeline
    Intake,

    /// Compute the forecast for one lag
    ExecForecast,

    /// Send a computed forecast to the distribution service
    Publish,

    /// Set or clear an analyst override
    AnalystIntervene,

    /// Stop tracking an event
    Stop,

    /// Cleanup placeholder, always deleted
    NoOp,
}

impl Opcode {
    pub const ALL: [Opcode; 6] = [
        Opcode::Intake,
        Opcode::ExecForecast,
        Opcode::Publish,
        Opcode::AnalystIntervene,
        Opcode::Stop,
        Opcode::NoOp,
    ];

    /// Stable integer stored in the task record
    pub const fn code(self) -> i32 {
        match self {
            Opcode::Intake => 1,
            Opcode::ExecForecast => 2,
            Opcode::Publish => 3,
            Opcode::AnalystIntervene => 4,
            Opcode::Stop => 5,
            Opcode::NoOp => 6,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        Self::ALL.into_iter().find(|op| op.code() == code)
    }

    pub fn name(self) -> &'static str {
        match self {
            Opcode::Intake => "intake",
            Opcode::ExecForecast => "exec_forecast",
            Opcode::Publish => "publish",
            Opcode::AnalystIntervene => "analyst_intervene",
            Opcode::Stop => "stop",
            Opcode::NoOp => "no_op",
        }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Arguments for `TaskStore::submit`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewTask {
    /// Event this task belongs to (empty = not event-scoped)
    pub event_id: String,

    /// Requested execution time (epoch ms); becomes the initial `exec_time`
    pub sched_time: i64,

    /// When the request was made (epoch ms)
    pub submit_time: i64,

    /// Who made the request
    pub submit_id: String,

    /// Raw operation code
    pub opcode: i32,

    /// Caller-defined stage, usually a retry-schedule index
    pub stage: i32,

    /// Versioned payload envelope
    pub details: Option<String>,
}

impl NewTask {
    pub fn new(
        opcode: Opcode,
        event_id: impl Into<String>,
        sched_time: i64,
        submit_time: i64,
        submit_id: impl Into<String>,
    ) -> Self {
        Self {
            event_id: event_id.into(),
            sched_time,
            submit_time,
            submit_id: submit_id.into(),
            opcode: opcode.code(),
            stage: 0,
            details: None,
        }
    }

    pub fn with_stage(mut self, stage: i32) -> Self {
        self.stage = stage;
        self
    }

    pub fn with_details(mut self, details: String) -> Self {
        self.details = Some(details);
        self
    }

    /// Override the opcode with a raw value (restore, tests)
    pub fn with_raw_opcode(mut self, opcode: i32) -> Self {
        self.opcode = opcode;
        self
    }
}

/// A persisted task record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: TaskId,

    /// Earliest moment the task may run; `EXEC_TIME_CLAIMED` while in flight
    pub exec_time: i64,

    pub event_id: String,
    pub sched_time: i64,
    pub submit_time: i64,
    pub submit_id: String,
    pub opcode: i32,
    pub stage: i32,
    pub details: Option<String>,
}

impl TaskRecord {
    /// Known opcode, if this deployment understands it
    pub fn opcode(&self) -> Option<Opcode> {
        Opcode::from_code(self.opcode)
    }

    pub fn opcode_label(&self) -> String {
        match self.opcode() {
            Some(op) => op.to_string(),
            None => format!("unknown({})", self.opcode),
        }
    }

    pub fn is_claimed(&self) -> bool {
        self.exec_time == EXEC_TIME_CLAIMED
    }

    pub fn is_event_scoped(&self) -> bool {
        !self.event_id.is_empty()
    }

    /// Rebuild the submission that would recreate this record (backup/restore)
    pub fn to_new_task(&self) -> NewTask {
        NewTask {
            event_id: self.event_id.clone(),
            sched_time: self.sched_time,
            submit_time: self.submit_time,
            submit_id: self.submit_id.clone(),
            opcode: self.opcode,
            stage: self.stage,
            details: self.details.clone(),
        }
    }
}
