//! Domain types for the aftershock engine.
//!
//! This module contains the core data structures:
//! - Task: persisted unit of scheduled work
//! - Snapshot: immutable timeline state for one event
//! - Commands: payloads carried inside tasks, in a versioned envelope

pub mod commands;
pub mod payload;
pub mod snapshot;
pub mod task;

// Re-export commonly used types
pub use commands::{
    AnalystCommand, CommandGuard, ForecastCommand, IntakeCommand, PublishCommand, StopCommand,
};
pub use payload::{Payload, PayloadError};
pub use snapshot::{
    next_action_time, AnalystOverride, ForecastRef, Mainshock, PublishStatus, Snapshot,
    StopReason, TimelineState,
};
pub use task::{NewTask, Opcode, TaskId, TaskRecord, EXEC_TIME_CLAIMED};
