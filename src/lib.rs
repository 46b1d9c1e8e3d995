//! aftershock - Aftershock forecast dispatch engine
//!
//! Tracks earthquake sequences and keeps a forecast product current for
//! each one.
//!
//! # Architecture
//!
//! Two persistent structures drive everything:
//! - A task store: durable, time-ordered queue of work items, shared by
//!   any number of dispatcher processes
//! - Timelines: one append-only snapshot log per event, the authoritative
//!   record of where that event's forecast cycle stands
//!
//! Each task names an opcode. The dispatcher claims the earliest due task,
//! runs the executor for its opcode, and settles the task according to
//! the result code. Executors advance timelines and schedule follow-up
//! tasks; commands carry a guard so superseded work is dropped.
//!
//! # Modules
//!
//! - `adapters`: External collaborators (product publisher, event source,
//!   forecast model)
//! - `core`: Task store, timelines, dispatcher, executors, policies
//! - `domain`: Data structures (TaskRecord, Snapshot, commands)
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Run the dispatcher
//! aftershock serve
//!
//! # Start tracking an event
//! aftershock intake us7000abcd
//!
//! # Inspect it
//! aftershock timeline us7000abcd
//! ```

pub mod adapters;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;

// Re-export main types at crate root for convenience
pub use crate::core::{Dispatcher, ExecContext, ExecutorRegistry, SqliteTaskStore, JsonlTimelineStore};
pub use domain::{NewTask, Opcode, Snapshot, TaskRecord, TimelineState};
