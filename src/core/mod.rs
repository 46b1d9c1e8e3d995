//! Core engine logic.
//!
//! This module contains:
//! - Store: durable task queue with atomic claim
//! - Timeline: append-only per-event snapshot log
//! - Retry / Schedule: pure timing policies
//! - Health: failure-run monitors per subsystem
//! - Executors: one handler per opcode
//! - Dispatch: the claim/execute/apply loop

pub mod clock;
pub mod dispatch;
pub mod executors;
pub mod health;
pub mod retry;
pub mod schedule;
pub mod store;
pub mod timeline;

// Re-export commonly used types
pub use clock::{Clock, ManualClock, SystemClock};
pub use dispatch::{DispatchError, Dispatcher, DispatcherConfig, Step};
pub use executors::{
    Disposition, EngineSettings, ExecContext, ExecError, Executor, ExecutorRegistry,
    RegistryError, ResultCode,
};
pub use health::{AlertRule, HealthMonitor, HealthSettings, LastOpMonitor, MonitorSettings, MultiRuleMonitor, ServerHealth, Subsystem};
pub use retry::{RetryDecision, RetryPolicy};
pub use schedule::ForecastSchedule;
pub use store::{SqliteTaskStore, TaskStore, TaskStoreError};
pub use timeline::{replay, JsonlTimelineStore, TimelineError, TimelineStore};
