//! Executors: one per opcode.
//!
//! An executor reads the event's timeline, talks to collaborators, and
//! then either re-arms its own task with `stage` or reports a result code
//! telling the dispatcher what to do with the task. All business logic
//! lives here; the dispatcher only maps result codes to dispositions.

mod analyst;
mod forecast;
mod intake;
mod publish;
mod stop;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Notify;
use tracing::{debug, error};

use crate::adapters::{ForecastModel, MainshockSource, Publisher};
use crate::core::clock::Clock;
use crate::core::health::ServerHealth;
use crate::core::retry::RetryPolicy;
use crate::core::schedule::ForecastSchedule;
use crate::core::store::{TaskStore, TaskStoreError};
use crate::core::timeline::{TimelineError, TimelineStore};
use crate::domain::payload::{self, Payload, PayloadError};
use crate::domain::{CommandGuard, NewTask, Opcode, Snapshot, TaskId, TaskRecord};

pub use analyst::AnalystExecutor;
pub use forecast::ExecForecastExecutor;
pub use intake::IntakeExecutor;
pub use publish::PublishExecutor;
pub use stop::StopExecutor;

/// `submit_id` written on tasks the engine schedules for itself
pub const SERVER_SUBMIT_ID: &str = "server";

/// How long a command may wait for the snapshot that issued it to land
const UNWRITTEN_GUARD_GRACE_MS: i64 = 60_000;

const UNWRITTEN_GUARD_RECHECK_MS: i64 = 1_000;

/// Outcome reported by an executor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultCode {
    /// Work done, task finished
    Success,

    /// Task finished without doing work (or gave up)
    Delete,

    /// Payload could not be decoded
    Corrupt,

    /// Executor re-armed the task itself
    Stage,

    AlreadyInState,
    StaleCommand,
    NoTimeline,
    UnknownOpcode,
}

/// What the dispatcher does with a finished task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Delete,
    LeaveStaged,
    Escalate,
}

impl ResultCode {
    pub fn disposition(self) -> Disposition {
        match self {
            ResultCode::Success
            | ResultCode::Delete
            | ResultCode::Corrupt
            | ResultCode::AlreadyInState
            | ResultCode::StaleCommand
            | ResultCode::NoTimeline => Disposition::Delete,
            ResultCode::Stage => Disposition::LeaveStaged,
            ResultCode::UnknownOpcode => Disposition::Escalate,
        }
    }
}

/// Infrastructure failure of the engine's own stores
#[derive(Debug, Error)]
pub enum ExecError {
    #[error("Task store error: {0}")]
    Store(#[from] TaskStoreError),

    #[error("Timeline error: {0}")]
    Timeline(#[from] TimelineError),

    #[error("Payload error: {0}")]
    Payload(#[from] PayloadError),
}

impl ExecError {
    /// Failures a re-run cannot fix: a malformed event id, or a write the
    /// state machine will never accept. `OutOfOrder` is left out because a
    /// re-run reads the newer snapshot and settles.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            ExecError::Timeline(
                TimelineError::InvalidArgument(_) | TimelineError::InvalidTransition { .. }
            ) | ExecError::Payload(_)
        )
    }
}

/// Engine behaviour shared by every executor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineSettings {
    pub schedule: ForecastSchedule,
    pub intake_retry: RetryPolicy,
    pub forecast_retry: RetryPolicy,
    pub publish_retry: RetryPolicy,

    /// Network code written on products
    pub product_network: String,

    /// Prefix for product codes
    pub product_code_prefix: String,

    pub product_reviewed: bool,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            schedule: ForecastSchedule::default(),
            intake_retry: RetryPolicy::intake_default(),
            forecast_retry: RetryPolicy::forecast_default(),
            publish_retry: RetryPolicy::publish_default(),
            product_network: "us".to_string(),
            product_code_prefix: String::new(),
            product_reviewed: true,
        }
    }
}

/// Everything an executor may touch
pub struct ExecContext {
    pub tasks: Arc<dyn TaskStore>,
    pub timelines: Arc<dyn TimelineStore>,
    pub publisher: Arc<dyn Publisher>,
    pub source: Arc<dyn MainshockSource>,
    pub model: Arc<dyn ForecastModel>,
    pub health: Arc<ServerHealth>,
    pub clock: Arc<dyn Clock>,
    pub settings: Arc<EngineSettings>,

    /// Wakes the dispatcher when new work is submitted
    pub wakeup: Arc<Notify>,
}

impl ExecContext {
    pub fn now(&self) -> i64 {
        self.clock.now_millis()
    }

    /// Submit a task and wake the dispatcher
    pub fn submit(&self, task: NewTask) -> Result<TaskId, TaskStoreError> {
        let id = self.tasks.submit(task)?;
        self.wakeup.notify_one();
        Ok(id)
    }

    /// Submit an engine-issued command for `event_id` due at `sched_time`
    pub fn submit_command<P: Payload>(
        &self,
        opcode: Opcode,
        event_id: &str,
        sched_time: i64,
        command: &P,
    ) -> Result<TaskId, ExecError> {
        let details = payload::encode(command)?;
        let task = NewTask::new(opcode, event_id, sched_time, self.now(), SERVER_SUBMIT_ID)
            .with_details(details);
        Ok(self.submit(task)?)
    }

    /// Latest snapshot, or `None` when the event has no timeline
    pub async fn current_snapshot(&self, event_id: &str) -> Result<Option<Snapshot>, ExecError> {
        match self.timelines.open(event_id).await {
            Ok(snapshot) => Ok(Some(snapshot)),
            Err(TimelineError::NotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn append(&self, snapshot: &Snapshot) -> Result<(), ExecError> {
        self.timelines.append(&snapshot.event_id, snapshot).await?;
        Ok(())
    }
}

/// Decode a task's payload, logging permanent failures
fn decode_command<P: Payload>(task: &TaskRecord) -> Option<P> {
    match payload::decode::<P>(task.details.as_deref()) {
        Ok(command) => Some(command),
        Err(e) => {
            error!(task_id = %task.id, event_id = %task.event_id, error = %e, "Corrupt task payload");
            None
        }
    }
}

/// Where a command stands against the timeline it targets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GuardCheck {
    Current,
    Stale,

    /// Re-armed to look again shortly
    Deferred,
}

/// Compare a command's guard with the latest snapshot.
///
/// Follow-up commands are submitted before the snapshot that issues them
/// is appended, so another process may claim one while its snapshot is
/// still being written. Such a command (guard newer than the log) is
/// re-checked for a short grace period; after that its issuer failed and
/// the issuer's re-run supersedes it.
fn check_guard(
    ctx: &ExecContext,
    task: &TaskRecord,
    snapshot: &Snapshot,
    guard: &CommandGuard,
) -> Result<GuardCheck, ExecError> {
    if snapshot.accepts(guard) {
        return Ok(GuardCheck::Current);
    }

    let now = ctx.now();
    if guard.action_time > snapshot.cycle_time
        && now.saturating_sub(guard.action_time) < UNWRITTEN_GUARD_GRACE_MS
    {
        let exec_time = now + UNWRITTEN_GUARD_RECHECK_MS;
        ctx.tasks.stage(task.id, exec_time, task.stage, None)?;
        debug!(task_id = %task.id, guard_time = guard.action_time, "Issuing snapshot not written yet");
        return Ok(GuardCheck::Deferred);
    }

    Ok(GuardCheck::Stale)
}

/// Handler for one opcode
#[async_trait]
pub trait Executor: Send + Sync {
    fn name(&self) -> &'static str;

    async fn execute(&self, ctx: &ExecContext, task: &TaskRecord) -> Result<ResultCode, ExecError>;
}

/// Cleanup placeholder
pub struct NoOpExecutor;

#[async_trait]
impl Executor for NoOpExecutor {
    fn name(&self) -> &'static str {
        "no_op"
    }

    async fn execute(&self, _ctx: &ExecContext, _task: &TaskRecord) -> Result<ResultCode, ExecError> {
        Ok(ResultCode::Delete)
    }
}

/// Fallback for opcodes nothing is registered for
pub struct UnknownOpcodeExecutor;

#[async_trait]
impl Executor for UnknownOpcodeExecutor {
    fn name(&self) -> &'static str {
        "unknown"
    }

    async fn execute(&self, _ctx: &ExecContext, task: &TaskRecord) -> Result<ResultCode, ExecError> {
        error!(task_id = %task.id, opcode = task.opcode, "No executor for opcode");
        Ok(ResultCode::UnknownOpcode)
    }
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Executor already registered for opcode {0}")]
    Duplicate(i32),
}

/// Opcode → executor dispatch table
pub struct ExecutorRegistry {
    executors: HashMap<i32, Arc<dyn Executor>>,
    fallback: Arc<dyn Executor>,
}

impl Default for ExecutorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutorRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self {
            executors: HashMap::new(),
            fallback: Arc::new(UnknownOpcodeExecutor),
        }
    }

    /// Registry with every production executor
    pub fn standard() -> Self {
        let entries: [(Opcode, Arc<dyn Executor>); 6] = [
            (Opcode::Intake, Arc::new(IntakeExecutor)),
            (Opcode::ExecForecast, Arc::new(ExecForecastExecutor)),
            (Opcode::Publish, Arc::new(PublishExecutor)),
            (Opcode::AnalystIntervene, Arc::new(AnalystExecutor)),
            (Opcode::Stop, Arc::new(StopExecutor)),
            (Opcode::NoOp, Arc::new(NoOpExecutor)),
        ];

        let mut registry = Self::new();
        for (opcode, executor) in entries {
            registry.executors.insert(opcode.code(), executor);
        }
        registry
    }

    pub fn register(&mut self, opcode: i32, executor: Arc<dyn Executor>) -> Result<(), RegistryError> {
        if self.executors.contains_key(&opcode) {
            return Err(RegistryError::Duplicate(opcode));
        }
        self.executors.insert(opcode, executor);
        Ok(())
    }

    pub fn get(&self, opcode: i32) -> Option<Arc<dyn Executor>> {
        self.executors.get(&opcode).cloned()
    }

    /// Executor for `opcode`, or the unknown-opcode fallback
    pub fn resolve(&self, opcode: i32) -> Arc<dyn Executor> {
        self.get(opcode).unwrap_or_else(|| self.fallback.clone())
    }
}
