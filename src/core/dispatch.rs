//! Dispatcher: claims due tasks and runs their executors.
//!
//! One dispatcher per process runs a single loop: claim the earliest due
//! task, run its executor, apply the disposition for the returned code.
//! Several processes may share the task store; `claim_ready` keeps them
//! from running the same task twice.
//!
//! A claimed task whose process dies stays at `exec_time == 0`. The
//! stale-claim sweep notices such records and re-arms them from their
//! `sched_time`, giving at-least-once execution.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use crate::core::executors::{Disposition, ExecContext, ExecutorRegistry, ResultCode};
use crate::core::store::TaskStoreError;
use crate::domain::TaskId;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Unknown opcode {opcode} on {task_id}")]
    UnknownOpcode { opcode: i32, task_id: TaskId },

    #[error("Task store error: {0}")]
    Store(#[from] TaskStoreError),
}

/// Dispatcher timing, in seconds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatcherConfig {
    /// Longest sleep between polls when nothing is due
    #[serde(default = "default_idle_poll")]
    pub idle_poll_secs: u64,

    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// How long a claimed record may sit before it counts as abandoned
    #[serde(default = "default_stale_claim_threshold")]
    pub stale_claim_threshold_secs: u64,

    /// Delay before re-running a task whose executor hit a store failure
    #[serde(default = "default_infra_retry_delay")]
    pub infra_retry_delay_secs: u64,
}

fn default_idle_poll() -> u64 {
    30
}
fn default_sweep_interval() -> u64 {
    60
}
fn default_stale_claim_threshold() -> u64 {
    1_800
}
fn default_infra_retry_delay() -> u64 {
    60
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            idle_poll_secs: default_idle_poll(),
            sweep_interval_secs: default_sweep_interval(),
            stale_claim_threshold_secs: default_stale_claim_threshold(),
            infra_retry_delay_secs: default_infra_retry_delay(),
        }
    }
}

fn secs_to_ms(secs: u64) -> i64 {
    i64::try_from(secs).unwrap_or(i64::MAX / 1000).saturating_mul(1000)
}

/// Result of one dispatch step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Nothing was due
    Idle,

    /// A task ran and its disposition was applied
    Executed { task_id: TaskId, code: ResultCode },

    /// The executor hit an infrastructure failure; the task was re-armed
    Rearmed { task_id: TaskId, exec_time: i64 },
}

pub struct Dispatcher {
    ctx: Arc<ExecContext>,
    registry: ExecutorRegistry,
    config: DispatcherConfig,

    /// Claimed records seen by the sweep, with when they were first seen
    stale_seen: HashMap<TaskId, i64>,
}

impl Dispatcher {
    pub fn new(ctx: Arc<ExecContext>, registry: ExecutorRegistry, config: DispatcherConfig) -> Self {
        Self {
            ctx,
            registry,
            config,
            stale_seen: HashMap::new(),
        }
    }

    pub fn context(&self) -> &Arc<ExecContext> {
        &self.ctx
    }

    /// Claim, execute and settle at most one task
    #[instrument(skip_all)]
    pub async fn run_once(&mut self) -> Result<Step, DispatchError> {
        let now = self.ctx.now();
        let Some(task) = self.ctx.tasks.claim_ready(now)? else {
            return Ok(Step::Idle);
        };

        let executor = self.registry.resolve(task.opcode);
        debug!(
            task_id = %task.id,
            event_id = %task.event_id,
            opcode = %task.opcode_label(),
            stage = task.stage,
            executor = executor.name(),
            "Claimed task"
        );

        let code = match executor.execute(&self.ctx, &task).await {
            Ok(code) => code,
            Err(e) if e.is_permanent() => {
                error!(task_id = %task.id, event_id = %task.event_id, error = %e, "Task can never succeed, deleting");
                ResultCode::Corrupt
            }
            Err(e) => {
                let exec_time = self.ctx.now() + secs_to_ms(self.config.infra_retry_delay_secs);
                error!(task_id = %task.id, error = %e, exec_time, "Executor failed, re-arming task");
                self.ctx.tasks.stage(task.id, exec_time, task.stage, None)?;
                return Ok(Step::Rearmed {
                    task_id: task.id,
                    exec_time,
                });
            }
        };

        match code {
            ResultCode::Corrupt => {
                error!(task_id = %task.id, event_id = %task.event_id, "Deleting corrupt task")
            }
            ResultCode::Success | ResultCode::Stage => {
                debug!(task_id = %task.id, code = ?code, "Task finished")
            }
            _ => info!(task_id = %task.id, event_id = %task.event_id, code = ?code, "Task finished"),
        }

        match code.disposition() {
            Disposition::Delete => self.delete_finished(task.id)?,
            Disposition::LeaveStaged => {}
            Disposition::Escalate => {
                self.delete_finished(task.id)?;
                return Err(DispatchError::UnknownOpcode {
                    opcode: task.opcode,
                    task_id: task.id,
                });
            }
        }

        Ok(Step::Executed {
            task_id: task.id,
            code,
        })
    }

    fn delete_finished(&self, id: TaskId) -> Result<(), DispatchError> {
        match self.ctx.tasks.delete(id) {
            Ok(()) => Ok(()),
            // Already gone, e.g. removed by an operator while running
            Err(TaskStoreError::InvalidArgument(msg)) => {
                warn!(task_id = %id, reason = %msg, "Finished task already deleted");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Re-arm claimed records that have sat at `exec_time == 0` longer
    /// than the threshold. Runs between dispatch steps, so this process
    /// never owns a claim at that moment. Returns how many were recovered.
    #[instrument(skip_all)]
    pub fn sweep_stale_claims(&mut self) -> Result<usize, DispatchError> {
        let now = self.ctx.now();
        let threshold = secs_to_ms(self.config.stale_claim_threshold_secs);
        let claimed = self.ctx.tasks.range_query(0, 0, None)?;

        let live: HashSet<TaskId> = claimed.iter().map(|t| t.id).collect();
        self.stale_seen.retain(|id, _| live.contains(id));

        let mut recovered = 0;
        for task in claimed {
            let first_seen = *self.stale_seen.entry(task.id).or_insert(now);
            if now - first_seen < threshold {
                continue;
            }
            self.stale_seen.remove(&task.id);

            if task.sched_time <= 0 {
                error!(task_id = %task.id, sched_time = task.sched_time, "Abandoned claim is corrupt, deleting");
                self.delete_finished(task.id)?;
                continue;
            }

            match self.ctx.tasks.stage(task.id, task.sched_time, task.stage, None) {
                Ok(()) => {
                    warn!(task_id = %task.id, event_id = %task.event_id, "Re-armed abandoned claim");
                    recovered += 1;
                }
                // Finished by its owner in the meantime
                Err(TaskStoreError::InvalidArgument(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }

        if recovered > 0 {
            self.ctx.wakeup.notify_one();
        }
        Ok(recovered)
    }

    /// How long to sleep before polling again
    fn idle_sleep(&self) -> Result<Duration, DispatchError> {
        let now = self.ctx.now();
        let idle_ms = secs_to_ms(self.config.idle_poll_secs);
        let upcoming = self.ctx.tasks.range_query(1, now.saturating_add(idle_ms), None)?;

        let wait_ms = upcoming
            .first()
            .map_or(idle_ms, |task| (task.exec_time - now).clamp(0, idle_ms));
        Ok(Duration::from_millis(u64::try_from(wait_ms).unwrap_or(0)))
    }

    /// Run until shutdown is signalled or an unknown opcode is found
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), DispatchError> {
        let sweep_interval = Duration::from_secs(self.config.sweep_interval_secs);
        let mut next_sweep = Instant::now();
        info!("Dispatcher started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            if Instant::now() >= next_sweep {
                if let Err(e) = self.sweep_stale_claims() {
                    error!(error = %e, "Stale-claim sweep failed");
                }
                next_sweep = Instant::now() + sweep_interval;
            }

            let idle = match self.run_once().await {
                Ok(Step::Idle) => true,
                Ok(_) => false,
                Err(e @ DispatchError::UnknownOpcode { .. }) => {
                    error!(error = %e, "Dispatcher halting");
                    return Err(e);
                }
                Err(DispatchError::Store(e)) => {
                    error!(error = %e, "Task store unavailable");
                    true
                }
            };

            if !idle {
                continue;
            }

            let sleep_for = match self.idle_sleep() {
                Ok(d) => d,
                Err(e) => {
                    warn!(error = %e, "Could not look ahead in task store");
                    Duration::from_secs(self.config.idle_poll_secs)
                }
            };
            let until_sweep = next_sweep.saturating_duration_since(Instant::now());

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = self.ctx.wakeup.notified() => {}
                _ = tokio::time::sleep(sleep_for.min(until_sweep)) => {}
            }
        }

        info!("Dispatcher stopped");
        Ok(())
    }
}
