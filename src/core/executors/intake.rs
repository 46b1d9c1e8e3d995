use async_trait::async_trait;
use tracing::{error, info, instrument, warn};

use super::forecast::schedule_next_forecast;
use super::{ExecContext, ExecError, Executor, ResultCode};
use crate::core::health::Subsystem;
use crate::core::retry::RetryDecision;
use crate::domain::payload;
use crate::domain::{next_action_time, IntakeCommand, Snapshot, StopReason, TaskRecord, TimelineState};

/// Creates a timeline, or converts a pending one once its mainshock resolves
pub struct IntakeExecutor;

#[async_trait]
impl Executor for IntakeExecutor {
    fn name(&self) -> &'static str {
        "intake"
    }

    #[instrument(skip_all, fields(task_id = %task.id, event_id = %task.event_id, stage = task.stage))]
    async fn execute(&self, ctx: &ExecContext, task: &TaskRecord) -> Result<ResultCode, ExecError> {
        // Intake commands may carry no payload at all
        let command: IntakeCommand = match payload::decode_or_default(task.details.as_deref()) {
            Ok(command) => command,
            Err(e) => {
                error!(error = %e, "Corrupt intake payload");
                return Ok(ResultCode::Corrupt);
            }
        };

        if task.event_id.is_empty() {
            error!("Intake task without an event id");
            return Ok(ResultCode::Corrupt);
        }

        let current = ctx.current_snapshot(&task.event_id).await?;
        if let Some(snapshot) = &current {
            if snapshot.state != TimelineState::IntakePending {
                info!(state = %snapshot.state, "Timeline already past intake");
                return Ok(ResultCode::AlreadyInState);
            }
        }

        let now = ctx.now();
        let base_time = command.base_time.unwrap_or(task.sched_time);

        match ctx.source.fetch(&task.event_id).await {
            Ok(mainshock) => {
                ctx.health.report(Subsystem::DataFetch, true, now);

                let action_time = next_action_time(current.as_ref(), now);
                let active = match &current {
                    Some(pending) => pending.activate(action_time, mainshock),
                    None => Snapshot::activated(&task.event_id, action_time, mainshock),
                };
                // Follow-up first: if the append then fails, the re-run
                // writes a newer snapshot and this command goes stale
                schedule_next_forecast(ctx, &active)?;
                ctx.append(&active).await?;
                info!(magnitude = active.mainshock.as_ref().map(|m| m.magnitude), "Timeline active");

                Ok(ResultCode::Success)
            }
            Err(e) => {
                ctx.health.report(Subsystem::DataFetch, false, now);
                warn!(error = %e, "Mainshock lookup failed");

                let pending = match current {
                    Some(pending) => pending,
                    None => {
                        let pending = Snapshot::intake_pending(&task.event_id, now);
                        ctx.append(&pending).await?;
                        pending
                    }
                };

                match ctx.settings.intake_retry.next_retry(base_time, now, task.stage) {
                    RetryDecision::Retry { exec_time, stage } => {
                        ctx.tasks.stage(task.id, exec_time, stage, None)?;
                        info!(exec_time, next_stage = stage, "Intake retry scheduled");
                        Ok(ResultCode::Stage)
                    }
                    RetryDecision::GiveUp => {
                        let stopped = pending.stopped(
                            next_action_time(Some(&pending), now),
                            StopReason::IntakeFailed,
                        );
                        ctx.append(&stopped).await?;
                        error!("Mainshock never resolved, timeline stopped");
                        Ok(ResultCode::Delete)
                    }
                }
            }
        }
    }
}
