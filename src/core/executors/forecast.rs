use async_trait::async_trait;
use tracing::{debug, error, info, instrument, warn};

use super::{check_guard, decode_command, ExecContext, ExecError, Executor, GuardCheck, ResultCode};
use crate::adapters::ForecastRequest;
use crate::core::health::Subsystem;
use crate::core::retry::RetryDecision;
use crate::domain::{
    next_action_time, ForecastCommand, ForecastRef, Opcode, PublishCommand, Snapshot, StopCommand,
    StopReason, TaskRecord,
};

/// Submit the command that continues `snapshot`'s forecast schedule: the
/// next `ExecForecast`, or `Stop(Expired)` once no lag remains.
pub(super) fn schedule_next_forecast(ctx: &ExecContext, snapshot: &Snapshot) -> Result<(), ExecError> {
    let Some(mainshock) = &snapshot.mainshock else {
        return Ok(());
    };

    let now = ctx.now();
    let elapsed = now.saturating_sub(mainshock.origin_time);
    let guard = snapshot.guard();

    match ctx.settings.schedule.next_lag(snapshot.last_forecast_lag, elapsed) {
        Some(lag) => {
            let due = now.max(mainshock.origin_time.saturating_add(lag));
            let command = ForecastCommand {
                guard,
                forecast_lag: lag,
                base_time: due,
            };
            let id = ctx.submit_command(Opcode::ExecForecast, &snapshot.event_id, due, &command)?;
            debug!(task_id = %id, event_id = %snapshot.event_id, lag, due, "Next forecast scheduled");
        }
        None => {
            let command = StopCommand {
                reason: StopReason::Expired,
                guard: Some(guard),
            };
            ctx.submit_command(Opcode::Stop, &snapshot.event_id, now, &command)?;
            info!(event_id = %snapshot.event_id, "Forecast schedule exhausted");
        }
    }
    Ok(())
}

/// Submit a forecast due now for the time elapsed since origin, never
/// at or below the lag already forecast. Used when analyst parameters
/// change.
pub(super) fn submit_immediate_forecast(ctx: &ExecContext, snapshot: &Snapshot) -> Result<(), ExecError> {
    let Some(mainshock) = &snapshot.mainshock else {
        return Ok(());
    };

    let now = ctx.now();
    let elapsed = now.saturating_sub(mainshock.origin_time).max(0);
    let lag = match snapshot.last_forecast_lag {
        Some(last) => elapsed.max(last + 1),
        None => elapsed,
    };
    let command = ForecastCommand {
        guard: snapshot.guard(),
        forecast_lag: lag,
        base_time: now,
    };
    ctx.submit_command(Opcode::ExecForecast, &snapshot.event_id, now, &command)?;
    Ok(())
}

/// Runs the forecast model for one lag and hands the result to publishing
pub struct ExecForecastExecutor;

#[async_trait]
impl Executor for ExecForecastExecutor {
    fn name(&self) -> &'static str {
        "exec_forecast"
    }

    #[instrument(skip_all, fields(task_id = %task.id, event_id = %task.event_id, stage = task.stage))]
    async fn execute(&self, ctx: &ExecContext, task: &TaskRecord) -> Result<ResultCode, ExecError> {
        let Some(command) = decode_command::<ForecastCommand>(task) else {
            return Ok(ResultCode::Corrupt);
        };

        let Some(snapshot) = ctx.current_snapshot(&task.event_id).await? else {
            warn!("Forecast requested for unknown event");
            return Ok(ResultCode::NoTimeline);
        };

        match check_guard(ctx, task, &snapshot, &command.guard)? {
            GuardCheck::Deferred => return Ok(ResultCode::Stage),
            GuardCheck::Current if snapshot.state.is_active() => {}
            _ => {
                info!(state = %snapshot.state, "Stale forecast command");
                return Ok(ResultCode::StaleCommand);
            }
        }

        let Some(mainshock) = snapshot.mainshock.clone() else {
            error!("Active timeline has no mainshock");
            return Ok(ResultCode::Corrupt);
        };

        let analyst_params = snapshot.analyst.as_ref().map(|a| a.params.clone());
        let request = ForecastRequest {
            event_id: task.event_id.clone(),
            mainshock,
            lag: command.forecast_lag,
            analyst_params: analyst_params.clone(),
        };

        let result = ctx.model.compute(&request).await;
        let now = ctx.now();
        let action_time = next_action_time(Some(&snapshot), now);

        match result {
            Ok(product) => {
                ctx.health.report(Subsystem::Forecast, true, now);

                let forecast = ForecastRef {
                    lag: command.forecast_lag,
                    computed_at: now,
                    analyst_params,
                    product,
                };
                let pending = snapshot.forecast_computed(action_time, forecast);
                let publish = PublishCommand {
                    guard: pending.guard(),
                    base_time: now,
                };
                ctx.submit_command(Opcode::Publish, &task.event_id, now, &publish)?;
                ctx.append(&pending).await?;
                info!(lag = command.forecast_lag, "Forecast computed");
                Ok(ResultCode::Success)
            }
            Err(e) => {
                ctx.health.report(Subsystem::Forecast, false, now);
                warn!(error = %e, lag = command.forecast_lag, "Forecast model failed");

                match ctx.settings.forecast_retry.next_retry(command.base_time, now, task.stage) {
                    RetryDecision::Retry { exec_time, stage } => {
                        ctx.tasks.stage(task.id, exec_time, stage, None)?;
                        Ok(ResultCode::Stage)
                    }
                    RetryDecision::GiveUp => {
                        let failed = snapshot.forecast_failed(action_time, command.forecast_lag);
                        schedule_next_forecast(ctx, &failed)?;
                        ctx.append(&failed).await?;
                        error!(lag = command.forecast_lag, "Forecast retries exhausted, skipping lag");
                        Ok(ResultCode::Delete)
                    }
                }
            }
        }
    }
}
