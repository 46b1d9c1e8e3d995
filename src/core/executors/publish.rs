use async_trait::async_trait;
use tracing::{error, info, instrument, warn};

use super::forecast::{schedule_next_forecast, submit_immediate_forecast};
use super::{check_guard, decode_command, ExecContext, ExecError, Executor, GuardCheck, ResultCode};
use crate::adapters::{Attachment, ProductRequest};
use crate::core::health::Subsystem;
use crate::core::retry::RetryDecision;
use crate::domain::{
    next_action_time, ForecastRef, PublishCommand, PublishStatus, Snapshot, TaskRecord,
    TimelineState,
};

/// Publishes the timeline's forecast, retrying on the publish schedule
pub struct PublishExecutor;

async fn publish_forecast(
    ctx: &ExecContext,
    snapshot: &Snapshot,
    forecast: &ForecastRef,
) -> anyhow::Result<()> {
    let settings = &ctx.settings;
    // Enough to reproduce the forecast later
    let inputs = serde_json::json!({
        "mainshock": snapshot.mainshock,
        "lag": forecast.lag,
        "analyst_params": forecast.analyst_params,
    });

    let request = ProductRequest {
        event_id: snapshot.event_id.clone(),
        network: settings.product_network.clone(),
        code: format!("{}{}", settings.product_code_prefix, snapshot.event_id),
        reviewed: settings.product_reviewed,
        payload: serde_json::to_string(&forecast.product)?,
        modified_time: forecast.computed_at,
        attachments: vec![Attachment {
            name: "inputs.json".to_string(),
            content_type: "application/json".to_string(),
            content: serde_json::to_string(&inputs)?,
        }],
    };

    let mut product = ctx.publisher.build(request)?;
    ctx.publisher.sign(&mut product)?;
    ctx.publisher.send(&product, false).await
}

/// After a publish cycle: re-forecast now if the analyst parameters
/// changed while it was open, otherwise move to the next lag
fn continue_schedule(ctx: &ExecContext, done: &Snapshot, forecast: &ForecastRef) -> Result<(), ExecError> {
    let current = done.analyst.as_ref().map(|a| &a.params);
    if current != forecast.analyst_params.as_ref() {
        info!(event_id = %done.event_id, "Analyst parameters changed during publish");
        submit_immediate_forecast(ctx, done)
    } else {
        schedule_next_forecast(ctx, done)
    }
}

#[async_trait]
impl Executor for PublishExecutor {
    fn name(&self) -> &'static str {
        "publish"
    }

    #[instrument(skip_all, fields(task_id = %task.id, event_id = %task.event_id, stage = task.stage))]
    async fn execute(&self, ctx: &ExecContext, task: &TaskRecord) -> Result<ResultCode, ExecError> {
        let Some(command) = decode_command::<PublishCommand>(task) else {
            return Ok(ResultCode::Corrupt);
        };

        let Some(snapshot) = ctx.current_snapshot(&task.event_id).await? else {
            warn!("Publish requested for unknown event");
            return Ok(ResultCode::NoTimeline);
        };

        match check_guard(ctx, task, &snapshot, &command.guard)? {
            GuardCheck::Deferred => return Ok(ResultCode::Stage),
            GuardCheck::Current if snapshot.state.is_publishing() => {}
            _ => {
                info!(state = %snapshot.state, "Stale publish command");
                return Ok(ResultCode::StaleCommand);
            }
        }

        let Some(forecast) = snapshot.forecast.clone() else {
            error!("Publishing timeline has no forecast");
            return Ok(ResultCode::Corrupt);
        };

        let result = publish_forecast(ctx, &snapshot, &forecast).await;
        let now = ctx.now();
        let action_time = next_action_time(Some(&snapshot), now);

        match result {
            Ok(()) => {
                ctx.health.report(Subsystem::Publish, true, now);

                let done = snapshot.publish_finished(action_time, PublishStatus::Success);
                continue_schedule(ctx, &done, &forecast)?;
                ctx.append(&done).await?;
                info!(lag = forecast.lag, "Forecast published");

                Ok(ResultCode::Success)
            }
            Err(e) => {
                ctx.health.report(Subsystem::Publish, false, now);
                warn!(error = %e, "Publish failed");

                match ctx.settings.publish_retry.next_retry(command.base_time, now, task.stage) {
                    RetryDecision::Retry { exec_time, stage } => {
                        if snapshot.state == TimelineState::PublishPending {
                            ctx.append(&snapshot.publish_retrying(action_time)).await?;
                        }
                        ctx.tasks.stage(task.id, exec_time, stage, None)?;
                        info!(exec_time, next_stage = stage, "Publish retry scheduled");
                        Ok(ResultCode::Stage)
                    }
                    RetryDecision::GiveUp => {
                        let done = snapshot.publish_finished(action_time, PublishStatus::Failure);
                        continue_schedule(ctx, &done, &forecast)?;
                        ctx.append(&done).await?;
                        error!(lag = forecast.lag, "Publish retries exhausted");

                        Ok(ResultCode::Delete)
                    }
                }
            }
        }
    }
}
