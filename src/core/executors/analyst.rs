use async_trait::async_trait;
use tracing::{info, instrument, warn};

use super::forecast::submit_immediate_forecast;
use super::{decode_command, ExecContext, ExecError, Executor, ResultCode};
use crate::domain::{next_action_time, AnalystCommand, AnalystOverride, TaskRecord, TimelineState};

/// Applies an analyst override and forces a fresh forecast
pub struct AnalystExecutor;

#[async_trait]
impl Executor for AnalystExecutor {
    fn name(&self) -> &'static str {
        "analyst_intervene"
    }

    #[instrument(skip_all, fields(task_id = %task.id, event_id = %task.event_id))]
    async fn execute(&self, ctx: &ExecContext, task: &TaskRecord) -> Result<ResultCode, ExecError> {
        let Some(command) = decode_command::<AnalystCommand>(task) else {
            return Ok(ResultCode::Corrupt);
        };

        let Some(snapshot) = ctx.current_snapshot(&task.event_id).await? else {
            warn!("Analyst intervention for unknown event");
            return Ok(ResultCode::NoTimeline);
        };

        if snapshot.state.is_terminal() {
            info!("Analyst intervention on stopped timeline");
            return Ok(ResultCode::AlreadyInState);
        }

        let now = ctx.now();
        let analyst = command.params.map(|params| AnalystOverride {
            analyst_id: command.analyst_id.clone(),
            params,
            submitted_at: now,
        });
        let cleared = analyst.is_none();

        let next = snapshot.with_override(next_action_time(Some(&snapshot), now), analyst);

        // Pending timelines pick the override up at activation; an open
        // publish cycle finishes first and the publisher re-forecasts
        if next.state == TimelineState::IntakePending || next.state.is_publishing() {
            ctx.append(&next).await?;
            info!(analyst = %command.analyst_id, cleared, state = %next.state, "Analyst override attached");
            return Ok(ResultCode::Success);
        }

        submit_immediate_forecast(ctx, &next)?;
        ctx.append(&next).await?;
        info!(analyst = %command.analyst_id, cleared, state = %next.state, "Analyst override applied");

        Ok(ResultCode::Success)
    }
}
