use async_trait::async_trait;
use tracing::{info, instrument, warn};

use super::{check_guard, decode_command, ExecContext, ExecError, Executor, GuardCheck, ResultCode};
use crate::domain::{next_action_time, StopCommand, TaskRecord};

/// Moves a timeline to `STOPPED`
pub struct StopExecutor;

#[async_trait]
impl Executor for StopExecutor {
    fn name(&self) -> &'static str {
        "stop"
    }

    #[instrument(skip_all, fields(task_id = %task.id, event_id = %task.event_id))]
    async fn execute(&self, ctx: &ExecContext, task: &TaskRecord) -> Result<ResultCode, ExecError> {
        let Some(command) = decode_command::<StopCommand>(task) else {
            return Ok(ResultCode::Corrupt);
        };

        let Some(snapshot) = ctx.current_snapshot(&task.event_id).await? else {
            warn!("Stop requested for unknown event");
            return Ok(ResultCode::NoTimeline);
        };

        if snapshot.state.is_terminal() {
            return Ok(ResultCode::AlreadyInState);
        }

        if let Some(guard) = &command.guard {
            match check_guard(ctx, task, &snapshot, guard)? {
                GuardCheck::Current => {}
                GuardCheck::Deferred => return Ok(ResultCode::Stage),
                GuardCheck::Stale => {
                    info!(state = %snapshot.state, "Stale stop command");
                    return Ok(ResultCode::StaleCommand);
                }
            }
        }

        let now = ctx.now();
        let stopped = snapshot.stopped(next_action_time(Some(&snapshot), now), command.reason.clone());
        ctx.append(&stopped).await?;
        info!(reason = %command.reason, "Timeline stopped");

        Ok(ResultCode::Success)
    }
}
