//! End-to-end dispatch scenarios.
//!
//! Each test drives the real dispatcher and executors against fakes for
//! the external collaborators, moving a manual clock between steps.

mod common;

use std::sync::atomic::Ordering;

use aftershock::core::{
    DispatchError, DispatcherConfig, EngineSettings, ForecastSchedule, HealthMonitor, ResultCode,
    RetryPolicy, Step, Subsystem, TaskStore, TimelineStore,
};
use aftershock::domain::{
    AnalystCommand, CommandGuard, ForecastCommand, IntakeCommand, NewTask, Opcode, PublishStatus,
    StopCommand, StopReason, TimelineState,
};
use serde_json::json;

use common::{mainshock, Harness, HOUR, MINUTE, ORIGIN};

const EVENT: &str = "ci40000001";

fn codes(steps: &[Step]) -> Vec<ResultCode> {
    steps
        .iter()
        .filter_map(|step| match step {
            Step::Executed { code, .. } => Some(*code),
            _ => None,
        })
        .collect()
}

fn states(timeline: &[aftershock::domain::Snapshot]) -> Vec<TimelineState> {
    timeline.iter().map(|s| s.state).collect()
}

/// Harness with an active timeline for EVENT, intake done at origin + 10m
async fn active_harness(settings: EngineSettings) -> Harness {
    let mut h = Harness::new(settings, ORIGIN + 10 * MINUTE).await;
    h.source.set(Some(mainshock(EVENT)));
    h.submit(Opcode::Intake, EVENT, h.now(), &IntakeCommand::default());

    let steps = h.run_due().await;
    assert_eq!(codes(&steps), vec![ResultCode::Success]);
    h
}

#[tokio::test]
async fn test_intake_forecast_publish_cycle() {
    let mut h = active_harness(EngineSettings::default()).await;

    let timeline = h.timeline(EVENT).await;
    assert_eq!(states(&timeline), vec![TimelineState::ActiveNormal]);
    assert_eq!(timeline[0].mainshock.as_ref().unwrap().magnitude, 6.4);

    // First lag is 20 minutes after origin
    let pending = h.pending(EVENT);
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].opcode(), Some(Opcode::ExecForecast));
    assert_eq!(pending[0].sched_time, ORIGIN + 20 * MINUTE);
    assert_eq!(pending[0].submit_id, "server");

    // Nothing is due yet
    assert!(h.run_due().await.is_empty());

    h.clock.set(ORIGIN + 20 * MINUTE);
    let steps = h.run_due().await;
    assert_eq!(codes(&steps), vec![ResultCode::Success, ResultCode::Success]);

    let timeline = h.timeline(EVENT).await;
    assert_eq!(
        states(&timeline),
        vec![
            TimelineState::ActiveNormal,
            TimelineState::PublishPending,
            TimelineState::ActiveNormal,
        ]
    );
    let last = timeline.last().unwrap();
    assert_eq!(last.publish_status, PublishStatus::Success);
    assert_eq!(last.last_forecast_lag, Some(20 * MINUTE));

    let sent = h.publisher.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].request.code, EVENT);
    assert_eq!(sent[0].request.network, "us");
    assert_eq!(sent[0].request.attachments[0].name, "inputs.json");
    assert_eq!(sent[0].signature.as_deref(), Some("test-signature"));

    // The next lag (1 hour) is queued
    let pending = h.pending(EVENT);
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].opcode(), Some(Opcode::ExecForecast));
    assert_eq!(pending[0].sched_time, ORIGIN + HOUR);

    assert!(h.health.alerts(h.now()).is_empty());
}

#[tokio::test]
async fn test_publish_retries_then_gives_up() {
    let settings = EngineSettings {
        publish_retry: RetryPolicy::new(vec![3_600, 21_600, 86_400]),
        ..EngineSettings::default()
    };
    let mut h = active_harness(settings).await;
    h.publisher.fail.store(true, Ordering::SeqCst);

    let base = ORIGIN + 20 * MINUTE;
    h.clock.set(base);

    // Forecast, then the first publish attempt
    let step = h.dispatcher.run_once().await.unwrap();
    assert!(matches!(step, Step::Executed { code: ResultCode::Success, .. }));
    let step = h.dispatcher.run_once().await.unwrap();
    assert!(matches!(step, Step::Executed { code: ResultCode::Stage, .. }));
    assert_eq!(h.dispatcher.run_once().await.unwrap(), Step::Idle);

    let timeline = h.timeline(EVENT).await;
    assert_eq!(timeline.last().unwrap().state, TimelineState::PublishRetry);
    assert!(!h.health.monitor(Subsystem::Publish).check_alert(h.now()));

    let publish = h.pending(EVENT);
    assert_eq!(publish.len(), 1);
    assert_eq!(publish[0].exec_time, base + HOUR);
    assert_eq!(publish[0].stage, 1);

    // Retries are measured from the original publish time
    for (at, expected_stage) in [(base + HOUR, 2), (base + 6 * HOUR, 3)] {
        h.clock.set(at);
        let step = h.dispatcher.run_once().await.unwrap();
        assert!(matches!(step, Step::Executed { code: ResultCode::Stage, .. }));
        assert_eq!(h.pending(EVENT)[0].stage, expected_stage);
    }

    h.clock.set(base + 24 * HOUR);
    let step = h.dispatcher.run_once().await.unwrap();
    assert!(matches!(step, Step::Executed { code: ResultCode::Delete, .. }));
    assert_eq!(h.publisher.attempts(), 4);
    assert!(h.health.monitor(Subsystem::Publish).check_alert(h.now()));
    assert_eq!(h.health.alerts(h.now()), vec![Subsystem::Publish]);

    let timeline = h.timeline(EVENT).await;
    let last = timeline.last().unwrap();
    assert_eq!(last.state, TimelineState::ActiveNormal);
    assert_eq!(last.publish_status, PublishStatus::Failure);

    // Publishing is abandoned; the schedule carries on
    let pending = h.pending(EVENT);
    assert!(pending.iter().all(|t| t.opcode() != Some(Opcode::Publish)));
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].opcode(), Some(Opcode::ExecForecast));
}

#[tokio::test]
async fn test_analyst_override_supersedes_queued_forecast() {
    let mut h = active_harness(EngineSettings::default()).await;

    h.clock.set(ORIGIN + 15 * MINUTE);
    let command = AnalystCommand {
        analyst_id: "jdoe".to_string(),
        params: Some(json!({ "b": 1.1 })),
    };
    h.submit(Opcode::AnalystIntervene, EVENT, h.now(), &command);

    // Override, then an immediate forecast and publish
    let steps = h.run_due().await;
    assert_eq!(codes(&steps), vec![ResultCode::Success; 3]);

    let timeline = h.timeline(EVENT).await;
    assert_eq!(
        states(&timeline),
        vec![
            TimelineState::ActiveNormal,
            TimelineState::ActiveAnalystOverride,
            TimelineState::PublishPending,
            TimelineState::ActiveNormal,
        ]
    );
    assert!(timeline.last().unwrap().analyst.is_some());

    let calls = h.model.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].lag, 15 * MINUTE);
    assert_eq!(calls[0].analyst_params, Some(json!({ "b": 1.1 })));

    // The forecast queued at intake no longer matches the timeline
    h.clock.set(ORIGIN + 20 * MINUTE);
    let steps = h.run_due().await;
    assert_eq!(
        codes(&steps),
        vec![ResultCode::StaleCommand, ResultCode::Success, ResultCode::Success]
    );

    let calls = h.model.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[1].lag, 20 * MINUTE);
    assert_eq!(calls[1].analyst_params, Some(json!({ "b": 1.1 })));
}

#[tokio::test]
async fn test_analyst_on_pending_timeline_waits_for_activation() {
    let settings = EngineSettings {
        intake_retry: RetryPolicy::new(vec![30, 120]),
        ..EngineSettings::default()
    };
    let start = ORIGIN + 10 * MINUTE;
    let mut h = Harness::new(settings, start).await;
    h.submit(Opcode::Intake, EVENT, start, &IntakeCommand::default());

    assert_eq!(codes(&h.run_due().await), vec![ResultCode::Stage]);

    let command = AnalystCommand {
        analyst_id: "jdoe".to_string(),
        params: Some(json!({ "p": 1.08 })),
    };
    h.submit(Opcode::AnalystIntervene, EVENT, h.now(), &command);
    assert_eq!(codes(&h.run_due().await), vec![ResultCode::Success]);

    let timeline = h.timeline(EVENT).await;
    assert_eq!(
        states(&timeline),
        vec![TimelineState::IntakePending, TimelineState::IntakePending]
    );
    assert!(h.model.calls().is_empty());

    h.source.set(Some(mainshock(EVENT)));
    h.clock.set(start + 30_000);
    assert_eq!(codes(&h.run_due().await), vec![ResultCode::Success]);

    let active = h.timeline(EVENT).await.pop().unwrap();
    assert_eq!(active.state, TimelineState::ActiveNormal);
    assert_eq!(active.analyst.as_ref().unwrap().analyst_id, "jdoe");

    h.clock.set(ORIGIN + 20 * MINUTE);
    h.run_due().await;
    assert_eq!(h.model.calls()[0].analyst_params, Some(json!({ "p": 1.08 })));
}

#[tokio::test]
async fn test_intake_gives_up_when_mainshock_never_resolves() {
    let settings = EngineSettings {
        intake_retry: RetryPolicy::new(vec![30, 120]),
        ..EngineSettings::default()
    };
    let start = ORIGIN + 10 * MINUTE;
    let mut h = Harness::new(settings, start).await;
    h.submit(Opcode::Intake, EVENT, start, &IntakeCommand::default());

    assert_eq!(codes(&h.run_due().await), vec![ResultCode::Stage]);
    assert_eq!(h.pending(EVENT)[0].exec_time, start + 30_000);

    h.clock.set(start + 30_000);
    assert_eq!(codes(&h.run_due().await), vec![ResultCode::Stage]);
    assert_eq!(h.pending(EVENT)[0].exec_time, start + 120_000);

    h.clock.set(start + 120_000);
    assert_eq!(codes(&h.run_due().await), vec![ResultCode::Delete]);

    let timeline = h.timeline(EVENT).await;
    assert_eq!(
        states(&timeline),
        vec![TimelineState::IntakePending, TimelineState::Stopped]
    );
    assert_eq!(timeline[1].stop_reason, Some(StopReason::IntakeFailed));
    assert!(h.pending(EVENT).is_empty());

    // Three failed lookups; the fetch rule wants the run to last 30 minutes
    let fetch = h.health.monitor(Subsystem::DataFetch);
    assert!(!fetch.check_alert(start + 120_000));
    assert!(fetch.check_alert(start + 30 * MINUTE));
}

#[tokio::test]
async fn test_stop_makes_queued_work_stale() {
    let mut h = active_harness(EngineSettings::default()).await;

    let stop = StopCommand {
        reason: StopReason::AliasRetired {
            superseded_by: "ci40000002".to_string(),
        },
        guard: None,
    };
    h.submit(Opcode::Stop, EVENT, h.now(), &stop);
    assert_eq!(codes(&h.run_due().await), vec![ResultCode::Success]);

    // A second stop changes nothing
    h.submit(Opcode::Stop, EVENT, h.now(), &stop);
    assert_eq!(codes(&h.run_due().await), vec![ResultCode::AlreadyInState]);

    h.clock.set(ORIGIN + 20 * MINUTE);
    assert_eq!(codes(&h.run_due().await), vec![ResultCode::StaleCommand]);
    assert!(h.model.calls().is_empty());
    assert!(h.pending(EVENT).is_empty());

    let last = h.timeline(EVENT).await.pop().unwrap();
    assert_eq!(last.state, TimelineState::Stopped);
    assert!(matches!(last.stop_reason, Some(StopReason::AliasRetired { .. })));
}

#[tokio::test]
async fn test_exhausted_schedule_expires_timeline() {
    let settings = EngineSettings {
        schedule: ForecastSchedule::new(vec![1_200]),
        ..EngineSettings::default()
    };
    let mut h = active_harness(settings).await;

    h.clock.set(ORIGIN + 20 * MINUTE);
    let steps = h.run_due().await;
    assert_eq!(codes(&steps), vec![ResultCode::Success; 3]);

    let last = h.timeline(EVENT).await.pop().unwrap();
    assert_eq!(last.state, TimelineState::Stopped);
    assert_eq!(last.stop_reason, Some(StopReason::Expired));
    assert!(h.pending(EVENT).is_empty());
}

#[tokio::test]
async fn test_forecast_failures_skip_the_lag() {
    let settings = EngineSettings {
        forecast_retry: RetryPolicy::new(vec![60]),
        ..EngineSettings::default()
    };
    let mut h = active_harness(settings).await;
    h.model.fail.store(true, Ordering::SeqCst);

    h.clock.set(ORIGIN + 20 * MINUTE);
    assert_eq!(codes(&h.run_due().await), vec![ResultCode::Stage]);

    h.clock.advance(60_000);
    assert_eq!(codes(&h.run_due().await), vec![ResultCode::Delete]);

    let last = h.timeline(EVENT).await.pop().unwrap();
    assert_eq!(last.state, TimelineState::ActiveNormal);
    assert_eq!(last.last_forecast_lag, Some(20 * MINUTE));
    assert_eq!(last.publish_status, PublishStatus::Failure);

    let pending = h.pending(EVENT);
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].sched_time, ORIGIN + HOUR);
    assert_eq!(h.publisher.attempts(), 0);
}

#[tokio::test]
async fn test_corrupt_payload_is_deleted() {
    let mut h = active_harness(EngineSettings::default()).await;

    let task = NewTask::new(Opcode::Publish, EVENT, h.now(), h.now(), "test")
        .with_details("{not json".to_string());
    let id = h.tasks.submit(task).unwrap();

    assert_eq!(codes(&h.run_due().await), vec![ResultCode::Corrupt]);
    assert!(h.pending(EVENT).iter().all(|t| t.id != id));
}

#[tokio::test]
async fn test_unknown_opcode_halts_dispatch() {
    let mut h = Harness::new(EngineSettings::default(), ORIGIN).await;

    let task = NewTask::new(Opcode::NoOp, EVENT, ORIGIN, ORIGIN, "test").with_raw_opcode(42);
    let id = h.tasks.submit(task).unwrap();

    let err = h.dispatcher.run_once().await.unwrap_err();
    match err {
        DispatchError::UnknownOpcode { opcode, task_id } => {
            assert_eq!(opcode, 42);
            assert_eq!(task_id, id);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(h.pending(EVENT).is_empty());
}

#[tokio::test]
async fn test_sweep_rearms_abandoned_claims() {
    let config = DispatcherConfig {
        stale_claim_threshold_secs: 600,
        ..DispatcherConfig::default()
    };
    let mut h = Harness::with_config(EngineSettings::default(), config, ORIGIN).await;
    h.submit(Opcode::Intake, EVENT, ORIGIN, &IntakeCommand::default());

    // Another process claims the task and dies
    let claimed = h.tasks.claim_ready(ORIGIN).unwrap().unwrap();
    assert!(claimed.sched_time > 0);
    assert_eq!(h.dispatcher.run_once().await.unwrap(), Step::Idle);

    assert_eq!(h.dispatcher.sweep_stale_claims().unwrap(), 0);
    h.clock.advance(5 * MINUTE);
    assert_eq!(h.dispatcher.sweep_stale_claims().unwrap(), 0);
    h.clock.advance(5 * MINUTE);
    assert_eq!(h.dispatcher.sweep_stale_claims().unwrap(), 1);

    let task = &h.pending(EVENT)[0];
    assert_eq!(task.id, claimed.id);
    assert_eq!(task.exec_time, ORIGIN);

    h.source.set(Some(mainshock(EVENT)));
    assert_eq!(codes(&h.run_due().await), vec![ResultCode::Success]);
}

#[tokio::test]
async fn test_invalid_event_id_is_not_retried() {
    let mut h = Harness::new(EngineSettings::default(), ORIGIN).await;
    h.submit(Opcode::Intake, "us:1234", ORIGIN, &IntakeCommand::default());

    let step = h.dispatcher.run_once().await.unwrap();
    assert!(matches!(step, Step::Executed { code: ResultCode::Corrupt, .. }));

    h.clock.advance(HOUR);
    assert_eq!(h.dispatcher.run_once().await.unwrap(), Step::Idle);
    assert!(h.tasks.range_query(i64::MIN, i64::MAX, None).unwrap().is_empty());
}

#[tokio::test]
async fn test_lost_follow_up_is_reissued_on_rerun() {
    let mut h = Harness::new(EngineSettings::default(), ORIGIN + 10 * MINUTE).await;
    h.source.set(Some(mainshock(EVENT)));
    h.submit(Opcode::Intake, EVENT, h.now(), &IntakeCommand::default());

    // Scheduling the first forecast fails: nothing is written yet
    h.tasks.fail_next_submit.store(true, Ordering::SeqCst);
    let step = h.dispatcher.run_once().await.unwrap();
    assert!(matches!(step, Step::Rearmed { .. }));
    assert!(h.timelines.open(EVENT).await.is_err());

    h.clock.advance(MINUTE);
    assert_eq!(codes(&h.run_due().await), vec![ResultCode::Success]);
    assert_eq!(states(&h.timeline(EVENT).await), vec![TimelineState::ActiveNormal]);

    let pending = h.pending(EVENT);
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].opcode(), Some(Opcode::ExecForecast));

    // Same for the publish a forecast hands off, and the lag after it
    h.clock.set(ORIGIN + 20 * MINUTE);
    h.tasks.fail_next_submit.store(true, Ordering::SeqCst);
    let step = h.dispatcher.run_once().await.unwrap();
    assert!(matches!(step, Step::Rearmed { .. }));
    assert_eq!(h.timeline(EVENT).await.len(), 1);

    h.clock.advance(MINUTE);
    let step = h.dispatcher.run_once().await.unwrap();
    assert!(matches!(step, Step::Executed { code: ResultCode::Success, .. }));

    h.tasks.fail_next_submit.store(true, Ordering::SeqCst);
    let step = h.dispatcher.run_once().await.unwrap();
    assert!(matches!(step, Step::Rearmed { .. }));
    assert_eq!(h.timeline(EVENT).await.last().unwrap().state, TimelineState::PublishPending);

    h.clock.advance(MINUTE);
    assert_eq!(codes(&h.run_due().await), vec![ResultCode::Success]);

    let timeline = h.timeline(EVENT).await;
    assert_eq!(
        states(&timeline),
        vec![
            TimelineState::ActiveNormal,
            TimelineState::PublishPending,
            TimelineState::ActiveNormal,
        ]
    );
    assert_eq!(timeline[2].publish_status, PublishStatus::Success);

    let pending = h.pending(EVENT);
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].sched_time, ORIGIN + HOUR);
}

#[tokio::test]
async fn test_command_ahead_of_log_waits_then_expires() {
    let mut h = active_harness(EngineSettings::default()).await;
    let cycle = h.timeline(EVENT).await[0].cycle_time;

    // Issued by a snapshot that has not reached the log
    let command = ForecastCommand {
        guard: CommandGuard {
            action_time: cycle + 5_000,
            last_forecast_lag: None,
        },
        forecast_lag: 20 * MINUTE,
        base_time: h.now(),
    };
    let id = h.submit(Opcode::ExecForecast, EVENT, h.now(), &command);

    let step = h.dispatcher.run_once().await.unwrap();
    assert_eq!(
        step,
        Step::Executed {
            task_id: id,
            code: ResultCode::Stage
        }
    );
    let deferred = h.pending(EVENT).into_iter().find(|t| t.id == id).unwrap();
    assert_eq!(deferred.exec_time, h.now() + 1_000);

    // The snapshot never arrives
    h.clock.set(cycle + 5_000 + MINUTE);
    assert_eq!(codes(&h.run_due().await), vec![ResultCode::StaleCommand]);
    assert!(h.model.calls().is_empty());
}

#[tokio::test]
async fn test_analyst_during_publish_retry_keeps_forecast() {
    let mut h = active_harness(EngineSettings::default()).await;
    h.publisher.fail.store(true, Ordering::SeqCst);

    let base = ORIGIN + 20 * MINUTE;
    h.clock.set(base);
    assert_eq!(
        codes(&h.run_due().await),
        vec![ResultCode::Success, ResultCode::Stage]
    );

    let command = AnalystCommand {
        analyst_id: "jdoe".to_string(),
        params: Some(json!({ "b": 0.9 })),
    };
    h.submit(Opcode::AnalystIntervene, EVENT, h.now(), &command);
    assert_eq!(codes(&h.run_due().await), vec![ResultCode::Success]);

    let attached = h.timeline(EVENT).await.pop().unwrap();
    assert_eq!(attached.state, TimelineState::PublishRetry);
    assert_eq!(attached.publish_status, PublishStatus::Pending);
    assert!(attached.analyst.is_some());

    // The retry still publishes the 20 minute forecast, then the new
    // parameters are forecast straight away
    h.publisher.fail.store(false, Ordering::SeqCst);
    h.clock.set(base + MINUTE);
    assert_eq!(codes(&h.run_due().await), vec![ResultCode::Success; 3]);

    let sent = h.publisher.sent();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0].request.payload, json!({ "lag": 20 * MINUTE }).to_string());

    let calls = h.model.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[1].lag, 21 * MINUTE);
    assert_eq!(calls[1].analyst_params, Some(json!({ "b": 0.9 })));

    let timeline = h.timeline(EVENT).await;
    let finished: Vec<PublishStatus> = timeline
        .windows(2)
        .filter(|w| w[0].state.is_publishing() && !w[1].state.is_publishing())
        .map(|w| w[1].publish_status)
        .collect();
    assert_eq!(finished, vec![PublishStatus::Success, PublishStatus::Success]);
    assert_eq!(h.pending(EVENT)[0].sched_time, ORIGIN + HOUR);
}
