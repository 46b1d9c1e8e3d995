//! Command-line interface for aftershock.
//!
//! Provides commands for running the dispatcher, submitting operator
//! commands, and inspecting tasks and timelines.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::DateTime;
use clap::{Parser, Subcommand};
use tokio::sync::{watch, Notify};
use tracing::{info, warn, Instrument};
use uuid::Uuid;

use crate::adapters::{CommandForecastModel, HttpMainshockSource, HttpPublisher};
use crate::config::{self, ResolvedConfig};
use crate::core::{
    Clock, Dispatcher, ExecContext, ExecutorRegistry, JsonlTimelineStore, ServerHealth,
    SqliteTaskStore, SystemClock, TaskStore, TimelineStore,
};
use crate::domain::payload;
use crate::domain::{
    AnalystCommand, IntakeCommand, NewTask, Opcode, Payload, StopCommand, StopReason, TaskRecord,
};

/// aftershock - Aftershock forecast dispatch engine
#[derive(Parser, Debug)]
#[command(name = "aftershock")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the dispatcher until Ctrl-C
    Serve,

    /// Start tracking an event
    Intake {
        /// Event ID
        event_id: String,

        /// Delay before intake runs
        #[arg(long, default_value = "0")]
        delay_secs: u64,
    },

    /// Set or clear analyst forecast parameters
    Analyst {
        /// Event ID
        event_id: String,

        /// JSON file with model parameters
        #[arg(long, conflicts_with = "clear", required_unless_present = "clear")]
        params: Option<PathBuf>,

        /// Remove the current override
        #[arg(long)]
        clear: bool,

        /// Analyst identifier (defaults to $USER)
        #[arg(long, env = "USER")]
        analyst: Option<String>,
    },

    /// Stop tracking an event
    Stop {
        /// Event ID
        event_id: String,

        /// The event was merged into this one
        #[arg(long)]
        superseded_by: Option<String>,
    },

    /// List pending tasks
    Tasks {
        /// Only tasks for this event
        #[arg(short, long)]
        event: Option<String>,
    },

    /// Show an event's timeline
    Timeline {
        /// Event ID
        event_id: String,
    },

    /// List tracked events
    Events,

    /// Write every task record to a JSON file
    Backup {
        /// Output file
        file: PathBuf,
    },

    /// Re-submit task records from a backup file
    Restore {
        /// Backup file
        file: PathBuf,
    },

    /// Show resolved configuration (debug)
    Config,
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        let cfg = config::config()?;

        match self.command {
            Commands::Serve => serve(cfg).await,
            Commands::Intake {
                event_id,
                delay_secs,
            } => submit_intake(cfg, &event_id, delay_secs),
            Commands::Analyst {
                event_id,
                params,
                clear,
                analyst,
            } => submit_analyst(cfg, &event_id, params.as_deref(), clear, analyst),
            Commands::Stop {
                event_id,
                superseded_by,
            } => submit_stop(cfg, &event_id, superseded_by),
            Commands::Tasks { event } => list_tasks(cfg, event.as_deref()),
            Commands::Timeline { event_id } => show_timeline(cfg, &event_id).await,
            Commands::Events => list_events(cfg).await,
            Commands::Backup { file } => backup(cfg, &file),
            Commands::Restore { file } => restore(cfg, &file),
            Commands::Config => show_config(cfg),
        }
    }
}

fn open_task_store(cfg: &ResolvedConfig) -> Result<SqliteTaskStore> {
    if let Some(parent) = cfg.task_db.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    SqliteTaskStore::open(&cfg.task_db)
        .with_context(|| format!("Failed to open task store: {}", cfg.task_db.display()))
}

async fn open_timelines(cfg: &ResolvedConfig) -> Result<JsonlTimelineStore> {
    JsonlTimelineStore::open_dir(&cfg.timeline_dir)
        .await
        .with_context(|| format!("Failed to open timelines: {}", cfg.timeline_dir.display()))
}

fn format_time(millis: i64) -> String {
    DateTime::from_timestamp_millis(millis)
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| millis.to_string())
}

fn operator_id() -> String {
    std::env::var("USER").map_or_else(|_| "operator".to_string(), |user| format!("cli:{}", user))
}

/// Submit an operator command due now (plus `delay_ms`)
fn submit_command<P: Payload>(
    cfg: &ResolvedConfig,
    opcode: Opcode,
    event_id: &str,
    delay_ms: i64,
    command: &P,
) -> Result<()> {
    crate::core::timeline::validate_event_id(event_id)?;

    let store = open_task_store(cfg)?;
    let now = SystemClock.now_millis();
    let task = NewTask::new(opcode, event_id, now + delay_ms, now, operator_id())
        .with_details(payload::encode(command)?);

    let id = store.submit(task)?;
    println!("Submitted {} for {} as {}", opcode, event_id, id);
    Ok(())
}

/// Run the dispatcher until Ctrl-C
async fn serve(cfg: &ResolvedConfig) -> Result<()> {
    let tasks: Arc<dyn TaskStore> = Arc::new(open_task_store(cfg)?);
    let timelines: Arc<dyn TimelineStore> = Arc::new(open_timelines(cfg).await?);

    let ctx = ExecContext {
        tasks,
        timelines,
        publisher: Arc::new(HttpPublisher::from_settings(&cfg.publish)?),
        source: Arc::new(HttpMainshockSource::from_settings(&cfg.source)?),
        model: Arc::new(CommandForecastModel::from_settings(&cfg.model)?),
        health: Arc::new(ServerHealth::new(&cfg.health)),
        clock: Arc::new(SystemClock),
        settings: Arc::new(cfg.engine.clone()),
        wakeup: Arc::new(Notify::new()),
    };

    if cfg.publish.signing_key.is_none() {
        warn!("No publish signing key set (AFTERSHOCK_PUBLISH_KEY); every publish will fail");
    }

    let dispatcher = Dispatcher::new(
        Arc::new(ctx),
        ExecutorRegistry::standard(),
        cfg.dispatcher.clone(),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown requested, finishing current task");
            let _ = shutdown_tx.send(true);
        }
    });

    let instance = Uuid::new_v4();
    let span = tracing::info_span!("dispatcher", %instance);
    dispatcher
        .run(shutdown_rx)
        .instrument(span)
        .await
        .context("Dispatcher stopped with an error")
}

fn submit_intake(cfg: &ResolvedConfig, event_id: &str, delay_secs: u64) -> Result<()> {
    let delay_ms = i64::try_from(delay_secs)
        .ok()
        .and_then(|s| s.checked_mul(1000))
        .context("Delay too large")?;
    submit_command(cfg, Opcode::Intake, event_id, delay_ms, &IntakeCommand::default())
}

fn submit_analyst(
    cfg: &ResolvedConfig,
    event_id: &str,
    params_file: Option<&Path>,
    clear: bool,
    analyst: Option<String>,
) -> Result<()> {
    let params = match (params_file, clear) {
        (_, true) => None,
        (Some(path), false) => {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read params file: {}", path.display()))?;
            let value: serde_json::Value = serde_json::from_str(&content)
                .with_context(|| format!("Params file is not valid JSON: {}", path.display()))?;
            Some(value)
        }
        (None, false) => bail!("Either --params or --clear is required"),
    };

    let command = AnalystCommand {
        analyst_id: analyst.unwrap_or_else(operator_id),
        params,
    };
    submit_command(cfg, Opcode::AnalystIntervene, event_id, 0, &command)
}

fn submit_stop(cfg: &ResolvedConfig, event_id: &str, superseded_by: Option<String>) -> Result<()> {
    let reason = match superseded_by {
        Some(superseded_by) => StopReason::AliasRetired { superseded_by },
        None => StopReason::Explicit,
    };
    let command = StopCommand {
        reason,
        guard: None,
    };
    submit_command(cfg, Opcode::Stop, event_id, 0, &command)
}

fn all_tasks(store: &SqliteTaskStore, event: Option<&str>) -> Result<Vec<TaskRecord>> {
    store
        .range_query(i64::MIN, i64::MAX, event)
        .context("Failed to query task store")
}

fn list_tasks(cfg: &ResolvedConfig, event: Option<&str>) -> Result<()> {
    let store = open_task_store(cfg)?;
    let tasks = all_tasks(&store, event)?;

    if tasks.is_empty() {
        println!("No tasks found");
        return Ok(());
    }

    println!(
        "{:<10} {:<20} {:<20} {:<18} {:<6} {:<16}",
        "ID", "EXEC TIME", "EVENT", "OPCODE", "STAGE", "SUBMITTED BY"
    );
    println!("{}", "-".repeat(95));

    for task in tasks {
        let exec = if task.is_claimed() {
            "(running)".to_string()
        } else {
            format_time(task.exec_time)
        };
        println!(
            "{:<10} {:<20} {:<20} {:<18} {:<6} {:<16}",
            task.id.get(),
            exec,
            task.event_id,
            task.opcode_label(),
            task.stage,
            task.submit_id
        );
    }

    Ok(())
}

async fn show_timeline(cfg: &ResolvedConfig, event_id: &str) -> Result<()> {
    let timelines = open_timelines(cfg).await?;
    let snapshots = timelines
        .range(event_id, i64::MIN, i64::MAX)
        .await
        .with_context(|| format!("Failed to read timeline for {}", event_id))?;

    println!("Timeline: {}", event_id);
    if let Some(mainshock) = snapshots.iter().rev().find_map(|s| s.mainshock.as_ref()) {
        println!(
            "Mainshock: M{:.1} at {} ({:.3}, {:.3}, {:.1} km)",
            mainshock.magnitude,
            format_time(mainshock.origin_time),
            mainshock.latitude,
            mainshock.longitude,
            mainshock.depth_km
        );
    }
    println!();
    println!(
        "{:<20} {:<26} {:<12} {:<10} {}",
        "ACTION TIME", "STATE", "LAG (h)", "PUBLISH", "NOTE"
    );
    println!("{}", "-".repeat(85));

    for snapshot in &snapshots {
        let lag = snapshot
            .last_forecast_lag
            .map(|lag| format!("{:.2}", lag as f64 / 3_600_000.0))
            .unwrap_or_else(|| "-".to_string());
        let note = match (&snapshot.stop_reason, &snapshot.analyst) {
            (Some(reason), _) => format!("stopped: {}", reason),
            (None, Some(analyst)) => format!("override by {}", analyst.analyst_id),
            (None, None) => String::new(),
        };
        println!(
            "{:<20} {:<26} {:<12} {:<10} {}",
            format_time(snapshot.action_time),
            snapshot.state.to_string(),
            lag,
            format!("{:?}", snapshot.publish_status),
            note
        );
    }

    Ok(())
}

async fn list_events(cfg: &ResolvedConfig) -> Result<()> {
    let timelines = open_timelines(cfg).await?;
    let events = timelines.list_events().await?;

    if events.is_empty() {
        println!("No events tracked");
        return Ok(());
    }

    println!("{:<24} {:<26} {:<20}", "EVENT", "STATE", "LAST ACTION");
    println!("{}", "-".repeat(70));

    for event_id in events {
        match timelines.open(&event_id).await {
            Ok(snapshot) => println!(
                "{:<24} {:<26} {:<20}",
                event_id,
                snapshot.state.to_string(),
                format_time(snapshot.action_time)
            ),
            Err(e) => println!("{:<24} (unreadable: {})", event_id, e),
        }
    }

    Ok(())
}

fn backup(cfg: &ResolvedConfig, file: &Path) -> Result<()> {
    let store = open_task_store(cfg)?;
    let tasks = all_tasks(&store, None)?;

    let json = serde_json::to_string_pretty(&tasks).context("Failed to serialize tasks")?;
    std::fs::write(file, json)
        .with_context(|| format!("Failed to write backup: {}", file.display()))?;

    println!("Backed up {} tasks to {}", tasks.len(), file.display());
    Ok(())
}

fn restore(cfg: &ResolvedConfig, file: &Path) -> Result<()> {
    let content = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read backup: {}", file.display()))?;
    let tasks: Vec<TaskRecord> = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse backup: {}", file.display()))?;

    let store = open_task_store(cfg)?;
    let mut restored = 0;
    // Records come back armed at their sched_time, claimed ones included
    for task in &tasks {
        if let Err(e) = crate::core::timeline::validate_event_id(&task.event_id) {
            warn!(task_id = %task.id, error = %e, "Skipping task with invalid event id");
            continue;
        }
        store
            .submit(task.to_new_task())
            .with_context(|| format!("Failed to restore {}", task.id))?;
        restored += 1;
    }

    println!("Restored {} of {} tasks from {}", restored, tasks.len(), file.display());
    Ok(())
}

fn show_config(cfg: &ResolvedConfig) -> Result<()> {
    println!("Aftershock Configuration");
    println!();
    println!(
        "Config file: {}",
        cfg.config_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none - using defaults)".to_string())
    );
    println!();
    println!("Paths:");
    println!("  Home:      {}", cfg.home.display());
    println!("  Task DB:   {}", cfg.task_db.display());
    println!("  Timelines: {}", cfg.timeline_dir.display());
    println!();
    println!("Dispatcher:");
    println!("  Idle poll:             {}s", cfg.dispatcher.idle_poll_secs);
    println!("  Sweep interval:        {}s", cfg.dispatcher.sweep_interval_secs);
    println!("  Stale claim threshold: {}s", cfg.dispatcher.stale_claim_threshold_secs);
    println!("  Infra retry delay:     {}s", cfg.dispatcher.infra_retry_delay_secs);
    println!();
    println!("Forecast lags (s): {:?}", cfg.engine.schedule.lags_secs);
    println!(
        "Model: {}",
        cfg.model.command.as_deref().unwrap_or("(not configured)")
    );
    println!();
    println!("Retry tables (s):");
    println!("  Intake:   {:?}", cfg.engine.intake_retry.delays_secs);
    println!("  Forecast: {:?}", cfg.engine.forecast_retry.delays_secs);
    println!("  Publish:  {:?}", cfg.engine.publish_retry.delays_secs);
    println!();
    println!("Publish:");
    println!(
        "  Endpoint:    {}",
        cfg.publish.endpoint.as_deref().unwrap_or("(not configured)")
    );
    println!("  Network:     {}", cfg.publish.network);
    println!(
        "  Signing key: {}",
        if cfg.publish.signing_key.is_some() { "set" } else { "not set" }
    );
    println!(
        "Event source: {}",
        cfg.source.base_url.as_deref().unwrap_or("(not configured)")
    );

    Ok(())
}
