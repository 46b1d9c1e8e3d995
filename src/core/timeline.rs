//! Append-only timeline store with file-based persistence.
//!
//! Each event's snapshots live in `<root>/<event_id>.jsonl`, one JSON
//! snapshot per line, oldest first. The last line is the authoritative
//! state. Appends are validated against that last line (strictly
//! increasing `action_time`, legal transition) while holding both an
//! in-process per-event mutex and an exclusive file lock, so writers in
//! other processes are serialized too.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use fs2::FileExt;
use thiserror::Error;
use tokio::fs;

use crate::domain::{Snapshot, TimelineState};

#[derive(Debug, Error)]
pub enum TimelineError {
    #[error("No timeline for event {0}")]
    NotFound(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Out-of-order snapshot for {event_id}: action_time {action_time} is not after {last}")]
    OutOfOrder {
        event_id: String,
        action_time: i64,
        last: i64,
    },

    #[error("Invalid transition for {event_id}: {from:?} → {to}")]
    InvalidTransition {
        event_id: String,
        from: Option<TimelineState>,
        to: TimelineState,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Background write failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Per-event append-only snapshot log
#[async_trait]
pub trait TimelineStore: Send + Sync {
    /// Latest snapshot, or `NotFound`
    async fn open(&self, event_id: &str) -> Result<Snapshot, TimelineError>;

    /// Append a snapshot; rejects out-of-order or illegal transitions
    async fn append(&self, event_id: &str, snapshot: &Snapshot) -> Result<(), TimelineError>;

    /// Snapshots with `action_time` in `[lo, hi]`, oldest first
    async fn range(&self, event_id: &str, lo: i64, hi: i64) -> Result<Vec<Snapshot>, TimelineError>;

    /// Every event id with a timeline
    async fn list_events(&self) -> Result<Vec<String>, TimelineError>;
}

/// Check that `next` may follow `prev` in an event's log
pub fn validate_successor(prev: Option<&Snapshot>, next: &Snapshot) -> Result<(), TimelineError> {
    match prev {
        None if next.state.can_start() => Ok(()),
        None => Err(TimelineError::InvalidTransition {
            event_id: next.event_id.clone(),
            from: None,
            to: next.state,
        }),
        Some(prev) => {
            if next.action_time <= prev.action_time {
                return Err(TimelineError::OutOfOrder {
                    event_id: next.event_id.clone(),
                    action_time: next.action_time,
                    last: prev.action_time,
                });
            }
            if !prev.state.can_transition_to(next.state) {
                return Err(TimelineError::InvalidTransition {
                    event_id: next.event_id.clone(),
                    from: Some(prev.state),
                    to: next.state,
                });
            }
            Ok(())
        }
    }
}

/// Walk a log validating every transition; returns the final state
pub fn replay(snapshots: &[Snapshot]) -> Result<Option<TimelineState>, TimelineError> {
    let mut prev: Option<&Snapshot> = None;
    for snapshot in snapshots {
        validate_successor(prev, snapshot)?;
        prev = Some(snapshot);
    }
    Ok(prev.map(|s| s.state))
}

/// Reject ids that could escape the timeline directory
pub fn validate_event_id(event_id: &str) -> Result<(), TimelineError> {
    let valid = !event_id.is_empty()
        && !event_id.starts_with('.')
        && event_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));

    if valid {
        Ok(())
    } else {
        Err(TimelineError::InvalidArgument(format!(
            "invalid event id: {:?}",
            event_id
        )))
    }
}

/// JSONL-file timeline store
pub struct JsonlTimelineStore {
    root: PathBuf,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl JsonlTimelineStore {
    /// Open a store rooted at `root`, creating the directory if needed
    pub async fn open_dir(root: impl Into<PathBuf>) -> Result<Self, TimelineError> {
        let root = root.into();
        fs::create_dir_all(&root).await?;
        Ok(Self {
            root,
            locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn log_path(&self, event_id: &str) -> PathBuf {
        self.root.join(format!("{}.jsonl", event_id))
    }

    fn event_lock(&self, event_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|p| p.into_inner());
        locks.entry(event_id.to_string()).or_default().clone()
    }

    /// Drop the map entry once no other writer holds it
    fn release_lock(&self, event_id: &str, lock: Arc<tokio::sync::Mutex<()>>) {
        let mut locks = self.locks.lock().unwrap_or_else(|p| p.into_inner());
        // Ours plus the map's; clones only happen under this map lock
        if Arc::strong_count(&lock) == 2 {
            locks.remove(event_id);
        }
    }

    /// Read every snapshot for an event, oldest first
    pub async fn read_all(&self, event_id: &str) -> Result<Vec<Snapshot>, TimelineError> {
        validate_event_id(event_id)?;
        let path = self.log_path(event_id);

        let content = match fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(TimelineError::NotFound(event_id.to_string()))
            }
            Err(e) => return Err(e.into()),
        };

        parse_lines(content.lines())
    }
}

fn parse_lines<'a>(lines: impl Iterator<Item = &'a str>) -> Result<Vec<Snapshot>, TimelineError> {
    lines
        .filter(|line| !line.trim().is_empty())
        .map(|line| serde_json::from_str(line).map_err(TimelineError::from))
        .collect()
}

/// Validate against the current last line and append, under an
/// exclusive lock on the log file
fn append_locked(path: &Path, snapshot: &Snapshot) -> Result<(), TimelineError> {
    let mut file = OpenOptions::new()
        .create(true)
        .read(true)
        .append(true)
        .open(path)?;

    file.lock_exclusive()?;
    let result = append_to(&mut file, snapshot);
    file.unlock()?;
    result
}

fn append_to(file: &mut File, snapshot: &Snapshot) -> Result<(), TimelineError> {
    let mut last: Option<Snapshot> = None;
    for line in BufReader::new(&*file).lines() {
        let line = line?;
        if !line.trim().is_empty() {
            last = Some(serde_json::from_str(&line)?);
        }
    }

    validate_successor(last.as_ref(), snapshot)?;

    let json = serde_json::to_string(snapshot)?;
    writeln!(file, "{}", json)?;
    file.flush()?;
    file.sync_data()?;
    Ok(())
}

#[async_trait]
impl TimelineStore for JsonlTimelineStore {
    async fn open(&self, event_id: &str) -> Result<Snapshot, TimelineError> {
        self.read_all(event_id)
            .await?
            .pop()
            .ok_or_else(|| TimelineError::NotFound(event_id.to_string()))
    }

    async fn append(&self, event_id: &str, snapshot: &Snapshot) -> Result<(), TimelineError> {
        validate_event_id(event_id)?;
        if snapshot.event_id != event_id {
            return Err(TimelineError::InvalidArgument(format!(
                "snapshot for {} appended to {}",
                snapshot.event_id, event_id
            )));
        }

        let lock = self.event_lock(event_id);
        let result = {
            let _guard = lock.lock().await;
            let path = self.log_path(event_id);
            let snapshot = snapshot.clone();
            tokio::task::spawn_blocking(move || append_locked(&path, &snapshot)).await
        };
        self.release_lock(event_id, lock);
        result?
    }

    async fn range(&self, event_id: &str, lo: i64, hi: i64) -> Result<Vec<Snapshot>, TimelineError> {
        let snapshots = self.read_all(event_id).await?;
        Ok(snapshots
            .into_iter()
            .filter(|s| s.action_time >= lo && s.action_time <= hi)
            .collect())
    }

    async fn list_events(&self) -> Result<Vec<String>, TimelineError> {
        let mut events = Vec::new();
        let mut entries = fs::read_dir(&self.root).await?;

        while let Some(entry) = entries.next_entry().await? {
            if let Some(name) = entry.file_name().to_str() {
                if let Some(event_id) = name.strip_suffix(".jsonl") {
                    events.push(event_id.to_string());
                }
            }
        }

        events.sort();
        Ok(events)
    }
}
