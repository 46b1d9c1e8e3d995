//! Shared fixtures for integration tests: in-process fakes for the
//! external collaborators and a dispatcher wired to a manual clock.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::sync::Notify;

use aftershock::adapters::{
    ForecastModel, ForecastRequest, MainshockSource, Product, ProductRequest, Publisher,
};
use aftershock::core::{
    Dispatcher, DispatcherConfig, EngineSettings, ExecContext, ExecutorRegistry,
    JsonlTimelineStore, ManualClock, ServerHealth, SqliteTaskStore, Step, TaskStore,
    TaskStoreError, TimelineStore,
};
use aftershock::domain::payload::{self, Payload};
use aftershock::domain::{Mainshock, NewTask, Opcode, Snapshot, TaskId, TaskRecord};

pub const MINUTE: i64 = 60_000;
pub const HOUR: i64 = 60 * MINUTE;

/// Mainshock origin used throughout the scenarios
pub const ORIGIN: i64 = 1_700_000_000_000;

pub fn mainshock(event_id: &str) -> Mainshock {
    Mainshock {
        event_id: event_id.to_string(),
        origin_time: ORIGIN,
        magnitude: 6.4,
        latitude: 35.77,
        longitude: -117.6,
        depth_km: 8.0,
        network: Some("ci".to_string()),
    }
}

/// Publisher that records what it was asked to send
#[derive(Default)]
pub struct FakePublisher {
    pub fail: AtomicBool,
    pub attempts: AtomicUsize,
    pub sent: Mutex<Vec<Product>>,
}

impl FakePublisher {
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn sent(&self) -> Vec<Product> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Publisher for FakePublisher {
    fn build(&self, request: ProductRequest) -> Result<Product> {
        Ok(Product {
            request,
            signature: None,
        })
    }

    fn sign(&self, product: &mut Product) -> Result<()> {
        product.signature = Some("test-signature".to_string());
        Ok(())
    }

    async fn send(&self, product: &Product, _is_text: bool) -> Result<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            bail!("distribution service unavailable");
        }
        self.sent.lock().unwrap().push(product.clone());
        Ok(())
    }
}

/// Event source that knows at most one mainshock at a time
#[derive(Default)]
pub struct FakeSource {
    pub mainshock: Mutex<Option<Mainshock>>,
}

impl FakeSource {
    pub fn set(&self, mainshock: Option<Mainshock>) {
        *self.mainshock.lock().unwrap() = mainshock;
    }
}

#[async_trait]
impl MainshockSource for FakeSource {
    async fn fetch(&self, event_id: &str) -> Result<Mainshock> {
        let known = self.mainshock.lock().unwrap().clone();
        match known {
            Some(m) if m.event_id == event_id => Ok(m),
            _ => bail!("event {} not found", event_id),
        }
    }
}

/// Model that echoes the lag back as its product
#[derive(Default)]
pub struct FakeModel {
    pub fail: AtomicBool,
    pub calls: Mutex<Vec<ForecastRequest>>,
}

impl FakeModel {
    pub fn calls(&self) -> Vec<ForecastRequest> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ForecastModel for FakeModel {
    async fn compute(&self, request: &ForecastRequest) -> Result<Value> {
        self.calls.lock().unwrap().push(request.clone());
        if self.fail.load(Ordering::SeqCst) {
            bail!("model exited with status 1");
        }
        Ok(json!({ "lag": request.lag }))
    }
}

/// In-memory task store that can be told to fail its next submit
pub struct FlakyStore {
    inner: SqliteTaskStore,
    pub fail_next_submit: AtomicBool,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self {
            inner: SqliteTaskStore::in_memory().unwrap(),
            fail_next_submit: AtomicBool::new(false),
        }
    }
}

impl TaskStore for FlakyStore {
    fn submit(&self, task: NewTask) -> Result<TaskId, TaskStoreError> {
        if self.fail_next_submit.swap(false, Ordering::SeqCst) {
            return Err(TaskStoreError::LockPoisoned);
        }
        self.inner.submit(task)
    }

    fn claim_ready(&self, cutoff_time: i64) -> Result<Option<TaskRecord>, TaskStoreError> {
        self.inner.claim_ready(cutoff_time)
    }

    fn stage(
        &self,
        id: TaskId,
        new_exec_time: i64,
        new_stage: i32,
        new_event_id: Option<&str>,
    ) -> Result<(), TaskStoreError> {
        self.inner.stage(id, new_exec_time, new_stage, new_event_id)
    }

    fn delete(&self, id: TaskId) -> Result<(), TaskStoreError> {
        self.inner.delete(id)
    }

    fn range_query(
        &self,
        exec_time_lo: i64,
        exec_time_hi: i64,
        event_id: Option<&str>,
    ) -> Result<Vec<TaskRecord>, TaskStoreError> {
        self.inner.range_query(exec_time_lo, exec_time_hi, event_id)
    }
}

/// A dispatcher over in-memory tasks, temp-dir timelines and fakes
pub struct Harness {
    pub dispatcher: Dispatcher,
    pub clock: Arc<ManualClock>,
    pub tasks: Arc<FlakyStore>,
    pub timelines: Arc<JsonlTimelineStore>,
    pub health: Arc<ServerHealth>,
    pub publisher: Arc<FakePublisher>,
    pub source: Arc<FakeSource>,
    pub model: Arc<FakeModel>,
    _temp: TempDir,
}

impl Harness {
    pub async fn new(settings: EngineSettings, start: i64) -> Self {
        Self::with_config(settings, DispatcherConfig::default(), start).await
    }

    pub async fn with_config(settings: EngineSettings, config: DispatcherConfig, start: i64) -> Self {
        let temp = TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::new(start));
        let tasks = Arc::new(FlakyStore::new());
        let health = Arc::new(ServerHealth::default());
        let timelines = Arc::new(
            JsonlTimelineStore::open_dir(temp.path().join("timelines"))
                .await
                .unwrap(),
        );
        let publisher = Arc::new(FakePublisher::default());
        let source = Arc::new(FakeSource::default());
        let model = Arc::new(FakeModel::default());

        let task_store: Arc<dyn TaskStore> = tasks.clone();
        let timeline_store: Arc<dyn TimelineStore> = timelines.clone();
        let ctx = ExecContext {
            tasks: task_store,
            timelines: timeline_store,
            publisher: publisher.clone(),
            source: source.clone(),
            model: model.clone(),
            health: health.clone(),
            clock: clock.clone(),
            settings: Arc::new(settings),
            wakeup: Arc::new(Notify::new()),
        };

        Self {
            dispatcher: Dispatcher::new(Arc::new(ctx), ExecutorRegistry::standard(), config),
            clock,
            tasks,
            timelines,
            health,
            publisher,
            source,
            model,
            _temp: temp,
        }
    }

    pub fn now(&self) -> i64 {
        use aftershock::core::Clock;
        self.clock.now_millis()
    }

    /// Submit an operator command due at `sched_time`
    pub fn submit<P: Payload>(&self, opcode: Opcode, event_id: &str, sched_time: i64, command: &P) -> TaskId {
        let task = NewTask::new(opcode, event_id, sched_time, self.now(), "test")
            .with_details(payload::encode(command).unwrap());
        self.tasks.submit(task).unwrap()
    }

    /// Run every task due at the current clock time
    pub async fn run_due(&mut self) -> Vec<Step> {
        let mut steps = Vec::new();
        loop {
            match self.dispatcher.run_once().await.unwrap() {
                Step::Idle => return steps,
                step => steps.push(step),
            }
        }
    }

    pub async fn timeline(&self, event_id: &str) -> Vec<Snapshot> {
        self.timelines.range(event_id, i64::MIN, i64::MAX).await.unwrap()
    }

    pub fn pending(&self, event_id: &str) -> Vec<TaskRecord> {
        self.tasks.range_query(i64::MIN, i64::MAX, Some(event_id)).unwrap()
    }
}
