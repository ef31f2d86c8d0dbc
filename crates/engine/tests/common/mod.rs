//! Shared fixtures: an in-memory job service and engine helpers.

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use pullsync_cache::{MemoryStore, SharedStorage, TabStorage};
use pullsync_core::{Task, TaskId, TaskMap, TaskStatus};
use pullsync_engine::{EngineConfig, JobService, ServiceError, StatusStream, TaskEngine, TaskView};
use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;

/// Upper bound for anything a test waits on.
pub const WAIT: Duration = Duration::from_secs(5);

/// Job service double. Listings are scripted; every status stream is an
/// in-memory duplex pipe whose server end is handed to the test.
pub struct FakeService {
    listing: Mutex<Result<TaskMap, String>>,
    failing_streams: Mutex<HashSet<TaskId>>,
    fail_dismiss: AtomicBool,
    streams_tx: mpsc::UnboundedSender<(TaskId, DuplexStream)>,
    streams_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<(TaskId, DuplexStream)>>,
    next_id: AtomicUsize,
    pub list_calls: AtomicUsize,
    pub cancelled: Mutex<Vec<TaskId>>,
    pub dismissed: Mutex<Vec<TaskId>>,
}

impl FakeService {
    pub fn new() -> Arc<Self> {
        let (streams_tx, streams_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            listing: Mutex::new(Ok(TaskMap::new())),
            failing_streams: Mutex::new(HashSet::new()),
            fail_dismiss: AtomicBool::new(false),
            streams_tx,
            streams_rx: tokio::sync::Mutex::new(streams_rx),
            next_id: AtomicUsize::new(0),
            list_calls: AtomicUsize::new(0),
            cancelled: Mutex::new(Vec::new()),
            dismissed: Mutex::new(Vec::new()),
        })
    }

    pub fn set_listing(&self, tasks: impl IntoIterator<Item = Task>) {
        *self.listing.lock().unwrap() = Ok(tasks.into_iter().map(|t| (t.id.clone(), t)).collect());
    }

    pub fn fail_listing(&self, message: &str) {
        *self.listing.lock().unwrap() = Err(message.to_string());
    }

    pub fn fail_streams_for(&self, task_id: &str) {
        self.failing_streams.lock().unwrap().insert(task_id.to_string());
    }

    pub fn fail_dismiss(&self) {
        self.fail_dismiss.store(true, Ordering::SeqCst);
    }

    /// Server end of the next status stream the engine opens.
    pub async fn next_stream(&self) -> (TaskId, DuplexStream) {
        let mut rx = self.streams_rx.lock().await;
        tokio::time::timeout(WAIT, rx.recv())
            .await
            .expect("a status stream should be opened")
            .expect("stream sender lives as long as the service")
    }
}

#[async_trait]
impl JobService for FakeService {
    async fn start_job(&self, _subject_name: &str) -> Result<TaskId, ServiceError> {
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        Ok(format!("job-{n}"))
    }

    async fn list_jobs(&self) -> Result<TaskMap, ServiceError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        self.listing
            .lock()
            .unwrap()
            .clone()
            .map_err(ServiceError::Transport)
    }

    async fn open_status_stream(&self, task_id: &str) -> Result<StatusStream, ServiceError> {
        if self.failing_streams.lock().unwrap().contains(task_id) {
            return Err(ServiceError::Api {
                status: 503,
                body: "unavailable".into(),
            });
        }
        let (client, server) = tokio::io::duplex(64 * 1024);
        let _ = self.streams_tx.send((task_id.to_string(), server));
        Ok(Box::new(client))
    }

    async fn cancel_job(&self, task_id: &str) -> Result<(), ServiceError> {
        self.cancelled.lock().unwrap().push(task_id.to_string());
        Ok(())
    }

    async fn dismiss_job(&self, task_id: &str) -> Result<(), ServiceError> {
        if self.fail_dismiss.load(Ordering::SeqCst) {
            return Err(ServiceError::Transport("connection reset".into()));
        }
        self.dismissed.lock().unwrap().push(task_id.to_string());
        Ok(())
    }
}

/// Config with a reconcile interval long enough that only the initial
/// pass and explicit passes run during a test.
pub fn quiet_config() -> EngineConfig {
    EngineConfig {
        reconcile_interval: Duration::from_secs(3600),
        ..EngineConfig::default()
    }
}

pub fn standalone_storage() -> TabStorage {
    SharedStorage::new(Arc::new(MemoryStore::new())).attach_tab()
}

/// Start an engine and wait for its initial reconcile pass.
pub async fn start_engine(service: &Arc<FakeService>, storage: TabStorage) -> TaskEngine {
    start_engine_with(quiet_config(), service, storage).await
}

pub async fn start_engine_with(
    config: EngineConfig,
    service: &Arc<FakeService>,
    storage: TabStorage,
) -> TaskEngine {
    let engine = TaskEngine::start(&config, service.clone() as Arc<dyn JobService>, storage);
    wait_for(&engine, |view| view.last_synced_at.is_some() || view.sync_error.is_some()).await;
    engine
}

/// Wait until the engine's view satisfies `predicate` and return it.
pub async fn wait_for(engine: &TaskEngine, predicate: impl FnMut(&TaskView) -> bool) -> TaskView {
    let mut rx = engine.subscribe();
    let view = tokio::time::timeout(WAIT, rx.wait_for(predicate))
        .await
        .expect("view should reach the expected state")
        .expect("engine should still publish views");
    view.clone()
}

/// Poll `condition` until it holds.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !condition() {
        assert!(tokio::time::Instant::now() < deadline, "condition not reached in time");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

pub async fn send_line(server: &mut DuplexStream, line: serde_json::Value) {
    server
        .write_all(format!("{line}\n").as_bytes())
        .await
        .expect("client end should be open");
}

pub fn task(id: &str, subject: &str, status: TaskStatus) -> Task {
    Task::new(id, subject).with_status(status)
}
