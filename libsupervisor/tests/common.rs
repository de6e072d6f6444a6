use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use common::{UserWorkerSpec, WorkerStatus};
use futures::FutureExt;
use libsupervisor::{
    ConfigArtifacts, ExitOutcome, LaunchCommand, Materializer, MemoryStore, ProcessEnvironment,
    RecordStore, SpawnedWorker, StopSignal, StoreError, Supervisor, SupervisorSettings,
};
use tempfile::TempDir;
use tokio::sync::oneshot;

#[allow(dead_code)]
struct FakeProcess {
    user_id: String,
    exit: oneshot::Sender<ExitOutcome>,
}

/// Process environment that hands out fake pids and only "exits" a worker
/// when it is signalled or told to crash.
#[allow(dead_code)]
#[derive(Default)]
pub struct FakeEnvironment {
    next_pid: AtomicU32,
    live: Mutex<HashMap<u32, FakeProcess>>,
    launches: Mutex<Vec<LaunchCommand>>,
    signals: Mutex<Vec<(u32, StopSignal)>>,
    sweeps: Mutex<Vec<String>>,
    group_kills: Mutex<Vec<u32>>,
    spawn_delays: Mutex<HashMap<String, Duration>>,
    ignore_graceful: AtomicBool,
    fail_spawn: AtomicBool,
}

#[allow(dead_code)]
impl FakeEnvironment {
    pub fn new() -> Self {
        FakeEnvironment {
            next_pid: AtomicU32::new(1000),
            ..Default::default()
        }
    }

    pub fn launches(&self) -> Vec<LaunchCommand> {
        self.launches.lock().unwrap().clone()
    }

    pub fn signals(&self) -> Vec<(u32, StopSignal)> {
        self.signals.lock().unwrap().clone()
    }

    pub fn sweeps(&self) -> Vec<String> {
        self.sweeps.lock().unwrap().clone()
    }

    pub fn group_kills(&self) -> Vec<u32> {
        self.group_kills.lock().unwrap().clone()
    }

    pub fn is_alive(&self, pid: u32) -> bool {
        self.live.lock().unwrap().contains_key(&pid)
    }

    pub fn live_pids(&self, user_id: &str) -> Vec<u32> {
        self.live
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, p)| p.user_id == user_id)
            .map(|(pid, _)| *pid)
            .collect()
    }

    pub fn set_spawn_delay(&self, user_id: &str, delay: Duration) {
        self.spawn_delays
            .lock()
            .unwrap()
            .insert(user_id.to_string(), delay);
    }

    pub fn ignore_graceful(&self, ignore: bool) {
        self.ignore_graceful.store(ignore, Ordering::SeqCst);
    }

    pub fn fail_spawn(&self, fail: bool) {
        self.fail_spawn.store(fail, Ordering::SeqCst);
    }

    /// Make a worker terminate on its own.
    pub fn crash(&self, pid: u32, code: i32) {
        self.exit(pid, Some(code));
    }

    fn exit(&self, pid: u32, code: Option<i32>) {
        if let Some(process) = self.live.lock().unwrap().remove(&pid) {
            let _ = process.exit.send(ExitOutcome { code });
        }
    }
}

#[async_trait]
impl ProcessEnvironment for FakeEnvironment {
    async fn spawn(&self, command: &LaunchCommand) -> io::Result<SpawnedWorker> {
        let user_id = command.env.get("BRIDGE_USER_ID").cloned().unwrap_or_default();
        let delay = self.spawn_delays.lock().unwrap().get(&user_id).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_spawn.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::NotFound, "no such program"));
        }
        self.launches.lock().unwrap().push(command.clone());

        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.live
            .lock()
            .unwrap()
            .insert(pid, FakeProcess { user_id, exit: tx });
        Ok(SpawnedWorker {
            pid,
            exited: async move { rx.await.unwrap_or_default() }.boxed(),
        })
    }

    fn signal(&self, pid: u32, signal: StopSignal) -> io::Result<()> {
        self.signals.lock().unwrap().push((pid, signal));
        if signal == StopSignal::Graceful && self.ignore_graceful.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.exit(pid, None);
        Ok(())
    }

    fn kill_group(&self, pid: u32) -> io::Result<()> {
        self.group_kills.lock().unwrap().push(pid);
        Ok(())
    }

    fn sweep(&self, pattern: &str) -> Vec<u32> {
        self.sweeps.lock().unwrap().push(pattern.to_string());
        Vec::new()
    }
}

/// Store whose writes can be switched to fail.
#[allow(dead_code)]
#[derive(Default)]
pub struct FailingStore {
    inner: MemoryStore,
    fail_writes: AtomicBool,
}

#[allow(dead_code)]
impl FailingStore {
    pub fn with_records(records: Vec<UserWorkerSpec>) -> Self {
        FailingStore {
            inner: MemoryStore::with_records(records),
            fail_writes: AtomicBool::new(false),
        }
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl RecordStore for FailingStore {
    async fn read_record(&self, user_id: &str) -> Result<UserWorkerSpec, StoreError> {
        self.inner.read_record(user_id).await
    }

    async fn write_record(&self, record: &UserWorkerSpec) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Io(io::Error::other("disk full")));
        }
        self.inner.write_record(record).await
    }

    async fn delete_record(&self, user_id: &str) -> Result<(), StoreError> {
        self.inner.delete_record(user_id).await
    }

    async fn list_records(&self) -> Result<Vec<UserWorkerSpec>, StoreError> {
        self.inner.list_records().await
    }
}

#[allow(dead_code)]
pub struct Harness {
    pub supervisor: Supervisor,
    pub store: Arc<MemoryStore>,
    pub env: Arc<FakeEnvironment>,
    pub artifacts: ConfigArtifacts,
    pub dir: TempDir,
}

#[allow(dead_code)]
impl Harness {
    pub fn new(records: Vec<UserWorkerSpec>) -> Self {
        Self::with_settings(records, test_settings())
    }

    pub fn with_settings(records: Vec<UserWorkerSpec>, settings: SupervisorSettings) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::with_records(records));
        let env = Arc::new(FakeEnvironment::new());
        let artifacts = ConfigArtifacts::new(dir.path().join("configs"));
        let supervisor = Supervisor::spawn(
            store.clone(),
            env.clone(),
            Materializer::default(),
            artifacts.clone(),
            settings,
        );
        Harness {
            supervisor,
            store,
            env,
            artifacts,
            dir,
        }
    }

    pub async fn record(&self, user_id: &str) -> UserWorkerSpec {
        self.store.read_record(user_id).await.unwrap()
    }

    /// Assert the registry and the record agree that the user is stopped.
    pub async fn assert_stopped(&self, user_id: &str) {
        assert_eq!(self.supervisor.worker_pid(user_id).await, None);
        let record = self.record(user_id).await;
        assert_eq!(record.status, WorkerStatus::Stopped);
        assert_eq!(record.pid, None);
    }

    /// Assert the registry and the record agree on the running pid.
    pub async fn assert_running(&self, user_id: &str, pid: u32) {
        assert_eq!(self.supervisor.worker_pid(user_id).await, Some(pid));
        let record = self.record(user_id).await;
        assert_eq!(record.status, WorkerStatus::Running);
        assert_eq!(record.pid, Some(pid));
        assert!(self.env.is_alive(pid));
    }
}

pub fn test_settings() -> SupervisorSettings {
    SupervisorSettings {
        graceful_stop_timeout: Duration::from_millis(200),
        forced_stop_timeout: Duration::from_millis(200),
        spawn_timeout: Duration::from_secs(5),
        ..Default::default()
    }
}

#[allow(dead_code)]
pub fn user(id: &str) -> UserWorkerSpec {
    let mut spec = UserWorkerSpec::new(id);
    spec.endpoint = Some("wss://x".to_string());
    spec
}

/// Poll until `check` holds or the deadline passes.
#[allow(dead_code)]
pub async fn eventually<F, Fut>(deadline: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let start = tokio::time::Instant::now();
    while start.elapsed() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check().await
}
