use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use common::UserWorkerSpec;
use futures::FutureExt;
use libsupervisor::{
    ConfigArtifacts, ExitOutcome, LaunchCommand, Materializer, MemoryStore, ProcessEnvironment,
    SpawnedWorker, StopSignal, Supervisor, SupervisorSettings,
};
use tempfile::TempDir;
use tokio::sync::oneshot;

/// Workers that live until they are signalled.
#[derive(Default)]
pub struct StubEnvironment {
    next_pid: AtomicU32,
    live: Mutex<HashMap<u32, oneshot::Sender<ExitOutcome>>>,
}

#[async_trait]
impl ProcessEnvironment for StubEnvironment {
    async fn spawn(&self, _command: &LaunchCommand) -> io::Result<SpawnedWorker> {
        let pid = 500 + self.next_pid.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.live.lock().unwrap().insert(pid, tx);
        Ok(SpawnedWorker {
            pid,
            exited: async move { rx.await.unwrap_or_default() }.boxed(),
        })
    }

    fn signal(&self, pid: u32, _signal: StopSignal) -> io::Result<()> {
        if let Some(tx) = self.live.lock().unwrap().remove(&pid) {
            let _ = tx.send(ExitOutcome { code: None });
        }
        Ok(())
    }

    fn kill_group(&self, _pid: u32) -> io::Result<()> {
        Ok(())
    }

    fn sweep(&self, _pattern: &str) -> Vec<u32> {
        Vec::new()
    }
}

pub struct TestApp {
    pub router: Router,
    pub supervisor: Supervisor,
    pub store: Arc<MemoryStore>,
    pub dir: TempDir,
}

pub fn app(records: Vec<UserWorkerSpec>) -> TestApp {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryStore::with_records(records));
    let settings = SupervisorSettings {
        graceful_stop_timeout: Duration::from_millis(200),
        forced_stop_timeout: Duration::from_millis(200),
        ..Default::default()
    };
    let supervisor = Supervisor::spawn(
        store.clone(),
        Arc::new(StubEnvironment::default()),
        Materializer::default(),
        ConfigArtifacts::new(dir.path().join("configs")),
        settings,
    );
    TestApp {
        router: bridged::api::router(supervisor.clone()),
        supervisor,
        store,
        dir,
    }
}

pub fn user(id: &str, endpoint: Option<&str>) -> UserWorkerSpec {
    let mut spec = UserWorkerSpec::new(id);
    spec.endpoint = endpoint.map(str::to_string);
    spec
}
