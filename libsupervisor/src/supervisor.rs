use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use common::{UserWorkerSpec, WorkerSettings};
use futures::future::{BoxFuture, join_all};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, mpsc, watch};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::environment::{ExitOutcome, LaunchCommand, ProcessEnvironment, StopSignal};
use crate::error::SupervisorError;
use crate::materialize::{ConfigArtifacts, Materializer};
use crate::projector::StatusProjector;
use crate::reconciler::{ExitNotice, ExitReconciler};
use crate::registry::{ProcessRegistry, UserLocks, WorkerHandle};
use crate::store::RecordStore;

const CONFIG_PLACEHOLDER: &str = "{config}";
const USER_PLACEHOLDER: &str = "{user_id}";

/// How the bridge worker program is invoked.
///
/// `{config}` and `{user_id}` are substituted in `args`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerLaunch {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    /// Worker output goes to `<log_dir>/<user_id>.log`; discarded when unset.
    pub log_dir: Option<PathBuf>,
    /// Extra variables for every worker.
    pub env: BTreeMap<String, String>,
}

impl Default for WorkerLaunch {
    fn default() -> Self {
        WorkerLaunch {
            program: "python3".to_string(),
            args: vec![
                "mcp_pipe.py".to_string(),
                "--config".to_string(),
                CONFIG_PLACEHOLDER.to_string(),
            ],
            working_dir: None,
            log_dir: None,
            env: BTreeMap::new(),
        }
    }
}

impl WorkerLaunch {
    /// Build the launch for one user. Secrets travel in the environment,
    /// never in the arguments or the config artifact.
    pub fn command_for(
        &self,
        spec: &UserWorkerSpec,
        endpoint: &str,
        config_path: &Path,
    ) -> LaunchCommand {
        let config = config_path.to_string_lossy();
        let mut args: Vec<String> = self
            .args
            .iter()
            .map(|a| {
                a.replace(CONFIG_PLACEHOLDER, &config)
                    .replace(USER_PLACEHOLDER, &spec.id)
            })
            .collect();
        // the command-line sweep finds workers by their config path
        if !self.args.iter().any(|a| a.contains(CONFIG_PLACEHOLDER)) {
            args.push(config.to_string());
        }

        let mut env = self.env.clone();
        env.insert("MCP_ENDPOINT".to_string(), endpoint.to_string());
        env.insert("BRIDGE_USER_ID".to_string(), spec.id.clone());
        env.insert("BRIDGE_CONFIG".to_string(), config.to_string());
        if let Some(key) = spec.active_search_key() {
            env.insert("BRAVE_API_KEY".to_string(), key.to_string());
        }

        LaunchCommand {
            program: self.program.clone(),
            args,
            working_dir: self.working_dir.clone(),
            env,
            log_path: self.log_dir.as_ref().map(|d| d.join(format!("{}.log", spec.id))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub launch: WorkerLaunch,
    /// How long a worker gets to exit after SIGTERM before it is killed.
    pub graceful_stop_timeout: Duration,
    /// How long to wait after SIGKILL before giving up on confirmation.
    pub forced_stop_timeout: Duration,
    pub spawn_timeout: Duration,
    pub exit_channel_capacity: usize,
    /// Start workers again on boot if their record still says running.
    pub resume_on_boot: bool,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        SupervisorSettings {
            launch: WorkerLaunch::default(),
            graceful_stop_timeout: Duration::from_secs(5),
            forced_stop_timeout: Duration::from_secs(2),
            spawn_timeout: Duration::from_secs(10),
            exit_channel_capacity: 64,
            resume_on_boot: false,
        }
    }
}

/// Keeps at most one bridge worker alive per user.
///
/// Every lifecycle operation for a user runs under that user's lock, so a
/// `start` and a `stop` for the same user never interleave, while different
/// users proceed independently. Cloning is cheap and shares the same state.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<SupervisorInner>,
}

pub(crate) struct SupervisorInner {
    pub(crate) store: Arc<dyn RecordStore>,
    pub(crate) env: Arc<dyn ProcessEnvironment>,
    pub(crate) materializer: Materializer,
    pub(crate) artifacts: ConfigArtifacts,
    pub(crate) projector: StatusProjector,
    pub(crate) registry: Mutex<ProcessRegistry>,
    pub(crate) locks: UserLocks,
    pub(crate) exits: mpsc::Sender<ExitNotice>,
    pub(crate) generation: AtomicU64,
    pub(crate) settings: SupervisorSettings,
}

impl Supervisor {
    /// Build a supervisor and the reconciler that must run alongside it.
    pub fn new(
        store: Arc<dyn RecordStore>,
        env: Arc<dyn ProcessEnvironment>,
        materializer: Materializer,
        artifacts: ConfigArtifacts,
        settings: SupervisorSettings,
    ) -> (Self, ExitReconciler) {
        let (exits, notices) = mpsc::channel(settings.exit_channel_capacity.max(1));
        let inner = Arc::new(SupervisorInner {
            projector: StatusProjector::new(store.clone()),
            store,
            env,
            materializer,
            artifacts,
            registry: Mutex::new(ProcessRegistry::default()),
            locks: UserLocks::default(),
            exits,
            generation: AtomicU64::new(0),
            settings,
        });
        let reconciler = ExitReconciler::new(notices, Arc::downgrade(&inner));
        (Supervisor { inner }, reconciler)
    }

    /// Like [`Supervisor::new`], with the reconciler spawned on the current runtime.
    pub fn spawn(
        store: Arc<dyn RecordStore>,
        env: Arc<dyn ProcessEnvironment>,
        materializer: Materializer,
        artifacts: ConfigArtifacts,
        settings: SupervisorSettings,
    ) -> Self {
        let (supervisor, reconciler) = Self::new(store, env, materializer, artifacts, settings);
        tokio::spawn(reconciler.run());
        supervisor
    }

    /// Launch a fresh worker for the user, retiring any previous one first.
    /// Returns the pid of the new worker.
    pub async fn start(&self, user_id: &str) -> Result<u32, SupervisorError> {
        let _guard = self.inner.locks.acquire(user_id).await;
        self.inner.start_locked(user_id).await
    }

    /// Stop the user's worker if one is running. Stopping an idle user succeeds.
    pub async fn stop(&self, user_id: &str) -> Result<(), SupervisorError> {
        let _guard = self.inner.locks.acquire(user_id).await;
        self.inner.stop_locked(user_id).await
    }

    /// Relaunch a running worker with freshly generated config.
    /// A user without a live worker is left alone and `None` is returned.
    pub async fn restart(&self, user_id: &str) -> Result<Option<u32>, SupervisorError> {
        let _guard = self.inner.locks.acquire(user_id).await;
        self.inner.restart_locked(user_id).await
    }

    /// Persist new settings, then restart the worker if it is running.
    pub async fn update(
        &self,
        user_id: &str,
        settings: &WorkerSettings,
    ) -> Result<Option<u32>, SupervisorError> {
        let _guard = self.inner.locks.acquire(user_id).await;
        let mut record = self.inner.store.read_record(user_id).await?;
        record.apply(settings);
        self.inner.store.write_record(&record).await?;
        debug!(user_id, "worker settings updated");
        self.inner.restart_locked(user_id).await
    }

    /// Stop the worker, drop its config artifact, then erase the record.
    pub async fn destroy(&self, user_id: &str) -> Result<(), SupervisorError> {
        let _guard = self.inner.locks.acquire(user_id).await;
        self.inner.stop_locked(user_id).await?;
        if let Err(e) = self.inner.artifacts.remove(user_id) {
            warn!(user_id, "failed to remove config artifact: {e}");
        }
        match self.inner.store.delete_record(user_id).await {
            Err(crate::error::StoreError::NotFound(_)) | Ok(()) => {}
            Err(e) => return Err(e.into()),
        }
        info!(user_id, "user worker destroyed");
        Ok(())
    }

    /// Pid of the supervised worker, if any.
    pub async fn worker_pid(&self, user_id: &str) -> Option<u32> {
        self.inner.registry.lock().await.get(user_id).map(|h| h.pid)
    }

    /// Current persisted record of the user.
    pub async fn record(&self, user_id: &str) -> Result<UserWorkerSpec, SupervisorError> {
        Ok(self.inner.store.read_record(user_id).await?)
    }

    pub async fn supervised_count(&self) -> usize {
        self.inner.registry.lock().await.len()
    }

    /// Bring records left `running` by a previous daemon in line with reality.
    ///
    /// Orphaned workers still using the user's config are killed. The record
    /// is then marked stopped, or the worker started again when
    /// `resume_on_boot` is set. Returns the ids that were reconciled.
    pub async fn recover(&self) -> Result<Vec<String>, SupervisorError> {
        let records = self.inner.store.list_records().await?;
        let mut reconciled = Vec::new();
        for record in records.into_iter().filter(UserWorkerSpec::is_running) {
            let user_id = record.id;
            let _guard = self.inner.locks.acquire(&user_id).await;
            if self.inner.registry.lock().await.get(&user_id).is_some() {
                continue;
            }
            if let Ok(path) = self.inner.artifacts.path_for(&user_id) {
                self.inner.sweep(&user_id, &path).await;
            }
            if self.inner.settings.resume_on_boot {
                match self.inner.start_locked(&user_id).await {
                    Ok(pid) => info!(user_id, pid, "worker resumed on boot"),
                    Err(e) => {
                        warn!(user_id, "failed to resume worker on boot: {e}");
                        self.inner.projector.mark_stopped(&user_id).await?;
                    }
                }
            } else {
                info!(user_id, "stale running status cleared");
                self.inner.projector.mark_stopped(&user_id).await?;
            }
            reconciled.push(user_id);
        }
        Ok(reconciled)
    }

    /// Stop every supervised worker. Used when the daemon exits.
    pub async fn shutdown(&self) {
        let user_ids = self.inner.registry.lock().await.user_ids();
        info!(workers = user_ids.len(), "stopping all workers");
        join_all(user_ids.iter().map(|user_id| async move {
            let _guard = self.inner.locks.acquire(user_id).await;
            self.inner.retire(user_id).await;
            if let Err(e) = self.inner.projector.mark_stopped(user_id).await {
                error!(user_id, "failed to persist stopped status: {e}");
            }
        }))
        .await;
    }
}

impl SupervisorInner {
    async fn start_locked(&self, user_id: &str) -> Result<u32, SupervisorError> {
        let spec = self.store.read_record(user_id).await?;
        let endpoint = spec
            .usable_endpoint()
            .ok_or_else(|| SupervisorError::MissingEndpoint {
                user_id: user_id.to_string(),
            })?
            .to_string();
        // reject unusable ids before any process action
        self.artifacts.path_for(user_id)?;

        let retired = self.retire(user_id).await;
        match self.launch(&spec, &endpoint).await {
            Ok(pid) => Ok(pid),
            Err(e) => {
                error!(user_id, "worker start failed: {e}");
                if retired.is_some()
                    && let Err(store_err) = self.projector.mark_stopped(user_id).await
                {
                    error!(user_id, "failed to persist stopped status: {store_err}");
                }
                Err(e)
            }
        }
    }

    async fn launch(&self, spec: &UserWorkerSpec, endpoint: &str) -> Result<u32, SupervisorError> {
        let user_id = spec.id.as_str();
        let config = self.materializer.materialize(spec);
        let config_path = self.artifacts.write(user_id, &config)?;
        let command = self.settings.launch.command_for(spec, endpoint, &config_path);

        let spawned = match timeout(self.settings.spawn_timeout, self.env.spawn(&command)).await {
            Ok(Ok(spawned)) => spawned,
            Ok(Err(e)) => {
                return Err(SupervisorError::SpawnFailure {
                    user_id: user_id.to_string(),
                    reason: e.to_string(),
                });
            }
            Err(_) => {
                return Err(SupervisorError::SpawnFailure {
                    user_id: user_id.to_string(),
                    reason: format!(
                        "spawn did not complete within {:?}",
                        self.settings.spawn_timeout
                    ),
                });
            }
        };

        let pid = spawned.pid;
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let exit = self.watch_exit(user_id, pid, generation, spawned.exited);
        let handle = WorkerHandle::new(user_id.to_string(), pid, generation, config_path, exit);

        let displaced = self.registry.lock().await.put(user_id, handle);
        if let Some(stale) = displaced {
            warn!(user_id, pid = stale.pid, "replacing a worker that was still registered");
            self.terminate(stale).await;
        }

        if let Err(e) = self.projector.mark_running(user_id, pid).await {
            // never leave a worker running that the record does not know about
            let removed = self.registry.lock().await.remove(user_id);
            if let Some(handle) = removed {
                self.terminate(handle).await;
            }
            return Err(e.into());
        }

        info!(
            user_id,
            pid,
            generation,
            capabilities = ?config.names(),
            "worker started"
        );
        Ok(pid)
    }

    /// Forward the worker's termination to the handle and the reconciler.
    fn watch_exit(
        &self,
        user_id: &str,
        pid: u32,
        generation: u64,
        exited: BoxFuture<'static, ExitOutcome>,
    ) -> watch::Receiver<Option<ExitOutcome>> {
        let (exit_tx, exit_rx) = watch::channel(None);
        let notices = self.exits.clone();
        let user_id = user_id.to_string();
        tokio::spawn(async move {
            let outcome = exited.await;
            // no receiver left means the handle is already retired
            let _ = exit_tx.send(Some(outcome));
            let notice = ExitNotice {
                user_id,
                pid,
                generation,
                outcome,
            };
            if notices.send(notice).await.is_err() {
                debug!(pid, "exit reconciler is gone, dropping exit notice");
            }
        });
        exit_rx
    }

    async fn stop_locked(&self, user_id: &str) -> Result<(), SupervisorError> {
        // unknown users get no process action
        self.store.read_record(user_id).await?;
        if let Some(pid) = self.retire(user_id).await {
            info!(user_id, pid, "worker stopped");
        }
        self.projector.mark_stopped(user_id).await?;
        Ok(())
    }

    async fn restart_locked(&self, user_id: &str) -> Result<Option<u32>, SupervisorError> {
        let running = self.registry.lock().await.get(user_id).is_some();
        if !running {
            debug!(user_id, "worker not running, restart skipped");
            return Ok(None);
        }
        self.stop_locked(user_id).await?;
        self.start_locked(user_id).await.map(Some)
    }

    /// Take the user's handle out of the registry and make sure the process
    /// is gone, then sweep for stragglers. Returns the retired pid.
    pub(crate) async fn retire(&self, user_id: &str) -> Option<u32> {
        let handle = self.registry.lock().await.remove(user_id);
        let config_path = match &handle {
            Some(h) => Some(h.config_path.clone()),
            None => self.artifacts.path_for(user_id).ok(),
        };
        let pid = match handle {
            Some(handle) => {
                let pid = handle.pid;
                self.terminate(handle).await;
                Some(pid)
            }
            None => None,
        };
        if let Some(path) = config_path {
            self.sweep(user_id, &path).await;
        }
        pid
    }

    /// SIGTERM, wait, then SIGKILL. Never waits longer than the two timeouts.
    /// Whatever the worker left behind in its process group is killed last.
    async fn terminate(&self, mut handle: WorkerHandle) {
        self.stop_leader(&mut handle).await;
        self.kill_group(&handle.user_id, handle.pid);
    }

    async fn stop_leader(&self, handle: &mut WorkerHandle) {
        let pid = handle.pid;
        let user_id = handle.user_id.clone();
        if handle.has_exited() {
            return;
        }
        if let Err(e) = self.env.signal(pid, StopSignal::Graceful) {
            warn!(user_id, pid, "failed to signal worker: {e}");
        }
        let graceful = self.settings.graceful_stop_timeout;
        if let Ok(outcome) = timeout(graceful, handle.wait_exit()).await {
            debug!(user_id, pid, code = ?outcome.code, "worker exited");
            return;
        }

        warn!(user_id, pid, "worker did not exit within {graceful:?}, killing it");
        if let Err(e) = self.env.signal(pid, StopSignal::Forced) {
            warn!(user_id, pid, "failed to kill worker: {e}");
        }
        if timeout(self.settings.forced_stop_timeout, handle.wait_exit())
            .await
            .is_err()
        {
            error!(user_id, pid, "worker still not reaped after kill, giving up on it");
        }
    }

    /// Descendants that ignored SIGTERM can outlive the group leader.
    pub(crate) fn kill_group(&self, user_id: &str, pid: u32) {
        if let Err(e) = self.env.kill_group(pid) {
            warn!(user_id, pid, "failed to kill worker process group: {e}");
        }
    }

    /// Kill processes still referencing the user's config artifact.
    pub(crate) async fn sweep(&self, user_id: &str, config_path: &Path) {
        let env = self.env.clone();
        let pattern = config_path.to_string_lossy().into_owned();
        match tokio::task::spawn_blocking(move || env.sweep(&pattern)).await {
            Ok(killed) if !killed.is_empty() => {
                warn!(user_id, pids = ?killed, "killed leftover worker processes");
            }
            Ok(_) => {}
            Err(e) => error!(user_id, "process sweep failed: {e}"),
        }
    }
}
