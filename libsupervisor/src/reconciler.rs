use std::sync::Weak;

use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::environment::ExitOutcome;
use crate::supervisor::SupervisorInner;

/// Sent by a worker's watcher task once the process has terminated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitNotice {
    pub user_id: String,
    pub pid: u32,
    pub generation: u64,
    pub outcome: ExitOutcome,
}

/// Applies exit notices to the registry and the persisted records.
///
/// An exit of a worker that is still registered (same launch generation) is
/// treated the same whether it was expected or a crash: the handle is dropped
/// and the record marked stopped. Nothing is relaunched. Notices for workers
/// an explicit stop already retired find no matching handle and are ignored.
pub struct ExitReconciler {
    notices: mpsc::Receiver<ExitNotice>,
    supervisor: Weak<SupervisorInner>,
}

impl ExitReconciler {
    pub(crate) fn new(
        notices: mpsc::Receiver<ExitNotice>,
        supervisor: Weak<SupervisorInner>,
    ) -> Self {
        ExitReconciler {
            notices,
            supervisor,
        }
    }

    /// Run until the supervisor is dropped.
    pub async fn run(mut self) {
        while let Some(notice) = self.notices.recv().await {
            let Some(inner) = self.supervisor.upgrade() else {
                break;
            };
            // each notice waits for its own user's lock, never for another user's
            tokio::spawn(async move { inner.reconcile_exit(notice).await });
        }
        debug!("exit reconciler stopped");
    }
}

impl SupervisorInner {
    pub(crate) async fn reconcile_exit(&self, notice: ExitNotice) {
        let user_id = notice.user_id.as_str();
        let _guard = self.locks.acquire(user_id).await;
        let removed = self
            .registry
            .lock()
            .await
            .remove_generation(user_id, notice.generation);
        let Some(handle) = removed else {
            debug!(user_id, pid = notice.pid, "exit of an already retired worker");
            return;
        };

        warn!(
            user_id,
            pid = notice.pid,
            code = ?notice.outcome.code,
            "worker exited unexpectedly, not restarting"
        );
        // whatever the worker launched may have outlived it
        self.kill_group(user_id, handle.pid);
        self.sweep(user_id, &handle.config_path).await;
        if let Err(e) = self.projector.mark_stopped(user_id).await {
            error!(user_id, "failed to persist stopped status: {e}");
        }
    }
}
