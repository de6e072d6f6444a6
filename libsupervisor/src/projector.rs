use std::sync::Arc;

use common::WorkerStatus;
use tracing::debug;

use crate::error::StoreError;
use crate::store::RecordStore;

/// Mirrors supervisor transitions into the persisted `status`/`pid` fields.
#[derive(Clone)]
pub(crate) struct StatusProjector {
    store: Arc<dyn RecordStore>,
}

impl StatusProjector {
    pub(crate) fn new(store: Arc<dyn RecordStore>) -> Self {
        StatusProjector { store }
    }

    pub(crate) async fn mark_running(&self, user_id: &str, pid: u32) -> Result<(), StoreError> {
        self.project(user_id, WorkerStatus::Running, Some(pid)).await
    }

    /// A record that no longer exists has nothing to project onto.
    pub(crate) async fn mark_stopped(&self, user_id: &str) -> Result<(), StoreError> {
        match self.project(user_id, WorkerStatus::Stopped, None).await {
            Err(StoreError::NotFound(_)) => Ok(()),
            other => other,
        }
    }

    async fn project(
        &self,
        user_id: &str,
        status: WorkerStatus,
        pid: Option<u32>,
    ) -> Result<(), StoreError> {
        // re-read so concurrent settings edits are not overwritten by a stale copy
        let mut record = self.store.read_record(user_id).await?;
        if record.status == status && record.pid == pid {
            return Ok(());
        }
        record.status = status;
        record.pid = pid;
        self.store.write_record(&record).await?;
        debug!(user_id, %status, ?pid, "worker status persisted");
        Ok(())
    }
}
