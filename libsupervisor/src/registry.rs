use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, PoisonError};

use tokio::sync::{Mutex, OwnedMutexGuard, watch};

use crate::environment::ExitOutcome;

/// A worker currently supervised for one user.
#[derive(Debug)]
pub struct WorkerHandle {
    pub user_id: String,
    pub pid: u32,
    /// Distinguishes successive launches for the same user, so an exit
    /// notice from an older worker never retires a newer one.
    pub generation: u64,
    pub config_path: PathBuf,
    exit: watch::Receiver<Option<ExitOutcome>>,
}

impl WorkerHandle {
    pub(crate) fn new(
        user_id: String,
        pid: u32,
        generation: u64,
        config_path: PathBuf,
        exit: watch::Receiver<Option<ExitOutcome>>,
    ) -> Self {
        WorkerHandle {
            user_id,
            pid,
            generation,
            config_path,
            exit,
        }
    }

    pub fn has_exited(&self) -> bool {
        self.exit.borrow().is_some()
    }

    /// Wait until the process is gone. Returns immediately if it already is.
    pub(crate) async fn wait_exit(&mut self) -> ExitOutcome {
        match self.exit.wait_for(Option::is_some).await {
            Ok(outcome) => (*outcome).unwrap_or_default(),
            // the watcher task went away without reporting, nothing left to wait for
            Err(_) => ExitOutcome::default(),
        }
    }
}

/// Live worker handles, at most one per user id.
#[derive(Debug, Default)]
pub(crate) struct ProcessRegistry {
    handles: HashMap<String, WorkerHandle>,
}

impl ProcessRegistry {
    pub(crate) fn get(&self, user_id: &str) -> Option<&WorkerHandle> {
        self.handles.get(user_id)
    }

    /// Register a handle, returning the one it displaced.
    pub(crate) fn put(&mut self, user_id: &str, handle: WorkerHandle) -> Option<WorkerHandle> {
        self.handles.insert(user_id.to_string(), handle)
    }

    pub(crate) fn remove(&mut self, user_id: &str) -> Option<WorkerHandle> {
        self.handles.remove(user_id)
    }

    /// Remove the handle only if it still belongs to the given launch.
    pub(crate) fn remove_generation(
        &mut self,
        user_id: &str,
        generation: u64,
    ) -> Option<WorkerHandle> {
        match self.handles.get(user_id) {
            Some(h) if h.generation == generation => self.handles.remove(user_id),
            _ => None,
        }
    }

    pub(crate) fn user_ids(&self) -> Vec<String> {
        self.handles.keys().cloned().collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.handles.len()
    }
}

type LockTable = Arc<std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>>;

/// One mutex per user id; holding it serializes every lifecycle operation for that user.
///
/// An entry lives only while someone holds or waits for it, so ids that never
/// reach a record (or were destroyed) do not pile up.
#[derive(Default)]
pub(crate) struct UserLocks {
    locks: LockTable,
}

impl UserLocks {
    pub(crate) async fn acquire(&self, user_id: &str) -> UserGuard {
        // cloned under the table lock so a releasing guard sees this waiter
        let lock = self
            .locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(user_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let guard = lock.lock_owned().await;
        UserGuard {
            user_id: user_id.to_string(),
            guard: Some(guard),
            table: self.locks.clone(),
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

pub(crate) struct UserGuard {
    user_id: String,
    guard: Option<OwnedMutexGuard<()>>,
    table: LockTable,
}

impl Drop for UserGuard {
    fn drop(&mut self) {
        let mut locks = self.table.lock().unwrap_or_else(PoisonError::into_inner);
        drop(self.guard.take());
        // only the table's own reference left: nobody holds or waits for it
        if locks
            .get(&self.user_id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(&self.user_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn handle(
        user: &str,
        pid: u32,
        generation: u64,
    ) -> (WorkerHandle, watch::Sender<Option<ExitOutcome>>) {
        let (tx, rx) = watch::channel(None);
        (
            WorkerHandle::new(user.to_string(), pid, generation, PathBuf::from("/tmp/x.json"), rx),
            tx,
        )
    }

    #[test]
    fn test_put_displaces_previous_handle() {
        let mut registry = ProcessRegistry::default();
        let (first, _tx1) = handle("u1", 10, 1);
        let (second, _tx2) = handle("u1", 11, 2);
        assert!(registry.put("u1", first).is_none());
        let displaced = registry.put("u1", second).unwrap();
        assert_eq!(displaced.pid, 10);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("u1").unwrap().pid, 11);
    }

    #[test]
    fn test_remove_generation_ignores_stale_launch() {
        let mut registry = ProcessRegistry::default();
        let (h, _tx) = handle("u1", 10, 5);
        registry.put("u1", h);
        assert!(registry.remove_generation("u1", 4).is_none());
        assert!(registry.get("u1").is_some());
        assert_eq!(registry.remove_generation("u1", 5).unwrap().pid, 10);
        assert!(registry.remove("u1").is_none());
    }

    #[tokio::test]
    async fn test_wait_exit_observes_outcome() {
        let (mut h, tx) = handle("u1", 10, 1);
        assert!(!h.has_exited());
        tx.send(Some(ExitOutcome { code: Some(3) })).unwrap();
        assert_eq!(h.wait_exit().await.code, Some(3));
        assert!(h.has_exited());
    }

    #[tokio::test]
    async fn test_wait_exit_when_watcher_gone() {
        let (mut h, tx) = handle("u1", 10, 1);
        drop(tx);
        assert_eq!(h.wait_exit().await, ExitOutcome::default());
    }

    #[tokio::test]
    async fn test_user_locks_serialize_same_user_only() {
        let locks = Arc::new(UserLocks::default());
        let guard = locks.acquire("a").await;

        // another user is not blocked
        tokio::time::timeout(Duration::from_millis(100), locks.acquire("b"))
            .await
            .unwrap();

        let locks2 = locks.clone();
        let waiter = tokio::spawn(async move {
            let _g = locks2.acquire("a").await;
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());
        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_user_locks_forget_released_ids() {
        let locks = UserLocks::default();
        for i in 0..1000 {
            let _g = locks.acquire(&format!("ghost-{i}")).await;
        }
        assert_eq!(locks.len(), 0);

        let held = locks.acquire("a").await;
        assert_eq!(locks.len(), 1);
        drop(held);
        assert_eq!(locks.len(), 0);
    }

    #[tokio::test]
    async fn test_user_locks_kept_while_someone_waits() {
        let locks = Arc::new(UserLocks::default());
        let guard = locks.acquire("a").await;

        let locks2 = locks.clone();
        let waiter = tokio::spawn(async move {
            let _g = locks2.acquire("a").await;
            tokio::time::sleep(Duration::from_millis(50)).await;
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        // releasing must not drop the entry the waiter is queued on
        drop(guard);
        assert_eq!(locks.len(), 1);
        let third = tokio::time::timeout(Duration::from_millis(20), locks.acquire("a")).await;
        assert!(third.is_err());

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(locks.len(), 0);
    }
}
