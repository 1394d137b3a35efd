use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::run::RunId;

type LockMap = DashMap<RunId, Arc<Mutex<()>>>;

/// One async mutex per run id.
///
/// Used to keep at most one `advance` in flight per run and to keep event
/// appends for a run in the same order as their broadcasts. Locks for
/// different runs never contend. An entry lives only while someone holds or
/// waits on it.
#[derive(Default)]
pub struct RunLocks {
    locks: Arc<LockMap>,
}

impl RunLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `run_id`. Released when the guard drops.
    pub async fn acquire(&self, run_id: RunId) -> RunLockGuard {
        // Clone the Arc out so the DashMap shard lock is released before awaiting.
        let lock = self.locks.entry(run_id).or_default().clone();
        let guard = lock.lock_owned().await;
        RunLockGuard {
            guard: Some(guard),
            run_id,
            locks: Arc::clone(&self.locks),
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.locks.len()
    }
}

/// Exclusive access to one run.
///
/// Dropping it releases the mutex and removes the map entry when no other
/// task holds a handle to it.
pub struct RunLockGuard {
    guard: Option<OwnedMutexGuard<()>>,
    run_id: RunId,
    locks: Arc<LockMap>,
}

impl Drop for RunLockGuard {
    fn drop(&mut self) {
        // The guard owns one strong ref; release it before counting.
        drop(self.guard.take());
        // Waiters clone the Arc under the same shard lock, so a count of 1
        // means only the map itself still refers to the mutex.
        self.locks
            .remove_if(&self.run_id, |_, lock| Arc::strong_count(lock) == 1);
    }
}
