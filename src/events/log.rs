use std::sync::Arc;

use futures::Stream;

use super::broadcaster::Broadcaster;
use crate::errors::RunError;
use crate::locks::RunLocks;
use crate::run::{NewRunEvent, RunEvent, RunId};
use crate::store::EventStore;

/// Durable event log with live tailing.
///
/// `append` persists first and broadcasts second, holding a per-run lock
/// across both so live delivery happens in `seq` order.
#[derive(Clone)]
pub struct EventLog {
    store: Arc<dyn EventStore>,
    broadcaster: Arc<Broadcaster>,
    append_locks: Arc<RunLocks>,
}

impl EventLog {
    pub fn new(store: Arc<dyn EventStore>) -> Self {
        Self {
            store,
            broadcaster: Arc::new(Broadcaster::new()),
            append_locks: Arc::new(RunLocks::new()),
        }
    }

    pub fn broadcaster(&self) -> &Arc<Broadcaster> {
        &self.broadcaster
    }

    pub async fn append(&self, event: NewRunEvent) -> Result<RunEvent, RunError> {
        let _guard = self.append_locks.acquire(event.run_id).await;
        let stored = self.store.append_event(event).await?;
        self.broadcaster.publish(&stored);
        tracing::debug!(
            run_id = %stored.run_id,
            seq = stored.seq,
            event_type = %stored.event_type,
            "Event appended"
        );
        Ok(stored)
    }

    /// Replay the run's history, then tail live events until the stream is dropped.
    ///
    /// The live queue is attached before history is read. Anything appended
    /// in between shows up in both and is skipped on the live side by `seq`.
    pub fn subscribe(
        &self,
        run_id: RunId,
    ) -> impl Stream<Item = Result<RunEvent, RunError>> + Send + 'static + use<> {
        let mut live = self.broadcaster.subscribe(run_id);
        let store = Arc::clone(&self.store);

        async_stream::try_stream! {
            let history = store.events_for_run(run_id).await?;
            let mut last_seq = 0;
            for event in history {
                last_seq = event.seq;
                yield event;
            }
            while let Some(event) = live.recv().await {
                if event.seq <= last_seq {
                    continue;
                }
                last_seq = event.seq;
                yield event;
            }
        }
    }

    /// The `n` most recent events, oldest first.
    pub async fn latest(&self, run_id: RunId, n: usize) -> Result<Vec<RunEvent>, RunError> {
        self.store.latest_events(run_id, n).await
    }

    pub async fn history(&self, run_id: RunId) -> Result<Vec<RunEvent>, RunError> {
        self.store.events_for_run(run_id).await
    }
}
