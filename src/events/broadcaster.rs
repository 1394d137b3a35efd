use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tokio::sync::mpsc;

use crate::run::{RunEvent, RunId};

struct Subscriber {
    id: u64,
    tx: mpsc::UnboundedSender<RunEvent>,
}

/// In-memory fan-out of freshly appended events.
///
/// Each subscriber owns an unbounded queue keyed by run id, so a slow or
/// abandoned reader never blocks publishing to anyone else, and a stream
/// never has to filter out other runs' events.
#[derive(Default)]
pub struct Broadcaster {
    subscribers: DashMap<RunId, Vec<Subscriber>>,
    next_id: AtomicU64,
}

impl Broadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a live queue for `run_id`. Events published after this call
    /// returns are delivered to it until the [`Subscription`] is dropped.
    pub fn subscribe(self: &Arc<Self>, run_id: RunId) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers
            .entry(run_id)
            .or_default()
            .push(Subscriber { id, tx });
        tracing::debug!(run_id = %run_id, subscriber = id, "Live subscriber attached");
        Subscription {
            run_id,
            id,
            rx,
            broadcaster: Arc::clone(self),
        }
    }

    /// Deliver to every live subscriber of the event's run. Closed queues are pruned.
    pub fn publish(&self, event: &RunEvent) {
        let run_id = event.run_id;
        if let Some(mut subs) = self.subscribers.get_mut(&run_id) {
            subs.retain(|s| s.tx.send(event.clone()).is_ok());
        }
        self.subscribers.remove_if(&run_id, |_, subs| subs.is_empty());
    }

    pub fn subscriber_count(&self, run_id: RunId) -> usize {
        self.subscribers
            .get(&run_id)
            .map(|subs| subs.len())
            .unwrap_or(0)
    }

    fn unsubscribe(&self, run_id: RunId, id: u64) {
        if let Some(mut subs) = self.subscribers.get_mut(&run_id) {
            subs.retain(|s| s.id != id);
        }
        self.subscribers.remove_if(&run_id, |_, subs| subs.is_empty());
        tracing::debug!(run_id = %run_id, subscriber = id, "Live subscriber detached");
    }
}

/// A live per-run event queue. Dropping it detaches from the broadcaster.
pub struct Subscription {
    run_id: RunId,
    id: u64,
    rx: mpsc::UnboundedReceiver<RunEvent>,
    broadcaster: Arc<Broadcaster>,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<RunEvent> {
        self.rx.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.broadcaster.unsubscribe(self.run_id, self.id);
    }
}
