//! Reorg event fan-out.
//!
//! Each subscriber owns a bounded channel. Publishing never blocks the
//! import path: a full channel loses the event (with a warning) and a closed
//! one is unregistered.

use super::head_tracker::{ReorgEvent, WaitError};
use parking_lot::Mutex;
use std::{
    collections::BTreeMap,
    sync::{Arc, Weak},
    time::Duration,
};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn, Span};

pub use tokio::sync::mpsc::error::TryRecvError;

/// Default per-subscriber channel capacity.
pub const DEFAULT_EVENT_BUFFER: usize = 64;

/// Registered subscriber channels.
#[derive(Debug)]
pub(crate) struct SubscriberRegistry {
    inner: Mutex<Subscribers>,
    buffer: usize,
    span: Span,
}

#[derive(Debug, Default)]
struct Subscribers {
    next_id: u64,
    senders: BTreeMap<u64, mpsc::Sender<Arc<ReorgEvent>>>,
}

impl SubscriberRegistry {
    pub(crate) fn new(buffer: usize, span: Span) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Subscribers::default()),
            buffer: buffer.max(1),
            span,
        })
    }

    pub(crate) fn subscribe(self: &Arc<Self>) -> (ReorgSubscription, SubscriptionHandle) {
        let (sender, receiver) = mpsc::channel(self.buffer);
        let mut inner = self.inner.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.senders.insert(id, sender);

        debug!(target: "poa::subscription", parent: &self.span, id, "Subscriber registered");
        (
            ReorgSubscription { id, receiver },
            SubscriptionHandle { id, registry: Arc::downgrade(self) },
        )
    }

    /// Offer `event` to every subscriber. Returns the number that accepted it.
    pub(crate) fn publish(&self, event: &Arc<ReorgEvent>) -> usize {
        let mut inner = self.inner.lock();
        let mut delivered = 0;
        inner.senders.retain(|id, sender| match sender.try_send(Arc::clone(event)) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(TrySendError::Full(_)) => {
                warn!(
                    target: "poa::subscription",
                    parent: &self.span,
                    id,
                    common_block = event.common_block.number,
                    "Subscriber channel full, dropping reorg event"
                );
                true
            }
            Err(TrySendError::Closed(_)) => {
                debug!(target: "poa::subscription", parent: &self.span, id, "Subscriber gone");
                false
            }
        });
        delivered
    }

    fn remove(&self, id: u64) -> bool {
        self.inner.lock().senders.remove(&id).is_some()
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.lock().senders.len()
    }
}

/// Receiving side of a reorg subscription.
#[derive(Debug)]
pub struct ReorgSubscription {
    id: u64,
    receiver: mpsc::Receiver<Arc<ReorgEvent>>,
}

impl ReorgSubscription {
    /// Subscription id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Next event, or `None` once cancelled (or the tracker is gone) and drained.
    pub async fn recv(&mut self) -> Option<Arc<ReorgEvent>> {
        self.receiver.recv().await
    }

    /// Next buffered event without waiting.
    pub fn try_recv(&mut self) -> Result<Arc<ReorgEvent>, TryRecvError> {
        self.receiver.try_recv()
    }

    /// Next event, waiting at most `timeout`.
    pub async fn recv_timeout(&mut self, timeout: Duration) -> Result<Arc<ReorgEvent>, WaitError> {
        match tokio::time::timeout(timeout, self.receiver.recv()).await {
            Ok(Some(event)) => Ok(event),
            Ok(None) => Err(WaitError::Closed),
            Err(_) => Err(WaitError::Timeout(timeout)),
        }
    }
}

/// Cancels a subscription.
#[derive(Debug, Clone)]
pub struct SubscriptionHandle {
    id: u64,
    registry: Weak<SubscriberRegistry>,
}

impl SubscriptionHandle {
    /// Subscription id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Stop delivery. Events already buffered can still be received.
    ///
    /// Returns false if the subscription was already gone.
    pub fn cancel(&self) -> bool {
        self.registry.upgrade().is_some_and(|registry| registry.remove(self.id))
    }
}
