//! In-process fan-out of progress events.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc::{self, error::TryRecvError, error::TrySendError};
use tracing::trace;

use crate::progress::{ProgressEvent, ProgressNotifier};

const DEFAULT_CAPACITY: usize = 64;

/// Identifier handed out by [`ProgressHub::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(u64);

/// Receiving end of a hub subscription.
///
/// Dropping the subscription is equivalent to unsubscribing; the hub prunes
/// closed channels on the next publish.
#[derive(Debug)]
pub struct Subscription {
    id: SubscriberId,
    receiver: mpsc::Receiver<ProgressEvent>,
}

impl Subscription {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Wait for the next event. Returns `None` once the hub dropped this subscriber.
    pub async fn recv(&mut self) -> Option<ProgressEvent> {
        self.receiver.recv().await
    }

    /// Take an event without waiting.
    pub fn try_recv(&mut self) -> Result<ProgressEvent, TryRecvError> {
        self.receiver.try_recv()
    }
}

/// Broadcast hub for progress events.
///
/// - Each subscriber owns a bounded channel
/// - Publishing never blocks: a full channel drops the event for that subscriber
/// - Closed subscribers are removed while publishing
#[derive(Debug)]
pub struct ProgressHub {
    subscribers: Mutex<HashMap<SubscriberId, mpsc::Sender<ProgressEvent>>>,
    next_id: AtomicU64,
    dropped: AtomicU64,
    capacity: usize,
}

impl ProgressHub {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Create a hub whose subscriber channels buffer `capacity` events (minimum 1).
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            subscribers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            dropped: AtomicU64::new(0),
            capacity: capacity.max(1),
        }
    }

    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::channel(self.capacity);
        let id = SubscriberId(self.next_id.fetch_add(1, Ordering::Relaxed));

        // A poisoned lock only means a publisher panicked mid-iteration; the map is still valid.
        let mut subs = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        subs.insert(id, tx);

        Subscription { id, receiver: rx }
    }

    /// Remove a subscriber. Returns `false` if it was already gone.
    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        let mut subs = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        subs.remove(&id).is_some()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// Total number of events dropped because a subscriber was not keeping up.
    pub fn dropped_events(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Default for ProgressHub {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressNotifier for ProgressHub {
    fn on_progress(&self, event: ProgressEvent) {
        let mut subs = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());

        subs.retain(|id, tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                trace!(subscriber = id.0, "progress subscriber lagging; event dropped");
                true
            }
            Err(TrySendError::Closed(_)) => false,
        });
    }
}
