//! Subscription types for live view streams.

use crate::error::{Result, SyncError};
use crate::types::{CollectionId, CollectionView};
use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use super::manager::ManagerInner;

/// Unique identifier for one subscriber attached to a collection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriberId(pub u64);

/// Events emitted on a view stream.
#[derive(Clone, Debug)]
pub enum ViewEvent {
    /// A new materialized view. Delivery is latest-value-wins: a slow
    /// consumer may skip intermediate views but always observes the newest.
    View(CollectionView),

    /// The backend live channel reported an error. Non-fatal; the
    /// last-known-good view stands and the listener keeps running.
    ListenerError(String),
}

/// Configuration for one subscriber.
#[derive(Clone, Debug)]
pub struct SubscriptionConfig {
    /// Max listener errors queued before the oldest are dropped.
    /// Default: 64
    pub max_buffered_errors: usize,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            max_buffered_errors: 64,
        }
    }
}

/// Per-subscriber delivery state.
///
/// Views are conflated into a single latest-value slot so a slow consumer
/// never blocks the producer; listener errors queue separately because they
/// must not be conflated away. A bounded(1) wake channel signals the handle.
pub(crate) struct SubscriberSlot {
    latest: Mutex<Option<CollectionView>>,
    errors: Mutex<VecDeque<String>>,
    max_errors: usize,
    closed: AtomicBool,
    wake: Sender<()>,
}

impl SubscriberSlot {
    pub(crate) fn new(config: &SubscriptionConfig) -> (Arc<Self>, Receiver<()>) {
        let (wake, wake_rx) = bounded(1);
        let slot = Arc::new(SubscriberSlot {
            latest: Mutex::new(None),
            errors: Mutex::new(VecDeque::new()),
            max_errors: config.max_buffered_errors.max(1),
            closed: AtomicBool::new(false),
            wake,
        });
        (slot, wake_rx)
    }

    pub(crate) fn push_view(&self, view: CollectionView) {
        *self.latest.lock() = Some(view);
        let _ = self.wake.try_send(());
    }

    pub(crate) fn push_error(&self, message: String) {
        let mut errors = self.errors.lock();
        if errors.len() >= self.max_errors {
            errors.pop_front();
        }
        errors.push_back(message);
        drop(errors);
        let _ = self.wake.try_send(());
    }

    /// Mark the slot detached. Queued events stay readable; the handle gets
    /// `SubscriptionDropped` once they are drained.
    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let _ = self.wake.try_send(());
    }

    fn take_event(&self) -> Option<ViewEvent> {
        if let Some(message) = self.errors.lock().pop_front() {
            return Some(ViewEvent::ListenerError(message));
        }
        self.latest.lock().take().map(ViewEvent::View)
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Handle to one live view stream.
///
/// Dropping the handle unsubscribes; when the last handle for a collection
/// goes away, the backend listener is torn down and local state discarded.
pub struct ViewHandle {
    id: SubscriberId,
    collection: CollectionId,
    slot: Arc<SubscriberSlot>,
    wake_rx: Receiver<()>,
    manager: Weak<ManagerInner>,
}

impl ViewHandle {
    pub(crate) fn new(
        id: SubscriberId,
        collection: CollectionId,
        slot: Arc<SubscriberSlot>,
        wake_rx: Receiver<()>,
        manager: Weak<ManagerInner>,
    ) -> Self {
        ViewHandle {
            id,
            collection,
            slot,
            wake_rx,
            manager,
        }
    }

    pub fn id(&self) -> SubscriberId {
        self.id
    }

    pub fn collection(&self) -> &CollectionId {
        &self.collection
    }

    /// Next event if one is ready. `None` means nothing yet: before the
    /// first snapshot lands this is the "loading" state.
    pub fn try_recv(&self) -> Option<ViewEvent> {
        self.slot.take_event()
    }

    /// Block until the next event. Errors once the subscription is torn down
    /// and all queued events are drained.
    pub fn recv(&self) -> Result<ViewEvent> {
        loop {
            if let Some(event) = self.slot.take_event() {
                return Ok(event);
            }
            if self.slot.is_closed() {
                return Err(SyncError::SubscriptionDropped);
            }
            self.wake_rx
                .recv()
                .map_err(|_| SyncError::SubscriptionDropped)?;
        }
    }

    /// Block up to `timeout` for the next event. `None` on timeout or after
    /// teardown.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<ViewEvent> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(event) = self.slot.take_event() {
                return Some(event);
            }
            if self.slot.is_closed() {
                return None;
            }
            let remaining = deadline.checked_duration_since(Instant::now())?;
            if self.wake_rx.recv_timeout(remaining).is_err() {
                return None;
            }
        }
    }

    /// Explicitly unsubscribe. Equivalent to dropping the handle.
    pub fn unsubscribe(self) {}
}

impl Drop for ViewHandle {
    fn drop(&mut self) {
        if let Some(manager) = self.manager.upgrade() {
            manager.detach(&self.collection, self.id);
        }
    }
}
