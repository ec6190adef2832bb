//! Reference-counted registry of live collection listeners.
//!
//! One `CollectionState` exists per collection with at least one subscriber.
//! The first subscriber starts the backend listener; later subscribers share
//! it. The last unsubscribe tears the listener down and discards local state.
//!
//! All mutation of a collection's view (snapshot application, optimistic
//! insert, optimistic removal) funnels through the per-collection view lock,
//! so backend callbacks and local appends never race on the list itself.

use crate::backend::{Backend, SnapshotEvent, Unsubscribe};
use crate::codec;
use crate::ordering::OrderingPolicy;
use crate::types::{ClientToken, CollectionId, CollectionView, Record};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

use super::types::{SubscriberId, SubscriberSlot, SubscriptionConfig, ViewHandle};

/// Local mirror state for one collection.
#[derive(Default)]
struct ViewState {
    /// Records confirmed by the last snapshot, sorted by policy.
    confirmed: Vec<Record>,
    /// Optimistic records still awaiting confirmation.
    pending: Vec<Record>,
    revision: u64,
    /// True once at least one snapshot has been applied.
    synced: bool,
}

impl ViewState {
    fn materialize(&self, policy: OrderingPolicy) -> CollectionView {
        let mut records = self.confirmed.clone();
        records.extend(self.pending.iter().cloned());
        policy.sort(&mut records);
        CollectionView {
            records,
            revision: self.revision,
        }
    }

    /// Whether there is anything worth replaying to a new subscriber.
    fn has_emitted(&self) -> bool {
        self.synced || !self.pending.is_empty()
    }
}

struct CollectionState {
    collection: CollectionId,
    view: Mutex<ViewState>,
    subscribers: Mutex<HashMap<SubscriberId, Arc<SubscriberSlot>>>,
    stop: Mutex<Option<Unsubscribe>>,
}

impl CollectionState {
    fn new(collection: CollectionId) -> Self {
        CollectionState {
            collection,
            view: Mutex::new(ViewState::default()),
            subscribers: Mutex::new(HashMap::new()),
            stop: Mutex::new(None),
        }
    }

    /// Reconcile an inbound snapshot into the view.
    ///
    /// The confirmed list is replaced wholesale, except that pending records
    /// whose token matches no confirmed record are retained (their write is
    /// still propagating). A matched pending record is removed; the confirmed
    /// record stands in its place. Matching is by token only, never content.
    fn apply_snapshot(&self, policy: OrderingPolicy, payload: crate::backend::BackendPayload) {
        let mut decoded = codec::decode(payload);

        // Guard the unique-id invariant against malformed payloads.
        let mut seen = HashSet::new();
        decoded.retain(|r| seen.insert(r.id.clone()));
        policy.sort(&mut decoded);

        let confirmed_tokens: HashSet<&ClientToken> =
            decoded.iter().filter_map(|r| r.token.as_ref()).collect();

        let mut view = self.view.lock();
        view.pending
            .retain(|r| match r.token.as_ref() {
                Some(token) => !confirmed_tokens.contains(token),
                None => true,
            });
        view.confirmed = decoded;
        view.synced = true;
        view.revision += 1;
        let snapshot = view.materialize(policy);
        drop(view);

        self.broadcast_view(snapshot);
    }

    fn broadcast_view(&self, view: CollectionView) {
        let subscribers = self.subscribers.lock();
        for slot in subscribers.values() {
            slot.push_view(view.clone());
        }
    }

    fn broadcast_error(&self, message: &str) {
        warn!(collection = %self.collection, message, "backend listener error");
        let subscribers = self.subscribers.lock();
        for slot in subscribers.values() {
            slot.push_error(message.to_string());
        }
    }

    fn close_all(&self) {
        let subscribers = self.subscribers.lock();
        for slot in subscribers.values() {
            slot.close();
        }
    }
}

pub(crate) struct ManagerInner {
    backend: Arc<dyn Backend>,
    ordering: OrderingPolicy,
    collections: Mutex<HashMap<CollectionId, Arc<CollectionState>>>,
    next_subscriber: AtomicU64,
}

impl ManagerInner {
    fn subscribe(
        self: &Arc<Self>,
        collection: &CollectionId,
        config: SubscriptionConfig,
    ) -> ViewHandle {
        let id = SubscriberId(self.next_subscriber.fetch_add(1, Ordering::SeqCst));
        let (slot, wake_rx) = SubscriberSlot::new(&config);

        // Register the subscriber under the registry lock so a concurrent
        // last-unsubscribe cannot discard the state out from under us.
        let (state, newly_created) = {
            let mut collections = self.collections.lock();
            let (state, created) = match collections.get(collection) {
                Some(state) => (Arc::clone(state), false),
                None => {
                    let state = Arc::new(CollectionState::new(collection.clone()));
                    collections.insert(collection.clone(), Arc::clone(&state));
                    (state, true)
                }
            };
            state.subscribers.lock().insert(id, Arc::clone(&slot));
            (state, created)
        };

        if newly_created {
            debug!(collection = %collection, "starting backend listener");
            let cb_state = Arc::clone(&state);
            let policy = self.ordering;
            let stop = self.backend.subscribe_raw(
                collection,
                Box::new(move |event| match event {
                    SnapshotEvent::Payload(payload) => cb_state.apply_snapshot(policy, payload),
                    SnapshotEvent::Error(message) => cb_state.broadcast_error(&message),
                }),
            );
            *state.stop.lock() = Some(stop);
        }

        // Replay-latest: a late subscriber sees the current view immediately.
        {
            let view = state.view.lock();
            if view.has_emitted() {
                slot.push_view(view.materialize(self.ordering));
            }
        }

        ViewHandle::new(
            id,
            collection.clone(),
            slot,
            wake_rx,
            Arc::downgrade(self),
        )
    }

    pub(crate) fn detach(&self, collection: &CollectionId, id: SubscriberId) {
        let mut collections = self.collections.lock();
        let Some(state) = collections.get(collection).map(Arc::clone) else {
            return;
        };

        let last = {
            let mut subscribers = state.subscribers.lock();
            let Some(slot) = subscribers.remove(&id) else {
                return;
            };
            slot.close();
            subscribers.is_empty()
        };

        if last {
            collections.remove(collection);
            drop(collections);
            debug!(collection = %collection, "tearing down backend listener");
            if let Some(stop) = state.stop.lock().take() {
                stop();
            }
        }
    }

    fn insert_optimistic(&self, collection: &CollectionId, record: Record) -> bool {
        let Some(state) = self.collections.lock().get(collection).map(Arc::clone) else {
            // Nothing mirrors this collection; the write still goes through.
            return false;
        };

        let mut view = state.view.lock();
        view.pending.push(record);
        view.revision += 1;
        let snapshot = view.materialize(self.ordering);
        drop(view);

        state.broadcast_view(snapshot);
        true
    }

    fn remove_optimistic(&self, collection: &CollectionId, token: &ClientToken) -> bool {
        let Some(state) = self.collections.lock().get(collection).map(Arc::clone) else {
            return false;
        };

        let mut view = state.view.lock();
        let before = view.pending.len();
        view.pending.retain(|r| r.token.as_ref() != Some(token));
        if view.pending.len() == before {
            return false;
        }
        view.revision += 1;
        let snapshot = view.materialize(self.ordering);
        drop(view);

        state.broadcast_view(snapshot);
        true
    }
}

impl Drop for ManagerInner {
    fn drop(&mut self) {
        let collections = std::mem::take(&mut *self.collections.lock());
        for state in collections.values() {
            state.close_all();
            if let Some(stop) = state.stop.lock().take() {
                stop();
            }
        }
    }
}

/// Owns the live listeners, one per collection with active subscribers.
///
/// Cheap to clone; clones share the registry, so two consumers of the same
/// collection share one upstream listener.
#[derive(Clone)]
pub struct SubscriptionManager {
    inner: Arc<ManagerInner>,
}

impl SubscriptionManager {
    /// Create a manager with the default (newest-first) ordering policy.
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self::with_ordering(backend, OrderingPolicy::default())
    }

    pub fn with_ordering(backend: Arc<dyn Backend>, ordering: OrderingPolicy) -> Self {
        SubscriptionManager {
            inner: Arc::new(ManagerInner {
                backend,
                ordering,
                collections: Mutex::new(HashMap::new()),
                next_subscriber: AtomicU64::new(1),
            }),
        }
    }

    /// Attach a subscriber to `collection`. The first subscriber starts the
    /// backend listener; the stream replays the current view to later
    /// subscribers. No event is delivered before the first snapshot: render
    /// a loading state until then.
    pub fn subscribe(&self, collection: &CollectionId, config: SubscriptionConfig) -> ViewHandle {
        self.inner.subscribe(collection, config)
    }

    /// Insert an optimistic record into the live view. Returns false when the
    /// collection has no active subscription (there is no view to mirror).
    pub fn insert_optimistic(&self, collection: &CollectionId, record: Record) -> bool {
        self.inner.insert_optimistic(collection, record)
    }

    /// Remove an optimistic record by its token, emitting an updated view if
    /// anything was removed. Used for rollback after a failed write.
    pub fn remove_optimistic(&self, collection: &CollectionId, token: &ClientToken) -> bool {
        self.inner.remove_optimistic(collection, token)
    }

    /// Number of collections with a live listener.
    pub fn collection_count(&self) -> usize {
        self.inner.collections.lock().len()
    }

    /// Number of subscribers attached to `collection`.
    pub fn subscriber_count(&self, collection: &CollectionId) -> usize {
        self.inner
            .collections
            .lock()
            .get(collection)
            .map(|state| state.subscribers.lock().len())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{
        BackendPayload, DocumentSnapshot, FieldMap, SnapshotFn, Unsubscribe, FIELD_CLIENT_TOKEN,
        FIELD_CONTENT, FIELD_CREATED_AT,
    };
    use crate::error::Result;
    use crate::subscriptions::ViewEvent;
    use crate::types::{RecordId, Timestamp};
    use serde_json::{json, Value};
    use std::time::Duration;

    /// Backend driven entirely by the test: snapshots are emitted manually.
    #[derive(Default)]
    struct ScriptedBackend {
        listeners: Mutex<HashMap<CollectionId, Vec<(u64, Arc<dyn Fn(SnapshotEvent) + Send + Sync>)>>>,
        next_listener: AtomicU64,
        subscribe_calls: AtomicU64,
    }

    impl ScriptedBackend {
        fn emit(&self, collection: &CollectionId, payload: BackendPayload) {
            let listeners: Vec<_> = self
                .listeners
                .lock()
                .get(collection)
                .map(|l| l.iter().map(|(_, f)| Arc::clone(f)).collect())
                .unwrap_or_default();
            for listener in listeners {
                listener(SnapshotEvent::Payload(payload.clone()));
            }
        }

        fn emit_error(&self, collection: &CollectionId, message: &str) {
            let listeners: Vec<_> = self
                .listeners
                .lock()
                .get(collection)
                .map(|l| l.iter().map(|(_, f)| Arc::clone(f)).collect())
                .unwrap_or_default();
            for listener in listeners {
                listener(SnapshotEvent::Error(message.to_string()));
            }
        }

        fn active_listeners(&self, collection: &CollectionId) -> usize {
            self.listeners
                .lock()
                .get(collection)
                .map(|l| l.len())
                .unwrap_or(0)
        }

        fn subscribe_calls(&self) -> u64 {
            self.subscribe_calls.load(Ordering::SeqCst)
        }
    }

    impl Backend for Arc<ScriptedBackend> {
        fn subscribe_raw(&self, collection: &CollectionId, on_snapshot: SnapshotFn) -> Unsubscribe {
            self.subscribe_calls.fetch_add(1, Ordering::SeqCst);
            let id = self.next_listener.fetch_add(1, Ordering::SeqCst);
            self.listeners
                .lock()
                .entry(collection.clone())
                .or_default()
                .push((id, Arc::from(on_snapshot)));

            let backend = Arc::clone(self);
            let collection = collection.clone();
            Box::new(move || {
                if let Some(listeners) = backend.listeners.lock().get_mut(&collection) {
                    listeners.retain(|(lid, _)| *lid != id);
                }
            })
        }

        fn append_raw(&self, _collection: &CollectionId, _fields: FieldMap) -> Result<RecordId> {
            Ok(RecordId("r1".to_string()))
        }
    }

    fn scripted() -> (Arc<ScriptedBackend>, SubscriptionManager) {
        let backend = Arc::new(ScriptedBackend::default());
        let manager = SubscriptionManager::new(Arc::new(Arc::clone(&backend)));
        (backend, manager)
    }

    fn doc(id: &str, content: &str, micros: Option<i64>, token: Option<&str>) -> DocumentSnapshot {
        let mut fields = FieldMap::new();
        fields.insert(FIELD_CONTENT.to_string(), json!(content));
        if let Some(m) = micros {
            fields.insert(FIELD_CREATED_AT.to_string(), json!(m));
        }
        if let Some(t) = token {
            fields.insert(FIELD_CLIENT_TOKEN.to_string(), Value::String(t.to_string()));
        }
        DocumentSnapshot {
            id: id.to_string(),
            fields,
        }
    }

    fn expect_view(handle: &ViewHandle) -> CollectionView {
        match handle.recv_timeout(Duration::from_millis(200)) {
            Some(ViewEvent::View(view)) => view,
            other => panic!("expected view event, got {:?}", other),
        }
    }

    #[test]
    fn test_two_subscribers_share_one_listener() {
        let (backend, manager) = scripted();
        let collection = CollectionId::new("messages");

        let first = manager.subscribe(&collection, SubscriptionConfig::default());
        let second = manager.subscribe(&collection, SubscriptionConfig::default());

        assert_eq!(backend.subscribe_calls(), 1);
        assert_eq!(manager.subscriber_count(&collection), 2);

        drop(first);
        assert_eq!(backend.active_listeners(&collection), 1);
        assert_eq!(manager.subscriber_count(&collection), 1);

        drop(second);
        assert_eq!(backend.active_listeners(&collection), 0);
        assert_eq!(manager.collection_count(), 0);
    }

    #[test]
    fn test_no_event_before_first_snapshot() {
        let (_backend, manager) = scripted();
        let collection = CollectionId::new("messages");

        let handle = manager.subscribe(&collection, SubscriptionConfig::default());
        assert!(handle.try_recv().is_none());
    }

    #[test]
    fn test_snapshot_reaches_subscriber_sorted() {
        let (backend, manager) = scripted();
        let collection = CollectionId::new("messages");
        let handle = manager.subscribe(&collection, SubscriptionConfig::default());

        backend.emit(
            &collection,
            BackendPayload::Ordered(vec![
                doc("d1", "old", Some(100), None),
                doc("d2", "new", Some(200), None),
            ]),
        );

        let view = expect_view(&handle);
        let contents: Vec<&str> = view.records.iter().map(|r| r.content.as_str()).collect();
        assert_eq!(contents, vec!["new", "old"]);
    }

    #[test]
    fn test_replay_latest_for_second_subscriber() {
        let (backend, manager) = scripted();
        let collection = CollectionId::new("messages");
        let first = manager.subscribe(&collection, SubscriptionConfig::default());

        backend.emit(
            &collection,
            BackendPayload::Ordered(vec![doc("d1", "hello", Some(100), None)]),
        );
        let _ = expect_view(&first);

        let second = manager.subscribe(&collection, SubscriptionConfig::default());
        let view = expect_view(&second);
        assert_eq!(view.records[0].content, "hello");
    }

    #[test]
    fn test_optimistic_record_confirmed_by_token() {
        let (backend, manager) = scripted();
        let collection = CollectionId::new("messages");
        let handle = manager.subscribe(&collection, SubscriptionConfig::default());

        let token = ClientToken("tmp-9".to_string());
        assert!(manager.insert_optimistic(&collection, Record::optimistic("hi", token.clone())));

        let view = expect_view(&handle);
        assert_eq!(view.records.len(), 1);
        assert!(view.records[0].is_pending());

        backend.emit(
            &collection,
            BackendPayload::Ordered(vec![doc("r1", "hi", Some(100), Some("tmp-9"))]),
        );

        let view = expect_view(&handle);
        assert_eq!(view.records.len(), 1);
        assert_eq!(view.records[0].id, RecordId("r1".to_string()));
        assert!(!view.records[0].is_pending());
    }

    #[test]
    fn test_unmatched_optimistic_record_survives_snapshot() {
        let (backend, manager) = scripted();
        let collection = CollectionId::new("messages");
        let handle = manager.subscribe(&collection, SubscriptionConfig::default());

        manager.insert_optimistic(
            &collection,
            Record::optimistic("in flight", ClientToken("tmp-1".to_string())),
        );
        let _ = expect_view(&handle);

        // Snapshot from another writer; our write has not landed yet.
        backend.emit(
            &collection,
            BackendPayload::Ordered(vec![doc("d1", "other", Some(100), None)]),
        );

        let view = expect_view(&handle);
        assert_eq!(view.records.len(), 2);
        assert_eq!(view.records[0].content, "in flight");
        assert_eq!(view.records[1].content, "other");
    }

    #[test]
    fn test_duplicate_content_does_not_false_match() {
        let (backend, manager) = scripted();
        let collection = CollectionId::new("messages");
        let handle = manager.subscribe(&collection, SubscriptionConfig::default());

        // Same content as the confirmed record, different token.
        manager.insert_optimistic(
            &collection,
            Record::optimistic("hi", ClientToken("tmp-2".to_string())),
        );
        let _ = expect_view(&handle);

        backend.emit(
            &collection,
            BackendPayload::Ordered(vec![doc("d1", "hi", Some(100), Some("tmp-other"))]),
        );

        let view = expect_view(&handle);
        assert_eq!(view.records.len(), 2);
    }

    #[test]
    fn test_snapshot_application_is_idempotent() {
        let (backend, manager) = scripted();
        let collection = CollectionId::new("messages");
        let handle = manager.subscribe(&collection, SubscriptionConfig::default());

        let payload = BackendPayload::Ordered(vec![
            doc("d1", "one", Some(100), None),
            doc("d2", "two", Some(200), None),
        ]);
        backend.emit(&collection, payload.clone());
        let first = expect_view(&handle);

        backend.emit(&collection, payload);
        let second = expect_view(&handle);

        assert_eq!(first.records, second.records);
    }

    #[test]
    fn test_listener_error_preserves_state() {
        let (backend, manager) = scripted();
        let collection = CollectionId::new("messages");
        let handle = manager.subscribe(&collection, SubscriptionConfig::default());

        backend.emit(
            &collection,
            BackendPayload::Ordered(vec![doc("d1", "kept", Some(100), None)]),
        );
        let _ = expect_view(&handle);

        backend.emit_error(&collection, "transient network failure");

        match handle.recv_timeout(Duration::from_millis(200)) {
            Some(ViewEvent::ListenerError(message)) => {
                assert_eq!(message, "transient network failure");
            }
            other => panic!("expected listener error, got {:?}", other),
        }

        // Listener still attached, state still last-known-good.
        assert_eq!(backend.active_listeners(&collection), 1);
        backend.emit(
            &collection,
            BackendPayload::Ordered(vec![
                doc("d1", "kept", Some(100), None),
                doc("d2", "later", Some(200), None),
            ]),
        );
        let view = expect_view(&handle);
        assert_eq!(view.records.len(), 2);
    }

    #[test]
    fn test_slow_consumer_sees_latest_view_only() {
        let (backend, manager) = scripted();
        let collection = CollectionId::new("messages");
        let handle = manager.subscribe(&collection, SubscriptionConfig::default());

        for i in 1..=5 {
            backend.emit(
                &collection,
                BackendPayload::Ordered(vec![doc(
                    "d1",
                    &format!("version {}", i),
                    Some(Timestamp::now().0),
                    None,
                )]),
            );
        }

        let view = expect_view(&handle);
        assert_eq!(view.records[0].content, "version 5");
        assert!(handle.try_recv().is_none());
    }

    #[test]
    fn test_resubscribe_after_teardown_starts_empty() {
        let (backend, manager) = scripted();
        let collection = CollectionId::new("messages");

        let handle = manager.subscribe(&collection, SubscriptionConfig::default());
        backend.emit(
            &collection,
            BackendPayload::Ordered(vec![doc("d1", "hello", Some(100), None)]),
        );
        let _ = expect_view(&handle);
        drop(handle);

        let handle = manager.subscribe(&collection, SubscriptionConfig::default());
        assert!(handle.try_recv().is_none());
    }

    #[test]
    fn test_recv_errors_after_teardown() {
        let (_backend, manager) = scripted();
        let collection = CollectionId::new("messages");

        let first = manager.subscribe(&collection, SubscriptionConfig::default());
        let second = manager.subscribe(&collection, SubscriptionConfig::default());
        drop(manager);
        drop(second);

        // Manager inner is still alive through the handles' weak refs only;
        // dropping the last strong ref closed every slot.
        assert!(first.recv().is_err());
    }

    #[test]
    fn test_optimistic_insert_without_subscription_is_noop() {
        let (_backend, manager) = scripted();
        let collection = CollectionId::new("messages");

        let inserted = manager.insert_optimistic(
            &collection,
            Record::optimistic("hi", ClientToken::fresh()),
        );
        assert!(!inserted);
        assert_eq!(manager.collection_count(), 0);
    }

    #[test]
    fn test_remove_optimistic_rolls_back_view() {
        let (_backend, manager) = scripted();
        let collection = CollectionId::new("messages");
        let handle = manager.subscribe(&collection, SubscriptionConfig::default());

        let token = ClientToken("tmp-3".to_string());
        manager.insert_optimistic(&collection, Record::optimistic("oops", token.clone()));
        let view = expect_view(&handle);
        assert_eq!(view.records.len(), 1);

        assert!(manager.remove_optimistic(&collection, &token));
        let view = expect_view(&handle);
        assert!(view.records.is_empty());

        // Second removal finds nothing.
        assert!(!manager.remove_optimistic(&collection, &token));
    }

    #[test]
    fn test_key_value_snapshot_is_sorted_client_side() {
        let (backend, manager) = scripted();
        let collection = CollectionId::new("messages");
        let handle = manager.subscribe(&collection, SubscriptionConfig::default());

        let mut map = HashMap::new();
        for (key, content, micros) in
            [("ka", "middle", 200), ("kb", "newest", 300), ("kc", "oldest", 100)]
        {
            let mut fields = FieldMap::new();
            fields.insert(FIELD_CONTENT.to_string(), json!(content));
            fields.insert(FIELD_CREATED_AT.to_string(), json!(micros));
            map.insert(key.to_string(), fields);
        }
        backend.emit(&collection, BackendPayload::KeyValue(map));

        let view = expect_view(&handle);
        let contents: Vec<&str> = view.records.iter().map(|r| r.content.as_str()).collect();
        assert_eq!(contents, vec!["newest", "middle", "oldest"]);
    }
}
