//! In-memory reference backends.
//!
//! Both transport shapes are emulated over the same storage: an insertion
//! ordered list of key/field-bag pairs per collection. The key-value flavor
//! re-pushes the whole subtree as an unordered map on every change; the
//! document flavor pushes the same data as a server-ordered snapshot
//! (creation time descending, unresolved timestamps first).
//!
//! Test hooks: `fail_next_append` for write rollback paths, `emit_error` for
//! listener error paths, `defer_timestamps`/`resolve_timestamps` for the
//! two-phase server-timestamp behavior, `insert_raw` for malformed payloads.

use super::{
    Backend, BackendPayload, DocumentSnapshot, FieldMap, SnapshotEvent, SnapshotFn, Unsubscribe,
    FIELD_CREATED_AT,
};
use crate::error::{Result, SyncError};
use crate::types::{CollectionId, RecordId, Timestamp};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Clone, Copy, Debug)]
enum Flavor {
    KeyValue,
    Ordered,
}

#[derive(Default)]
struct Slot {
    /// Insertion-ordered storage, key -> fields.
    records: Vec<(String, FieldMap)>,
    listeners: Vec<(u64, SnapshotFn)>,
}

struct Shared {
    flavor: Flavor,
    collections: Mutex<HashMap<CollectionId, Slot>>,
    next_key: AtomicU64,
    next_listener: AtomicU64,
    last_stamp: AtomicI64,
    fail_next: AtomicBool,
    defer_timestamps: AtomicBool,
}

impl Shared {
    fn new(flavor: Flavor) -> Arc<Self> {
        Arc::new(Shared {
            flavor,
            collections: Mutex::new(HashMap::new()),
            next_key: AtomicU64::new(1),
            next_listener: AtomicU64::new(1),
            last_stamp: AtomicI64::new(0),
            fail_next: AtomicBool::new(false),
            defer_timestamps: AtomicBool::new(false),
        })
    }

    fn subscribe(self: &Arc<Self>, collection: &CollectionId, on_snapshot: SnapshotFn) -> Unsubscribe {
        let id = self.next_listener.fetch_add(1, Ordering::SeqCst);

        {
            let mut collections = self.collections.lock();
            let slot = collections.entry(collection.clone()).or_default();
            // Deliver the current state immediately, like the real transports.
            on_snapshot(SnapshotEvent::Payload(self.payload_for(slot)));
            slot.listeners.push((id, on_snapshot));
        }

        let shared = Arc::clone(self);
        let collection = collection.clone();
        Box::new(move || {
            let mut collections = shared.collections.lock();
            if let Some(slot) = collections.get_mut(&collection) {
                slot.listeners.retain(|(lid, _)| *lid != id);
            }
        })
    }

    /// Server clock: strictly increasing, so no two writes tie on creation
    /// time.
    fn stamp(&self) -> i64 {
        let now = Timestamp::now().0;
        let mut seen = self.last_stamp.load(Ordering::SeqCst);
        loop {
            let next = now.max(seen + 1);
            match self.last_stamp.compare_exchange_weak(
                seen,
                next,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return next,
                Err(observed) => seen = observed,
            }
        }
    }

    fn append(&self, collection: &CollectionId, mut fields: FieldMap) -> Result<RecordId> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(SyncError::WriteFailed("injected backend failure".to_string()));
        }

        let key = format!("-K{:016}", self.next_key.fetch_add(1, Ordering::SeqCst));
        if !self.defer_timestamps.load(Ordering::SeqCst) {
            fields.insert(FIELD_CREATED_AT.to_string(), Value::Number(self.stamp().into()));
        }

        let mut collections = self.collections.lock();
        let slot = collections.entry(collection.clone()).or_default();
        slot.records.push((key.clone(), fields));
        self.emit(slot);

        Ok(RecordId(key))
    }

    /// Fill in every still-placeholder timestamp and push one snapshot.
    fn resolve_timestamps(&self, collection: &CollectionId) {
        let mut collections = self.collections.lock();
        let Some(slot) = collections.get_mut(collection) else {
            return;
        };

        let mut changed = false;
        for (_, fields) in &mut slot.records {
            let resolved = matches!(fields.get(FIELD_CREATED_AT), Some(Value::Number(_)));
            if !resolved {
                fields.insert(FIELD_CREATED_AT.to_string(), Value::Number(self.stamp().into()));
                changed = true;
            }
        }
        if changed {
            self.emit(slot);
        }
    }

    fn insert_raw(&self, collection: &CollectionId, key: &str, fields: FieldMap) {
        let mut collections = self.collections.lock();
        let slot = collections.entry(collection.clone()).or_default();
        slot.records.push((key.to_string(), fields));
        self.emit(slot);
    }

    fn emit_error(&self, collection: &CollectionId, message: &str) {
        let collections = self.collections.lock();
        if let Some(slot) = collections.get(collection) {
            for (_, listener) in &slot.listeners {
                listener(SnapshotEvent::Error(message.to_string()));
            }
        }
    }

    fn listener_count(&self, collection: &CollectionId) -> usize {
        self.collections
            .lock()
            .get(collection)
            .map(|slot| slot.listeners.len())
            .unwrap_or(0)
    }

    fn emit(&self, slot: &Slot) {
        let payload = self.payload_for(slot);
        for (_, listener) in &slot.listeners {
            listener(SnapshotEvent::Payload(payload.clone()));
        }
    }

    fn payload_for(&self, slot: &Slot) -> BackendPayload {
        match self.flavor {
            Flavor::KeyValue => BackendPayload::KeyValue(
                slot.records
                    .iter()
                    .map(|(key, fields)| (key.clone(), fields.clone()))
                    .collect(),
            ),
            Flavor::Ordered => {
                let mut docs: Vec<DocumentSnapshot> = slot
                    .records
                    .iter()
                    .map(|(key, fields)| DocumentSnapshot {
                        id: key.clone(),
                        fields: fields.clone(),
                    })
                    .collect();
                // Server-side order: unresolved timestamps first, then
                // creation time descending, id as tiebreak.
                docs.sort_by(|a, b| {
                    let key = |d: &DocumentSnapshot| {
                        d.fields
                            .get(FIELD_CREATED_AT)
                            .and_then(Value::as_i64)
                    };
                    match (key(a), key(b)) {
                        (None, None) => a.id.cmp(&b.id),
                        (None, Some(_)) => std::cmp::Ordering::Less,
                        (Some(_), None) => std::cmp::Ordering::Greater,
                        (Some(x), Some(y)) => y.cmp(&x).then_with(|| a.id.cmp(&b.id)),
                    }
                });
                BackendPayload::Ordered(docs)
            }
        }
    }
}

/// Streaming key-value backend: full unordered subtree on every change.
#[derive(Clone)]
pub struct MemoryKvBackend {
    shared: Arc<Shared>,
}

/// Query-based document backend: server-ordered snapshot on every change.
#[derive(Clone)]
pub struct MemoryDocBackend {
    shared: Arc<Shared>,
}

macro_rules! memory_backend_impl {
    ($name:ident, $flavor:expr) => {
        impl $name {
            pub fn new() -> Self {
                Self {
                    shared: Shared::new($flavor),
                }
            }

            /// Make the next `append_raw` fail without side effects.
            pub fn fail_next_append(&self) {
                self.shared.fail_next.store(true, Ordering::SeqCst);
            }

            /// When enabled, appends keep their server-timestamp placeholder
            /// until `resolve_timestamps` is called, mimicking the two-phase
            /// server timestamp of the real transports.
            pub fn defer_timestamps(&self, on: bool) {
                self.shared.defer_timestamps.store(on, Ordering::SeqCst);
            }

            /// Resolve all deferred timestamps and push a snapshot.
            pub fn resolve_timestamps(&self, collection: &CollectionId) {
                self.shared.resolve_timestamps(collection);
            }

            /// Seed a record with arbitrary fields (possibly malformed).
            pub fn insert_raw(&self, collection: &CollectionId, key: &str, fields: FieldMap) {
                self.shared.insert_raw(collection, key, fields);
            }

            /// Report an error on the live channel of `collection`.
            pub fn emit_error(&self, collection: &CollectionId, message: &str) {
                self.shared.emit_error(collection, message);
            }

            /// Number of live listeners registered for `collection`.
            pub fn listener_count(&self, collection: &CollectionId) -> usize {
                self.shared.listener_count(collection)
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl Backend for $name {
            fn subscribe_raw(
                &self,
                collection: &CollectionId,
                on_snapshot: SnapshotFn,
            ) -> Unsubscribe {
                self.shared.subscribe(collection, on_snapshot)
            }

            fn append_raw(&self, collection: &CollectionId, fields: FieldMap) -> Result<RecordId> {
                self.shared.append(collection, fields)
            }
        }
    };
}

memory_backend_impl!(MemoryKvBackend, Flavor::KeyValue);
memory_backend_impl!(MemoryDocBackend, Flavor::Ordered);
