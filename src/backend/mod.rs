//! Backend transport contract.
//!
//! The mirror consumes two structurally different transport shapes through
//! one trait:
//! - a streaming key-value store that pushes the entire subtree on every
//!   change, with no meaningful key order
//! - a query-based document store that pushes snapshots already ordered
//!   server-side
//!
//! The transport protocol itself is an external collaborator; this module
//! defines only the contract plus in-memory reference implementations of both
//! shapes for tests and demos.

mod memory;

pub use memory::{MemoryDocBackend, MemoryKvBackend};

use crate::error::Result;
use crate::types::{ClientToken, CollectionId, RecordId};
use serde_json::Value;
use std::collections::HashMap;

/// Loose field bag as delivered by a backend. Never propagated past decode.
pub type FieldMap = serde_json::Map<String, Value>;

/// Wire field holding the record text.
pub const FIELD_CONTENT: &str = "content";

/// Wire field holding the creation time (micros) once the server resolves it.
pub const FIELD_CREATED_AT: &str = "created_at";

/// Wire field echoing the client correlation token.
pub const FIELD_CLIENT_TOKEN: &str = "client_token";

/// Placeholder value the backend replaces with a server-assigned timestamp.
pub const SERVER_TIMESTAMP: &str = "__server_timestamp__";

/// One document in an ordered snapshot.
#[derive(Clone, Debug)]
pub struct DocumentSnapshot {
    pub id: String,
    pub fields: FieldMap,
}

/// Snapshot payload as delivered by a backend listener.
#[derive(Clone, Debug)]
pub enum BackendPayload {
    /// Full subtree from the streaming key-value store. Key order carries no
    /// meaning; the client must order records itself.
    KeyValue(HashMap<String, FieldMap>),

    /// Documents from the query-based store, pre-ordered by the server
    /// (order field descending).
    Ordered(Vec<DocumentSnapshot>),
}

/// Event delivered to a listener callback. Errors arrive on the same channel
/// as data so the listener can keep running through transient failures.
#[derive(Clone, Debug)]
pub enum SnapshotEvent {
    Payload(BackendPayload),
    Error(String),
}

/// Listener callback registered with a backend.
pub type SnapshotFn = Box<dyn Fn(SnapshotEvent) + Send + Sync>;

/// Closure that unregisters a live listener.
pub type Unsubscribe = Box<dyn FnOnce() + Send>;

/// Contract a backend transport must expose.
pub trait Backend: Send + Sync {
    /// Register a live listener for `collection`. The callback receives every
    /// subsequent snapshot (and, depending on the backend, the current one
    /// immediately). The returned closure unregisters the listener.
    fn subscribe_raw(&self, collection: &CollectionId, on_snapshot: SnapshotFn) -> Unsubscribe;

    /// Append a record to `collection`. Blocks until the backend confirms or
    /// rejects the write.
    fn append_raw(&self, collection: &CollectionId, fields: FieldMap) -> Result<RecordId>;
}

/// Build the wire fields for an append: content, a server-timestamp
/// placeholder, and the correlation token.
pub fn append_fields(content: &str, token: &ClientToken) -> FieldMap {
    let mut fields = FieldMap::new();
    fields.insert(FIELD_CONTENT.to_string(), Value::String(content.to_string()));
    fields.insert(
        FIELD_CREATED_AT.to_string(),
        Value::String(SERVER_TIMESTAMP.to_string()),
    );
    fields.insert(
        FIELD_CLIENT_TOKEN.to_string(),
        Value::String(token.as_str().to_string()),
    );
    fields
}
