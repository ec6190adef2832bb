//! # Replica
//!
//! A live, eventually-consistent local mirror of a remote record collection.
//!
//! One abstraction covers two structurally different transports: a streaming
//! key-value store that pushes the whole subtree on every change, and a
//! query-based document store that pushes server-ordered snapshots. The
//! mirror hides the difference while preserving each backend's ordering
//! guarantees.
//!
//! ## Core Concepts
//!
//! - **Records**: canonical `{id, content, created_at}` entries decoded from
//!   loose backend field bags
//! - **Views**: the materialized, ordered list per collection, streamed to
//!   subscribers with latest-value-wins delivery
//! - **Optimistic writes**: appends appear locally before confirmation and
//!   are reconciled by correlation token when the snapshot catches up
//! - **Listeners**: one reference-counted backend listener per collection
//!
//! ## Example
//!
//! ```ignore
//! use replica::{CollectionId, MemoryDocBackend, SyncStore, ViewEvent};
//! use std::sync::Arc;
//!
//! let backend = Arc::new(MemoryDocBackend::new());
//! let store = SyncStore::new(CollectionId::new("messages"), backend);
//!
//! let handle = store.live_view();
//! store.append("Hello, world!")?;
//!
//! if let Ok(ViewEvent::View(view)) = handle.recv() {
//!     for record in &view.records {
//!         println!("{}", record.content);
//!     }
//! }
//! ```

pub mod backend;
pub mod codec;
pub mod error;
pub mod ordering;
pub mod store;
pub mod subscriptions;
pub mod types;

// Re-exports
pub use backend::{
    append_fields, Backend, BackendPayload, DocumentSnapshot, FieldMap, MemoryDocBackend,
    MemoryKvBackend, SnapshotEvent, SnapshotFn, Unsubscribe,
};
pub use error::{Result, SyncError};
pub use ordering::{Direction, OrderingPolicy};
pub use store::{SyncConfig, SyncStore};
pub use subscriptions::{
    SubscriberId, SubscriptionConfig, SubscriptionManager, ViewEvent, ViewHandle,
};
pub use types::*;
