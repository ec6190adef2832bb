//! The `SyncStore` façade used by the UI layer.

use crate::backend::{self, Backend};
use crate::error::{Result, SyncError};
use crate::ordering::OrderingPolicy;
use crate::subscriptions::{SubscriptionConfig, SubscriptionManager, ViewHandle};
use crate::types::{ClientToken, CollectionId, Record, RecordId};
use std::sync::Arc;
use tracing::{debug, warn};

/// Store configuration.
#[derive(Clone, Debug, Default)]
pub struct SyncConfig {
    /// How materialized views are ordered.
    pub ordering: OrderingPolicy,

    /// Per-subscriber stream settings.
    pub subscription: SubscriptionConfig,
}

/// Façade over one collection: optimistic appends plus the live view stream.
///
/// Clones share the subscription registry, so several handles onto the same
/// collection still hold exactly one upstream listener.
#[derive(Clone)]
pub struct SyncStore {
    collection: CollectionId,
    backend: Arc<dyn Backend>,
    subscriptions: SubscriptionManager,
    config: SyncConfig,
}

impl SyncStore {
    pub fn new(collection: CollectionId, backend: Arc<dyn Backend>) -> Self {
        Self::with_config(collection, backend, SyncConfig::default())
    }

    pub fn with_config(
        collection: CollectionId,
        backend: Arc<dyn Backend>,
        config: SyncConfig,
    ) -> Self {
        let subscriptions = SubscriptionManager::with_ordering(Arc::clone(&backend), config.ordering);
        SyncStore {
            collection,
            backend,
            subscriptions,
            config,
        }
    }

    pub fn collection(&self) -> &CollectionId {
        &self.collection
    }

    /// Append a record.
    ///
    /// Blank or whitespace-only content is rejected with no side effects. On
    /// valid input, an optimistic record appears in the live view before the
    /// backend call resolves; if the backend rejects the write, the record is
    /// rolled back and `WriteFailed` returned. A successful write is promoted
    /// in place by reconciliation once the confirming snapshot arrives.
    ///
    /// The write is fire-and-forget with respect to subscription lifetime:
    /// unsubscribing does not cancel it.
    pub fn append(&self, content: &str) -> Result<RecordId> {
        let trimmed = content.trim();
        if trimmed.is_empty() {
            return Err(SyncError::BlankContent);
        }

        let token = ClientToken::fresh();
        let record = Record::optimistic(trimmed, token.clone());
        let inserted = self.subscriptions.insert_optimistic(&self.collection, record);
        debug!(collection = %self.collection, token = token.as_str(), inserted, "optimistic append");

        let fields = backend::append_fields(trimmed, &token);
        match self.backend.append_raw(&self.collection, fields) {
            Ok(id) => Ok(id),
            Err(err) => {
                if inserted {
                    self.subscriptions.remove_optimistic(&self.collection, &token);
                }
                warn!(collection = %self.collection, token = token.as_str(), %err, "append rolled back");
                Err(err)
            }
        }
    }

    /// Live stream of materialized views for this collection.
    ///
    /// No event is delivered before the first snapshot lands; render a
    /// loading state until then.
    pub fn live_view(&self) -> ViewHandle {
        self.subscriptions
            .subscribe(&self.collection, self.config.subscription.clone())
    }
}
