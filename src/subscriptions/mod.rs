//! Live subscription system.
//!
//! One backend listener per collection, shared by every subscriber through a
//! reference-counted registry. Each subscriber gets a stream of materialized
//! [`CollectionView`](crate::types::CollectionView)s with replay-latest
//! semantics and latest-value-wins delivery.
//!
//! # Example
//!
//! ```ignore
//! let manager = SubscriptionManager::new(backend);
//! let handle = manager.subscribe(&collection, SubscriptionConfig::default());
//!
//! loop {
//!     match handle.recv() {
//!         Ok(ViewEvent::View(view)) => render(&view),
//!         Ok(ViewEvent::ListenerError(message)) => show_banner(&message),
//!         Err(_) => break,
//!     }
//! }
//! ```

mod manager;
mod types;

pub use manager::SubscriptionManager;
pub use types::{SubscriberId, SubscriptionConfig, ViewEvent, ViewHandle};
