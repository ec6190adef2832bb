//! Core types for the collection mirror.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Name of a remote collection (a backend path or collection name).
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CollectionId(pub String);

impl CollectionId {
    pub fn new(name: impl Into<String>) -> Self {
        CollectionId(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for CollectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CollectionId({})", self.0)
    }
}

impl fmt::Display for CollectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a record, assigned by the backend on confirmation.
///
/// Optimistic records carry their client token as a temporary id until the
/// backend round-trip completes.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordId(pub String);

impl RecordId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RecordId({})", self.0)
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Client-generated correlation token for an optimistic write.
///
/// The token travels with the backend write and is echoed back in confirmed
/// snapshots, which is how reconciliation matches an optimistic record to its
/// confirmed counterpart without relying on content equality.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClientToken(pub String);

impl ClientToken {
    /// Generate a fresh token, unique within this process.
    pub fn fresh() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        let n = COUNTER.fetch_add(1, Ordering::Relaxed);
        ClientToken(format!("tmp-{}-{}", std::process::id(), n))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ClientToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ClientToken({})", self.0)
    }
}

/// Microseconds since Unix epoch.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// Current time.
    pub fn now() -> Self {
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("Time went backwards");
        Timestamp(duration.as_micros() as i64)
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

/// Creation time of a record: a resolved server timestamp, or `Pending` while
/// the server-assigned value is still in flight.
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CreatedAt {
    Pending,
    At(Timestamp),
}

impl CreatedAt {
    pub fn is_pending(&self) -> bool {
        matches!(self, CreatedAt::Pending)
    }

    pub fn timestamp(&self) -> Option<Timestamp> {
        match self {
            CreatedAt::Pending => None,
            CreatedAt::At(t) => Some(*t),
        }
    }
}

impl fmt::Debug for CreatedAt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CreatedAt::Pending => write!(f, "Pending"),
            CreatedAt::At(t) => write!(f, "At({})", t.0),
        }
    }
}

/// A single record in a collection.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    /// Backend id once confirmed; the client token while optimistic.
    pub id: RecordId,

    /// Application content.
    pub content: String,

    /// Server-assigned creation time, or `Pending` until confirmed.
    pub created_at: CreatedAt,

    /// Correlation token, present on optimistic records and on confirmed
    /// records that originated from this client.
    pub token: Option<ClientToken>,
}

impl Record {
    /// Build the optimistic record for a local append. The token doubles as
    /// the temporary id until the backend assigns a real one.
    pub fn optimistic(content: impl Into<String>, token: ClientToken) -> Self {
        Record {
            id: RecordId(token.0.clone()),
            content: content.into(),
            created_at: CreatedAt::Pending,
            token: Some(token),
        }
    }

    pub fn is_pending(&self) -> bool {
        self.created_at.is_pending()
    }
}

/// The materialized, ordered list of records for one collection.
///
/// Owned by the subscription layer; consumers receive clones through the view
/// stream. `revision` increases with every mutation, so a consumer that skips
/// intermediate views can still tell which one is newest.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionView {
    pub records: Vec<Record>,
    pub revision: u64,
}

impl CollectionView {
    pub fn empty() -> Self {
        CollectionView::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
