//! Ordering policy for materialized views.
//!
//! The streaming key-value backend delivers unordered snapshots, so ordering
//! is applied client-side after decode. The document backend pre-sorts
//! server-side with the same convention, so applying the policy again must be
//! a no-op.

use crate::types::{CreatedAt, Record};
use std::cmp::Ordering;

/// Display direction for resolved timestamps.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Direction {
    /// Newest records first; pending records above everything.
    #[default]
    NewestFirst,
    /// Oldest records first; pending records below everything.
    OldestFirst,
}

/// Total order over records.
///
/// Pending records sort as "most recent" so optimistic entries surface at the
/// display edge immediately. Resolved records compare by creation time; ties
/// break by id (lexicographic) for determinism. Pending ids are client tokens
/// and therefore unique, so the order is total.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct OrderingPolicy {
    pub direction: Direction,
}

impl OrderingPolicy {
    pub fn new(direction: Direction) -> Self {
        OrderingPolicy { direction }
    }

    pub fn compare(&self, a: &Record, b: &Record) -> Ordering {
        let recency = match (a.created_at, b.created_at) {
            (CreatedAt::Pending, CreatedAt::Pending) => Ordering::Equal,
            (CreatedAt::Pending, CreatedAt::At(_)) => Ordering::Less,
            (CreatedAt::At(_), CreatedAt::Pending) => Ordering::Greater,
            (CreatedAt::At(x), CreatedAt::At(y)) => y.cmp(&x),
        };
        let primary = match self.direction {
            Direction::NewestFirst => recency,
            Direction::OldestFirst => recency.reverse(),
        };
        primary.then_with(|| a.id.cmp(&b.id))
    }

    /// Sort in place. Stable, and idempotent by construction: a list already
    /// sorted by the same policy is left untouched.
    pub fn sort(&self, records: &mut [Record]) {
        records.sort_by(|a, b| self.compare(a, b));
    }
}
