//! Queue items and leases.

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::ids::ItemId;
use super::status::ItemStatus;
use super::value::Record;

/// One stored record with its system columns.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueItem {
    pub id: ItemId,
    /// Insert time, overwritten with the lease start when leased.
    pub enqueued_at: DateTime<Utc>,
    pub status: ItemStatus,
    pub payload: Record,
}

/// A batch of items claimed by one consumer.
///
/// The consumer must `ack` (or `fail`) the ids; otherwise the sweep returns
/// them to pending after the lease timeout.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Lease {
    pub ids: Vec<ItemId>,
    pub payloads: Vec<Record>,
}

impl Lease {
    pub(crate) fn from_items(mut items: Vec<QueueItem>) -> Self {
        // RETURNING gives no ordering guarantee.
        items.sort_by_key(|item| item.id);
        let (ids, payloads) = items.into_iter().map(|item| (item.id, item.payload)).unzip();
        Self { ids, payloads }
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ItemId, &Record)> {
        self.ids.iter().copied().zip(self.payloads.iter())
    }
}
