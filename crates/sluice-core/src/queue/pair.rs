//! Delta view between an input and an output queue.
//!
//! An input item counts as done once an output item carries the same join
//! key value. Backlog and fetch both evaluate this as one `LEFT JOIN ...
//! IS NULL` over the shared database.

use std::sync::Arc;

use super::ack_queue::{AckQueue, random_offset_within};
use super::ID_COLUMN;
use crate::domain::value::validate_field_name;
use crate::domain::{ItemStatus, Lease, QueueError, Result};
use crate::store::quote_ident;

#[derive(Debug, Clone)]
pub struct QueuePair {
    input: Arc<AckQueue>,
    output: Arc<AckQueue>,
    input_key: String,
    output_key: String,
}

impl QueuePair {
    /// Pair two queues joined on the same column name.
    pub fn new(input: Arc<AckQueue>, output: Arc<AckQueue>, key: &str) -> Result<Self> {
        Self::with_keys(input, output, key, key)
    }

    /// Pair two queues whose join columns are named differently.
    pub fn with_keys(
        input: Arc<AckQueue>,
        output: Arc<AckQueue>,
        input_key: &str,
        output_key: &str,
    ) -> Result<Self> {
        if !input.store().same_database(output.store()) {
            return Err(QueueError::DetachedQueues {
                input: input.name().to_string(),
                output: output.name().to_string(),
            });
        }
        for key in [input_key, output_key] {
            if key != ID_COLUMN {
                validate_field_name(key).map_err(|_| QueueError::InvalidName(key.to_string()))?;
            }
        }
        Ok(Self {
            input,
            output,
            input_key: input_key.to_string(),
            output_key: output_key.to_string(),
        })
    }

    pub fn input(&self) -> &Arc<AckQueue> {
        &self.input
    }

    pub fn output(&self) -> &Arc<AckQueue> {
        &self.output
    }

    pub fn input_key(&self) -> &str {
        &self.input_key
    }

    pub fn output_key(&self) -> &str {
        &self.output_key
    }

    /// Pending input items with no matching output item.
    pub fn backlog(&self) -> Result<u64> {
        self.input.maybe_recycle_stale_leases()?;
        self.raw_backlog()
    }

    /// Lease up to `n` backlog items in id order.
    pub fn fetch(&self, n: usize) -> Result<Lease> {
        self.fetch_with(n, false)
    }

    /// Lease up to `n` backlog items, optionally from a random position
    /// inside the backlog.
    pub fn fetch_with(&self, n: usize, random_offset: bool) -> Result<Lease> {
        self.input.maybe_recycle_stale_leases()?;
        if n == 0 {
            return Ok(Lease::default());
        }
        let offset = if random_offset {
            random_offset_within(self.raw_backlog()?, n)
        } else {
            0
        };
        let candidates = match self.join_columns()? {
            Some((ik, ok)) => format!(
                "SELECT i._id FROM {input} AS i LEFT JOIN {output} AS o ON i.{ik} = o.{ok} \
                 WHERE o.{ok} IS NULL AND i._status < {leased} ORDER BY i._id",
                input = self.input.table(),
                output = self.output.table(),
                leased = ItemStatus::Leased.code(),
            ),
            None => format!(
                "SELECT _id FROM {} WHERE _status < {} ORDER BY _id",
                self.input.table(),
                ItemStatus::Leased.code()
            ),
        };
        self.input.lease_candidates(&candidates, n, offset)
    }

    fn raw_backlog(&self) -> Result<u64> {
        let Some((ik, ok)) = self.join_columns()? else {
            // No key column on one side yet: nothing can match.
            return self.input.raw_pending_count();
        };
        let sql = format!(
            "SELECT COUNT(*) FROM {input} AS i LEFT JOIN {output} AS o ON i.{ik} = o.{ok} \
             WHERE o.{ok} IS NULL AND i._status < {leased}",
            input = self.input.table(),
            output = self.output.table(),
            leased = ItemStatus::Leased.code(),
        );
        let conn = self.input.store().conn()?;
        let n: i64 = conn.query_row(&sql, [], |row| row.get(0))?;
        Ok(n as u64)
    }

    /// Quoted key columns when both exist, indexing them on first use.
    fn join_columns(&self) -> Result<Option<(String, String)>> {
        if !self.input.ensure_index(&self.input_key)? || !self.output.ensure_index(&self.output_key)? {
            return Ok(None);
        }
        Ok(Some((quote_ident(&self.input_key), quote_ident(&self.output_key))))
    }
}
