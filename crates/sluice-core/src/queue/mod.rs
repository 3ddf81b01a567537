//! Durable queues: the ack queue itself, its schema registry, and the
//! input/output pairing used by pipeline stages.

mod ack_queue;
mod pair;
mod schema;

pub use ack_queue::{AckQueue, QueueOptions};
pub use pair::QueuePair;
pub use schema::{Column, SchemaRegistry};

pub(crate) use ack_queue::random_offset_within;

/// System columns. Payload field names may not start with `_`, so these can
/// never collide with user data.
pub(crate) const ID_COLUMN: &str = "_id";
pub(crate) const TS_COLUMN: &str = "_ts";
pub(crate) const STATUS_COLUMN: &str = "_status";
