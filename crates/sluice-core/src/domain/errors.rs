//! Errors for queue, schema and ledger operations.

use thiserror::Error;

use super::ids::{ItemId, TaskId};
use super::value::ColumnType;

#[derive(Debug, Error)]
pub enum QueueError {
    /// A record failed validation; nothing from its batch was inserted.
    #[error("invalid record at index {index}: {reason}")]
    InvalidRecord { index: usize, reason: String },

    #[error("schema conflict on column `{column}`: declared {expected}, got {found}")]
    SchemaConflict {
        column: String,
        expected: ColumnType,
        found: ColumnType,
    },

    /// Ack/fail referenced ids that are missing or not currently leased.
    #[error("unknown or unleased item ids: {0:?}")]
    UnknownKey(Vec<ItemId>),

    #[error("unknown task: {0}")]
    UnknownTask(TaskId),

    #[error("invalid identifier `{0}`")]
    InvalidName(String),

    /// The two sides of a queue pair live in different databases.
    #[error("queues `{input}` and `{output}` are not in the same store")]
    DetachedQueues { input: String, output: String },

    /// Underlying storage failure.
    #[error("store unavailable: {0}")]
    StoreUnavailable(#[from] rusqlite::Error),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store lock poisoned")]
    LockPoisoned,

    /// A stored value could not be decoded.
    #[error("corrupt stored value: {0}")]
    Corrupt(String),
}

impl QueueError {
    /// Validation and schema errors are the caller's fault; everything else
    /// comes from the store.
    pub fn is_store_failure(&self) -> bool {
        matches!(
            self,
            QueueError::StoreUnavailable(_)
                | QueueError::Io(_)
                | QueueError::LockPoisoned
                | QueueError::Corrupt(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, QueueError>;
