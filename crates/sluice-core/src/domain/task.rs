//! Task ledger records.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::TaskId;
use super::status::TaskStatus;

/// Opaque identifier returned by an external execution backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExternalHandle(String);

impl ExternalHandle {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ExternalHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// One task of one stage.
///
/// Records are never deleted by the core; they are the audit trail of every
/// dispatch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskRecord {
    pub task_id: TaskId,
    pub stage: String,
    pub status: TaskStatus,

    /// Per-stage ordinal of this task.
    pub task_index: u64,

    /// Number of input items this task leased.
    pub claimed_count: u64,

    pub external_handle: Option<ExternalHandle>,

    /// Error message when the task failed.
    pub error: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields to merge into a task record. `None` leaves a field untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskUpdate {
    pub status: Option<TaskStatus>,
    pub claimed_count: Option<u64>,
    pub external_handle: Option<ExternalHandle>,
    pub error: Option<String>,
}

impl TaskUpdate {
    pub fn status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn with_claimed(mut self, claimed_count: u64) -> Self {
        self.claimed_count = Some(claimed_count);
        self
    }

    pub fn with_handle(mut self, handle: ExternalHandle) -> Self {
        self.external_handle = Some(handle);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    /// Merge into `record`. `updated_at` is refreshed by the caller.
    pub(crate) fn apply(self, record: &mut TaskRecord) {
        if let Some(status) = self.status {
            record.status = status;
        }
        if let Some(claimed) = self.claimed_count {
            record.claimed_count = claimed;
        }
        if let Some(handle) = self.external_handle {
            record.external_handle = Some(handle);
        }
        if let Some(error) = self.error {
            record.error = Some(error);
        }
    }
}
