//! Status views - queue と stage の状態を説明するための読み取り専用 snapshot

use std::collections::BTreeMap;

use serde::Serialize;

use crate::domain::TaskStatus;

/// Records of one queue by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueCounts {
    pub pending: u64,
    pub leased: u64,
    pub acked: u64,
    pub failed: u64,
}

impl QueueCounts {
    pub fn total(&self) -> u64 {
        self.pending + self.leased + self.acked + self.failed
    }
}

/// Snapshot of one stage.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageStatus {
    pub stage: String,
    pub backlog: u64,
    pub input: Option<QueueCounts>,
    pub output: Option<QueueCounts>,
    /// Ledger entries by task status; statuses without tasks are omitted.
    pub tasks: BTreeMap<String, u64>,
}

impl StageStatus {
    pub fn tasks_in(&self, status: TaskStatus) -> u64 {
        self.tasks.get(status.as_str()).copied().unwrap_or(0)
    }
}
