//! Item and task status.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Status of a queue item.
///
/// State transitions:
/// - Pending -> Leased -> Acked
/// - Pending -> Leased -> Failed
/// - Leased -> Pending (lease timeout, performed by the sweep)
///
/// Stored as an integer code. The codes are ordered so that
/// `status < Leased` means "eligible for leasing" and `status > Leased`
/// means "terminal".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Pending,
    Leased,
    Acked,
    Failed,
}

impl ItemStatus {
    pub fn code(self) -> i64 {
        match self {
            ItemStatus::Pending => 1,
            ItemStatus::Leased => 2,
            ItemStatus::Acked => 5,
            ItemStatus::Failed => 9,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            1 => Some(ItemStatus::Pending),
            2 => Some(ItemStatus::Leased),
            5 => Some(ItemStatus::Acked),
            9 => Some(ItemStatus::Failed),
            _ => None,
        }
    }

    /// Is this item eligible for lease?
    pub fn is_pending(self) -> bool {
        self.code() < ItemStatus::Leased.code()
    }

    /// Is this a terminal state (no further transitions)?
    pub fn is_terminal(self) -> bool {
        self.code() > ItemStatus::Leased.code()
    }
}

/// Lifecycle of a task in the ledger.
///
/// Created -> Submitted -> Started -> Done | Failed. Remote dispatch leaves a
/// task at Submitted until the backend runs it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Created,
    Submitted,
    Started,
    Done,
    Failed,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 5] = [
        TaskStatus::Created,
        TaskStatus::Submitted,
        TaskStatus::Started,
        TaskStatus::Done,
        TaskStatus::Failed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Created => "created",
            TaskStatus::Submitted => "submitted",
            TaskStatus::Started => "started",
            TaskStatus::Done => "done",
            TaskStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Done | TaskStatus::Failed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("unknown task status `{s}`"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::pending(ItemStatus::Pending, true, false)]
    #[case::leased(ItemStatus::Leased, false, false)]
    #[case::acked(ItemStatus::Acked, false, true)]
    #[case::failed(ItemStatus::Failed, false, true)]
    fn item_status_predicates(
        #[case] status: ItemStatus,
        #[case] pending: bool,
        #[case] terminal: bool,
    ) {
        assert_eq!(status.is_pending(), pending);
        assert_eq!(status.is_terminal(), terminal);
        assert_eq!(ItemStatus::from_code(status.code()), Some(status));
    }

    #[test]
    fn unknown_item_code_is_rejected() {
        assert_eq!(ItemStatus::from_code(3), None);
    }

    #[test]
    fn task_status_parses_its_own_names() {
        for status in TaskStatus::ALL {
            assert_eq!(status.as_str().parse::<TaskStatus>(), Ok(status));
        }
        assert!("running".parse::<TaskStatus>().is_err());
    }
}
