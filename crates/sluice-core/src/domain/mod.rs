//! Domain model (ids, payload values, statuses, items, tasks, errors).

pub mod errors;
pub mod ids;
pub mod item;
pub mod status;
pub mod task;
pub mod value;

pub use self::errors::{QueueError, Result};
pub use self::ids::{ItemId, TaskId};
pub use self::item::{Lease, QueueItem};
pub use self::status::{ItemStatus, TaskStatus};
pub use self::task::{ExternalHandle, TaskRecord, TaskUpdate};
pub use self::value::{ColumnType, FieldValue, Record};
