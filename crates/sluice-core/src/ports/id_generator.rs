//! IdGenerator port - task id generation.

use crate::domain::ids::TaskId;
use crate::ports::Clock;
use ulid::Ulid;

/// Generates globally unique task ids.
///
/// ULIDs sort by creation time and need no coordination between workers.
pub trait IdGenerator: Send + Sync {
    fn generate_task_id(&self) -> TaskId;
}

/// ULID generator whose timestamp part comes from a [`Clock`].
pub struct UlidGenerator<C> {
    clock: C,
}

impl<C: Clock> UlidGenerator<C> {
    pub fn new(clock: C) -> Self {
        Self { clock }
    }
}

impl<C: Clock> IdGenerator for UlidGenerator<C> {
    fn generate_task_id(&self) -> TaskId {
        let timestamp_ms = self.clock.now().timestamp_millis().max(0) as u64;
        let ulid = Ulid::from_parts(timestamp_ms, rand::random());
        TaskId::from(ulid)
    }
}
