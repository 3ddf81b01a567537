//! Ports - seams to collaborators outside the core.
//!
//! - time (`Clock`) and id generation (`IdGenerator`)
//! - the remote execution backend (`ExecutionBackend`)
//! - the per-stage user function (`StageProcessor`)

pub mod backend;
pub mod clock;
pub mod id_generator;
pub mod processor;

pub use self::backend::{BackendError, ExecutionBackend};
pub use self::clock::{Clock, ManualClock, SystemClock};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::processor::{FnProcessor, ProcessError, StageParams, StageProcessor, from_fn};
