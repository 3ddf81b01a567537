//! ExecutionBackend port - remote task execution.
//!
//! The pipeline hands a task id to the backend and stores the returned handle
//! on the task record. The backend is expected to eventually call
//! [`Pipeline::run_task`](crate::app::Pipeline::run_task) with that id; the
//! core never polls it.

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::{ExternalHandle, TaskId};

#[derive(Debug, Error)]
#[error("backend submit failed: {0}")]
pub struct BackendError(pub String);

#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    /// Fire-and-forget submission of one task.
    async fn submit(&self, stage: &str, task_id: TaskId) -> Result<ExternalHandle, BackendError>;
}
