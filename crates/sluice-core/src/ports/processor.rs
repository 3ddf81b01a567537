//! StageProcessor port - the user function a stage runs on each batch.

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::Record;

/// Extra keyword arguments forwarded to a stage's processor.
pub type StageParams = serde_json::Map<String, serde_json::Value>;

/// Error raised by a processor. It fails the task; the leased batch is left
/// unacked and comes back after the lease timeout.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct ProcessError {
    message: String,
}

impl ProcessError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<String> for ProcessError {
    fn from(message: String) -> Self {
        Self { message }
    }
}

impl From<&str> for ProcessError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

/// Processing capability of a stage.
///
/// Source stages receive an empty batch; sink stages return an empty vec.
/// Implementations must tolerate re-delivery of a batch (at-least-once).
#[async_trait]
pub trait StageProcessor: Send + Sync {
    async fn process(
        &self,
        batch: Vec<Record>,
        params: &StageParams,
    ) -> Result<Vec<Record>, ProcessError>;
}

/// Adapter for plain synchronous closures.
pub struct FnProcessor<F>(F);

pub fn from_fn<F>(f: F) -> FnProcessor<F>
where
    F: Fn(Vec<Record>, &StageParams) -> Result<Vec<Record>, ProcessError> + Send + Sync,
{
    FnProcessor(f)
}

#[async_trait]
impl<F> StageProcessor for FnProcessor<F>
where
    F: Fn(Vec<Record>, &StageParams) -> Result<Vec<Record>, ProcessError> + Send + Sync,
{
    async fn process(
        &self,
        batch: Vec<Record>,
        params: &StageParams,
    ) -> Result<Vec<Record>, ProcessError> {
        (self.0)(batch, params)
    }
}
