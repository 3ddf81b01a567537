//! Pipeline - named stages driven to a fixpoint by a polling loop.
//!
//! One pass computes every stage's backlog, opens ledger entries for the
//! tasks needed to drain it, and runs them inline or hands them to a backend.
//! Completion is checked only after a pass has finished, so output produced
//! during the pass cannot be mistaken for "nothing left to do".

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use super::stage::{DispatchMode, Stage, TaskOutcome, blocking};
use super::status::StageStatus;
use crate::domain::{QueueError, TaskId, TaskStatus, TaskUpdate};
use crate::ports::{BackendError, ExecutionBackend};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error("duplicate stage `{0}`")]
    DuplicateStage(String),

    #[error("unknown stage `{0}`")]
    UnknownStage(String),

    #[error("invalid stage `{stage}`: {reason}")]
    InvalidStage { stage: String, reason: String },

    #[error(transparent)]
    Backend(#[from] BackendError),

    /// The pass or time limit ran out before every backlog reached zero.
    #[error("pipeline incomplete after {passes} passes")]
    Incomplete { passes: u64 },

    #[error("task join failed: {0}")]
    Join(String),
}

/// Bounds for [`Pipeline::run_until_complete`].
#[derive(Debug, Clone, PartialEq)]
pub struct RunLimits {
    /// Pause after a pass that dispatched nothing.
    pub poll_interval: Duration,
    pub max_passes: Option<u64>,
    pub deadline: Option<Duration>,
}

impl Default for RunLimits {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            max_passes: None,
            deadline: None,
        }
    }
}

/// What one pass did for one stage.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StagePass {
    pub stage: String,
    pub backlog: u64,
    pub dispatched: usize,
    pub done: usize,
    pub empty: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunReport {
    pub stages: Vec<StagePass>,
}

impl RunReport {
    pub fn dispatched(&self) -> usize {
        self.stages.iter().map(|s| s.dispatched).sum()
    }

    pub fn failed(&self) -> usize {
        self.stages.iter().map(|s| s.failed).sum()
    }

    pub fn backlog(&self) -> u64 {
        self.stages.iter().map(|s| s.backlog).sum()
    }
}

#[derive(Default)]
pub struct PipelineBuilder {
    stages: Vec<Arc<Stage>>,
    limits: RunLimits,
}

impl PipelineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a stage. Stages run in registration order within a pass.
    pub fn stage(mut self, stage: Stage) -> Result<Self, PipelineError> {
        if self.stages.iter().any(|s| s.name() == stage.name()) {
            return Err(PipelineError::DuplicateStage(stage.name().to_string()));
        }
        self.stages.push(Arc::new(stage));
        Ok(self)
    }

    pub fn limits(mut self, limits: RunLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.limits.poll_interval = interval;
        self
    }

    pub fn max_passes(mut self, max_passes: u64) -> Self {
        self.limits.max_passes = Some(max_passes);
        self
    }

    pub fn deadline(mut self, deadline: Duration) -> Self {
        self.limits.deadline = Some(deadline);
        self
    }

    pub fn build(self) -> Pipeline {
        Pipeline {
            stages: self.stages,
            limits: self.limits,
        }
    }
}

pub struct Pipeline {
    stages: Vec<Arc<Stage>>,
    limits: RunLimits,
}

impl Pipeline {
    pub fn builder() -> PipelineBuilder {
        PipelineBuilder::new()
    }

    pub fn stage(&self, name: &str) -> Option<&Arc<Stage>> {
        self.stages.iter().find(|s| s.name() == name)
    }

    pub fn stages(&self) -> impl Iterator<Item = &Arc<Stage>> {
        self.stages.iter()
    }

    pub fn limits(&self) -> &RunLimits {
        &self.limits
    }

    /// One pass over every stage.
    ///
    /// Inline tasks run concurrently and are all joined before this returns;
    /// the first error is reported after the rest have finished.
    pub async fn run_once(&self) -> Result<RunReport, PipelineError> {
        let mut report = RunReport::default();
        let mut inline = JoinSet::new();

        for (index, stage) in self.stages.iter().enumerate() {
            let s = Arc::clone(stage);
            let backlog = blocking(move || s.backlog()).await??;
            let mut required = stage.required_tasks(backlog);

            if let DispatchMode::Remote(backend) = stage.dispatch() {
                if required > 0 {
                    let s = Arc::clone(stage);
                    let in_flight = blocking(move || s.in_flight(&[TaskStatus::Submitted])).await??;
                    required = required.saturating_sub(usize::try_from(in_flight).unwrap_or(usize::MAX));
                }
                for _ in 0..required {
                    self.submit(stage, backend).await?;
                }
            } else {
                for _ in 0..required {
                    let s = Arc::clone(stage);
                    let task_id = blocking(move || s.open_task()).await??;
                    let s = Arc::clone(stage);
                    inline.spawn(async move { (index, s.execute(task_id).await) });
                }
            }

            if required > 0 {
                debug!(stage = stage.name(), backlog, tasks = required, "dispatched tasks");
            }
            report.stages.push(StagePass {
                stage: stage.name().to_string(),
                backlog,
                dispatched: required,
                ..StagePass::default()
            });
        }

        let mut first_error = None;
        while let Some(joined) = inline.join_next().await {
            let result = match joined {
                Ok((index, outcome)) => outcome.map(|o| (index, o)),
                Err(e) => Err(PipelineError::Join(e.to_string())),
            };
            match result {
                Ok((index, outcome)) => {
                    let pass = &mut report.stages[index];
                    match outcome {
                        TaskOutcome::Done { .. } => pass.done += 1,
                        TaskOutcome::Empty => pass.empty += 1,
                        TaskOutcome::Failed { .. } => pass.failed += 1,
                    }
                }
                Err(e) => {
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(report),
        }
    }

    /// Open a task and hand it to the backend.
    ///
    /// The task is `submitted` before the backend sees it, so a backend that
    /// runs it right away cannot have its `started` overwritten.
    async fn submit(&self, stage: &Arc<Stage>, backend: &Arc<dyn ExecutionBackend>) -> Result<TaskId, PipelineError> {
        let s = Arc::clone(stage);
        let task_id = blocking(move || s.open_task()).await??;

        match backend.submit(stage.name(), task_id).await {
            Ok(handle) => {
                debug!(stage = stage.name(), task_id = %task_id, handle = %handle, "task submitted");
                let s = Arc::clone(stage);
                blocking(move || s.ledger().update(task_id, TaskUpdate::default().with_handle(handle))).await??;
                Ok(task_id)
            }
            Err(e) => {
                warn!(stage = stage.name(), task_id = %task_id, error = %e, "submit failed");
                let s = Arc::clone(stage);
                let message = e.to_string();
                blocking(move || {
                    s.ledger()
                        .update(task_id, TaskUpdate::status(TaskStatus::Failed).with_error(message))
                })
                .await??;
                Err(e.into())
            }
        }
    }

    /// Run a previously submitted task. This is the entry point for remote
    /// workers.
    pub async fn run_task(&self, stage: &str, task_id: TaskId) -> Result<TaskOutcome, PipelineError> {
        let stage = self
            .stage(stage)
            .ok_or_else(|| PipelineError::UnknownStage(stage.to_string()))?;
        Arc::clone(stage).execute(task_id).await
    }

    /// Whether every stage reports zero backlog.
    pub async fn is_complete(&self) -> Result<bool, PipelineError> {
        for stage in &self.stages {
            let s = Arc::clone(stage);
            if blocking(move || s.backlog()).await?? > 0 {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Run passes until every backlog is zero. Returns the number of passes.
    pub async fn run_until_complete(&self) -> Result<u64, PipelineError> {
        let started = tokio::time::Instant::now();
        let mut passes = 0;

        while !self.is_complete().await? {
            if self.limits.max_passes.is_some_and(|max| passes >= max)
                || self.limits.deadline.is_some_and(|d| started.elapsed() >= d)
            {
                warn!(passes, "pipeline stopped before completion");
                return Err(PipelineError::Incomplete { passes });
            }

            let report = self.run_once().await?;
            passes += 1;
            info!(
                pass = passes,
                backlog = report.backlog(),
                dispatched = report.dispatched(),
                failed = report.failed(),
                "pipeline pass"
            );
            if report.dispatched() == 0 {
                tokio::time::sleep(self.limits.poll_interval).await;
            }
        }

        info!(passes, "pipeline complete");
        Ok(passes)
    }

    pub async fn status(&self) -> Result<Vec<StageStatus>, PipelineError> {
        let mut out = Vec::with_capacity(self.stages.len());
        for stage in &self.stages {
            let s = Arc::clone(stage);
            out.push(blocking(move || s.status()).await??);
        }
        Ok(out)
    }
}
