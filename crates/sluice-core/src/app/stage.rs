//! Stage - one processing step between an input and an output queue.
//!
//! A stage without an input queue is a source: it runs once and its output
//! is whatever the processor returns. A stage without an output queue is a
//! sink: every pending input item is backlog and results are discarded.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use tracing::{debug, warn};

use super::pipeline::PipelineError;
use super::status::StageStatus;
use crate::domain::{ItemId, Lease, QueueError, Record, TaskId, TaskStatus, TaskUpdate};
use crate::ledger::TaskLedger;
use crate::ports::{ExecutionBackend, StageParams, StageProcessor};
use crate::queue::{AckQueue, QueuePair};
use crate::store::Store;

pub const DEFAULT_BATCH_SIZE: usize = 32;
pub const DEFAULT_CONCURRENCY_LIMIT: usize = 8;

/// Statuses that count as a task still on its way.
const IN_FLIGHT: [TaskStatus; 3] = [TaskStatus::Created, TaskStatus::Submitted, TaskStatus::Started];

/// Where a stage's tasks run.
#[derive(Clone, Default)]
pub enum DispatchMode {
    /// In this process, concurrently, joined before the pass ends.
    #[default]
    Inline,
    /// Handed to an external backend that later calls `Pipeline::run_task`.
    Remote(Arc<dyn ExecutionBackend>),
}

impl fmt::Debug for DispatchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DispatchMode::Inline => f.write_str("Inline"),
            DispatchMode::Remote(_) => f.write_str("Remote"),
        }
    }
}

#[derive(Debug, Clone)]
enum Wiring {
    Source { output: Arc<AckQueue> },
    Sink { input: Arc<AckQueue> },
    Transform { pair: QueuePair },
}

impl Wiring {
    fn input(&self) -> Option<&Arc<AckQueue>> {
        match self {
            Wiring::Source { .. } => None,
            Wiring::Sink { input } => Some(input),
            Wiring::Transform { pair } => Some(pair.input()),
        }
    }

    fn output(&self) -> Option<&Arc<AckQueue>> {
        match self {
            Wiring::Source { output } => Some(output),
            Wiring::Sink { .. } => None,
            Wiring::Transform { pair } => Some(pair.output()),
        }
    }

    fn store(&self) -> &Store {
        match self {
            Wiring::Source { output } => output.store(),
            Wiring::Sink { input } => input.store(),
            Wiring::Transform { pair } => pair.input().store(),
        }
    }
}

/// How one task ended.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    Done { claimed: u64, produced: usize },
    /// Nothing was left to lease by the time the task ran.
    Empty,
    /// The batch stays leased and is recycled after the lease timeout.
    Failed { error: String },
}

pub struct Stage {
    name: String,
    wiring: Wiring,
    processor: Arc<dyn StageProcessor>,
    batch_size: usize,
    concurrency_limit: usize,
    random_offset: bool,
    params: StageParams,
    dispatch: DispatchMode,
    ledger: TaskLedger,
}

impl fmt::Debug for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stage")
            .field("name", &self.name)
            .field("wiring", &self.wiring)
            .field("batch_size", &self.batch_size)
            .field("concurrency_limit", &self.concurrency_limit)
            .field("dispatch", &self.dispatch)
            .finish()
    }
}

impl Stage {
    pub fn builder(name: impl Into<String>, processor: impl StageProcessor + 'static) -> StageBuilder {
        StageBuilder::new(name, Arc::new(processor))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn input(&self) -> Option<&Arc<AckQueue>> {
        self.wiring.input()
    }

    pub fn output(&self) -> Option<&Arc<AckQueue>> {
        self.wiring.output()
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn concurrency_limit(&self) -> usize {
        self.concurrency_limit
    }

    pub fn dispatch(&self) -> &DispatchMode {
        &self.dispatch
    }

    pub fn ledger(&self) -> &TaskLedger {
        &self.ledger
    }

    /// Units of work this stage has not started yet.
    pub fn backlog(&self) -> Result<u64, QueueError> {
        match &self.wiring {
            Wiring::Transform { pair } => pair.backlog(),
            Wiring::Sink { input } => input.pending_count(),
            Wiring::Source { .. } => {
                if self.ledger.count_by_status(TaskStatus::Done)? > 0 {
                    return Ok(0);
                }
                Ok(if self.in_flight(&IN_FLIGHT)? > 0 { 0 } else { 1 })
            }
        }
    }

    pub fn status(&self) -> Result<StageStatus, QueueError> {
        let mut tasks = BTreeMap::new();
        for status in TaskStatus::ALL {
            let n = self.ledger.count_by_status(status)?;
            if n > 0 {
                tasks.insert(status.as_str().to_string(), n);
            }
        }
        Ok(StageStatus {
            stage: self.name.clone(),
            backlog: self.backlog()?,
            input: self.wiring.input().map(|q| q.counts()).transpose()?,
            output: self.wiring.output().map(|q| q.counts()).transpose()?,
            tasks,
        })
    }

    /// Tasks to start for `backlog`, capped by the concurrency limit.
    pub fn required_tasks(&self, backlog: u64) -> usize {
        let batches = backlog.div_ceil(self.batch_size as u64);
        usize::try_from(batches)
            .unwrap_or(usize::MAX)
            .min(self.concurrency_limit)
    }

    /// Tasks in `statuses` updated within the lease timeout of the queue the
    /// stage leases from. Older ones are presumed lost.
    pub(crate) fn in_flight(&self, statuses: &[TaskStatus]) -> Result<u64, QueueError> {
        let window = match (self.wiring.input(), self.wiring.output()) {
            (Some(q), _) | (None, Some(q)) => q.options().lease_timeout(),
            (None, None) => return Ok(0),
        };
        statuses
            .iter()
            .map(|status| self.ledger.count_recent(*status, window))
            .sum()
    }

    /// Open a ledger entry for a task about to be dispatched: `created`,
    /// then `submitted`.
    pub(crate) fn open_task(&self) -> Result<TaskId, QueueError> {
        let task = self.ledger.create(TaskStatus::Created)?;
        self.ledger
            .update(task.task_id, TaskUpdate::status(TaskStatus::Submitted))
            .map(|t| t.task_id)
    }

    fn fetch(&self) -> Result<Lease, QueueError> {
        match &self.wiring {
            Wiring::Transform { pair } => pair.fetch_with(self.batch_size, self.random_offset),
            Wiring::Sink { input } => input.lease(self.batch_size, self.random_offset),
            Wiring::Source { .. } => Ok(Lease::default()),
        }
    }

    /// Write results, then ack the inputs they came from.
    fn settle(&self, ids: &[ItemId], outputs: &[Record]) -> Result<(), QueueError> {
        match self.wiring.output() {
            Some(output) => {
                output.put(outputs)?;
            }
            None if !outputs.is_empty() => {
                debug!(stage = %self.name, discarded = outputs.len(), "sink discarded results");
            }
            None => {}
        }
        if let Some(input) = self.wiring.input()
            && !ids.is_empty()
        {
            input.ack(ids)?;
        }
        Ok(())
    }

    /// Run one task: lease a batch, process it, store results, ack inputs.
    ///
    /// Processor errors and rejected results fail the task and leave the
    /// batch leased. Store failures are returned.
    pub(crate) async fn execute(self: Arc<Self>, task_id: TaskId) -> Result<TaskOutcome, PipelineError> {
        let stage = Arc::clone(&self);
        blocking(move || stage.ledger.update(task_id, TaskUpdate::status(TaskStatus::Started))).await??;

        let lease = if self.wiring.input().is_some() {
            let stage = Arc::clone(&self);
            let lease = blocking(move || stage.fetch()).await??;
            if lease.is_empty() {
                self.finish(task_id, TaskUpdate::status(TaskStatus::Done).with_claimed(0))
                    .await?;
                debug!(stage = %self.name, task_id = %task_id, "nothing to lease");
                return Ok(TaskOutcome::Empty);
            }
            lease
        } else {
            Lease::default()
        };

        let claimed = lease.len() as u64;
        let Lease { ids, payloads } = lease;
        let outputs = match self.processor.process(payloads, &self.params).await {
            Ok(outputs) => outputs,
            Err(e) => return self.fail(task_id, claimed, e.to_string()).await,
        };

        let produced = outputs.len();
        let stage = Arc::clone(&self);
        match blocking(move || stage.settle(&ids, &outputs)).await? {
            Ok(()) => {}
            Err(e) if !e.is_store_failure() => return self.fail(task_id, claimed, e.to_string()).await,
            Err(e) => return Err(e.into()),
        }

        self.finish(task_id, TaskUpdate::status(TaskStatus::Done).with_claimed(claimed))
            .await?;
        debug!(stage = %self.name, task_id = %task_id, claimed, produced, "task done");
        Ok(TaskOutcome::Done { claimed, produced })
    }

    async fn fail(&self, task_id: TaskId, claimed: u64, error: String) -> Result<TaskOutcome, PipelineError> {
        warn!(stage = %self.name, task_id = %task_id, claimed, %error, "task failed");
        self.finish(
            task_id,
            TaskUpdate::status(TaskStatus::Failed)
                .with_claimed(claimed)
                .with_error(error.clone()),
        )
        .await?;
        Ok(TaskOutcome::Failed { error })
    }

    async fn finish(&self, task_id: TaskId, update: TaskUpdate) -> Result<(), PipelineError> {
        let ledger = self.ledger.clone();
        blocking(move || ledger.update(task_id, update)).await??;
        Ok(())
    }
}

/// Run a synchronous store call off the async runtime.
pub(crate) async fn blocking<T, F>(f: F) -> Result<Result<T, QueueError>, PipelineError>
where
    F: FnOnce() -> Result<T, QueueError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| PipelineError::Join(e.to_string()))
}

pub struct StageBuilder {
    name: String,
    processor: Arc<dyn StageProcessor>,
    input: Option<Arc<AckQueue>>,
    output: Option<Arc<AckQueue>>,
    input_key: String,
    output_key: String,
    batch_size: usize,
    concurrency_limit: usize,
    random_offset: bool,
    params: StageParams,
    dispatch: DispatchMode,
}

impl StageBuilder {
    pub fn new(name: impl Into<String>, processor: Arc<dyn StageProcessor>) -> Self {
        Self {
            name: name.into(),
            processor,
            input: None,
            output: None,
            input_key: "_id".to_string(),
            output_key: "_id".to_string(),
            batch_size: DEFAULT_BATCH_SIZE,
            concurrency_limit: DEFAULT_CONCURRENCY_LIMIT,
            random_offset: false,
            params: StageParams::new(),
            dispatch: DispatchMode::Inline,
        }
    }

    pub fn input(mut self, queue: Arc<AckQueue>) -> Self {
        self.input = Some(queue);
        self
    }

    pub fn output(mut self, queue: Arc<AckQueue>) -> Self {
        self.output = Some(queue);
        self
    }

    /// Column that links an input item to its output. Defaults to `_id`.
    pub fn join_key(self, key: impl Into<String>) -> Self {
        let key = key.into();
        self.join_keys(key.clone(), key)
    }

    pub fn join_keys(mut self, input_key: impl Into<String>, output_key: impl Into<String>) -> Self {
        self.input_key = input_key.into();
        self.output_key = output_key.into();
        self
    }

    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn concurrency_limit(mut self, limit: usize) -> Self {
        self.concurrency_limit = limit;
        self
    }

    pub fn random_offset(mut self, random_offset: bool) -> Self {
        self.random_offset = random_offset;
        self
    }

    pub fn params(mut self, params: StageParams) -> Self {
        self.params = params;
        self
    }

    pub fn param(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    pub fn dispatch(mut self, dispatch: DispatchMode) -> Self {
        self.dispatch = dispatch;
        self
    }

    pub fn build(self) -> Result<Stage, PipelineError> {
        if self.batch_size == 0 {
            return Err(PipelineError::InvalidStage {
                stage: self.name,
                reason: "batch_size must be positive".to_string(),
            });
        }
        if self.concurrency_limit == 0 {
            return Err(PipelineError::InvalidStage {
                stage: self.name,
                reason: "concurrency_limit must be positive".to_string(),
            });
        }

        let wiring = match (self.input, self.output) {
            (Some(input), Some(output)) => Wiring::Transform {
                pair: QueuePair::with_keys(input, output, &self.input_key, &self.output_key)?,
            },
            (Some(input), None) => Wiring::Sink { input },
            (None, Some(output)) => Wiring::Source { output },
            (None, None) => {
                return Err(PipelineError::InvalidStage {
                    stage: self.name,
                    reason: "a stage needs an input or an output queue".to_string(),
                });
            }
        };
        let ledger = wiring.store().ledger(&self.name)?;

        Ok(Stage {
            name: self.name,
            wiring,
            processor: self.processor,
            batch_size: self.batch_size,
            concurrency_limit: self.concurrency_limit,
            random_offset: self.random_offset,
            params: self.params,
            dispatch: self.dispatch,
            ledger,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{FieldValue, ItemStatus};
    use crate::ports::{ProcessError, from_fn};
    use crate::queue::QueueOptions;

    fn opts() -> QueueOptions {
        QueueOptions::default().with_sweep_probability(0.0)
    }

    fn passthrough() -> impl StageProcessor {
        from_fn(|batch, _| Ok(batch))
    }

    fn transform(store: &Store, processor: impl StageProcessor + 'static) -> Arc<Stage> {
        let inq = store.queue("inq", opts()).unwrap();
        let outq = store.queue("outq", opts()).unwrap();
        Arc::new(
            Stage::builder("transform", processor)
                .input(inq)
                .output(outq)
                .join_key("idx")
                .batch_size(4)
                .build()
                .unwrap(),
        )
    }

    fn seed(stage: &Stage, n: i64) {
        let records: Vec<Record> = (0..n).map(|i| Record::new().with("idx", i)).collect();
        stage.input().unwrap().put(&records).unwrap();
    }

    #[test]
    fn required_tasks_rounds_up_and_caps() {
        let store = Store::in_memory().unwrap();
        let stage = Stage::builder("s", passthrough())
            .output(store.queue("out", opts()).unwrap())
            .batch_size(10)
            .concurrency_limit(3)
            .build()
            .unwrap();
        assert_eq!(stage.required_tasks(0), 0);
        assert_eq!(stage.required_tasks(1), 1);
        assert_eq!(stage.required_tasks(21), 3);
        assert_eq!(stage.required_tasks(1_000), 3);
    }

    #[test]
    fn build_rejects_bad_settings() {
        let store = Store::in_memory().unwrap();
        let out = store.queue("out", opts()).unwrap();

        let err = Stage::builder("s", passthrough()).build().unwrap_err();
        assert!(matches!(err, PipelineError::InvalidStage { .. }));

        let err = Stage::builder("s", passthrough())
            .output(out.clone())
            .batch_size(0)
            .build()
            .unwrap_err();
        assert!(matches!(err, PipelineError::InvalidStage { .. }));

        let err = Stage::builder("bad name", passthrough()).output(out).build().unwrap_err();
        assert!(matches!(err, PipelineError::Queue(QueueError::InvalidName(_))));
    }

    #[test]
    fn source_backlog_drops_once_a_task_is_done() {
        let store = Store::in_memory().unwrap();
        let stage = Stage::builder("source", passthrough())
            .output(store.queue("out", opts()).unwrap())
            .build()
            .unwrap();
        assert_eq!(stage.backlog().unwrap(), 1);

        let task = stage.ledger().create(TaskStatus::Created).unwrap();
        assert_eq!(stage.backlog().unwrap(), 0);

        stage
            .ledger()
            .update(task.task_id, TaskUpdate::status(TaskStatus::Failed))
            .unwrap();
        assert_eq!(stage.backlog().unwrap(), 1);

        let task = stage.ledger().create(TaskStatus::Started).unwrap();
        stage
            .ledger()
            .update(task.task_id, TaskUpdate::status(TaskStatus::Done))
            .unwrap();
        assert_eq!(stage.backlog().unwrap(), 0);
    }

    #[test]
    fn open_task_marks_the_task_submitted() {
        let store = Store::in_memory().unwrap();
        let stage = transform(&store, passthrough());

        let task_id = stage.open_task().unwrap();
        let record = stage.ledger().get(task_id).unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Submitted);
        assert_eq!(record.task_index, 0);
        assert_eq!(stage.ledger().count_by_status(TaskStatus::Created).unwrap(), 0);
        assert_eq!(stage.in_flight(&[TaskStatus::Submitted]).unwrap(), 1);
    }

    #[test]
    fn sink_backlog_is_pending_input() {
        let store = Store::in_memory().unwrap();
        let input = store.queue("in", opts()).unwrap();
        input.put(&[Record::new().with("a", 1), Record::new().with("a", 2)]).unwrap();
        let stage = Stage::builder("sink", passthrough())
            .input(input)
            .build()
            .unwrap();
        assert_eq!(stage.backlog().unwrap(), 2);
    }

    #[tokio::test]
    async fn execute_moves_a_batch_to_the_output() {
        let store = Store::in_memory().unwrap();
        let stage = transform(
            &store,
            from_fn(|batch, _| {
                Ok(batch
                    .into_iter()
                    .map(|r| {
                        let idx = r.get("idx").and_then(FieldValue::as_i64).unwrap_or(0);
                        r.with("out", idx + 50)
                    })
                    .collect())
            }),
        );
        seed(&stage, 6);

        let task = stage.ledger().create(TaskStatus::Created).unwrap();
        let outcome = Arc::clone(&stage).execute(task.task_id).await.unwrap();
        assert_eq!(outcome, TaskOutcome::Done { claimed: 4, produced: 4 });

        let record = stage.ledger().get(task.task_id).unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Done);
        assert_eq!(record.claimed_count, 4);
        assert_eq!(stage.backlog().unwrap(), 2);
        assert_eq!(stage.input().unwrap().done_count().unwrap(), 4);

        let out = stage.output().unwrap().peek(10).unwrap();
        assert_eq!(out[0].payload.get("out").and_then(FieldValue::as_i64), Some(50));
    }

    #[tokio::test]
    async fn processor_error_fails_task_and_keeps_batch_leased() {
        let store = Store::in_memory().unwrap();
        let stage = transform(&store, from_fn(|_, _| Err(ProcessError::new("boom"))));
        seed(&stage, 3);

        let task = stage.ledger().create(TaskStatus::Created).unwrap();
        let outcome = Arc::clone(&stage).execute(task.task_id).await.unwrap();
        assert_eq!(outcome, TaskOutcome::Failed { error: "boom".into() });

        let record = stage.ledger().get(task.task_id).unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Failed);
        assert_eq!(record.error.as_deref(), Some("boom"));
        assert_eq!(stage.input().unwrap().leased_count().unwrap(), 3);
        assert_eq!(stage.output().unwrap().exact_count().unwrap(), 0);
    }

    #[tokio::test]
    async fn rejected_results_fail_the_task() {
        let store = Store::in_memory().unwrap();
        let stage = transform(&store, from_fn(|_, _| Ok(vec![Record::new()])));
        seed(&stage, 1);

        let task = stage.ledger().create(TaskStatus::Created).unwrap();
        let outcome = Arc::clone(&stage).execute(task.task_id).await.unwrap();
        assert!(matches!(outcome, TaskOutcome::Failed { .. }));

        let item = &stage.input().unwrap().peek(1).unwrap()[0];
        assert_eq!(item.status, ItemStatus::Leased);
    }

    #[tokio::test]
    async fn empty_input_finishes_with_nothing_claimed() {
        let store = Store::in_memory().unwrap();
        let stage = transform(&store, passthrough());

        let task = stage.ledger().create(TaskStatus::Created).unwrap();
        let outcome = Arc::clone(&stage).execute(task.task_id).await.unwrap();
        assert_eq!(outcome, TaskOutcome::Empty);
        assert_eq!(
            stage.ledger().get(task.task_id).unwrap().unwrap().status,
            TaskStatus::Done
        );
    }

    #[tokio::test]
    async fn params_reach_the_processor() {
        let store = Store::in_memory().unwrap();
        let stage = Arc::new(
            Stage::builder(
                "source",
                from_fn(|_, params| {
                    let n = params.get("n").and_then(|v| v.as_i64()).unwrap_or(0);
                    Ok((0..n).map(|i| Record::new().with("idx", i)).collect())
                }),
            )
            .output(store.queue("out", opts()).unwrap())
            .param("n", 3)
            .build()
            .unwrap(),
        );

        let task = stage.ledger().create(TaskStatus::Created).unwrap();
        let outcome = Arc::clone(&stage).execute(task.task_id).await.unwrap();
        assert_eq!(outcome, TaskOutcome::Done { claimed: 0, produced: 3 });
        assert_eq!(stage.output().unwrap().exact_count().unwrap(), 3);
    }

    #[test]
    fn status_reports_queues_and_tasks() {
        let store = Store::in_memory().unwrap();
        let stage = transform(&store, passthrough());
        seed(&stage, 5);
        stage.ledger().create(TaskStatus::Created).unwrap();

        let status = stage.status().unwrap();
        assert_eq!(status.backlog, 5);
        assert_eq!(status.input.unwrap().pending, 5);
        assert_eq!(status.output.unwrap().total(), 0);
        assert_eq!(status.tasks_in(TaskStatus::Created), 1);
    }

    #[tokio::test]
    async fn unknown_task_is_an_error() {
        let store = Store::in_memory().unwrap();
        let stage = transform(&store, passthrough());
        let missing = TaskId::from(ulid::Ulid::new());
        let err = Arc::clone(&stage).execute(missing).await.unwrap_err();
        assert!(matches!(err, PipelineError::Queue(QueueError::UnknownTask(_))));
    }
}
