//! Demo pipeline: a source that emits numbered records and a transform that
//! adds an offset to each.

use async_trait::async_trait;
use sluice_core::{
    FieldValue, Pipeline, PipelineError, ProcessError, Record, SluiceConfig, Stage, StageParams,
    StageProcessor, StageStatus, Store, from_fn,
};
use tracing::info;

pub const INPUT_QUEUE: &str = "demo_in";
pub const OUTPUT_QUEUE: &str = "demo_out";

/// Copies `idx` into `out`, shifted by the `offset` param.
struct AddOffset;

#[async_trait]
impl StageProcessor for AddOffset {
    async fn process(
        &self,
        batch: Vec<Record>,
        params: &StageParams,
    ) -> Result<Vec<Record>, ProcessError> {
        let offset = params.get("offset").and_then(|v| v.as_i64()).unwrap_or(0);
        batch
            .into_iter()
            .map(|record| {
                let idx = record
                    .get("idx")
                    .and_then(FieldValue::as_i64)
                    .ok_or_else(|| ProcessError::new("record has no integer `idx`"))?;
                Ok(record.with("out", idx + offset))
            })
            .collect()
    }
}

pub async fn run(
    config: &SluiceConfig,
    store: &Store,
    records: i64,
    batch_size: usize,
) -> Result<Vec<StageStatus>, PipelineError> {
    let inq = store.queue(INPUT_QUEUE, config.queue.clone())?;
    let outq = store.queue(OUTPUT_QUEUE, config.queue.clone())?;

    let source = Stage::builder(
        "demo_load",
        from_fn(move |_, _| Ok((0..records).map(|i| Record::new().with("idx", i)).collect())),
    )
    .output(inq.clone())
    .build()?;

    let transform = Stage::builder("demo_transform", AddOffset)
        .input(inq)
        .output(outq)
        .join_key("idx")
        .batch_size(batch_size)
        .param("offset", 50)
        .build()?;

    let pipeline = Pipeline::builder()
        .stage(source)?
        .stage(transform)?
        .limits(config.pipeline.limits())
        .build();

    let passes = pipeline.run_until_complete().await?;
    info!(passes, "demo pipeline finished");
    pipeline.status().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use sluice_core::{QueueOptions, TaskStatus};

    #[tokio::test]
    async fn demo_runs_to_completion() {
        let store = Store::in_memory().unwrap();
        let config = SluiceConfig {
            queue: QueueOptions::default().with_sweep_probability(0.0),
            ..SluiceConfig::default()
        };

        let status = run(&config, &store, 12, 5).await.unwrap();
        assert_eq!(status.len(), 2);
        assert!(status.iter().all(|s| s.backlog == 0));
        assert_eq!(status[1].output.unwrap().pending, 12);
        assert_eq!(status[1].tasks_in(TaskStatus::Done), 3);
    }

    #[tokio::test]
    async fn offset_comes_from_params() {
        let mut params = StageParams::new();
        params.insert("offset".into(), 7.into());
        let out = AddOffset
            .process(vec![Record::new().with("idx", 1)], &params)
            .await
            .unwrap();
        assert_eq!(out[0].get("out").and_then(FieldValue::as_i64), Some(8));
    }
}
