//! App - queue と ledger を組み合わせた pipeline 層
//!
//! # 主要コンポーネント
//! - **Stage**: 入力 queue、出力 queue、processor の組
//! - **Pipeline**: stage を backlog がなくなるまで回す polling loop
//! - **Status**: queue / stage の snapshot

pub mod pipeline;
pub mod stage;
pub mod status;

pub use self::pipeline::{Pipeline, PipelineBuilder, PipelineError, RunLimits, RunReport, StagePass};
pub use self::stage::{DispatchMode, Stage, StageBuilder, TaskOutcome};
pub use self::status::{QueueCounts, StageStatus};
