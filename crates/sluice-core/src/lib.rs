//! sluice-core
//!
//! Durable ack queues on `SQLite` and a backlog-driven pipeline on top.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, value, status, item, task, errors）
//! - **ports**: 抽象化レイヤー（Clock, IdGenerator, ExecutionBackend, StageProcessor）
//! - **store**: 共有 `SQLite` 接続
//! - **queue**: AckQueue、schema registry、QueuePair（anti-join view）
//! - **ledger**: stage ごとの task ledger
//! - **app**: Stage と Pipeline（run loop）
//! - **config**: TOML 設定

pub mod app;
pub mod config;
pub mod domain;
pub mod ledger;
pub mod ports;
pub mod queue;
pub mod store;

pub use app::{
    DispatchMode, Pipeline, PipelineBuilder, PipelineError, QueueCounts, RunLimits, RunReport,
    Stage, StageBuilder, StageStatus, TaskOutcome,
};
pub use config::{ConfigError, SluiceConfig};
pub use domain::{
    ColumnType, ExternalHandle, FieldValue, ItemId, ItemStatus, Lease, QueueError, QueueItem,
    Record, TaskId, TaskRecord, TaskStatus, TaskUpdate,
};
pub use ledger::TaskLedger;
pub use ports::{
    BackendError, Clock, ExecutionBackend, ManualClock, ProcessError, StageParams,
    StageProcessor, SystemClock, from_fn,
};
pub use queue::{AckQueue, QueueOptions, QueuePair};
pub use store::{Store, StoreOptions};
