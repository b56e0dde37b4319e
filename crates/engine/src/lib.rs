//! Task orchestration engine: runs every task of a dataset through an
//! ordered pipeline of stages, sharing bounded resource pools, a two-level
//! result cache and per-task checkpoints across four scheduling strategies.
//!
//! Build an [`Engine`] from a [`RunConfig`](sqlflow_core::RunConfig), register
//! stages and resource factories on the builder, then call [`Engine::run`].

pub mod cache;
pub mod checkpoint;
pub mod collector;
pub mod engine;
pub mod error;
pub mod pool;
pub mod progress;
pub mod scheduler;
pub mod stage;
pub mod stats;
pub mod worker;

pub use sqlflow_core;

pub use cache::{DirectoryCache, MultiLevelCache, SharedCache};
pub use checkpoint::{CheckpointRecord, CheckpointStore, FileCheckpointStore, MemoryCheckpointStore};
pub use collector::{CollectedResults, JsonlSink, MemorySink, ResultSink, ResultsCollector, ResultsSummary};
pub use engine::{Engine, EngineBuilder};
pub use error::*;
pub use pool::{PoolStats, Resource, ResourceFactory, ResourcePool, ResourcePools};
pub use progress::{LogProgress, ProgressReporter, ProgressSink};
pub use scheduler::{CancelSignal, RunSummary, Scheduler, StageObserver, TaskExecutor};
pub use stage::{NoConfig, Stage, StageContext, StageError, StageEvent, StageRegistry};
pub use stats::{RunStatistics, StatsAggregator};
