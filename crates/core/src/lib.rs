pub mod config;
pub mod dataset;
pub mod error;
pub mod task;

pub use config::{
    load_dotenv, CacheConfig, CheckpointConfig, PipelineConfig, PoolConfig, RetryConfig,
    RunConfig, RunSection, SharedCacheConfig, SharedCacheKind, StageDescriptor, Strategy,
    StrategyKind,
};
pub use dataset::{load_json_dataset, tasks_from_entries};
pub use error::*;
pub use task::*;
