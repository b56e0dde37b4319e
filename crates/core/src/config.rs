mod loading;
mod types;
mod validation;


pub use loading::load_dotenv;
pub use types::{
    CacheConfig, CheckpointConfig, PipelineConfig, PoolConfig, RetryConfig, RunConfig,
    RunSection, SharedCacheConfig, SharedCacheKind, StageDescriptor, Strategy, StrategyKind,
};
