use std::time::Duration;

use sqlflow_core::ConfigError;
use thiserror::Error;

/// Errors from a [`ResourcePool`](crate::pool::ResourcePool).
#[derive(Error, Debug)]
pub enum PoolError {
    #[error("pool '{pool}' had no free resource within {waited:?}")]
    Timeout { pool: String, waited: Duration },

    #[error("pool '{pool}' failed to create a resource: {message}")]
    Create { pool: String, message: String },

    #[error("pool '{0}' is closed")]
    Closed(String),

    #[error("unknown pool '{0}'")]
    UnknownPool(String),

    #[error("pool '{0}' is configured but no resource factory was registered")]
    MissingFactory(String),
}

/// Errors from a cache level. The multi-level cache never surfaces these to
/// callers; they are logged and counted.
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("cache I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("cache entry JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("cache backend error: {0}")]
    Backend(String),
}

#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("checkpoint I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("checkpoint JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors writing results to a [`ResultSink`](crate::collector::ResultSink).
#[derive(Error, Debug)]
pub enum SinkError {
    #[error("sink I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("sink JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Error, Debug)]
pub enum CollectorError {
    #[error("task index {index} is outside the dataset (size {size})")]
    IndexOutOfRange { index: usize, size: usize },

    #[error("collector already finalized")]
    Finalized,

    #[error(transparent)]
    Sink(#[from] SinkError),
}

/// Errors on the coordinator/worker process protocol.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("worker I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("worker message JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("worker protocol error: {0}")]
    Protocol(String),
}

/// Top-level error for building and running an [`Engine`](crate::engine::Engine).
#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error(transparent)]
    Sink(#[from] SinkError),

    #[error(transparent)]
    Collector(#[from] CollectorError),

    #[error(transparent)]
    Worker(#[from] WorkerError),

    #[error("no stage registered under name '{0}'")]
    UnknownStage(String),

    #[error("runtime error: {0}")]
    Runtime(String),
}
