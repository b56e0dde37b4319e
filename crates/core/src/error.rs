use thiserror::Error;

/// Errors raised while loading or validating a run configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("config I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),

    #[error("stage '{stage}' has invalid config: {message}")]
    StageConfig { stage: String, message: String },
}

/// Errors raised while reading a dataset into tasks.
#[derive(Error, Debug)]
pub enum DatasetError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("dataset entry {index}: {message}")]
    Entry { index: usize, message: String },
}

/// Illegal lifecycle transition on a [`Task`](crate::Task).
#[derive(Error, Debug, PartialEq, Eq)]
pub enum TaskStateError {
    #[error("task {task_id} is already terminal ({status})")]
    Terminal { task_id: String, status: String },

    #[error("task {task_id} is not running ({status})")]
    NotRunning { task_id: String, status: String },
}
