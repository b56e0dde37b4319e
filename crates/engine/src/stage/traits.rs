use std::any::Any;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlflow_core::TaskSnapshot;
use thiserror::Error;

use crate::pool::PooledResource;

/// How the runner should react to a stage failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageErrorKind {
    /// Worth retrying as-is (rate limits, timeouts, flaky I/O).
    Transient,
    /// Retrying cannot help; the task fails at this stage.
    Permanent,
    /// The borrowed resource is broken; retry with a fresh one.
    ResourceFatal,
}

impl fmt::Display for StageErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StageErrorKind::Transient => "transient",
            StageErrorKind::Permanent => "permanent",
            StageErrorKind::ResourceFatal => "resource-fatal",
        };
        f.write_str(s)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{kind} stage error: {message}")]
pub struct StageError {
    pub kind: StageErrorKind,
    pub message: String,
}

impl StageError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: StageErrorKind::Transient,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            kind: StageErrorKind::Permanent,
            message: message.into(),
        }
    }

    pub fn resource_fatal(message: impl Into<String>) -> Self {
        Self {
            kind: StageErrorKind::ResourceFatal,
            message: message.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind != StageErrorKind::Permanent
    }
}

/// Everything a stage may look at while it runs.
pub struct StageContext<'a, C> {
    /// Handle from the stage's declared pool, if it declared one.
    pub resource: Option<&'a PooledResource>,
    pub snapshot: &'a TaskSnapshot,
    pub config: &'a C,
    /// 1-based attempt number.
    pub attempt: u32,
}

impl<'a, C> StageContext<'a, C> {
    /// Downcast the borrowed resource, failing permanently when the stage was
    /// configured without a pool or with a pool of the wrong type.
    pub fn resource_as<T: Any + Send + Sync>(&self) -> Result<&'a T, StageError> {
        let handle = self
            .resource
            .ok_or_else(|| StageError::permanent("stage has no resource pool configured"))?;
        handle.downcast_ref::<T>().ok_or_else(|| {
            StageError::permanent(format!(
                "pool '{}' does not provide {}",
                handle.pool_name(),
                std::any::type_name::<T>()
            ))
        })
    }

    /// Output of an earlier stage, deserialized.
    pub fn prior<T: DeserializeOwned>(&self, stage: &str) -> Result<T, StageError> {
        let value = self
            .snapshot
            .prior_output(stage)
            .ok_or_else(|| StageError::permanent(format!("no output from stage '{stage}'")))?;
        serde_json::from_value(value.clone())
            .map_err(|e| StageError::permanent(format!("output of stage '{stage}' has unexpected shape: {e}")))
    }
}

/// Config type for stages that take no parameters. Accepts (and ignores)
/// any `[stages.config]` table.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct NoConfig {}

/// One step of the pipeline.
///
/// Implementations must be deterministic in `(snapshot, config)` when the
/// stage is cacheable: equal inputs are served from cache without calling
/// `execute`.
#[async_trait]
pub trait Stage: Send + Sync + 'static {
    /// Typed form of the stage's `[stages.config]` table.
    type Config: DeserializeOwned + Send + Sync + 'static;

    fn name(&self) -> &str;

    async fn execute(&self, ctx: StageContext<'_, Self::Config>) -> Result<Value, StageError>;
}

// ── Type erasure ────────────────────────────────────────────────────

pub(crate) type BoundConfig = Arc<dyn Any + Send + Sync>;

/// Object-safe view of a [`Stage`] with its config type erased.
#[async_trait]
pub(crate) trait ErasedStage: Send + Sync {
    fn name(&self) -> &str;

    fn bind_config(&self, raw: &toml::Table) -> Result<BoundConfig, String>;

    async fn execute_erased(
        &self,
        resource: Option<&PooledResource>,
        snapshot: &TaskSnapshot,
        config: &(dyn Any + Send + Sync),
        attempt: u32,
    ) -> Result<Value, StageError>;
}

pub(crate) struct StageAdapter<S>(pub S);

#[async_trait]
impl<S: Stage> ErasedStage for StageAdapter<S> {
    fn name(&self) -> &str {
        self.0.name()
    }

    fn bind_config(&self, raw: &toml::Table) -> Result<BoundConfig, String> {
        let config: S::Config = toml::Value::Table(raw.clone())
            .try_into()
            .map_err(|e: toml::de::Error| e.to_string())?;
        Ok(Arc::new(config))
    }

    async fn execute_erased(
        &self,
        resource: Option<&PooledResource>,
        snapshot: &TaskSnapshot,
        config: &(dyn Any + Send + Sync),
        attempt: u32,
    ) -> Result<Value, StageError> {
        let config = config
            .downcast_ref::<S::Config>()
            .ok_or_else(|| StageError::permanent("stage config has the wrong type"))?;
        self.0
            .execute(StageContext {
                resource,
                snapshot,
                config,
                attempt,
            })
            .await
    }
}
