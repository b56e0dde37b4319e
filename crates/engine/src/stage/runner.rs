use std::sync::Arc;
use std::time::{Duration, Instant};

use sqlflow_core::{FailureKind, StageRecord, TaskFailure, TaskSnapshot};
use tracing::{debug, warn};

use super::event::{CacheProbe, StageEvent, StageEventOutcome};
use super::registry::BoundStage;
use super::traits::{StageError, StageErrorKind};
use crate::cache::{Fingerprint, MultiLevelCache};
use crate::error::PoolError;
use crate::pool::{PooledResource, ResourcePools};

/// A stage that could not produce a value for a task.
#[derive(Debug, Clone)]
pub struct StageFailure {
    /// The `Failed` history record to append to the task.
    pub record: StageRecord,
    pub failure: TaskFailure,
}

/// Result of running one stage, plus the event describing it.
#[derive(Debug)]
pub struct StageRun {
    pub result: Result<StageRecord, StageFailure>,
    pub event: StageEvent,
}

/// Executes single stages: cache lookup, resource borrowing, bounded
/// invocation, retries, cache store.
#[derive(Clone)]
pub struct StageRunner {
    pools: Arc<ResourcePools>,
    cache: Option<Arc<MultiLevelCache>>,
    call_timeout: Duration,
}

impl StageRunner {
    pub fn new(
        pools: Arc<ResourcePools>,
        cache: Option<Arc<MultiLevelCache>>,
        call_timeout: Duration,
    ) -> Self {
        Self {
            pools,
            cache,
            call_timeout,
        }
    }

    pub fn pools(&self) -> &ResourcePools {
        &self.pools
    }

    pub fn cache(&self) -> Option<&Arc<MultiLevelCache>> {
        self.cache.as_ref()
    }

    /// Run `stage` against `snapshot`.
    ///
    /// A cache hit returns without touching any pool. On a miss the stage is
    /// invoked with a borrowed resource under `call_timeout`; transient and
    /// resource-fatal errors are retried (the latter on a fresh resource) up
    /// to the stage's attempt bound. A pool timeout fails immediately.
    pub async fn run(&self, stage: &BoundStage, snapshot: &TaskSnapshot) -> StageRun {
        let started = Instant::now();
        let mut event = StageEvent {
            task_id: snapshot.task_id.clone(),
            stage: stage.name().to_string(),
            outcome: StageEventOutcome::Completed,
            cache: CacheProbe::Skipped,
            cache_errors: 0,
            attempts: 0,
            elapsed_ms: 0,
        };

        let cache = self.cache.as_ref().filter(|_| stage.is_cacheable());
        let fingerprint = cache.map(|_| Fingerprint::compute(stage.name(), &stage.config_json, snapshot));

        if let (Some(cache), Some(fp)) = (cache, fingerprint.as_ref()) {
            let lookup = cache.get(fp).await;
            event.cache_errors += lookup.errors;
            match (lookup.value, lookup.level) {
                (Some(value), Some(level)) => {
                    debug!(task_id = %snapshot.task_id, stage = stage.name(), ?level, "cache hit");
                    event.cache = CacheProbe::Hit(level);
                    event.outcome = StageEventOutcome::CacheHit;
                    event.elapsed_ms = started.elapsed().as_millis() as u64;
                    let record = StageRecord::cached(stage.name(), value, started.elapsed());
                    return StageRun {
                        result: Ok(record),
                        event,
                    };
                }
                _ => event.cache = CacheProbe::Miss,
            }
        }

        let result = self.invoke_with_retries(stage, snapshot, &mut event).await;
        let elapsed = started.elapsed();
        event.elapsed_ms = elapsed.as_millis() as u64;

        let result = match result {
            Ok(value) => {
                if let (Some(cache), Some(fp)) = (cache, fingerprint.as_ref()) {
                    event.cache_errors += cache.put(fp, &value).await;
                }
                Ok(StageRecord::completed(stage.name(), value, elapsed, event.attempts))
            }
            Err((kind, message)) => {
                event.outcome = StageEventOutcome::Failed(kind);
                warn!(
                    task_id = %snapshot.task_id,
                    stage = stage.name(),
                    attempts = event.attempts,
                    error = %message,
                    "stage failed"
                );
                Err(StageFailure {
                    record: StageRecord::failed(stage.name(), &message, elapsed, event.attempts),
                    failure: TaskFailure::new(kind, Some(stage.name()), message),
                })
            }
        };
        StageRun { result, event }
    }

    async fn invoke_with_retries(
        &self,
        stage: &BoundStage,
        snapshot: &TaskSnapshot,
        event: &mut StageEvent,
    ) -> Result<serde_json::Value, (FailureKind, String)> {
        let pool = match stage.resource() {
            Some(name) => match self.pools.get(name) {
                Ok(pool) => Some(pool),
                Err(e) => return Err((FailureKind::Resource, e.to_string())),
            },
            None => None,
        };
        let max_attempts = stage.retry.max_attempts;

        loop {
            let attempt = event.attempts + 1;

            let handle = match pool {
                Some(pool) => match pool.acquire_default().await {
                    Ok(handle) => Some(handle),
                    Err(e @ PoolError::Timeout { .. }) => {
                        return Err((FailureKind::PoolTimeout, e.to_string()));
                    }
                    Err(e) => {
                        // Creation failures count as an attempt on a broken resource.
                        event.attempts = attempt;
                        if attempt >= max_attempts {
                            return Err((FailureKind::Resource, e.to_string()));
                        }
                        self.backoff(stage, snapshot, attempt, &e.to_string()).await;
                        continue;
                    }
                },
                None => None,
            };

            event.attempts = attempt;
            let outcome = tokio::time::timeout(
                self.call_timeout,
                stage
                    .stage
                    .execute_erased(handle.as_ref(), snapshot, stage.config.as_ref(), attempt),
            )
            .await
            .unwrap_or_else(|_| {
                Err(StageError::transient(format!(
                    "call exceeded {}s timeout",
                    self.call_timeout.as_secs_f64()
                )))
            });

            let error = match outcome {
                Ok(value) => {
                    release(handle, false);
                    return Ok(value);
                }
                Err(error) => error,
            };
            release(handle, error.kind == StageErrorKind::ResourceFatal);

            if !error.is_retryable() {
                return Err((FailureKind::Stage, error.message));
            }
            if attempt >= max_attempts {
                return Err((
                    FailureKind::Stage,
                    format!("gave up after {attempt} attempts: {}", error.message),
                ));
            }
            self.backoff(stage, snapshot, attempt, &error.to_string()).await;
        }
    }

    async fn backoff(&self, stage: &BoundStage, snapshot: &TaskSnapshot, attempt: u32, error: &str) {
        let delay = stage.retry.delay(attempt);
        debug!(
            task_id = %snapshot.task_id,
            stage = stage.name(),
            attempt,
            delay_ms = delay.as_millis() as u64,
            error,
            "retrying stage"
        );
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}

fn release(handle: Option<PooledResource>, invalidate: bool) {
    if let Some(handle) = handle {
        if invalidate {
            handle.invalidate();
        } else {
            handle.release();
        }
    }
}
