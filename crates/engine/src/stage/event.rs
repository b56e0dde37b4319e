use serde::{Deserialize, Serialize};
use sqlflow_core::FailureKind;

use crate::cache::CacheLevel;

/// What the cache said about a stage invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "probe", content = "level")]
pub enum CacheProbe {
    /// Caching disabled for the run or the stage.
    Skipped,
    Miss,
    Hit(CacheLevel),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageEventOutcome {
    Completed,
    CacheHit,
    Failed(FailureKind),
}

/// Exactly one of these is emitted per stage run, whatever the outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageEvent {
    pub task_id: String,
    pub stage: String,
    pub outcome: StageEventOutcome,
    pub cache: CacheProbe,
    /// Shared-cache errors swallowed during this run.
    pub cache_errors: u32,
    /// Invocations of the stage function (0 on a cache hit).
    pub attempts: u32,
    pub elapsed_ms: u64,
}

impl StageEvent {
    pub fn retries(&self) -> u32 {
        self.attempts.saturating_sub(1)
    }

    pub fn is_success(&self) -> bool {
        !matches!(self.outcome, StageEventOutcome::Failed(_))
    }
}
