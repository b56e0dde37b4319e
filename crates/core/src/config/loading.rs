use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use super::types::{
    CacheConfig, CheckpointConfig, PipelineConfig, RetryConfig, RunConfig, RunSection,
    StageDescriptor,
};
use crate::error::ConfigError;

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

impl RunConfig {
    /// Parse config from a TOML string, apply `SQLFLOW_*` overrides and validate.
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let mut config: Self = toml::from_str(toml_str)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load config from a file path.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let mut config = Self::from_toml(&content)?;
        config.source_path = Some(path.to_path_buf());
        Ok(config)
    }

    /// Config with defaults for every section and the given stages.
    pub fn with_stages(stages: Vec<StageDescriptor>) -> Self {
        Self {
            run: RunSection::default(),
            retry: RetryConfig::default(),
            cache: CacheConfig::default(),
            checkpoint: CheckpointConfig::default(),
            pools: BTreeMap::new(),
            stages,
            source_path: None,
        }
    }

    pub fn pipeline(&self) -> PipelineConfig {
        PipelineConfig::new(self.stages.clone())
    }

    pub fn results_path(&self) -> PathBuf {
        self.run.output_dir.join("results.jsonl")
    }

    pub fn statistics_path(&self) -> PathBuf {
        self.run.output_dir.join("statistics.json")
    }

    // ── Environment variable overrides ──────────────────────────────

    /// Apply environment variable overrides.
    ///
    /// Convention: `SQLFLOW_SECTION_KEY` overrides `section.key`.
    /// Examples:
    /// - `SQLFLOW_RUN_STRATEGY` → `run.strategy`
    /// - `SQLFLOW_RUN_WORKERS` → `run.workers`
    /// - `SQLFLOW_CACHE_SHARED_URL` → `cache.shared.url`
    /// - `SQLFLOW_CHECKPOINT_DIR` → `checkpoint.dir`
    ///
    /// Values that fail to parse are ignored.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    pub(crate) fn apply_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = parse_var(&lookup, "SQLFLOW_RUN_STRATEGY") {
            self.run.strategy = v;
        }
        if let Some(v) = parse_var(&lookup, "SQLFLOW_RUN_WORKERS") {
            self.run.workers = v;
        }
        if let Some(v) = parse_var(&lookup, "SQLFLOW_RUN_MAX_IN_FLIGHT") {
            self.run.max_in_flight = v;
        }
        if let Some(v) = lookup("SQLFLOW_RUN_OUTPUT_DIR") {
            self.run.output_dir = PathBuf::from(v);
        }
        if let Some(v) = parse_var(&lookup, "SQLFLOW_RUN_FLUSH_EVERY") {
            self.run.flush_every = v;
        }
        if let Some(v) = parse_var(&lookup, "SQLFLOW_RUN_PROGRESS_INTERVAL_SECS") {
            self.run.progress_interval_secs = v;
        }
        if let Some(v) = parse_var(&lookup, "SQLFLOW_RUN_FAILURE_THRESHOLD") {
            self.run.failure_threshold = v;
        }
        if let Some(v) = parse_var(&lookup, "SQLFLOW_RETRY_MAX_ATTEMPTS") {
            self.retry.max_attempts = v;
        }
        if let Some(v) = parse_var(&lookup, "SQLFLOW_RETRY_CALL_TIMEOUT_SECS") {
            self.retry.call_timeout_secs = v;
        }
        if let Some(v) = parse_var(&lookup, "SQLFLOW_CACHE_ENABLED") {
            self.cache.enabled = v;
        }
        if let Some(v) = parse_var(&lookup, "SQLFLOW_CACHE_L1_CAPACITY") {
            self.cache.l1_capacity = v;
        }
        if let Some(shared) = self.cache.shared.as_mut() {
            if let Some(v) = lookup("SQLFLOW_CACHE_SHARED_URL") {
                shared.url = Some(v);
            }
            if let Some(v) = lookup("SQLFLOW_CACHE_SHARED_PATH") {
                shared.path = Some(PathBuf::from(v));
            }
            if let Some(v) = parse_var(&lookup, "SQLFLOW_CACHE_SHARED_TTL_SECS") {
                shared.ttl_secs = v;
            }
        }
        if let Some(v) = parse_var(&lookup, "SQLFLOW_CHECKPOINT_ENABLED") {
            self.checkpoint.enabled = v;
        }
        if let Some(v) = lookup("SQLFLOW_CHECKPOINT_DIR") {
            self.checkpoint.dir = PathBuf::from(v);
        }
    }
}

fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    lookup(key).and_then(|v| v.trim().parse().ok())
}
