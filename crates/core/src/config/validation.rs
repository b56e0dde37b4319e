use std::collections::HashSet;

use super::types::{RunConfig, SharedCacheKind};
use crate::error::ConfigError;

impl RunConfig {
    /// Validate cross-section references and numeric bounds.
    ///
    /// Stage-specific `config` tables are checked later, when the engine binds
    /// them to concrete stage implementations.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.validate_run()?;
        self.validate_retry()?;
        self.validate_cache()?;
        self.validate_pools()?;
        self.validate_stages()?;
        Ok(())
    }

    fn validate_run(&self) -> Result<(), ConfigError> {
        let run = &self.run;
        if run.workers == 0 {
            return Err(invalid("run.workers must be at least 1"));
        }
        if run.max_in_flight == 0 {
            return Err(invalid("run.max_in_flight must be at least 1"));
        }
        if run.flush_every == 0 {
            return Err(invalid("run.flush_every must be at least 1"));
        }
        if !(0.0..=1.0).contains(&run.failure_threshold) {
            return Err(invalid(format!(
                "run.failure_threshold must be between 0 and 1, got {}",
                run.failure_threshold
            )));
        }
        if let Some(end) = run.end {
            if end < run.start {
                return Err(invalid(format!(
                    "run.end ({end}) is before run.start ({})",
                    run.start
                )));
            }
        }
        if let Some(cmd) = &run.worker_command {
            if cmd.is_empty() {
                return Err(invalid("run.worker_command must name a program"));
            }
        }
        Ok(())
    }

    fn validate_retry(&self) -> Result<(), ConfigError> {
        if self.retry.max_attempts == 0 {
            return Err(invalid("retry.max_attempts must be at least 1"));
        }
        if self.retry.backoff_factor < 1.0 {
            return Err(invalid("retry.backoff_factor must be >= 1.0"));
        }
        if self.retry.call_timeout_secs == 0 {
            return Err(invalid("retry.call_timeout_secs must be at least 1"));
        }
        Ok(())
    }

    fn validate_cache(&self) -> Result<(), ConfigError> {
        let cache = &self.cache;
        if cache.l1_capacity == 0 {
            return Err(invalid("cache.l1_capacity must be at least 1"));
        }
        if cache.l1_shards == 0 || cache.l1_shards > cache.l1_capacity {
            return Err(invalid(format!(
                "cache.l1_shards must be between 1 and l1_capacity ({})",
                cache.l1_capacity
            )));
        }
        if let Some(shared) = &cache.shared {
            match shared.kind {
                SharedCacheKind::Directory if shared.path.is_none() => {
                    return Err(invalid("cache.shared kind 'directory' requires 'path'"));
                }
                SharedCacheKind::Redis if shared.url.is_none() => {
                    return Err(invalid("cache.shared kind 'redis' requires 'url'"));
                }
                _ => {}
            }
            if shared.ttl_secs == 0 {
                return Err(invalid("cache.shared.ttl_secs must be at least 1"));
            }
        }
        Ok(())
    }

    fn validate_pools(&self) -> Result<(), ConfigError> {
        for (name, pool) in &self.pools {
            if pool.size == 0 {
                return Err(invalid(format!("pool '{name}' must have size >= 1")));
            }
        }
        Ok(())
    }

    /// Ensure stage names are unique and every referenced pool exists.
    fn validate_stages(&self) -> Result<(), ConfigError> {
        if self.stages.is_empty() {
            return Err(invalid("at least one [[stages]] entry is required"));
        }
        let mut seen = HashSet::new();
        for stage in &self.stages {
            if stage.name.trim().is_empty() {
                return Err(invalid("stage names must not be empty"));
            }
            if !seen.insert(stage.name.as_str()) {
                return Err(invalid(format!("duplicate stage name '{}'", stage.name)));
            }
            if let Some(pool) = &stage.resource {
                if !self.pools.contains_key(pool) {
                    return Err(invalid(format!(
                        "stage '{}' references unknown pool '{pool}'",
                        stage.name
                    )));
                }
            }
            if stage.max_attempts == Some(0) {
                return Err(ConfigError::StageConfig {
                    stage: stage.name.clone(),
                    message: "max_attempts must be at least 1".into(),
                });
            }
        }
        Ok(())
    }
}

fn invalid(msg: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(msg.into())
}
