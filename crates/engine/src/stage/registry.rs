use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use sqlflow_core::{ConfigError, PipelineConfig, StageDescriptor};
use tracing::info;

use super::retry::RetryPolicy;
use super::traits::{BoundConfig, ErasedStage, Stage, StageAdapter};
use crate::error::EngineError;

/// Stage implementations available to a run, by name.
#[derive(Default, Clone)]
pub struct StageRegistry {
    stages: HashMap<String, Arc<dyn ErasedStage>>,
}

impl StageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a stage under its own name, replacing any previous one.
    pub fn register<S: Stage>(&mut self, stage: S) {
        let name = stage.name().to_string();
        self.stages.insert(name, Arc::new(StageAdapter(stage)));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.stages.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.stages.keys().cloned().collect();
        names.sort();
        names
    }

    /// Resolve every descriptor to a registered stage and deserialize its
    /// config. Fails before any task runs if a stage is unknown or its
    /// config does not fit the stage's config type.
    pub fn bind(
        &self,
        pipeline: &PipelineConfig,
        retry: &RetryPolicy,
    ) -> Result<BoundPipeline, EngineError> {
        let mut stages = Vec::with_capacity(pipeline.len());
        for descriptor in &pipeline.stages {
            let stage = self
                .stages
                .get(&descriptor.name)
                .ok_or_else(|| EngineError::UnknownStage(descriptor.name.clone()))?;
            let config = stage.bind_config(&descriptor.config).map_err(|message| {
                ConfigError::StageConfig {
                    stage: descriptor.name.clone(),
                    message,
                }
            })?;
            let config_json = serde_json::to_value(&descriptor.config).map_err(|e| {
                ConfigError::StageConfig {
                    stage: descriptor.name.clone(),
                    message: e.to_string(),
                }
            })?;
            let retry = match descriptor.max_attempts {
                Some(n) => retry.with_max_attempts(n),
                None => retry.clone(),
            };
            stages.push(BoundStage {
                descriptor: descriptor.clone(),
                stage: Arc::clone(stage),
                config,
                config_json,
                retry,
            });
        }
        info!(
            stages = %stages.iter().map(|s| s.name()).collect::<Vec<_>>().join(" → "),
            "pipeline bound"
        );
        Ok(BoundPipeline { stages })
    }
}

/// A stage paired with its validated config and retry bound.
#[derive(Clone)]
pub struct BoundStage {
    pub descriptor: StageDescriptor,
    pub(crate) stage: Arc<dyn ErasedStage>,
    pub(crate) config: BoundConfig,
    /// Config as JSON; part of every cache fingerprint for this stage.
    pub config_json: Value,
    pub retry: RetryPolicy,
}

impl BoundStage {
    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn resource(&self) -> Option<&str> {
        self.descriptor.resource.as_deref()
    }

    pub fn is_cacheable(&self) -> bool {
        self.descriptor.cacheable
    }

    pub fn is_checkpointed(&self) -> bool {
        self.descriptor.skippable_if_checkpointed
    }
}

/// The ordered, immutable stage list of a run.
#[derive(Clone, Default)]
pub struct BoundPipeline {
    stages: Vec<BoundStage>,
}

impl std::fmt::Debug for BoundPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoundPipeline")
            .field("stages", &self.stages.len())
            .finish()
    }
}

impl BoundPipeline {
    pub fn stages(&self) -> &[BoundStage] {
        &self.stages
    }

    pub fn get(&self, index: usize) -> Option<&BoundStage> {
        self.stages.get(index)
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.stages.iter().map(BoundStage::name).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::traits::{NoConfig, StageContext, StageError};
    use async_trait::async_trait;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Deserialize)]
    struct GenConfig {
        candidates: u32,
        #[serde(default)]
        temperature: f64,
    }

    struct Generate;

    #[async_trait]
    impl Stage for Generate {
        type Config = GenConfig;
        fn name(&self) -> &str {
            "generate"
        }
        async fn execute(&self, ctx: StageContext<'_, GenConfig>) -> Result<Value, StageError> {
            Ok(json!({ "n": ctx.config.candidates, "t": ctx.config.temperature }))
        }
    }

    struct Vote;

    #[async_trait]
    impl Stage for Vote {
        type Config = NoConfig;
        fn name(&self) -> &str {
            "vote"
        }
        async fn execute(&self, _ctx: StageContext<'_, NoConfig>) -> Result<Value, StageError> {
            Ok(json!("SELECT 1"))
        }
    }

    fn registry() -> StageRegistry {
        let mut r = StageRegistry::new();
        r.register(Generate);
        r.register(Vote);
        r
    }

    fn table(toml_src: &str) -> toml::Table {
        toml_src.parse().unwrap()
    }

    #[test]
    fn binds_in_declared_order_with_overrides() {
        let pipeline = PipelineConfig::new(vec![
            StageDescriptor::new("generate")
                .with_config(table("candidates = 3"))
                .with_max_attempts(5),
            StageDescriptor::new("vote"),
        ]);
        let bound = registry().bind(&pipeline, &RetryPolicy::immediate(2)).unwrap();

        assert_eq!(bound.names(), vec!["generate", "vote"]);
        assert_eq!(bound.stages()[0].retry.max_attempts, 5);
        assert_eq!(bound.stages()[1].retry.max_attempts, 2);
        assert_eq!(bound.stages()[0].config_json, json!({ "candidates": 3 }));
    }

    #[test]
    fn unknown_stage_fails_binding() {
        let pipeline = PipelineConfig::new(vec![StageDescriptor::new("evaluate")]);
        let err = registry().bind(&pipeline, &RetryPolicy::default()).unwrap_err();
        assert!(matches!(err, EngineError::UnknownStage(name) if name == "evaluate"));
    }

    #[test]
    fn bad_stage_config_fails_binding() {
        let pipeline = PipelineConfig::new(vec![
            StageDescriptor::new("generate").with_config(table("candidates = \"many\"")),
        ]);
        let err = registry().bind(&pipeline, &RetryPolicy::default()).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("generate"), "got: {msg}");

        // Missing required field.
        let pipeline = PipelineConfig::new(vec![StageDescriptor::new("generate")]);
        assert!(registry().bind(&pipeline, &RetryPolicy::default()).is_err());
    }

    #[test]
    fn no_config_accepts_any_table() {
        let pipeline = PipelineConfig::new(vec![
            StageDescriptor::new("vote").with_config(table("unused = true")),
        ]);
        assert!(registry().bind(&pipeline, &RetryPolicy::default()).is_ok());
    }
}
