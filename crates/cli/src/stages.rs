//! Demo pipeline: prompt rendering, candidate generation against a pooled
//! mock model, and majority-vote answer selection.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use sqlflow_core::RunConfig;
use sqlflow_engine::{EngineBuilder, Resource, ResourceFactory, Stage, StageContext, StageError};
use tracing::debug;

pub const MOCK_SQL: &str = "SELECT * FROM table WHERE condition = 'value';";

/// Register the demo stages, plus a [`MockModel`] factory for every
/// configured pool.
pub fn register(builder: EngineBuilder, config: &RunConfig) -> EngineBuilder {
    let mut builder = builder.stage(RenderPrompt).stage(MockGenerate).stage(PickAnswer);
    for pool in config.pools.keys() {
        builder = builder.resource(pool.clone(), Arc::new(MockModelFactory { pool: pool.clone() }));
    }
    builder
}

// ── Mock model resource ─────────────────────────────────────────────

/// Stand-in for an LLM client. One instance per pool slot.
#[derive(Debug)]
pub struct MockModel {
    pub name: String,
    pub slot: usize,
    calls: AtomicU64,
}

impl MockModel {
    pub fn new(name: impl Into<String>, slot: usize) -> Self {
        Self {
            name: name.into(),
            slot,
            calls: AtomicU64::new(0),
        }
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    /// Produce `n` candidate answers. Every `fail_every`-th call on this
    /// instance fails as if the provider were overloaded (0 never fails).
    pub async fn complete(&self, prompt: &str, n: usize, latency: Duration, fail_every: u64) -> Result<Vec<String>, String> {
        let call = self.calls.fetch_add(1, Ordering::Relaxed) + 1;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        if fail_every > 0 && call % fail_every == 0 {
            return Err(format!("{} slot {} overloaded (call {call})", self.name, self.slot));
        }
        debug!(model = %self.name, slot = self.slot, prompt_len = prompt.len(), n, "mock completion");
        Ok(match n {
            0 | 1 => vec![MOCK_SQL.to_string()],
            n => (1..=n).map(|i| format!("{MOCK_SQL} -- Response {i}")).collect(),
        })
    }
}

struct MockModelFactory {
    pool: String,
}

#[async_trait]
impl ResourceFactory for MockModelFactory {
    async fn create(&self, slot: usize) -> anyhow::Result<Resource> {
        Ok(Arc::new(MockModel::new(format!("mock-{}", self.pool), slot)))
    }
}

// ── render_prompt ───────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct PromptConfig {
    /// `{question}`, `{db_id}` and `{evidence}` are substituted.
    pub template: String,
}

impl Default for PromptConfig {
    fn default() -> Self {
        Self {
            template: "-- Database: {db_id}\n-- Question: {question}\n-- Hint: {evidence}\nSELECT".into(),
        }
    }
}

pub struct RenderPrompt;

#[async_trait]
impl Stage for RenderPrompt {
    type Config = PromptConfig;

    fn name(&self) -> &str {
        "render_prompt"
    }

    async fn execute(&self, ctx: StageContext<'_, PromptConfig>) -> Result<Value, StageError> {
        let input = &ctx.snapshot.input;
        if input.question.trim().is_empty() {
            return Err(StageError::permanent("empty question"));
        }
        let prompt = ctx
            .config
            .template
            .replace("{question}", input.question.trim())
            .replace("{db_id}", &input.db_id)
            .replace("{evidence}", input.evidence.trim());
        Ok(json!(prompt))
    }
}

// ── mock_generate ───────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct GenerateConfig {
    pub candidates: usize,
    pub latency_ms: u64,
    pub fail_every: u64,
}

impl Default for GenerateConfig {
    fn default() -> Self {
        Self {
            candidates: 1,
            latency_ms: 0,
            fail_every: 0,
        }
    }
}

pub struct MockGenerate;

#[async_trait]
impl Stage for MockGenerate {
    type Config = GenerateConfig;

    fn name(&self) -> &str {
        "mock_generate"
    }

    async fn execute(&self, ctx: StageContext<'_, GenerateConfig>) -> Result<Value, StageError> {
        let model = ctx.resource_as::<MockModel>()?;
        let prompt: String = ctx.prior("render_prompt")?;
        let cfg = ctx.config;
        let candidates = model
            .complete(&prompt, cfg.candidates, Duration::from_millis(cfg.latency_ms), cfg.fail_every)
            .await
            .map_err(StageError::transient)?;
        Ok(json!({ "model": model.name, "candidates": candidates }))
    }
}

// ── pick_answer ─────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct Generated {
    candidates: Vec<String>,
}

/// Majority vote over the generated candidates, compared with comments and
/// whitespace stripped. Ties go to the earliest candidate.
pub struct PickAnswer;

#[async_trait]
impl Stage for PickAnswer {
    type Config = sqlflow_engine::NoConfig;

    fn name(&self) -> &str {
        "pick_answer"
    }

    async fn execute(&self, ctx: StageContext<'_, Self::Config>) -> Result<Value, StageError> {
        let generated: Generated = ctx.prior("mock_generate")?;
        let (sql, votes) =
            majority(&generated.candidates).ok_or_else(|| StageError::permanent("model returned no candidates"))?;
        Ok(json!({ "sql": sql, "votes": votes, "candidates": generated.candidates.len() }))
    }
}

fn normalize(sql: &str) -> String {
    let code = sql.split("--").next().unwrap_or_default();
    code.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn majority(candidates: &[String]) -> Option<(String, usize)> {
    let mut votes: HashMap<String, usize> = HashMap::new();
    for c in candidates {
        *votes.entry(normalize(c)).or_default() += 1;
    }
    let mut best: Option<(String, usize)> = None;
    for c in candidates {
        let key = normalize(c);
        let count = votes[&key];
        if best.as_ref().map_or(true, |(_, n)| count > *n) {
            best = Some((key, count));
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn majority_ignores_comments_and_whitespace() {
        let candidates = vec![
            "SELECT a FROM t".to_string(),
            "SELECT  b FROM t -- Response 2".to_string(),
            "SELECT b\nFROM t -- Response 3".to_string(),
        ];
        assert_eq!(majority(&candidates), Some(("SELECT b FROM t".to_string(), 2)));
    }

    #[test]
    fn majority_tie_goes_to_first() {
        let candidates = vec!["SELECT 1".to_string(), "SELECT 2".to_string()];
        assert_eq!(majority(&candidates), Some(("SELECT 1".to_string(), 1)));
        assert_eq!(majority(&[]), None);
    }

    #[tokio::test]
    async fn mock_model_fails_every_nth_call() {
        let model = MockModel::new("mock", 0);
        assert!(model.complete("p", 1, Duration::ZERO, 3).await.is_ok());
        assert!(model.complete("p", 1, Duration::ZERO, 3).await.is_ok());
        assert!(model.complete("p", 1, Duration::ZERO, 3).await.is_err());
        assert_eq!(model.calls(), 3);

        let many = model.complete("p", 3, Duration::ZERO, 0).await.unwrap();
        assert_eq!(many.len(), 3);
        assert!(many[2].ends_with("-- Response 3"));
    }
}
