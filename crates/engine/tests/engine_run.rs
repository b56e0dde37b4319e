//! End-to-end runs through [`Engine`] with file-backed results, checkpoints
//! and caches in a temp directory.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use sqlflow_core::{
    PoolConfig, RunConfig, SharedCacheConfig, SharedCacheKind, StageDescriptor, StageStatus, StrategyKind, Task,
    TaskInput, TaskStatus,
};
use sqlflow_engine::collector::{read_jsonl, RESULTS_JSON, RESULTS_JSONL};
use sqlflow_engine::{Engine, NoConfig, Resource, Stage, StageContext, StageError};

// ── Fixtures ────────────────────────────────────────────────────────

struct Model {
    slot: usize,
}

#[derive(Default)]
struct Counters {
    prompt_calls: AtomicUsize,
    generate_calls: AtomicUsize,
    models_created: AtomicUsize,
    generate_broken: AtomicBool,
}

struct Prompt(Arc<Counters>);

#[async_trait]
impl Stage for Prompt {
    type Config = NoConfig;
    fn name(&self) -> &str {
        "prompt"
    }
    async fn execute(&self, ctx: StageContext<'_, NoConfig>) -> Result<Value, StageError> {
        self.0.prompt_calls.fetch_add(1, Ordering::SeqCst);
        if ctx.snapshot.input.question.contains("unanswerable") {
            return Err(StageError::permanent("no schema for question"));
        }
        Ok(json!(format!("-- {}", ctx.snapshot.input.question)))
    }
}

struct Generate(Arc<Counters>);

#[async_trait]
impl Stage for Generate {
    type Config = NoConfig;
    fn name(&self) -> &str {
        "generate"
    }
    async fn execute(&self, ctx: StageContext<'_, NoConfig>) -> Result<Value, StageError> {
        self.0.generate_calls.fetch_add(1, Ordering::SeqCst);
        let model = ctx.resource_as::<Model>()?;
        if self.0.generate_broken.load(Ordering::SeqCst) {
            return Err(StageError::permanent("model offline"));
        }
        let prompt: String = ctx.prior("prompt")?;
        tokio::time::sleep(Duration::from_millis(2)).await;
        Ok(json!({ "sql": format!("SELECT 1; {prompt}"), "slot": model.slot }))
    }
}

fn stages() -> Vec<StageDescriptor> {
    vec![
        StageDescriptor::new("prompt").checkpointed(),
        StageDescriptor::new("generate").with_resource("model"),
    ]
}

fn config(dir: &Path, strategy: StrategyKind) -> RunConfig {
    let mut config = RunConfig::with_stages(stages());
    config.run.strategy = strategy;
    config.run.workers = 3;
    config.run.flush_every = 2;
    config.run.progress_interval_secs = 0;
    config.run.output_dir = dir.join("results");
    config.checkpoint.dir = dir.join("checkpoints");
    config.retry.initial_backoff_ms = 1;
    config.retry.max_backoff_ms = 5;
    config.pools.insert(
        "model".into(),
        PoolConfig {
            size: 2,
            acquire_timeout_secs: 5,
            warm: false,
        },
    );
    config
}

fn engine(config: RunConfig, counters: &Arc<Counters>) -> Engine {
    let created = Arc::clone(counters);
    Engine::builder(config)
        .stage(Prompt(Arc::clone(counters)))
        .stage(Generate(Arc::clone(counters)))
        .resource(
            "model",
            Arc::new(move |slot: usize| {
                created.models_created.fetch_add(1, Ordering::SeqCst);
                async move { anyhow::Ok(Arc::new(Model { slot }) as Resource) }
            }),
        )
        .build()
        .expect("engine builds")
}

fn tasks(questions: &[&str]) -> Vec<Task> {
    questions
        .iter()
        .enumerate()
        .map(|(i, q)| Task::new(i, format!("q{i}"), TaskInput::new(*q, "db")))
        .collect()
}

fn numbered(n: usize) -> Vec<Task> {
    (0..n)
        .map(|i| Task::new(i, format!("q{i}"), TaskInput::new(format!("question {i}"), "db")))
        .collect()
}

// ── Tests ───────────────────────────────────────────────────────────

#[test]
fn thread_run_writes_ordered_results_and_statistics() {
    let dir = tempfile::tempdir().unwrap();
    let counters = Arc::new(Counters::default());
    let engine = engine(config(dir.path(), StrategyKind::Thread), &counters);

    let summary = engine.run(numbered(12)).unwrap();
    assert_eq!(summary.results.summary.succeeded, 12);
    assert_eq!(summary.failure_rate(), 0.0);

    let results = dir.path().join("results");
    let lines = read_jsonl(&results.join(RESULTS_JSONL)).unwrap();
    let indices: Vec<usize> = lines.iter().map(|t| t.index).collect();
    assert_eq!(indices, (0..12).collect::<Vec<_>>());

    let final_json: Value = serde_json::from_str(&std::fs::read_to_string(results.join(RESULTS_JSON)).unwrap()).unwrap();
    assert_eq!(final_json["results"].as_array().unwrap().len(), 12);

    let stats: Value =
        serde_json::from_str(&std::fs::read_to_string(results.join("statistics.json")).unwrap()).unwrap();
    assert_eq!(stats["tasks"]["succeeded"], 12);
    assert!(stats["stages"]["generate"]["runs"].as_u64().unwrap() >= 12);

    let pool = &engine.pool_stats()[0];
    assert!(pool.created <= 2, "pool grew to {}", pool.created);
}

#[test]
fn one_failing_task_does_not_stop_the_rest() {
    let dir = tempfile::tempdir().unwrap();
    let counters = Arc::new(Counters::default());
    let engine = engine(config(dir.path(), StrategyKind::Sequential), &counters);

    let summary = engine
        .run(tasks(&["a", "b", "unanswerable c", "d", "e"]))
        .unwrap();
    let results = &summary.results;
    assert_eq!(results.summary.succeeded, 4);
    assert_eq!(results.summary.failed, 1);
    assert!((summary.failure_rate() - 0.2).abs() < 1e-9);

    let failed = results.get(2).unwrap();
    assert_eq!(failed.status(), TaskStatus::Failed);
    assert_eq!(failed.failure().unwrap().stage.as_deref(), Some("prompt"));
    // The failed task never reached the pooled stage.
    assert_eq!(counters.generate_calls.load(Ordering::SeqCst), 4);
}

#[test]
fn second_run_resumes_from_file_checkpoints() {
    let dir = tempfile::tempdir().unwrap();
    let counters = Arc::new(Counters::default());
    let mut cfg = config(dir.path(), StrategyKind::Async);
    cfg.cache.enabled = false;

    counters.generate_broken.store(true, Ordering::SeqCst);
    let first = engine(cfg.clone(), &counters).run(numbered(4)).unwrap();
    assert_eq!(first.results.summary.failed, 4);
    assert_eq!(counters.prompt_calls.load(Ordering::SeqCst), 4);

    counters.generate_broken.store(false, Ordering::SeqCst);
    let second = engine(cfg, &counters).run(numbered(4)).unwrap();
    assert_eq!(second.results.summary.succeeded, 4);
    assert_eq!(counters.prompt_calls.load(Ordering::SeqCst), 4, "prompt must not rerun");
    for task in second.results.tasks() {
        assert_eq!(task.history()[0].status, StageStatus::Restored);
        assert_eq!(task.history()[1].status, StageStatus::Completed);
    }
}

#[test]
fn cached_stages_never_borrow_a_resource() {
    let dir = tempfile::tempdir().unwrap();
    let counters = Arc::new(Counters::default());
    let mut cfg = config(dir.path(), StrategyKind::Sequential);
    cfg.checkpoint.enabled = false;
    let engine = engine(cfg, &counters);

    engine.run(numbered(3)).unwrap();
    let acquisitions = engine.pool_stats()[0].acquisitions;
    assert_eq!(acquisitions, 3);

    let again = engine.run(numbered(3)).unwrap();
    assert_eq!(again.results.summary.succeeded, 3);
    assert_eq!(engine.pool_stats()[0].acquisitions, acquisitions);
    assert_eq!(counters.generate_calls.load(Ordering::SeqCst), 3);
    for task in again.results.tasks() {
        assert!(task.history().iter().all(|r| r.status == StageStatus::Cached));
    }

    let stats = engine.stats().snapshot();
    assert_eq!(stats.cache.l1_hits, 6);
    assert_eq!(engine.cache_stats().unwrap().l1.hits, 6);
}

#[test]
fn identical_input_in_the_same_run_is_a_cache_hit() {
    let dir = tempfile::tempdir().unwrap();
    let counters = Arc::new(Counters::default());
    let mut cfg = config(dir.path(), StrategyKind::Sequential);
    cfg.checkpoint.enabled = false;
    let engine = engine(cfg, &counters);

    let summary = engine.run(tasks(&["same question", "same question"])).unwrap();
    assert_eq!(summary.results.summary.succeeded, 2);
    assert_eq!(engine.pool_stats()[0].acquisitions, 1);
    assert_eq!(counters.generate_calls.load(Ordering::SeqCst), 1);

    let second = summary.results.get(1).unwrap();
    assert_eq!(second.id, "q1");
    assert!(second.history().iter().all(|r| r.status == StageStatus::Cached));
    assert_eq!(
        second.stage_output("generate"),
        summary.results.get(0).unwrap().stage_output("generate")
    );
}

#[test]
fn shared_directory_cache_serves_another_engine() {
    let dir = tempfile::tempdir().unwrap();
    let counters = Arc::new(Counters::default());
    let mut cfg = config(dir.path(), StrategyKind::Thread);
    cfg.checkpoint.enabled = false;
    cfg.cache.shared = Some(SharedCacheConfig {
        kind: SharedCacheKind::Directory,
        path: Some(dir.path().join("l2")),
        url: None,
        ttl_secs: 600,
    });

    engine(cfg.clone(), &counters).run(numbered(5)).unwrap();
    assert_eq!(counters.generate_calls.load(Ordering::SeqCst), 5);

    let second = engine(cfg, &counters);
    let summary = second.run(numbered(5)).unwrap();
    assert_eq!(summary.results.summary.succeeded, 5);
    assert_eq!(counters.generate_calls.load(Ordering::SeqCst), 5);
    assert_eq!(second.stats().snapshot().cache.l2_hits, 10);
}

#[test]
fn cancelled_before_start_leaves_every_slot_missing() {
    let dir = tempfile::tempdir().unwrap();
    let counters = Arc::new(Counters::default());
    let engine = engine(config(dir.path(), StrategyKind::Thread), &counters);

    engine.cancel_signal().cancel();
    let summary = engine.run(numbered(4)).unwrap();
    assert!(summary.cancelled);
    assert_eq!(summary.results.summary.missing, 4);
    assert_eq!(summary.failure_rate(), 1.0);
    assert_eq!(counters.prompt_calls.load(Ordering::SeqCst), 0);
    assert!(dir.path().join("results").join(RESULTS_JSON).exists());
}

#[test]
fn unknown_stage_fails_the_build() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = config(dir.path(), StrategyKind::Sequential);
    cfg.stages.push(StageDescriptor::new("score"));
    let counters = Arc::new(Counters::default());
    let built = Engine::builder(cfg)
        .stage(Prompt(Arc::clone(&counters)))
        .stage(Generate(counters))
        .build();
    assert!(matches!(built, Err(sqlflow_engine::EngineError::UnknownStage(name)) if name == "score"));
}

#[test]
fn process_strategy_without_config_file_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let counters = Arc::new(Counters::default());
    let engine = engine(config(dir.path(), StrategyKind::Process), &counters);
    assert!(matches!(
        engine.run(numbered(1)),
        Err(sqlflow_engine::EngineError::Config(_))
    ));
}
