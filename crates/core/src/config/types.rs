use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

// ── Top-level config ────────────────────────────────────────────────

/// Full configuration for one batch run.
///
/// Parsed from `sqlflow.toml`, then overridden from `SQLFLOW_*` environment
/// variables, then validated. Every section except `[[stages]]` is optional.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    #[serde(default)]
    pub run: RunSection,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub checkpoint: CheckpointConfig,

    /// Named resource pools referenced by stages.
    #[serde(default)]
    pub pools: BTreeMap<String, PoolConfig>,

    /// Ordered stage list; execution follows declaration order.
    #[serde(default)]
    pub stages: Vec<StageDescriptor>,

    /// File the config was loaded from, if any. Worker processes re-read it.
    #[serde(skip)]
    pub source_path: Option<PathBuf>,
}

// ── Section configs ─────────────────────────────────────────────────

/// How tasks are distributed over execution contexts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StrategyKind {
    Sequential,
    #[serde(alias = "threads")]
    Thread,
    #[serde(alias = "processes", alias = "multiprocess")]
    Process,
    #[serde(alias = "cooperative")]
    Async,
}

impl std::str::FromStr for StrategyKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sequential" => Ok(Self::Sequential),
            "thread" | "threads" => Ok(Self::Thread),
            "process" | "processes" | "multiprocess" => Ok(Self::Process),
            "async" | "cooperative" => Ok(Self::Async),
            other => Err(format!(
                "unknown strategy '{other}', expected sequential, thread, process or async"
            )),
        }
    }
}

/// Resolved concurrency strategy with its sizing parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    Sequential,
    Threads { workers: usize },
    Processes { workers: usize },
    Cooperative { max_in_flight: usize },
}

impl Strategy {
    pub fn name(&self) -> &'static str {
        match self {
            Strategy::Sequential => "sequential",
            Strategy::Threads { .. } => "thread",
            Strategy::Processes { .. } => "process",
            Strategy::Cooperative { .. } => "async",
        }
    }
}

/// `[run]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSection {
    #[serde(default = "default_strategy")]
    pub strategy: StrategyKind,

    /// Worker threads or processes for the parallel strategies.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Concurrent tasks for the async strategy.
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,

    /// Directory receiving `results.jsonl`, `results.json` and `statistics.json`.
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    /// Flush the ordered results prefix every N newly contiguous entries.
    #[serde(default = "default_flush_every")]
    pub flush_every: usize,

    /// Seconds between progress log lines; 0 disables progress reporting.
    #[serde(default = "default_progress_interval")]
    pub progress_interval_secs: u64,

    /// Failure rate above which the run exits non-zero (0.0 to 1.0).
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: f64,

    /// Command used to spawn process workers. Defaults to the current
    /// executable with `worker --config <path>`.
    #[serde(default)]
    pub worker_command: Option<Vec<String>>,

    /// First dataset index to run (inclusive).
    #[serde(default)]
    pub start: usize,

    /// Dataset index to stop at (exclusive). Runs to the end when unset.
    #[serde(default)]
    pub end: Option<usize>,
}

fn default_strategy() -> StrategyKind {
    StrategyKind::Sequential
}

fn default_workers() -> usize {
    3
}

fn default_max_in_flight() -> usize {
    8
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("results")
}

fn default_flush_every() -> usize {
    10
}

fn default_progress_interval() -> u64 {
    10
}

fn default_failure_threshold() -> f64 {
    0.5
}

impl Default for RunSection {
    fn default() -> Self {
        Self {
            strategy: default_strategy(),
            workers: default_workers(),
            max_in_flight: default_max_in_flight(),
            output_dir: default_output_dir(),
            flush_every: default_flush_every(),
            progress_interval_secs: default_progress_interval(),
            failure_threshold: default_failure_threshold(),
            worker_command: None,
            start: 0,
            end: None,
        }
    }
}

impl RunSection {
    pub fn strategy(&self) -> Strategy {
        match self.strategy {
            StrategyKind::Sequential => Strategy::Sequential,
            StrategyKind::Thread => Strategy::Threads {
                workers: self.workers,
            },
            StrategyKind::Process => Strategy::Processes {
                workers: self.workers,
            },
            StrategyKind::Async => Strategy::Cooperative {
                max_in_flight: self.max_in_flight,
            },
        }
    }

    pub fn progress_interval(&self) -> Option<Duration> {
        (self.progress_interval_secs > 0).then(|| Duration::from_secs(self.progress_interval_secs))
    }
}

/// `[retry]` section: bounds for transient stage failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts per stage call, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,

    /// Upper bound on a single stage invocation.
    #[serde(default = "default_call_timeout")]
    pub call_timeout_secs: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    200
}

fn default_max_backoff_ms() -> u64 {
    2000
}

fn default_backoff_factor() -> f64 {
    1.5
}

fn default_call_timeout() -> u64 {
    120
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            backoff_factor: default_backoff_factor(),
            call_timeout_secs: default_call_timeout(),
        }
    }
}

impl RetryConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }
}

/// `[cache]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Total in-process entry ceiling, split evenly across shards.
    #[serde(default = "default_l1_capacity")]
    pub l1_capacity: usize,

    /// Number of independently locked L1 shards. 1 gives exact LRU order.
    #[serde(default = "default_l1_shards")]
    pub l1_shards: usize,

    /// Optional shared second level.
    #[serde(default)]
    pub shared: Option<SharedCacheConfig>,
}

fn default_true() -> bool {
    true
}

fn default_l1_capacity() -> usize {
    10_000
}

fn default_l1_shards() -> usize {
    16
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            l1_capacity: default_l1_capacity(),
            l1_shards: default_l1_shards(),
            shared: None,
        }
    }
}

/// Backend of the shared cache level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SharedCacheKind {
    Directory,
    Redis,
}

/// `[cache.shared]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SharedCacheConfig {
    pub kind: SharedCacheKind,

    /// Directory for the `directory` backend.
    #[serde(default)]
    pub path: Option<PathBuf>,

    /// Connection URL for the `redis` backend.
    #[serde(default)]
    pub url: Option<String>,

    /// Entry lifetime in seconds.
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
}

fn default_ttl_secs() -> u64 {
    3600
}

impl SharedCacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

/// `[checkpoint]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_checkpoint_dir")]
    pub dir: PathBuf,
}

fn default_checkpoint_dir() -> PathBuf {
    PathBuf::from("checkpoints")
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: default_checkpoint_dir(),
        }
    }
}

/// `[pools.<name>]` section: one fixed-size resource pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    #[serde(default = "default_pool_size")]
    pub size: usize,

    #[serde(default = "default_acquire_timeout")]
    pub acquire_timeout_secs: u64,

    /// Create every handle at startup instead of on first use.
    #[serde(default)]
    pub warm: bool,
}

fn default_pool_size() -> usize {
    3
}

fn default_acquire_timeout() -> u64 {
    30
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            size: default_pool_size(),
            acquire_timeout_secs: default_acquire_timeout(),
            warm: false,
        }
    }
}

impl PoolConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs)
    }
}

/// One `[[stages]]` entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageDescriptor {
    pub name: String,

    /// Pool whose handle the stage borrows while it runs.
    #[serde(default)]
    pub resource: Option<String>,

    #[serde(default = "default_true")]
    pub cacheable: bool,

    /// Restore this stage from a checkpoint instead of re-running it, and
    /// persist a checkpoint once it completes.
    #[serde(default)]
    pub skippable_if_checkpointed: bool,

    /// Overrides `[retry] max_attempts` for this stage.
    #[serde(default)]
    pub max_attempts: Option<u32>,

    /// Stage-specific parameters, deserialised into the stage's config type.
    #[serde(default)]
    pub config: toml::Table,
}

impl StageDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            resource: None,
            cacheable: true,
            skippable_if_checkpointed: false,
            max_attempts: None,
            config: toml::Table::new(),
        }
    }

    pub fn with_resource(mut self, pool: impl Into<String>) -> Self {
        self.resource = Some(pool.into());
        self
    }

    pub fn checkpointed(mut self) -> Self {
        self.skippable_if_checkpointed = true;
        self
    }

    pub fn uncached(mut self) -> Self {
        self.cacheable = false;
        self
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    pub fn with_config(mut self, config: toml::Table) -> Self {
        self.config = config;
        self
    }
}

/// Ordered, immutable stage list for one run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub stages: Vec<StageDescriptor>,
}

impl PipelineConfig {
    pub fn new(stages: Vec<StageDescriptor>) -> Self {
        Self { stages }
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.stages.iter().position(|s| s.name == name)
    }
}
