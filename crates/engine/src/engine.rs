//! Assembles one run's components from a [`RunConfig`].
//!
//! Everything a run touches (pools, cache, checkpoint store, statistics) is
//! an explicit instance owned by the [`Engine`]; nothing is process-global.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use sqlflow_core::{ConfigError, RunConfig, StrategyKind, Task};
use tracing::{error, info, warn};

use crate::cache::{build_shared_cache, CacheStats, L1Cache, MultiLevelCache, SharedCache};
use crate::checkpoint::{CheckpointStore, FileCheckpointStore};
use crate::collector::{JsonlSink, ResultSink, ResultsCollector};
use crate::error::EngineError;
use crate::pool::{PoolStats, ResourceFactory, ResourcePools};
use crate::progress::{LogProgress, ProgressReporter, ProgressSink};
use crate::scheduler::{CancelSignal, RunSummary, Scheduler, TaskExecutor, WorkerCommand};
use crate::stage::{RetryPolicy, Stage, StageRegistry, StageRunner};
use crate::stats::StatsAggregator;
use crate::worker;

pub struct EngineBuilder {
    config: RunConfig,
    registry: StageRegistry,
    factories: HashMap<String, Arc<dyn ResourceFactory>>,
    checkpoints: Option<Arc<dyn CheckpointStore>>,
    shared_cache: Option<Arc<dyn SharedCache>>,
    progress: Arc<dyn ProgressSink>,
}

impl EngineBuilder {
    pub fn stage<S: Stage>(mut self, stage: S) -> Self {
        self.registry.register(stage);
        self
    }

    /// Factory for the pool configured under `[pools.<name>]`.
    pub fn resource(mut self, name: impl Into<String>, factory: Arc<dyn ResourceFactory>) -> Self {
        self.factories.insert(name.into(), factory);
        self
    }

    /// Use this store instead of the `[checkpoint] dir` file store.
    pub fn checkpoint_store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoints = Some(store);
        self
    }

    /// Use this L2 backend instead of the one described by `[cache.shared]`.
    pub fn shared_cache(mut self, cache: Arc<dyn SharedCache>) -> Self {
        self.shared_cache = Some(cache);
        self
    }

    pub fn progress_sink(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.progress = sink;
        self
    }

    /// Validate the config, bind every stage and create the run's components.
    pub fn build(self) -> Result<Engine, EngineError> {
        let config = self.config;
        config.validate()?;

        let retry = RetryPolicy::from_config(&config.retry);
        let pipeline = self.registry.bind(&config.pipeline(), &retry)?;
        let pools = Arc::new(ResourcePools::from_config(&config.pools, self.factories)?);

        let cache = if config.cache.enabled {
            let l1 = L1Cache::new(config.cache.l1_capacity, config.cache.l1_shards);
            let shared = match (self.shared_cache, &config.cache.shared) {
                (Some(cache), _) => Some(cache),
                (None, Some(shared)) => Some(build_shared_cache(shared)?),
                (None, None) => None,
            };
            let ttl = config
                .cache
                .shared
                .as_ref()
                .map(|s| s.ttl())
                .unwrap_or(Duration::from_secs(3600));
            Some(Arc::new(MultiLevelCache::new(l1, shared, ttl)))
        } else {
            None
        };

        let checkpoints: Option<Arc<dyn CheckpointStore>> = match (config.checkpoint.enabled, self.checkpoints) {
            (false, _) => None,
            (true, Some(store)) => Some(store),
            (true, None) => Some(Arc::new(FileCheckpointStore::new(&config.checkpoint.dir)?)),
        };

        let stats = Arc::new(StatsAggregator::new(pipeline.names().as_slice()));
        let runner = StageRunner::new(Arc::clone(&pools), cache.clone(), config.retry.call_timeout());
        let executor = Arc::new(TaskExecutor::new(pipeline, runner, checkpoints));

        info!(
            stages = executor.pipeline().len(),
            pools = config.pools.len(),
            cache = cache.is_some(),
            checkpoints = config.checkpoint.enabled,
            strategy = config.run.strategy().name(),
            "engine ready"
        );

        Ok(Engine {
            config,
            pools,
            cache,
            stats,
            executor,
            cancel: CancelSignal::new(),
            progress: self.progress,
        })
    }
}

pub struct Engine {
    config: RunConfig,
    pools: Arc<ResourcePools>,
    cache: Option<Arc<MultiLevelCache>>,
    stats: Arc<StatsAggregator>,
    executor: Arc<TaskExecutor>,
    cancel: CancelSignal,
    progress: Arc<dyn ProgressSink>,
}

impl Engine {
    pub fn builder(config: RunConfig) -> EngineBuilder {
        EngineBuilder {
            config,
            registry: StageRegistry::new(),
            factories: HashMap::new(),
            checkpoints: None,
            shared_cache: None,
            progress: Arc::new(LogProgress),
        }
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Trigger to stop the run gracefully, e.g. from a Ctrl-C handler.
    pub fn cancel_signal(&self) -> CancelSignal {
        self.cancel.clone()
    }

    pub fn stats(&self) -> Arc<StatsAggregator> {
        Arc::clone(&self.stats)
    }

    pub fn pool_stats(&self) -> Vec<PoolStats> {
        self.pools.stats()
    }

    pub fn cache_stats(&self) -> Option<CacheStats> {
        self.cache.as_ref().map(|c| c.stats())
    }

    /// Run `tasks`, writing `results.jsonl`, `results.json` and
    /// `statistics.json` under `[run] output_dir`. Blocking.
    pub fn run(&self, tasks: Vec<Task>) -> Result<RunSummary, EngineError> {
        let sink = JsonlSink::create(&self.config.run.output_dir)?;
        let summary = self.run_with_sink(tasks, Box::new(sink))?;

        let path = self.config.statistics_path();
        match self.stats.snapshot().write_json(&path) {
            Ok(()) => info!(path = %path.display(), "statistics written"),
            Err(e) => warn!(path = %path.display(), error = %e, "failed to write statistics"),
        }
        Ok(summary)
    }

    /// Run `tasks` into a caller-supplied sink. Blocking.
    pub fn run_with_sink(&self, tasks: Vec<Task>, sink: Box<dyn ResultSink>) -> Result<RunSummary, EngineError> {
        let size = tasks
            .iter()
            .map(|t| t.index + 1)
            .max()
            .unwrap_or(0)
            .max(tasks.len());
        let strategy = self.config.run.strategy();

        self.stats.reset();
        if self.pools.has_warm_pools() && self.config.run.strategy != StrategyKind::Process {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .map_err(|e| EngineError::Runtime(e.to_string()))?;
            runtime.block_on(self.pools.warm_up())?;
        }

        let collector = Arc::new(ResultsCollector::new(size, self.config.run.flush_every, sink));
        let mut scheduler = Scheduler::new(
            Arc::clone(&self.executor),
            collector,
            Arc::clone(&self.stats),
            self.cancel.clone(),
        );
        if self.config.run.strategy == StrategyKind::Process {
            scheduler = scheduler.with_worker_command(self.worker_command()?);
        }

        let reporter = self
            .config
            .run
            .progress_interval()
            .map(|every| ProgressReporter::start(Arc::clone(&self.stats), every, Arc::clone(&self.progress)));
        let result = scheduler.run(tasks, &strategy);
        if let Some(reporter) = reporter {
            reporter.stop();
        }
        result
    }

    /// Serve tasks from a coordinator over stdin/stdout until told to stop.
    /// This is the body of `sqlflow worker`. Blocking.
    pub fn serve_worker(&self) -> Result<(), EngineError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| EngineError::Runtime(e.to_string()))?;
        let result = runtime.block_on(async {
            if let Err(e) = self.pools.warm_up().await {
                error!(error = %e, "worker pool warm-up failed");
                worker::report_fatal(&e.to_string()).await?;
                return Err(EngineError::from(e));
            }
            worker::serve_stdio(Arc::clone(&self.executor)).await?;
            Ok::<(), EngineError>(())
        });
        // A stdin read may still be parked on the blocking pool.
        runtime.shutdown_timeout(Duration::from_millis(100));
        result
    }

    /// `run.worker_command` if set, otherwise this executable re-invoked as
    /// `worker --config <the config this engine was loaded from>`.
    fn worker_command(&self) -> Result<WorkerCommand, EngineError> {
        if let Some(argv) = &self.config.run.worker_command {
            return WorkerCommand::from_argv(argv)
                .ok_or_else(|| ConfigError::Invalid("run.worker_command must not be empty".into()).into());
        }
        let Some(config_path) = &self.config.source_path else {
            return Err(ConfigError::Invalid(
                "process strategy needs a config file or run.worker_command".into(),
            )
            .into());
        };
        let exe = std::env::current_exe()
            .map_err(|e| EngineError::Runtime(format!("cannot locate current executable: {e}")))?;
        Ok(WorkerCommand::new(
            exe,
            vec![
                "worker".to_string(),
                "--config".to_string(),
                config_path.display().to_string(),
            ],
        ))
    }
}
