//! Task scheduling across the four execution strategies.
//!
//! Every strategy funnels through the same [`TaskExecutor`] and hands each
//! finished task to the statistics aggregator and the results collector.
//! Stage failures stay on their task; only cancellation ends a run early.

pub mod cancel;
pub mod executor;
pub mod processes;
mod strategies;


use std::sync::Arc;
use std::time::{Duration, Instant};

use sqlflow_core::{Strategy, Task};
use tracing::{error, info};

use crate::collector::{CollectedResults, ResultsCollector};
use crate::error::EngineError;
use crate::stats::StatsAggregator;

pub use cancel::CancelSignal;
pub use executor::{StageObserver, TaskExecutor, TaskRun};
pub use processes::WorkerCommand;

/// Outcome of [`Scheduler::run`].
#[derive(Debug)]
pub struct RunSummary {
    pub strategy: String,
    pub cancelled: bool,
    pub elapsed: Duration,
    pub results: CollectedResults,
}

impl RunSummary {
    pub fn failure_rate(&self) -> f64 {
        self.results.summary.failure_rate()
    }
}

pub struct Scheduler {
    executor: Arc<TaskExecutor>,
    collector: Arc<ResultsCollector>,
    stats: Arc<StatsAggregator>,
    cancel: CancelSignal,
    worker_command: Option<WorkerCommand>,
}

impl Scheduler {
    pub fn new(
        executor: Arc<TaskExecutor>,
        collector: Arc<ResultsCollector>,
        stats: Arc<StatsAggregator>,
        cancel: CancelSignal,
    ) -> Self {
        Self {
            executor,
            collector,
            stats,
            cancel,
            worker_command: None,
        }
    }

    /// Command used to launch children for [`Strategy::Processes`].
    pub fn with_worker_command(mut self, command: WorkerCommand) -> Self {
        self.worker_command = Some(command);
        self
    }

    pub fn cancel_signal(&self) -> CancelSignal {
        self.cancel.clone()
    }

    /// Run `tasks` to completion (or cancellation) and finalize the results.
    ///
    /// Blocks the calling thread; each strategy builds the runtimes it needs,
    /// so this must not be called from inside an async context.
    pub fn run(&self, tasks: Vec<Task>, strategy: &Strategy) -> Result<RunSummary, EngineError> {
        let started = Instant::now();
        let count = tasks.len();
        self.stats.set_total(count);
        info!(strategy = strategy.name(), tasks = count, "run starting");

        match strategy {
            Strategy::Sequential => strategies::sequential(self, tasks)?,
            Strategy::Threads { workers } => strategies::threads(self, tasks, *workers)?,
            Strategy::Cooperative { max_in_flight } => {
                strategies::cooperative(self, tasks, *max_in_flight)?
            }
            Strategy::Processes { workers } => {
                let command = self.worker_command.as_ref().ok_or_else(|| {
                    EngineError::Runtime("process strategy needs a worker command".into())
                })?;
                processes::run(self, command, tasks, *workers)?
            }
        }

        let results = self.collector.finalize()?;
        let summary = RunSummary {
            strategy: strategy.name().to_string(),
            cancelled: self.cancel.is_cancelled(),
            elapsed: started.elapsed(),
            results,
        };
        info!(
            strategy = %summary.strategy,
            elapsed_ms = summary.elapsed.as_millis() as u64,
            succeeded = summary.results.summary.succeeded,
            failed = summary.results.summary.failed,
            missing = summary.results.summary.missing,
            cancelled = summary.cancelled,
            "run finished"
        );
        Ok(summary)
    }

    /// Execute one task in-process unless the run was already cancelled.
    async fn execute_one(&self, task: Task) -> TaskRun {
        if self.cancel.is_cancelled() {
            return TaskRun::not_started(task);
        }
        self.stats.task_started();
        self.executor.execute(task, &self.cancel, &*self.stats).await
    }

    /// Feed a finished task to statistics and the collector. Its stage events
    /// were already counted as they happened.
    fn finish_task(&self, run: TaskRun) {
        if !run.was_started() {
            return;
        }
        self.stats.task_finished(&run.task);
        let task_id = run.task.id.clone();
        if let Err(e) = self.collector.record(run.task) {
            error!(task_id = %task_id, error = %e, "failed to record task result");
        }
    }
}

fn current_thread_runtime() -> Result<tokio::runtime::Runtime, EngineError> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| EngineError::Runtime(format!("failed to build tokio runtime: {e}")))
}
