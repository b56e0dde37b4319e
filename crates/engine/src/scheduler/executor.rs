use std::sync::Arc;

use sqlflow_core::{FailureKind, StageRecord, Task, TaskFailure, TaskStateError, TaskStatus};
use tracing::{debug, info, warn};

use super::cancel::CancelSignal;
use crate::checkpoint::{CheckpointRecord, CheckpointStore};
use crate::stage::{BoundPipeline, StageEvent, StageRunner};
use crate::stats::StatsAggregator;

/// A task after the executor is done with it.
///
/// A task that comes back `Pending` was never started (the run was cancelled
/// first) and is left out of the results.
#[derive(Debug)]
pub struct TaskRun {
    pub task: Task,
}

impl TaskRun {
    pub fn not_started(task: Task) -> Self {
        Self { task }
    }

    pub fn was_started(&self) -> bool {
        self.task.status() != TaskStatus::Pending
    }
}

/// Receives every [`StageEvent`] as soon as its stage run ends, while the
/// task is still moving through the rest of the pipeline.
pub trait StageObserver: Send + Sync {
    fn stage_finished(&self, event: &StageEvent);
}

impl StageObserver for StatsAggregator {
    fn stage_finished(&self, event: &StageEvent) {
        self.observe(event);
    }
}

/// Drives one task through the whole pipeline. Shared by every strategy and
/// by worker processes.
pub struct TaskExecutor {
    pipeline: BoundPipeline,
    runner: StageRunner,
    checkpoints: Option<Arc<dyn CheckpointStore>>,
}

impl TaskExecutor {
    pub fn new(
        pipeline: BoundPipeline,
        runner: StageRunner,
        checkpoints: Option<Arc<dyn CheckpointStore>>,
    ) -> Self {
        Self {
            pipeline,
            runner,
            checkpoints,
        }
    }

    pub fn pipeline(&self) -> &BoundPipeline {
        &self.pipeline
    }

    pub fn runner(&self) -> &StageRunner {
        &self.runner
    }

    /// Restore from checkpoint, then run every remaining stage in order.
    ///
    /// Stage errors end up on the task, never as an `Err`: the task is marked
    /// failed and the caller moves on to the next one. `observer` sees each
    /// stage's event before the next stage starts.
    pub async fn execute(&self, mut task: Task, cancel: &CancelSignal, observer: &dyn StageObserver) -> TaskRun {
        if cancel.is_cancelled() && task.status() == TaskStatus::Pending {
            return TaskRun::not_started(task);
        }

        if task.status() == TaskStatus::Pending && task.history().is_empty() {
            self.restore(&mut task);
        }
        if let Err(e) = task.start() {
            warn!(task_id = %task.id, error = %e, "task cannot be started");
            return TaskRun { task };
        }

        let first = task.current_stage_index();
        let remaining = self.pipeline.stages().get(first..).unwrap_or_default();
        for stage in remaining {
            if cancel.is_cancelled() {
                let failure = TaskFailure::new(
                    FailureKind::Cancelled,
                    Some(stage.name()),
                    "run cancelled before stage started",
                );
                log_transition(task.fail(failure), &task.id);
                return TaskRun { task };
            }

            let run = self.runner.run(stage, &task.snapshot()).await;
            observer.stage_finished(&run.event);
            match run.result {
                Ok(record) => {
                    log_transition(task.record_stage(record), &task.id);
                    if stage.is_checkpointed() {
                        self.save_checkpoint(&task, stage.name());
                    }
                }
                Err(failure) => {
                    log_transition(task.record_stage(failure.record), &task.id);
                    log_transition(task.fail(failure.failure), &task.id);
                    return TaskRun { task };
                }
            }
        }

        log_transition(task.succeed(), &task.id);
        debug!(task_id = %task.id, elapsed_ms = task.elapsed_ms(), "task succeeded");
        TaskRun { task }
    }

    /// Seed `task` with the longest run of leading checkpointable stages
    /// found in its checkpoint. Anything after the first gap is re-run.
    fn restore(&self, task: &mut Task) {
        let Some(store) = &self.checkpoints else {
            return;
        };
        let record = match store.load(&task.id) {
            Ok(Some(record)) => record,
            Ok(None) => return,
            Err(e) => {
                warn!(task_id = %task.id, error = %e, "checkpoint unreadable, starting from scratch");
                return;
            }
        };
        if record.state.input != task.input {
            warn!(task_id = %task.id, "checkpoint was written for different inputs, ignoring it");
            return;
        }

        let restored: Vec<StageRecord> = self
            .pipeline
            .stages()
            .iter()
            .zip(record.state.history())
            .take_while(|(stage, saved)| {
                stage.is_checkpointed() && saved.stage == stage.name() && saved.is_success()
            })
            .map(|(_, saved)| saved.clone())
            .collect();
        if restored.is_empty() {
            return;
        }
        let count = restored.len();
        log_transition(task.restore(restored), &task.id);
        info!(task_id = %task.id, restored = count, last = %record.last_completed_stage, "resumed from checkpoint");
    }

    fn save_checkpoint(&self, task: &Task, stage: &str) {
        let Some(store) = &self.checkpoints else {
            return;
        };
        if let Err(e) = store.save(&CheckpointRecord::new(task, stage)) {
            warn!(task_id = %task.id, stage, error = %e, "checkpoint write failed");
        }
    }
}

/// The executor owns the task, so a rejected transition is an executor bug.
/// It is logged and the run continues.
fn log_transition(result: Result<(), TaskStateError>, task_id: &str) {
    if let Err(e) = result {
        warn!(task_id, error = %e, "unexpected task state transition");
    }
}
