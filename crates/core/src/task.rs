use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::TaskStateError;

/// Immutable inputs of one dataset entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskInput {
    /// Natural-language question as it appears in the dataset.
    pub question: String,
    /// Supporting hint text; empty when the dataset has none.
    #[serde(default)]
    pub evidence: String,
    /// Target database identifier.
    pub db_id: String,
    /// Reference answer, when the dataset carries one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ground_truth: Option<String>,
    /// Any additional dataset fields, passed through to stages untouched.
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub extra: serde_json::Map<String, Value>,
}

impl TaskInput {
    pub fn new(question: impl Into<String>, db_id: impl Into<String>) -> Self {
        Self {
            question: question.into(),
            evidence: String::new(),
            db_id: db_id.into(),
            ground_truth: None,
            extra: serde_json::Map::new(),
        }
    }

    pub fn with_evidence(mut self, evidence: impl Into<String>) -> Self {
        self.evidence = evidence.into();
        self
    }

    pub fn with_ground_truth(mut self, sql: impl Into<String>) -> Self {
        self.ground_truth = Some(sql.into());
        self
    }

    /// Question and evidence joined the way prompts consume them.
    pub fn full_question(&self) -> String {
        format!("{} {}", self.question, self.evidence).trim().to_string()
    }
}

/// Lifecycle state of a task: `Pending → Running → {Succeeded, Failed}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Succeeded | TaskStatus::Failed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Succeeded => "succeeded",
            TaskStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// How a single stage result came to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    /// The stage function ran and returned a value.
    Completed,
    /// The value was served from cache without invoking the stage.
    Cached,
    /// The value was restored from a checkpoint of an earlier run.
    Restored,
    /// The stage failed; `output` carries the error description.
    Failed,
}

/// One entry of a task's execution history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageRecord {
    pub stage: String,
    pub output: Value,
    pub recorded_at: DateTime<Utc>,
    pub status: StageStatus,
    #[serde(default)]
    pub elapsed_ms: u64,
    #[serde(default)]
    pub attempts: u32,
}

impl StageRecord {
    pub fn completed(stage: &str, output: Value, elapsed: Duration, attempts: u32) -> Self {
        Self::new(stage, output, StageStatus::Completed, elapsed, attempts)
    }

    pub fn cached(stage: &str, output: Value, elapsed: Duration) -> Self {
        Self::new(stage, output, StageStatus::Cached, elapsed, 0)
    }

    pub fn failed(stage: &str, message: &str, elapsed: Duration, attempts: u32) -> Self {
        let output = serde_json::json!({ "error": message });
        Self::new(stage, output, StageStatus::Failed, elapsed, attempts)
    }

    fn new(stage: &str, output: Value, status: StageStatus, elapsed: Duration, attempts: u32) -> Self {
        Self {
            stage: stage.to_string(),
            output,
            recorded_at: Utc::now(),
            status,
            elapsed_ms: elapsed.as_millis() as u64,
            attempts,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status != StageStatus::Failed
    }
}

/// Category of a terminal task failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// A stage returned a permanent error or exhausted its retries.
    Stage,
    /// No pooled resource became available in time.
    PoolTimeout,
    /// A pooled resource could not be created.
    Resource,
    /// The run was cancelled while the task was mid-pipeline.
    Cancelled,
    /// The worker process running the task died or misbehaved.
    Worker,
}

/// Terminal failure attached to a task, with the captured error description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskFailure {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    pub kind: FailureKind,
    pub message: String,
}

impl TaskFailure {
    pub fn new(kind: FailureKind, stage: Option<&str>, message: impl Into<String>) -> Self {
        Self {
            stage: stage.map(str::to_string),
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.stage {
            Some(stage) => write!(f, "{:?} failure at stage '{}': {}", self.kind, stage, self.message),
            None => write!(f, "{:?} failure: {}", self.kind, self.message),
        }
    }
}

/// What a stage sees of a task: its inputs plus the outputs of earlier stages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub task_id: String,
    pub input: TaskInput,
    /// Successful outputs of the stages already run, keyed by stage name.
    pub prior: BTreeMap<String, Value>,
}

impl TaskSnapshot {
    /// The part of the snapshot that determines a stage's result.
    ///
    /// The task id is excluded so identical inputs share cache entries.
    pub fn cache_material(&self) -> Value {
        serde_json::json!({
            "input": self.input,
            "prior": self.prior,
        })
    }

    pub fn prior_output(&self, stage: &str) -> Option<&Value> {
        self.prior.get(stage)
    }
}

/// One dataset entry flowing through the pipeline.
///
/// The execution history is append-only: records are only ever pushed via
/// [`Task::record_stage`] or seeded once via [`Task::restore`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Position in the original dataset; final output is ordered by this.
    pub index: usize,
    /// Stable identifier across runs; checkpoints are keyed by it.
    pub id: String,
    pub input: TaskInput,
    history: Vec<StageRecord>,
    current_stage_index: usize,
    status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    failure: Option<TaskFailure>,
}

impl Task {
    pub fn new(index: usize, id: impl Into<String>, input: TaskInput) -> Self {
        Self {
            index,
            id: id.into(),
            input,
            history: Vec::new(),
            current_stage_index: 0,
            status: TaskStatus::Pending,
            failure: None,
        }
    }

    pub fn history(&self) -> &[StageRecord] {
        &self.history
    }

    pub fn current_stage_index(&self) -> usize {
        self.current_stage_index
    }

    pub fn status(&self) -> TaskStatus {
        self.status
    }

    pub fn failure(&self) -> Option<&TaskFailure> {
        self.failure.as_ref()
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Output of the most recent successful stage.
    pub fn last_output(&self) -> Option<&Value> {
        self.history
            .iter()
            .rev()
            .find(|r| r.is_success())
            .map(|r| &r.output)
    }

    pub fn stage_output(&self, stage: &str) -> Option<&Value> {
        self.history
            .iter()
            .rev()
            .find(|r| r.stage == stage && r.is_success())
            .map(|r| &r.output)
    }

    /// Total wall time spent in stages, including cache hits.
    pub fn elapsed_ms(&self) -> u64 {
        self.history.iter().map(|r| r.elapsed_ms).sum()
    }

    pub fn snapshot(&self) -> TaskSnapshot {
        let prior = self
            .history
            .iter()
            .filter(|r| r.is_success())
            .map(|r| (r.stage.clone(), r.output.clone()))
            .collect();
        TaskSnapshot {
            task_id: self.id.clone(),
            input: self.input.clone(),
            prior,
        }
    }

    /// Seed a pending task with stage results recovered from a checkpoint.
    ///
    /// Only valid before the task has started and before any history exists.
    pub fn restore(&mut self, records: Vec<StageRecord>) -> Result<(), TaskStateError> {
        if self.status != TaskStatus::Pending || !self.history.is_empty() {
            return Err(TaskStateError::NotRunning {
                task_id: self.id.clone(),
                status: self.status.to_string(),
            });
        }
        self.history = records
            .into_iter()
            .map(|mut r| {
                r.status = StageStatus::Restored;
                r
            })
            .collect();
        self.current_stage_index = self.history.len();
        Ok(())
    }

    pub fn start(&mut self) -> Result<(), TaskStateError> {
        match self.status {
            TaskStatus::Pending => {
                self.status = TaskStatus::Running;
                Ok(())
            }
            TaskStatus::Running => Ok(()),
            status => Err(self.terminal_error(status)),
        }
    }

    /// Append a stage result. Successful records advance the stage cursor.
    pub fn record_stage(&mut self, record: StageRecord) -> Result<(), TaskStateError> {
        if self.status != TaskStatus::Running {
            return Err(TaskStateError::NotRunning {
                task_id: self.id.clone(),
                status: self.status.to_string(),
            });
        }
        if record.is_success() {
            self.current_stage_index += 1;
        }
        self.history.push(record);
        Ok(())
    }

    pub fn succeed(&mut self) -> Result<(), TaskStateError> {
        match self.status {
            TaskStatus::Running => {
                self.status = TaskStatus::Succeeded;
                Ok(())
            }
            TaskStatus::Pending => Err(TaskStateError::NotRunning {
                task_id: self.id.clone(),
                status: self.status.to_string(),
            }),
            status => Err(self.terminal_error(status)),
        }
    }

    /// Mark the task failed. A pending task may fail directly (e.g. it was
    /// never dispatched because its worker died).
    pub fn fail(&mut self, failure: TaskFailure) -> Result<(), TaskStateError> {
        if self.status.is_terminal() {
            return Err(self.terminal_error(self.status));
        }
        self.status = TaskStatus::Failed;
        self.failure = Some(failure);
        Ok(())
    }

    fn terminal_error(&self, status: TaskStatus) -> TaskStateError {
        TaskStateError::Terminal {
            task_id: self.id.clone(),
            status: status.to_string(),
        }
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let question: String = self.input.question.chars().take(50).collect();
        write!(f, "Task({}, {}, '{}')", self.id, self.input.db_id, question)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Task {
        Task::new(0, "q0", TaskInput::new("How many singers?", "concert_singer"))
    }

    #[test]
    fn lifecycle_happy_path() {
        let mut task = sample();
        assert_eq!(task.status(), TaskStatus::Pending);

        task.start().unwrap();
        task.record_stage(StageRecord::completed("a", json!(1), Duration::from_millis(5), 1))
            .unwrap();
        task.record_stage(StageRecord::cached("b", json!(2), Duration::ZERO))
            .unwrap();
        task.succeed().unwrap();

        assert_eq!(task.status(), TaskStatus::Succeeded);
        assert_eq!(task.current_stage_index(), 2);
        assert_eq!(task.last_output(), Some(&json!(2)));
        assert_eq!(task.stage_output("a"), Some(&json!(1)));
        assert_eq!(task.elapsed_ms(), 5);
    }

    #[test]
    fn terminal_states_are_final() {
        let mut task = sample();
        task.start().unwrap();
        task.fail(TaskFailure::new(FailureKind::Stage, Some("a"), "boom"))
            .unwrap();

        assert!(task.start().is_err());
        assert!(task.succeed().is_err());
        assert!(task
            .fail(TaskFailure::new(FailureKind::Stage, None, "again"))
            .is_err());
        assert_eq!(task.failure().unwrap().message, "boom");
    }

    #[test]
    fn record_requires_running() {
        let mut task = sample();
        let err = task
            .record_stage(StageRecord::completed("a", json!(1), Duration::ZERO, 1))
            .unwrap_err();
        assert!(matches!(err, TaskStateError::NotRunning { .. }));
    }

    #[test]
    fn failed_record_does_not_advance_cursor() {
        let mut task = sample();
        task.start().unwrap();
        task.record_stage(StageRecord::failed("a", "rate limited", Duration::ZERO, 3))
            .unwrap();
        assert_eq!(task.current_stage_index(), 0);
        assert!(task.last_output().is_none());
        assert_eq!(task.history()[0].output, json!({ "error": "rate limited" }));
    }

    #[test]
    fn restore_marks_records_restored() {
        let mut task = sample();
        let records = vec![StageRecord::completed("a", json!("x"), Duration::ZERO, 1)];
        task.restore(records).unwrap();

        assert_eq!(task.current_stage_index(), 1);
        assert_eq!(task.history()[0].status, StageStatus::Restored);
        // Second restore is rejected: history is append-only.
        assert!(task.restore(Vec::new()).is_err());
    }

    #[test]
    fn snapshot_excludes_failed_and_task_id_from_cache_material() {
        let mut a = sample();
        let mut b = Task::new(7, "q7", a.input.clone());
        for t in [&mut a, &mut b] {
            t.start().unwrap();
            t.record_stage(StageRecord::completed("s", json!({"k": 1}), Duration::ZERO, 1))
                .unwrap();
        }
        a.record_stage(StageRecord::failed("t", "nope", Duration::ZERO, 1))
            .unwrap();

        let sa = a.snapshot();
        assert_eq!(sa.prior.len(), 1);
        assert_eq!(sa.cache_material(), b.snapshot().cache_material());
    }

    #[test]
    fn full_question_joins_evidence() {
        let input = TaskInput::new("Count rows", "db").with_evidence("table is t");
        assert_eq!(input.full_question(), "Count rows table is t");
        assert_eq!(TaskInput::new("Q", "db").full_question(), "Q");
    }

    #[test]
    fn task_serde_round_trip_keeps_state() {
        let mut task = sample();
        task.start().unwrap();
        task.record_stage(StageRecord::completed("a", json!([1, 2]), Duration::ZERO, 1))
            .unwrap();
        let json = serde_json::to_string(&task).unwrap();
        let back: Task = serde_json::from_str(&json).unwrap();
        assert_eq!(back.status(), TaskStatus::Running);
        assert_eq!(back.history(), task.history());
    }
}
