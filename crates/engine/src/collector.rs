//! Ordered results collection.
//!
//! Tasks finish in any order; the collector slots each one at its dataset
//! index and streams the contiguous, fully-filled prefix to a
//! [`ResultSink`] so partial output is always in dataset order.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use serde::Serialize;
use sqlflow_core::{Task, TaskStatus};
use tracing::{debug, error, info, warn};

use crate::error::{CollectorError, SinkError};

/// Destination for finished tasks.
pub trait ResultSink: Send {
    /// Append tasks, already in index order.
    fn write_entries(&mut self, tasks: &[&Task]) -> Result<(), SinkError>;

    /// Called once by [`ResultsCollector::finalize`] after the last write.
    fn finish(&mut self, results: &CollectedResults) -> Result<(), SinkError>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ResultsSummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Slots with no recorded task (cancelled before start, or lost).
    pub missing: usize,
}

impl ResultsSummary {
    /// Share of the dataset that did not succeed, missing entries included.
    pub fn failure_rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            (self.failed + self.missing) as f64 / self.total as f64
        }
    }
}

/// Final output of a run, ordered by dataset index.
#[derive(Debug, Clone, Default)]
pub struct CollectedResults {
    pub entries: Vec<Option<Task>>,
    pub summary: ResultsSummary,
}

impl CollectedResults {
    fn from_entries(entries: Vec<Option<Task>>) -> Self {
        let mut summary = ResultsSummary {
            total: entries.len(),
            ..ResultsSummary::default()
        };
        for entry in &entries {
            match entry.as_ref().map(Task::status) {
                Some(TaskStatus::Succeeded) => summary.succeeded += 1,
                Some(_) => summary.failed += 1,
                None => summary.missing += 1,
            }
        }
        Self { entries, summary }
    }

    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.entries.iter().flatten()
    }

    pub fn get(&self, index: usize) -> Option<&Task> {
        self.entries.get(index).and_then(Option::as_ref)
    }

    pub fn missing_indices(&self) -> Vec<usize> {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.is_none())
            .map(|(i, _)| i)
            .collect()
    }
}

/// How far collection has got.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Completion {
    pub total: usize,
    pub recorded: usize,
    /// Entries already handed to the sink.
    pub flushed: usize,
    pub finalized: bool,
}

impl Completion {
    pub fn is_complete(&self) -> bool {
        self.recorded == self.total
    }
}

struct CollectorState {
    entries: Vec<Option<Task>>,
    recorded: usize,
    /// Entries `[0, flushed)` have been written.
    flushed: usize,
    finalized: bool,
    sink: Box<dyn ResultSink>,
}

pub struct ResultsCollector {
    size: usize,
    flush_every: usize,
    state: Mutex<CollectorState>,
}

impl ResultsCollector {
    pub fn new(size: usize, flush_every: usize, sink: Box<dyn ResultSink>) -> Self {
        Self {
            size,
            flush_every: flush_every.max(1),
            state: Mutex::new(CollectorState {
                entries: (0..size).map(|_| None).collect(),
                recorded: 0,
                flushed: 0,
                finalized: false,
                sink,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, CollectorState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Place a finished task at its index. Safe to call from any thread.
    ///
    /// Recording an index twice replaces the earlier entry; if the earlier one
    /// was already flushed, the replacement is appended straight away.
    pub fn record(&self, task: Task) -> Result<(), CollectorError> {
        let index = task.index;
        if index >= self.size {
            return Err(CollectorError::IndexOutOfRange {
                index,
                size: self.size,
            });
        }
        let mut state = self.state();
        if state.finalized {
            return Err(CollectorError::Finalized);
        }

        if state.entries[index].is_none() {
            state.recorded += 1;
        } else {
            debug!(index, task_id = %task.id, "replacing recorded result");
        }
        state.entries[index] = Some(task);

        if index < state.flushed {
            let state = &mut *state;
            if let Some(task) = state.entries[index].as_ref() {
                state.sink.write_entries(&[task])?;
            }
            return Ok(());
        }

        let mut end = state.flushed;
        while end < self.size && state.entries[end].is_some() {
            end += 1;
        }
        if end - state.flushed >= self.flush_every {
            Self::flush_prefix(&mut state, end)?;
        }
        Ok(())
    }

    fn flush_prefix(state: &mut CollectorState, end: usize) -> Result<(), SinkError> {
        let start = state.flushed;
        let batch: Vec<&Task> = state.entries[start..end].iter().flatten().collect();
        state.sink.write_entries(&batch)?;
        debug!(from = start, to = end, "flushed results");
        state.flushed = end;
        Ok(())
    }

    pub fn completion(&self) -> Completion {
        let state = self.state();
        Completion {
            total: self.size,
            recorded: state.recorded,
            flushed: state.flushed,
            finalized: state.finalized,
        }
    }

    /// Write every remaining entry (gaps left as missing), close the sink and
    /// hand back the ordered results. Further `record` calls fail.
    ///
    /// Sink errors are logged; the only error returned is a second call.
    pub fn finalize(&self) -> Result<CollectedResults, CollectorError> {
        let mut guard = self.state();
        let state = &mut *guard;
        if state.finalized {
            return Err(CollectorError::Finalized);
        }
        let start = state.flushed;
        let tail: Vec<&Task> = state.entries[start..].iter().flatten().collect();
        let tail_len = tail.len();
        // A sink failure costs the file output, never the in-memory results.
        if !tail.is_empty() {
            if let Err(e) = state.sink.write_entries(&tail) {
                error!(from = start, count = tail_len, error = %e, "failed to write remaining results");
            }
        }
        state.flushed = self.size;
        state.finalized = true;

        let results = CollectedResults::from_entries(std::mem::take(&mut state.entries));
        if let Err(e) = state.sink.finish(&results) {
            error!(error = %e, "failed to close results sink");
        }
        info!(
            total = results.summary.total,
            succeeded = results.summary.succeeded,
            failed = results.summary.failed,
            missing = results.summary.missing,
            tail = tail_len,
            "results finalized"
        );
        Ok(results)
    }
}

// ── JSONL sink ──────────────────────────────────────────────────────

pub const RESULTS_JSONL: &str = "results.jsonl";
pub const RESULTS_JSON: &str = "results.json";

/// Appends one JSON task per line to `results.jsonl` and writes the complete
/// ordered `results.json` on finish.
///
/// The JSONL file is opened in append mode, so a resumed run adds to what an
/// interrupted one left behind; [`read_jsonl`] resolves duplicates.
pub struct JsonlSink {
    dir: PathBuf,
    writer: BufWriter<File>,
}

impl JsonlSink {
    pub fn create(dir: impl Into<PathBuf>) -> Result<Self, SinkError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(RESULTS_JSONL))?;
        Ok(Self {
            dir,
            writer: BufWriter::new(file),
        })
    }

    pub fn jsonl_path(&self) -> PathBuf {
        self.dir.join(RESULTS_JSONL)
    }

    pub fn json_path(&self) -> PathBuf {
        self.dir.join(RESULTS_JSON)
    }
}

impl ResultSink for JsonlSink {
    fn write_entries(&mut self, tasks: &[&Task]) -> Result<(), SinkError> {
        for task in tasks {
            serde_json::to_writer(&mut self.writer, task)?;
            self.writer.write_all(b"\n")?;
        }
        self.writer.flush()?;
        Ok(())
    }

    fn finish(&mut self, results: &CollectedResults) -> Result<(), SinkError> {
        self.writer.flush()?;
        let doc = serde_json::json!({
            "metadata": {
                "total": results.summary.total,
                "succeeded": results.summary.succeeded,
                "failed": results.summary.failed,
                "missing": results.summary.missing,
                "written_at": Utc::now(),
            },
            "results": results.entries,
        });
        let path = self.json_path();
        let tmp = self.dir.join(format!(".{RESULTS_JSON}.{}.tmp", uuid::Uuid::new_v4()));
        std::fs::write(&tmp, serde_json::to_string_pretty(&doc)?)?;
        if let Err(e) = std::fs::rename(&tmp, &path) {
            let _ = std::fs::remove_file(&tmp);
            return Err(e.into());
        }
        info!(path = %path.display(), "results written");
        Ok(())
    }
}

/// Load a `results.jsonl`, keeping the last line written for each index.
/// Unparseable lines (e.g. a torn final write) are skipped with a warning.
pub fn read_jsonl(path: &Path) -> Result<Vec<Task>, SinkError> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut by_index = BTreeMap::new();
    for (n, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<Task>(&line) {
            Ok(task) => {
                by_index.insert(task.index, task);
            }
            Err(e) => warn!(path = %path.display(), line = n + 1, error = %e, "skipping bad results line"),
        }
    }
    Ok(by_index.into_values().collect())
}

// ── In-memory sink ──────────────────────────────────────────────────

/// What a [`MemorySink`] has seen, shared with the caller.
#[derive(Debug, Default)]
pub struct MemorySinkLog {
    /// Indices in the order they were written.
    pub written: Vec<usize>,
    /// Number of `write_entries` calls.
    pub batches: usize,
    pub finished: Option<ResultsSummary>,
}

/// Sink that records writes in memory; for tests and embedding.
#[derive(Clone, Default)]
pub struct MemorySink {
    log: Arc<Mutex<MemorySinkLog>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn log(&self) -> MutexGuard<'_, MemorySinkLog> {
        self.log.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl ResultSink for MemorySink {
    fn write_entries(&mut self, tasks: &[&Task]) -> Result<(), SinkError> {
        let mut log = self.log();
        log.batches += 1;
        log.written.extend(tasks.iter().map(|t| t.index));
        Ok(())
    }

    fn finish(&mut self, results: &CollectedResults) -> Result<(), SinkError> {
        self.log().finished = Some(results.summary.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlflow_core::{FailureKind, StageRecord, TaskFailure, TaskInput};
    use std::time::Duration;

    fn done(index: usize) -> Task {
        let mut task = Task::new(index, format!("q{index}"), TaskInput::new("q", "db"));
        task.start().unwrap();
        task.record_stage(StageRecord::completed("s", serde_json::json!(index), Duration::ZERO, 1))
            .unwrap();
        task.succeed().unwrap();
        task
    }

    fn failed(index: usize) -> Task {
        let mut task = Task::new(index, format!("q{index}"), TaskInput::new("q", "db"));
        task.start().unwrap();
        task.fail(TaskFailure::new(FailureKind::Stage, Some("s"), "boom"))
            .unwrap();
        task
    }

    #[test]
    fn flushes_contiguous_prefix_in_order() {
        let sink = MemorySink::new();
        let collector = ResultsCollector::new(5, 2, Box::new(sink.clone()));

        collector.record(done(1)).unwrap();
        collector.record(done(2)).unwrap();
        assert!(sink.log().written.is_empty(), "index 0 still missing");

        collector.record(done(0)).unwrap();
        assert_eq!(sink.log().written, vec![0, 1, 2]);

        collector.record(done(4)).unwrap();
        assert_eq!(collector.completion().flushed, 3);

        let results = collector.finalize().unwrap();
        assert_eq!(sink.log().written, vec![0, 1, 2, 4]);
        assert_eq!(results.summary.missing, 1);
        assert_eq!(results.missing_indices(), vec![3]);
        assert_eq!(sink.log().finished.as_ref().unwrap().succeeded, 4);
    }

    #[test]
    fn out_of_order_records_end_up_ordered() {
        let collector = ResultsCollector::new(4, 10, Box::new(MemorySink::new()));
        for i in [3, 0, 2, 1] {
            collector.record(if i == 2 { failed(i) } else { done(i) }).unwrap();
        }
        assert!(collector.completion().is_complete());
        let results = collector.finalize().unwrap();
        let order: Vec<usize> = results.tasks().map(|t| t.index).collect();
        assert_eq!(order, vec![0, 1, 2, 3]);
        assert_eq!(results.summary.failed, 1);
        assert!((results.summary.failure_rate() - 0.25).abs() < 1e-9);
    }

    #[test]
    fn rejects_out_of_range_and_after_finalize() {
        let collector = ResultsCollector::new(1, 1, Box::new(MemorySink::new()));
        assert!(matches!(
            collector.record(done(5)),
            Err(CollectorError::IndexOutOfRange { index: 5, size: 1 })
        ));
        collector.finalize().unwrap();
        assert!(matches!(collector.record(done(0)), Err(CollectorError::Finalized)));
        assert!(matches!(collector.finalize(), Err(CollectorError::Finalized)));
    }

    #[test]
    fn rerecording_a_flushed_index_appends_replacement() {
        let sink = MemorySink::new();
        let collector = ResultsCollector::new(2, 1, Box::new(sink.clone()));
        collector.record(failed(0)).unwrap();
        collector.record(done(0)).unwrap();
        assert_eq!(sink.log().written, vec![0, 0]);
        assert_eq!(collector.completion().recorded, 1);

        let results = collector.finalize().unwrap();
        assert_eq!(results.get(0).unwrap().status(), TaskStatus::Succeeded);
    }

    /// Every write fails, as on a full disk.
    struct FullDisk;

    impl ResultSink for FullDisk {
        fn write_entries(&mut self, _tasks: &[&Task]) -> Result<(), SinkError> {
            Err(std::io::Error::other("no space left on device").into())
        }

        fn finish(&mut self, _results: &CollectedResults) -> Result<(), SinkError> {
            Err(std::io::Error::other("no space left on device").into())
        }
    }

    #[test]
    fn finalize_returns_results_when_sink_fails() {
        let collector = ResultsCollector::new(3, 10, Box::new(FullDisk));
        collector.record(done(0)).unwrap();
        collector.record(failed(2)).unwrap();

        let results = collector.finalize().unwrap();
        assert_eq!(results.summary.total, 3);
        assert_eq!(results.summary.succeeded, 1);
        assert_eq!(results.summary.failed, 1);
        assert_eq!(results.missing_indices(), vec![1]);
        assert!(collector.completion().finalized);
        assert!(matches!(collector.record(done(1)), Err(CollectorError::Finalized)));
    }

    #[test]
    fn concurrent_recording() {
        let sink = MemorySink::new();
        let collector = Arc::new(ResultsCollector::new(200, 7, Box::new(sink.clone())));
        std::thread::scope(|s| {
            for offset in 0..4 {
                let collector = Arc::clone(&collector);
                s.spawn(move || {
                    for i in (offset..200).step_by(4) {
                        collector.record(done(i)).unwrap();
                    }
                });
            }
        });
        collector.finalize().unwrap();
        let written = sink.log().written.clone();
        assert_eq!(written, (0..200).collect::<Vec<_>>());
    }

    #[test]
    fn jsonl_sink_round_trip_and_dedupe() {
        let dir = tempfile::tempdir().unwrap();

        // An interrupted run wrote index 0 (failed) and half a line.
        {
            let mut sink = JsonlSink::create(dir.path()).unwrap();
            sink.write_entries(&[&failed(0)]).unwrap();
            let mut f = OpenOptions::new().append(true).open(sink.jsonl_path()).unwrap();
            f.write_all(b"{\"index\": 1, \"id\"\n").unwrap();
        }

        let collector = ResultsCollector::new(2, 1, Box::new(JsonlSink::create(dir.path()).unwrap()));
        collector.record(done(0)).unwrap();
        collector.record(done(1)).unwrap();
        collector.finalize().unwrap();

        let tasks = read_jsonl(&dir.path().join(RESULTS_JSONL)).unwrap();
        assert_eq!(tasks.len(), 2);
        assert!(tasks.iter().all(|t| t.status() == TaskStatus::Succeeded));

        let doc: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(dir.path().join(RESULTS_JSON)).unwrap()).unwrap();
        assert_eq!(doc["metadata"]["succeeded"], 2);
        assert_eq!(doc["results"][1]["id"], "q1");
    }

    #[test]
    fn results_json_marks_missing_as_null() {
        let dir = tempfile::tempdir().unwrap();
        let collector = ResultsCollector::new(2, 1, Box::new(JsonlSink::create(dir.path()).unwrap()));
        collector.record(done(1)).unwrap();
        collector.finalize().unwrap();

        let doc: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(dir.path().join(RESULTS_JSON)).unwrap()).unwrap();
        assert!(doc["results"][0].is_null());
        assert_eq!(doc["metadata"]["missing"], 1);
    }

    #[test]
    fn read_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(read_jsonl(&dir.path().join("nope.jsonl")).unwrap().is_empty());
    }
}
