//! Per-task persistence of completed stage results, so an interrupted run
//! can resume without redoing expensive stages.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlflow_core::Task;
use tracing::debug;

use crate::error::CheckpointError;

/// Snapshot of a task after its last checkpointed stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub task_id: String,
    pub last_completed_stage: String,
    pub state: Task,
    pub written_at: DateTime<Utc>,
}

impl CheckpointRecord {
    pub fn new(task: &Task, last_completed_stage: &str) -> Self {
        Self {
            task_id: task.id.clone(),
            last_completed_stage: last_completed_stage.to_string(),
            state: task.clone(),
            written_at: Utc::now(),
        }
    }
}

/// Durable map from task id to its latest checkpoint. Last write wins.
pub trait CheckpointStore: Send + Sync {
    fn load(&self, task_id: &str) -> Result<Option<CheckpointRecord>, CheckpointError>;

    fn save(&self, record: &CheckpointRecord) -> Result<(), CheckpointError>;

    fn remove(&self, task_id: &str) -> Result<(), CheckpointError>;

    /// Ids of every task with a checkpoint, sorted.
    fn list(&self) -> Result<Vec<String>, CheckpointError>;
}

// ── Filesystem store ────────────────────────────────────────────────

/// One pretty-printed JSON file per task id:
/// ```text
/// checkpoints/
///   1024.json
///   q_2F7.json      ← id "q/7"
/// ```
/// Saves write a unique temp file and rename it into place, so concurrent
/// saves of different ids never interfere and a crash never leaves a torn
/// record behind.
pub struct FileCheckpointStore {
    dir: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, CheckpointError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, task_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", encode_id(task_id)))
    }
}

impl CheckpointStore for FileCheckpointStore {
    fn load(&self, task_id: &str) -> Result<Option<CheckpointRecord>, CheckpointError> {
        let path = self.path_for(task_id);
        let json = match std::fs::read_to_string(&path) {
            Ok(json) => json,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let record = serde_json::from_str(&json)?;
        Ok(Some(record))
    }

    fn save(&self, record: &CheckpointRecord) -> Result<(), CheckpointError> {
        let path = self.path_for(&record.task_id);
        let tmp = self.dir.join(format!(
            ".{}.{}.tmp",
            encode_id(&record.task_id),
            uuid::Uuid::new_v4()
        ));
        let json = serde_json::to_string_pretty(record)?;
        std::fs::write(&tmp, json)?;
        if let Err(e) = std::fs::rename(&tmp, &path) {
            let _ = std::fs::remove_file(&tmp);
            return Err(e.into());
        }
        debug!(task_id = %record.task_id, stage = %record.last_completed_stage, "checkpoint saved");
        Ok(())
    }

    fn remove(&self, task_id: &str) -> Result<(), CheckpointError> {
        match std::fs::remove_file(self.path_for(task_id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn list(&self) -> Result<Vec<String>, CheckpointError> {
        let mut ids = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with('.') {
                continue;
            }
            if let Some(stem) = name.strip_suffix(".json") {
                if let Some(id) = decode_id(stem) {
                    ids.push(id);
                }
            }
        }
        ids.sort();
        Ok(ids)
    }
}

/// Map a task id onto a safe file stem. ASCII alphanumerics, `-` and `.`
/// pass through (except a leading `.`); every other byte becomes `_XX`.
fn encode_id(id: &str) -> String {
    let mut out = String::with_capacity(id.len());
    for (i, b) in id.bytes().enumerate() {
        let keep = b.is_ascii_alphanumeric() || b == b'-' || (b == b'.' && i > 0);
        if keep {
            out.push(b as char);
        } else {
            out.push_str(&format!("_{b:02X}"));
        }
    }
    out
}

fn decode_id(stem: &str) -> Option<String> {
    let bytes = stem.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'_' {
            let hex = stem.get(i + 1..i + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}

// ── In-memory store ─────────────────────────────────────────────────

/// Process-local store for tests and dry runs.
#[derive(Default)]
pub struct MemoryCheckpointStore {
    records: Mutex<HashMap<String, CheckpointRecord>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn records(&self) -> MutexGuard<'_, HashMap<String, CheckpointRecord>> {
        self.records.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn load(&self, task_id: &str) -> Result<Option<CheckpointRecord>, CheckpointError> {
        Ok(self.records().get(task_id).cloned())
    }

    fn save(&self, record: &CheckpointRecord) -> Result<(), CheckpointError> {
        self.records()
            .insert(record.task_id.clone(), record.clone());
        Ok(())
    }

    fn remove(&self, task_id: &str) -> Result<(), CheckpointError> {
        self.records().remove(task_id);
        Ok(())
    }

    fn list(&self) -> Result<Vec<String>, CheckpointError> {
        let mut ids: Vec<_> = self.records().keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }
}
