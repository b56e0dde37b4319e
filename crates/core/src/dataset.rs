use std::path::Path;

use serde_json::{Map, Value};
use tracing::info;

use crate::error::DatasetError;
use crate::task::{Task, TaskInput};

/// Keys consumed into [`TaskInput`] fields; everything else lands in `extra`.
const KNOWN_KEYS: &[&str] = &["question_id", "question", "evidence", "db_id", "SQL", "sql"];

/// Read a JSON array of dataset entries and turn `[start, end)` into tasks.
///
/// Task indices are positions within the selected slice, so results are
/// ordered and sized by the slice. Task ids come from `question_id`, falling
/// back to the entry's position in the full file so ids stay stable when the
/// slice changes.
pub fn load_json_dataset(
    path: impl AsRef<Path>,
    start: usize,
    end: Option<usize>,
) -> Result<Vec<Task>, DatasetError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path)?;
    let entries: Vec<Value> = serde_json::from_str(&content)?;
    let total = entries.len();
    let tasks = tasks_from_entries(entries, start, end)?;
    info!(
        path = %path.display(),
        total,
        selected = tasks.len(),
        "loaded dataset"
    );
    Ok(tasks)
}

/// Convert already-parsed entries into tasks; see [`load_json_dataset`].
pub fn tasks_from_entries(
    entries: Vec<Value>,
    start: usize,
    end: Option<usize>,
) -> Result<Vec<Task>, DatasetError> {
    let end = end.unwrap_or(entries.len()).min(entries.len());
    let start = start.min(end);

    entries
        .into_iter()
        .enumerate()
        .skip(start)
        .take(end - start)
        .enumerate()
        .map(|(slot, (position, entry))| parse_entry(slot, position, entry))
        .collect()
}

fn parse_entry(slot: usize, position: usize, entry: Value) -> Result<Task, DatasetError> {
    let Value::Object(mut obj) = entry else {
        return Err(DatasetError::Entry {
            index: position,
            message: "expected a JSON object".into(),
        });
    };

    let question = required_str(&obj, "question", position)?;
    let db_id = required_str(&obj, "db_id", position)?;
    let evidence = obj
        .get("evidence")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .trim()
        .to_string();
    let ground_truth = obj
        .get("SQL")
        .or_else(|| obj.get("sql"))
        .and_then(Value::as_str)
        .map(str::to_string);
    let id = match obj.get("question_id") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        Some(Value::Null) | None => position.to_string(),
        Some(other) => {
            return Err(DatasetError::Entry {
                index: position,
                message: format!("question_id must be a string or number, got {other}"),
            })
        }
    };

    obj.retain(|k, _| !KNOWN_KEYS.contains(&k.as_str()));
    let extra: Map<String, Value> = obj;

    let input = TaskInput {
        question,
        evidence,
        db_id,
        ground_truth,
        extra,
    };
    Ok(Task::new(slot, id, input))
}

fn required_str(obj: &Map<String, Value>, key: &str, index: usize) -> Result<String, DatasetError> {
    obj.get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| DatasetError::Entry {
            index,
            message: format!("missing string field '{key}'"),
        })
}
