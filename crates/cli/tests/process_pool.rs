//! Drives the real `sqlflow` binary, including the process strategy where
//! the binary re-launches itself as `sqlflow worker`.

use std::path::Path;
use std::process::{Command, Output};

use serde_json::{json, Value};

fn write_config(dir: &Path, strategy: &str, extra_generate: &str) -> std::path::PathBuf {
    let path = dir.join("sqlflow.toml");
    let config = format!(
        r#"
[run]
strategy = "{strategy}"
workers = 2
output_dir = {output:?}
flush_every = 2
progress_interval_secs = 0

[retry]
max_attempts = 3
initial_backoff_ms = 1
max_backoff_ms = 5

[checkpoint]
dir = {checkpoints:?}

[pools.model]
size = 1

[[stages]]
name = "render_prompt"
skippable_if_checkpointed = true

[[stages]]
name = "mock_generate"
resource = "model"
[stages.config]
candidates = 3
{extra_generate}

[[stages]]
name = "pick_answer"
"#,
        output = dir.join("results").display().to_string(),
        checkpoints = dir.join("checkpoints").display().to_string(),
    );
    std::fs::write(&path, config).unwrap();
    path
}

fn write_dataset(dir: &Path, questions: &[&str]) -> std::path::PathBuf {
    let entries: Vec<Value> = questions
        .iter()
        .enumerate()
        .map(|(i, q)| json!({ "question_id": format!("d{i}"), "db_id": "demo", "question": q }))
        .collect();
    let path = dir.join("dataset.json");
    std::fs::write(&path, serde_json::to_vec(&entries).unwrap()).unwrap();
    path
}

fn sqlflow(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_sqlflow"))
        .args(args)
        .env("RUST_LOG", "warn")
        .output()
        .expect("sqlflow binary runs")
}

fn final_results(dir: &Path) -> Vec<Value> {
    let text = std::fs::read_to_string(dir.join("results").join("results.json")).unwrap();
    let doc: Value = serde_json::from_str(&text).unwrap();
    doc["results"].as_array().unwrap().clone()
}

#[test]
fn process_strategy_runs_every_task_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path(), "process", "latency_ms = 5");
    let questions: Vec<String> = (0..8).map(|i| format!("question number {i}")).collect();
    let refs: Vec<&str> = questions.iter().map(String::as_str).collect();
    let dataset = write_dataset(dir.path(), &refs);

    let out = sqlflow(&[
        "run",
        "--config",
        config.to_str().unwrap(),
        "--dataset",
        dataset.to_str().unwrap(),
    ]);
    assert!(out.status.success(), "stderr: {}", String::from_utf8_lossy(&out.stderr));

    let results = final_results(dir.path());
    assert_eq!(results.len(), 8);
    for (i, entry) in results.iter().enumerate() {
        assert_eq!(entry["id"], format!("d{i}"));
        assert_eq!(entry["status"], "succeeded");
    }
    assert!(dir.path().join("results").join("statistics.json").exists());
}

#[test]
fn transient_model_failures_are_retried() {
    let dir = tempfile::tempdir().unwrap();
    // Every other call fails; a retry always lands on a good call.
    let config = write_config(dir.path(), "sequential", "fail_every = 2");
    let dataset = write_dataset(dir.path(), &["one", "two", "three"]);

    let out = sqlflow(&[
        "run",
        "--config",
        config.to_str().unwrap(),
        "--dataset",
        dataset.to_str().unwrap(),
    ]);
    assert!(out.status.success(), "stderr: {}", String::from_utf8_lossy(&out.stderr));
    let results = final_results(dir.path());
    assert!(results.iter().all(|r| r["status"] == "succeeded"));
}

#[test]
fn failure_rate_over_threshold_exits_non_zero() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path(), "thread", "");
    let dataset = write_dataset(dir.path(), &["", "  ", "fine"]);

    let out = sqlflow(&[
        "run",
        "--config",
        config.to_str().unwrap(),
        "--dataset",
        dataset.to_str().unwrap(),
    ]);
    assert!(!out.status.success());
    assert!(String::from_utf8_lossy(&out.stderr).contains("exceeds threshold"));

    let results = final_results(dir.path());
    assert_eq!(results[0]["status"], "failed");
    assert_eq!(results[2]["status"], "succeeded");
}

#[test]
fn check_config_rejects_unknown_stage() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path(), "sequential", "");
    let mut text = std::fs::read_to_string(&config).unwrap();
    text.push_str("\n[[stages]]\nname = \"execute_sql\"\n");
    std::fs::write(&config, text).unwrap();

    let out = sqlflow(&["check-config", "--config", config.to_str().unwrap()]);
    assert!(!out.status.success());
    assert!(String::from_utf8_lossy(&out.stderr).contains("execute_sql"));

    let ok = write_config(dir.path(), "sequential", "");
    let out = sqlflow(&["check-config", "--config", ok.to_str().unwrap()]);
    assert!(out.status.success());
    assert!(String::from_utf8_lossy(&out.stdout).contains("mock_generate"));
}
