//! Run-wide counters fed by stage events and task completions.
//!
//! Observers only touch atomics (plus a read lock to find a stage's
//! counters), so `snapshot()` never stalls workers.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlflow_core::{FailureKind, Task, TaskStatus};

use crate::cache::CacheLevel;
use crate::error::SinkError;
use crate::stage::{CacheProbe, StageEvent, StageEventOutcome};

/// Upper bounds (inclusive, ms) of the latency histogram buckets. A final
/// overflow bucket catches everything slower.
pub const LATENCY_BUCKETS_MS: [u64; 11] = [10, 50, 100, 250, 500, 1_000, 2_500, 5_000, 10_000, 30_000, 60_000];

const BUCKETS: usize = LATENCY_BUCKETS_MS.len() + 1;

// ── Histogram ───────────────────────────────────────────────────────

#[derive(Default)]
struct Histogram {
    buckets: [AtomicU64; BUCKETS],
    count: AtomicU64,
    sum_ms: AtomicU64,
    max_ms: AtomicU64,
}

impl Histogram {
    fn record(&self, ms: u64) {
        let bucket = LATENCY_BUCKETS_MS
            .iter()
            .position(|&le| ms <= le)
            .unwrap_or(BUCKETS - 1);
        self.buckets[bucket].fetch_add(1, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum_ms.fetch_add(ms, Ordering::Relaxed);
        self.max_ms.fetch_max(ms, Ordering::Relaxed);
    }

    fn reset(&self) {
        for b in &self.buckets {
            b.store(0, Ordering::Relaxed);
        }
        self.count.store(0, Ordering::Relaxed);
        self.sum_ms.store(0, Ordering::Relaxed);
        self.max_ms.store(0, Ordering::Relaxed);
    }

    fn snapshot(&self) -> HistogramSnapshot {
        let buckets = self
            .buckets
            .iter()
            .enumerate()
            .map(|(i, b)| BucketCount {
                le_ms: LATENCY_BUCKETS_MS.get(i).copied(),
                count: b.load(Ordering::Relaxed),
            })
            .collect();
        let count = self.count.load(Ordering::Relaxed);
        let sum_ms = self.sum_ms.load(Ordering::Relaxed);
        HistogramSnapshot {
            buckets,
            count,
            sum_ms,
            max_ms: self.max_ms.load(Ordering::Relaxed),
            mean_ms: if count == 0 { 0.0 } else { sum_ms as f64 / count as f64 },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BucketCount {
    /// `None` for the overflow bucket.
    pub le_ms: Option<u64>,
    pub count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistogramSnapshot {
    pub buckets: Vec<BucketCount>,
    pub count: u64,
    pub sum_ms: u64,
    pub max_ms: u64,
    pub mean_ms: f64,
}

// ── Per-stage counters ──────────────────────────────────────────────

#[derive(Default)]
struct StageCounters {
    name: String,
    runs: AtomicU64,
    attempts: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    cache_hits: AtomicU64,
    retries: AtomicU64,
    latency: Histogram,
}

impl StageCounters {
    fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }

    fn reset(&self) {
        for c in [
            &self.runs,
            &self.attempts,
            &self.successes,
            &self.failures,
            &self.cache_hits,
            &self.retries,
        ] {
            c.store(0, Ordering::Relaxed);
        }
        self.latency.reset();
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageStatistics {
    /// Stage runs, one per task that reached the stage.
    pub runs: u64,
    /// Calls into the stage function, retries included.
    pub invocations: u64,
    pub successes: u64,
    pub failures: u64,
    pub cache_hits: u64,
    pub retries: u64,
    pub latency: HistogramSnapshot,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskCounts {
    pub total: u64,
    pub started: u64,
    pub succeeded: u64,
    pub failed: u64,
    /// Subset of `failed` interrupted by cancellation.
    pub cancelled: u64,
}

impl TaskCounts {
    pub fn finished(&self) -> u64 {
        self.succeeded + self.failed
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheCounts {
    pub l1_hits: u64,
    pub l2_hits: u64,
    pub misses: u64,
    pub l2_errors: u64,
}

impl CacheCounts {
    pub fn hit_rate(&self) -> f64 {
        let lookups = self.l1_hits + self.l2_hits + self.misses;
        if lookups == 0 {
            0.0
        } else {
            (self.l1_hits + self.l2_hits) as f64 / lookups as f64
        }
    }
}

/// Point-in-time copy of every counter, written to `statistics.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunStatistics {
    pub started_at: DateTime<Utc>,
    pub uptime_secs: f64,
    pub tasks: TaskCounts,
    pub cache: CacheCounts,
    /// Keyed by stage name.
    pub stages: BTreeMap<String, StageStatistics>,
}

impl RunStatistics {
    /// Finished tasks per second of uptime.
    pub fn throughput(&self) -> f64 {
        if self.uptime_secs <= 0.0 {
            0.0
        } else {
            self.tasks.finished() as f64 / self.uptime_secs
        }
    }

    pub fn write_json(&self, path: &Path) -> Result<(), SinkError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }
}

// ── Aggregator ──────────────────────────────────────────────────────

pub struct StatsAggregator {
    started: Mutex<(Instant, DateTime<Utc>)>,
    tasks_total: AtomicU64,
    tasks_started: AtomicU64,
    tasks_succeeded: AtomicU64,
    tasks_failed: AtomicU64,
    tasks_cancelled: AtomicU64,
    l1_hits: AtomicU64,
    l2_hits: AtomicU64,
    cache_misses: AtomicU64,
    l2_errors: AtomicU64,
    stages: RwLock<Vec<Arc<StageCounters>>>,
}

impl StatsAggregator {
    /// Stages named here appear in snapshots even before their first event.
    pub fn new<S: AsRef<str>>(stages: &[S]) -> Self {
        let stages = stages
            .iter()
            .map(|s| Arc::new(StageCounters::named(s.as_ref())))
            .collect();
        Self {
            started: Mutex::new((Instant::now(), Utc::now())),
            tasks_total: AtomicU64::new(0),
            tasks_started: AtomicU64::new(0),
            tasks_succeeded: AtomicU64::new(0),
            tasks_failed: AtomicU64::new(0),
            tasks_cancelled: AtomicU64::new(0),
            l1_hits: AtomicU64::new(0),
            l2_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
            l2_errors: AtomicU64::new(0),
            stages: RwLock::new(stages),
        }
    }

    fn stage(&self, name: &str) -> Arc<StageCounters> {
        {
            let stages = self.stages.read().unwrap_or_else(|p| p.into_inner());
            if let Some(c) = stages.iter().find(|c| c.name == name) {
                return Arc::clone(c);
            }
        }
        let mut stages = self.stages.write().unwrap_or_else(|p| p.into_inner());
        if let Some(c) = stages.iter().find(|c| c.name == name) {
            return Arc::clone(c);
        }
        let counters = Arc::new(StageCounters::named(name));
        stages.push(Arc::clone(&counters));
        counters
    }

    pub fn observe(&self, event: &StageEvent) {
        let counters = self.stage(&event.stage);
        counters.runs.fetch_add(1, Ordering::Relaxed);
        counters.attempts.fetch_add(event.attempts as u64, Ordering::Relaxed);
        counters.retries.fetch_add(event.retries() as u64, Ordering::Relaxed);
        counters.latency.record(event.elapsed_ms);
        match event.outcome {
            StageEventOutcome::Completed => {
                counters.successes.fetch_add(1, Ordering::Relaxed);
            }
            StageEventOutcome::CacheHit => {
                counters.successes.fetch_add(1, Ordering::Relaxed);
                counters.cache_hits.fetch_add(1, Ordering::Relaxed);
            }
            StageEventOutcome::Failed(_) => {
                counters.failures.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.record_cache_lookup(event.cache);
        self.l2_errors
            .fetch_add(event.cache_errors as u64, Ordering::Relaxed);
    }

    pub fn record_cache_lookup(&self, probe: CacheProbe) {
        let counter = match probe {
            CacheProbe::Skipped => return,
            CacheProbe::Miss => &self.cache_misses,
            CacheProbe::Hit(CacheLevel::L1) => &self.l1_hits,
            CacheProbe::Hit(CacheLevel::L2) => &self.l2_hits,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_total(&self, total: usize) {
        self.tasks_total.store(total as u64, Ordering::Relaxed);
    }

    pub fn task_started(&self) {
        self.tasks_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn task_succeeded(&self) {
        self.tasks_succeeded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn task_failed(&self, kind: FailureKind) {
        self.tasks_failed.fetch_add(1, Ordering::Relaxed);
        if kind == FailureKind::Cancelled {
            self.tasks_cancelled.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Count a task that reached a terminal state. Non-terminal tasks are ignored.
    pub fn task_finished(&self, task: &Task) {
        match task.status() {
            TaskStatus::Succeeded => self.task_succeeded(),
            TaskStatus::Failed => {
                let kind = task.failure().map(|f| f.kind).unwrap_or(FailureKind::Stage);
                self.task_failed(kind);
            }
            TaskStatus::Pending | TaskStatus::Running => {}
        }
    }

    pub fn uptime(&self) -> Duration {
        self.started.lock().unwrap_or_else(|p| p.into_inner()).0.elapsed()
    }

    pub fn snapshot(&self) -> RunStatistics {
        let (started, started_at) = *self.started.lock().unwrap_or_else(|p| p.into_inner());
        let stages = self
            .stages
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .map(|c| {
                (
                    c.name.clone(),
                    StageStatistics {
                        runs: c.runs.load(Ordering::Relaxed),
                        invocations: c.attempts.load(Ordering::Relaxed),
                        successes: c.successes.load(Ordering::Relaxed),
                        failures: c.failures.load(Ordering::Relaxed),
                        cache_hits: c.cache_hits.load(Ordering::Relaxed),
                        retries: c.retries.load(Ordering::Relaxed),
                        latency: c.latency.snapshot(),
                    },
                )
            })
            .collect();
        RunStatistics {
            started_at,
            uptime_secs: started.elapsed().as_secs_f64(),
            tasks: TaskCounts {
                total: self.tasks_total.load(Ordering::Relaxed),
                started: self.tasks_started.load(Ordering::Relaxed),
                succeeded: self.tasks_succeeded.load(Ordering::Relaxed),
                failed: self.tasks_failed.load(Ordering::Relaxed),
                cancelled: self.tasks_cancelled.load(Ordering::Relaxed),
            },
            cache: CacheCounts {
                l1_hits: self.l1_hits.load(Ordering::Relaxed),
                l2_hits: self.l2_hits.load(Ordering::Relaxed),
                misses: self.cache_misses.load(Ordering::Relaxed),
                l2_errors: self.l2_errors.load(Ordering::Relaxed),
            },
            stages,
        }
    }

    /// Zero every counter and restart the uptime clock. Stage names are kept.
    pub fn reset(&self) {
        *self.started.lock().unwrap_or_else(|p| p.into_inner()) = (Instant::now(), Utc::now());
        for c in [
            &self.tasks_total,
            &self.tasks_started,
            &self.tasks_succeeded,
            &self.tasks_failed,
            &self.tasks_cancelled,
            &self.l1_hits,
            &self.l2_hits,
            &self.cache_misses,
            &self.l2_errors,
        ] {
            c.store(0, Ordering::Relaxed);
        }
        for stage in self.stages.read().unwrap_or_else(|p| p.into_inner()).iter() {
            stage.reset();
        }
    }
}

impl Default for StatsAggregator {
    fn default() -> Self {
        Self::new::<&str>(&[])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlflow_core::{StageRecord, TaskFailure, TaskInput};

    fn event(stage: &str, outcome: StageEventOutcome, cache: CacheProbe, attempts: u32, ms: u64) -> StageEvent {
        StageEvent {
            task_id: "q0".into(),
            stage: stage.into(),
            outcome,
            cache,
            cache_errors: 0,
            attempts,
            elapsed_ms: ms,
        }
    }

    #[test]
    fn stage_counters_and_histogram() {
        let stats = StatsAggregator::new(&["generate", "vote"]);
        stats.observe(&event("generate", StageEventOutcome::Completed, CacheProbe::Miss, 3, 120));
        stats.observe(&event("generate", StageEventOutcome::CacheHit, CacheProbe::Hit(CacheLevel::L1), 0, 1));
        stats.observe(&event(
            "generate",
            StageEventOutcome::Failed(FailureKind::Stage),
            CacheProbe::Hit(CacheLevel::L2),
            1,
            90_000,
        ));

        let snap = stats.snapshot();
        let generate = &snap.stages["generate"];
        assert_eq!(generate.runs, 3);
        assert_eq!(generate.invocations, 4);
        assert_eq!(generate.successes, 2);
        assert_eq!(generate.failures, 1);
        assert_eq!(generate.cache_hits, 1);
        assert_eq!(generate.retries, 2);
        assert_eq!(generate.latency.count, 3);
        assert_eq!(generate.latency.max_ms, 90_000);
        // 1ms → first bucket, 120ms → le 250, 90s → overflow.
        assert_eq!(generate.latency.buckets[0].count, 1);
        assert_eq!(generate.latency.buckets[3].count, 1);
        assert_eq!(generate.latency.buckets.last().unwrap().le_ms, None);
        assert_eq!(generate.latency.buckets.last().unwrap().count, 1);

        assert_eq!(snap.stages["vote"].runs, 0);
        assert_eq!(snap.cache.l1_hits, 1);
        assert_eq!(snap.cache.l2_hits, 1);
        assert_eq!(snap.cache.misses, 1);
        assert!((snap.cache.hit_rate() - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn unknown_stage_is_registered_on_first_event() {
        let stats = StatsAggregator::default();
        stats.observe(&event("evaluate", StageEventOutcome::Completed, CacheProbe::Skipped, 1, 5));
        let snap = stats.snapshot();
        assert_eq!(snap.stages["evaluate"].successes, 1);
        assert_eq!(snap.cache.misses, 0);
    }

    #[test]
    fn task_outcomes() {
        let stats = StatsAggregator::default();
        stats.set_total(3);

        let mut ok = Task::new(0, "a", TaskInput::new("q", "db"));
        ok.start().unwrap();
        ok.record_stage(StageRecord::completed("s", serde_json::json!(1), Duration::ZERO, 1))
            .unwrap();
        ok.succeed().unwrap();

        let mut cancelled = Task::new(1, "b", TaskInput::new("q", "db"));
        cancelled.start().unwrap();
        cancelled
            .fail(TaskFailure::new(FailureKind::Cancelled, Some("s"), "cancelled"))
            .unwrap();

        let pending = Task::new(2, "c", TaskInput::new("q", "db"));

        for t in [&ok, &cancelled, &pending] {
            stats.task_started();
            stats.task_finished(t);
        }
        let snap = stats.snapshot();
        assert_eq!(snap.tasks.total, 3);
        assert_eq!(snap.tasks.started, 3);
        assert_eq!(snap.tasks.succeeded, 1);
        assert_eq!(snap.tasks.failed, 1);
        assert_eq!(snap.tasks.cancelled, 1);
        assert_eq!(snap.tasks.finished(), 2);
    }

    #[test]
    fn reset_zeroes_but_keeps_stage_names() {
        let stats = StatsAggregator::new(&["generate"]);
        stats.observe(&event("generate", StageEventOutcome::Completed, CacheProbe::Miss, 1, 10));
        stats.task_started();
        stats.reset();

        let snap = stats.snapshot();
        assert_eq!(snap.tasks.started, 0);
        assert_eq!(snap.cache.misses, 0);
        assert_eq!(snap.stages["generate"].runs, 0);
        assert_eq!(snap.stages["generate"].latency.count, 0);
    }

    #[test]
    fn concurrent_observers() {
        let stats = Arc::new(StatsAggregator::new(&["generate"]));
        std::thread::scope(|s| {
            for _ in 0..4 {
                let stats = Arc::clone(&stats);
                s.spawn(move || {
                    for _ in 0..250 {
                        stats.observe(&event("generate", StageEventOutcome::Completed, CacheProbe::Miss, 1, 3));
                        let _ = stats.snapshot();
                    }
                });
            }
        });
        assert_eq!(stats.snapshot().stages["generate"].runs, 1000);
    }

    #[test]
    fn writes_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out").join("statistics.json");
        StatsAggregator::new(&["generate"]).snapshot().write_json(&path).unwrap();
        let back: RunStatistics = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert!(back.stages.contains_key("generate"));
    }
}
