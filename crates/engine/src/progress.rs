use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{info, warn};

use crate::stats::{RunStatistics, StatsAggregator};

/// Receives periodic statistics snapshots during a run.
pub trait ProgressSink: Send + Sync {
    fn report(&self, stats: &RunStatistics);
}

/// Logs one `info!` line per report.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogProgress;

impl ProgressSink for LogProgress {
    fn report(&self, stats: &RunStatistics) {
        let t = &stats.tasks;
        let pct = if t.total == 0 {
            100.0
        } else {
            t.finished() as f64 * 100.0 / t.total as f64
        };
        info!(
            done = t.finished(),
            total = t.total,
            succeeded = t.succeeded,
            failed = t.failed,
            percent = format_args!("{pct:.1}"),
            tasks_per_sec = format_args!("{:.2}", stats.throughput()),
            cache_hit_rate = format_args!("{:.2}", stats.cache.hit_rate()),
            "progress"
        );
    }
}

/// Background thread pushing snapshots to a sink every `interval`, plus a
/// final one on [`stop`](Self::stop).
pub struct ProgressReporter {
    stop: Sender<()>,
    handle: Option<JoinHandle<()>>,
}

impl ProgressReporter {
    pub fn start(stats: Arc<StatsAggregator>, interval: Duration, sink: Arc<dyn ProgressSink>) -> Self {
        let (stop, rx) = mpsc::channel::<()>();
        let handle = std::thread::Builder::new()
            .name("sqlflow-progress".into())
            .spawn(move || {
                loop {
                    match rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => sink.report(&stats.snapshot()),
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                sink.report(&stats.snapshot());
            });
        let handle = match handle {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!(error = %e, "progress reporting disabled: could not spawn thread");
                None
            }
        };
        Self { stop, handle }
    }

    pub fn stop(mut self) {
        let _ = self.stop.send(());
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("progress thread panicked");
            }
        }
    }
}
