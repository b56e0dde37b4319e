use std::collections::VecDeque;
use std::sync::Mutex;

use futures::stream::{self, StreamExt};
use sqlflow_core::Task;
use tracing::{debug, error};

use super::{current_thread_runtime, Scheduler};
use crate::error::EngineError;

/// One task at a time, in dataset order.
pub(super) fn sequential(scheduler: &Scheduler, tasks: Vec<Task>) -> Result<(), EngineError> {
    let runtime = current_thread_runtime()?;
    runtime.block_on(async {
        for task in tasks {
            if scheduler.cancel.is_cancelled() {
                break;
            }
            let run = scheduler.execute_one(task).await;
            scheduler.finish_task(run);
        }
    });
    Ok(())
}

/// A rayon pool of `workers` threads pulling from one shared queue. Each
/// thread drives its tasks on its own current-thread runtime; pools and the
/// L1 cache are shared by all of them.
pub(super) fn threads(scheduler: &Scheduler, tasks: Vec<Task>, workers: usize) -> Result<(), EngineError> {
    let workers = workers.max(1);
    let queue = Mutex::new(VecDeque::from(tasks));
    let failures = Mutex::new(Vec::new());

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(workers)
        .thread_name(|i| format!("sqlflow-worker-{i}"))
        .build()
        .map_err(|e| EngineError::Runtime(format!("failed to build worker pool: {e}")))?;

    pool.scope(|scope| {
        for worker in 0..workers {
            let queue = &queue;
            let failures = &failures;
            scope.spawn(move |_| {
                let runtime = match current_thread_runtime() {
                    Ok(rt) => rt,
                    Err(e) => {
                        error!(worker, error = %e, "worker could not start");
                        failures.lock().unwrap_or_else(|p| p.into_inner()).push(e);
                        return;
                    }
                };
                let mut handled = 0usize;
                runtime.block_on(async {
                    loop {
                        if scheduler.cancel.is_cancelled() {
                            break;
                        }
                        let next = queue.lock().unwrap_or_else(|p| p.into_inner()).pop_front();
                        let Some(task) = next else {
                            break;
                        };
                        let run = scheduler.execute_one(task).await;
                        scheduler.finish_task(run);
                        handled += 1;
                    }
                });
                debug!(worker, handled, "worker drained");
            });
        }
    });

    let mut failures = failures.into_inner().unwrap_or_else(|p| p.into_inner());
    if failures.len() == workers {
        if let Some(e) = failures.pop() {
            return Err(e);
        }
    }
    Ok(())
}

/// Up to `max_in_flight` tasks interleaved on a single thread.
pub(super) fn cooperative(
    scheduler: &Scheduler,
    tasks: Vec<Task>,
    max_in_flight: usize,
) -> Result<(), EngineError> {
    let runtime = current_thread_runtime()?;
    runtime.block_on(
        stream::iter(tasks).for_each_concurrent(max_in_flight.max(1), |task| async move {
            let run = scheduler.execute_one(task).await;
            scheduler.finish_task(run);
        }),
    );
    Ok(())
}
