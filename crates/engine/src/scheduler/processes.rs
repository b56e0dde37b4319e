//! Process-pool strategy: the coordinator side.
//!
//! Each child is a `sqlflow worker` process with its own resource pools and
//! L1 cache (an L2 backend, if configured, is shared through the backend
//! itself). Children pull tasks one at a time from a shared queue. A child
//! that dies takes only its in-flight task down with it.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Mutex;
use std::time::Duration;

use sqlflow_core::{FailureKind, Task, TaskFailure};
use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::{debug, error, info, warn};

use super::{current_thread_runtime, Scheduler, TaskRun};
use crate::error::{EngineError, WorkerError};
use crate::worker::{read_message, write_message, WorkerRequest, WorkerResponse};

const CHILD_EXIT_GRACE: Duration = Duration::from_secs(5);

/// How to launch one worker process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl WorkerCommand {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// From an argv list such as `run.worker_command`. `None` when empty.
    pub fn from_argv(argv: &[String]) -> Option<Self> {
        let (program, args) = argv.split_first()?;
        Some(Self::new(program, args.to_vec()))
    }

    fn spawn(&self) -> std::io::Result<Child> {
        Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
    }
}

type ChildLines = Lines<BufReader<ChildStdout>>;

pub(super) fn run(
    scheduler: &Scheduler,
    command: &WorkerCommand,
    tasks: Vec<Task>,
    workers: usize,
) -> Result<(), EngineError> {
    if tasks.is_empty() {
        return Ok(());
    }
    let workers = workers.clamp(1, tasks.len());
    let queue = Mutex::new(VecDeque::from(tasks));
    info!(workers, program = %command.program.display(), "launching worker processes");

    let runtime = current_thread_runtime()?;
    runtime.block_on(async {
        let children = (0..workers).map(|worker| drive_child(scheduler, command, worker, &queue));
        futures::future::join_all(children).await;
    });

    let leftover: Vec<Task> = queue
        .into_inner()
        .unwrap_or_else(|p| p.into_inner())
        .into_iter()
        .collect();
    if !leftover.is_empty() && !scheduler.cancel.is_cancelled() {
        error!(tasks = leftover.len(), "no worker process left alive, failing remaining tasks");
        for task in leftover {
            fail_task(scheduler, task, "no live worker process to run the task".into());
        }
    }
    Ok(())
}

/// Feed tasks to one child until the queue is empty, the run is cancelled
/// or the child dies.
async fn drive_child(scheduler: &Scheduler, command: &WorkerCommand, worker: usize, queue: &Mutex<VecDeque<Task>>) {
    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(e) => {
            error!(worker, error = %e, "failed to launch worker process");
            return;
        }
    };
    let (Some(mut stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
        error!(worker, "worker process has no stdio pipes");
        let _ = child.kill().await;
        return;
    };
    let mut lines = BufReader::new(stdout).lines();

    match read_message::<_, WorkerResponse>(&mut lines).await {
        Ok(Some(WorkerResponse::Ready { pid })) => debug!(worker, pid, "worker process ready"),
        Ok(Some(WorkerResponse::Fatal { message })) => {
            error!(worker, %message, "worker process could not start");
            let _ = child.kill().await;
            return;
        }
        other => {
            error!(worker, response = ?other, "worker process sent no ready message");
            let _ = child.kill().await;
            return;
        }
    }

    let mut handled = 0usize;
    loop {
        if scheduler.cancel.is_cancelled() {
            break;
        }
        let next = queue.lock().unwrap_or_else(|p| p.into_inner()).pop_front();
        let Some(task) = next else {
            break;
        };

        scheduler.stats.task_started();
        let request = WorkerRequest::Run { task: task.clone() };
        if let Err(e) = write_message(&mut stdin, &request).await {
            fail_task(scheduler, task, format!("worker {worker} stopped accepting tasks: {e}"));
            break;
        }
        match await_done(scheduler, &mut stdin, &mut lines, worker).await {
            Ok(run) => {
                scheduler.finish_task(run);
                handled += 1;
            }
            Err(message) => {
                warn!(worker, task_id = %task.id, %message, "worker lost its task");
                fail_task(scheduler, task, message);
                break;
            }
        }
    }

    let _ = write_message(&mut stdin, &WorkerRequest::Shutdown).await;
    drop(stdin);
    match tokio::time::timeout(CHILD_EXIT_GRACE, child.wait()).await {
        Ok(Ok(status)) => debug!(worker, handled, %status, "worker process exited"),
        Ok(Err(e)) => warn!(worker, error = %e, "failed to reap worker process"),
        Err(_) => {
            warn!(worker, "worker process ignored shutdown, killing it");
            let _ = child.kill().await;
        }
    }
}

/// Wait for the in-flight task's `Done`, counting its stage events as they
/// arrive and forwarding a cancellation if one comes in meanwhile. `Err`
/// means the child is unusable.
async fn await_done(
    scheduler: &Scheduler,
    stdin: &mut ChildStdin,
    lines: &mut ChildLines,
    worker: usize,
) -> Result<TaskRun, String> {
    let mut cancel_forwarded = false;
    loop {
        tokio::select! {
            message = read_message::<_, WorkerResponse>(lines) => match message {
                Ok(Some(WorkerResponse::Event { event })) => scheduler.stats.observe(&event),
                Ok(Some(WorkerResponse::Done { task })) => return Ok(TaskRun { task }),
                Ok(Some(WorkerResponse::Fatal { message })) => {
                    return Err(format!("worker {worker} failed: {message}"));
                }
                Ok(Some(WorkerResponse::Ready { .. })) => {}
                Ok(None) => return Err(format!("worker {worker} exited mid-task")),
                Err(WorkerError::Json(e)) => warn!(worker, error = %e, "ignoring malformed worker output"),
                Err(e) => return Err(format!("worker {worker} output unreadable: {e}")),
            },
            _ = scheduler.cancel.cancelled(), if !cancel_forwarded => {
                cancel_forwarded = true;
                if let Err(e) = write_message(stdin, &WorkerRequest::Cancel).await {
                    warn!(worker, error = %e, "could not forward cancellation");
                }
            }
        }
    }
}

fn fail_task(scheduler: &Scheduler, mut task: Task, message: String) {
    if let Err(e) = task.fail(TaskFailure::new(FailureKind::Worker, None, message)) {
        warn!(task_id = %task.id, error = %e, "task already terminal");
    }
    scheduler.finish_task(TaskRun { task });
}
