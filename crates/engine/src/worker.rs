//! Coordinator ↔ worker-process protocol.
//!
//! Newline-delimited JSON over the child's stdin/stdout; the child logs to
//! stderr only. A session looks like:
//!
//! ```text
//! ← {"type":"ready","pid":4242}
//! → {"type":"run","task":{...}}
//! ← {"type":"event","event":{...}}     one per stage, as it finishes
//! ← {"type":"done","task":{...}}
//! → {"type":"cancel"}
//! → {"type":"shutdown"}
//! ```

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sqlflow_core::Task;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, Lines};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::WorkerError;
use crate::scheduler::{CancelSignal, StageObserver, TaskExecutor};
use crate::stage::StageEvent;

/// Coordinator → worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerRequest {
    Run { task: Task },
    /// Stop after the current stage; the in-flight task comes back cancelled.
    Cancel,
    Shutdown,
}

/// Worker → coordinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerResponse {
    Ready { pid: u32 },
    /// A stage of the in-flight task finished. Sent before the next stage
    /// starts, so a worker that dies mid-task has already reported its work.
    Event { event: StageEvent },
    Done { task: Task },
    /// The worker cannot serve tasks at all (e.g. its pools failed to warm up).
    Fatal { message: String },
}

/// Write one message as a single line and flush.
pub async fn write_message<W, T>(writer: &mut W, message: &T) -> Result<(), WorkerError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut line = serde_json::to_vec(message)?;
    line.push(b'\n');
    writer.write_all(&line).await?;
    writer.flush().await?;
    Ok(())
}

/// Read the next non-blank line as a message. `Ok(None)` at end of stream.
///
/// Cancel-safe: only whole lines are ever consumed.
pub async fn read_message<R, T>(lines: &mut Lines<R>) -> Result<Option<T>, WorkerError>
where
    R: AsyncBufRead + Unpin,
    T: DeserializeOwned,
{
    loop {
        let Some(line) = lines.next_line().await? else {
            return Ok(None);
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        return Ok(Some(serde_json::from_str(line)?));
    }
}

/// Hands stage events from the executor to the output loop.
struct ForwardEvents(mpsc::UnboundedSender<StageEvent>);

impl StageObserver for ForwardEvents {
    fn stage_finished(&self, event: &StageEvent) {
        // The receiver lives as long as `serve`.
        let _ = self.0.send(event.clone());
    }
}

/// Serve tasks read from `input` until `Shutdown` or end of input.
///
/// Requests are read on a separate task so a `Cancel` reaches the executor
/// while a task is running.
pub async fn serve<R, W>(executor: Arc<TaskExecutor>, input: R, mut output: W) -> Result<(), WorkerError>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin,
{
    let cancel = CancelSignal::new();
    let (tx, mut rx) = mpsc::unbounded_channel::<Task>();

    let reader_cancel = cancel.clone();
    let reader = tokio::spawn(async move {
        let mut lines = BufReader::new(input).lines();
        loop {
            match read_message::<_, WorkerRequest>(&mut lines).await {
                Ok(Some(WorkerRequest::Run { task })) => {
                    if tx.send(task).is_err() {
                        break;
                    }
                }
                Ok(Some(WorkerRequest::Cancel)) => reader_cancel.cancel(),
                Ok(Some(WorkerRequest::Shutdown)) | Ok(None) => break,
                Err(WorkerError::Json(e)) => warn!(error = %e, "ignoring malformed request"),
                Err(e) => {
                    warn!(error = %e, "worker input closed");
                    break;
                }
            }
        }
    });

    let pid = std::process::id();
    write_message(&mut output, &WorkerResponse::Ready { pid }).await?;
    info!(pid, "worker ready");

    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<StageEvent>();
    let forward = ForwardEvents(event_tx);

    let mut served = 0usize;
    while let Some(task) = rx.recv().await {
        debug!(task_id = %task.id, "worker running task");
        let execution = executor.execute(task, &cancel, &forward);
        tokio::pin!(execution);
        let run = loop {
            tokio::select! {
                biased;
                Some(event) = event_rx.recv() => {
                    write_message(&mut output, &WorkerResponse::Event { event }).await?;
                }
                run = &mut execution => break run,
            }
        };
        while let Ok(event) = event_rx.try_recv() {
            write_message(&mut output, &WorkerResponse::Event { event }).await?;
        }
        write_message(&mut output, &WorkerResponse::Done { task: run.task }).await?;
        served += 1;
    }

    reader.abort();
    info!(pid, served, "worker shutting down");
    Ok(())
}

/// [`serve`] over the process's own stdin/stdout.
pub async fn serve_stdio(executor: Arc<TaskExecutor>) -> Result<(), WorkerError> {
    serve(executor, tokio::io::stdin(), tokio::io::stdout()).await
}

/// Tell the coordinator this worker cannot start.
pub async fn report_fatal(message: &str) -> Result<(), WorkerError> {
    let mut stdout = tokio::io::stdout();
    write_message(
        &mut stdout,
        &WorkerResponse::Fatal {
            message: message.to_string(),
        },
    )
    .await
}
