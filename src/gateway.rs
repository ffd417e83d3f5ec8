//! Execution gateway: runs one admitted request inside a sandbox and streams
//! its output back.

use bytes::Bytes;
use futures_util::stream::{self, BoxStream};
use futures_util::StreamExt;
use std::io;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn, Instrument};

use crate::error::{ExecError, SandboxError};
use crate::runtime::{InputStream, SandboxProcess};
use crate::state::{AdmissionPermit, AppState};

/// Output chunks buffered between the sandbox and a slow client.
const OUTPUT_BUFFER: usize = 16;

/// Response body of an execution: sandbox output, then any in-band error text.
pub type ExecutionOutput = BoxStream<'static, io::Result<Bytes>>;

pub struct ExecutionRequest {
    pub input: InputStream,
    pub timeout: Duration,
}

impl ExecutionRequest {
    pub fn new(input: InputStream, timeout: Duration) -> Self {
        Self { input, timeout }
    }
}

/// Wait for the admission slot, then start the execution in the background.
///
/// The returned stream yields the sandbox's output as it is produced and
/// ends once the sandbox is gone. The slot stays held until then; dropping
/// the stream (client disconnect) kills the sandbox. Returns `None` only if
/// the admission slot can no longer be acquired.
pub async fn execute(state: &AppState, request: ExecutionRequest) -> Option<ExecutionOutput> {
    let permit = state.admission.acquire().await?;
    let id = uuid::Uuid::new_v4();
    info!(execution = %id, "Execution admitted");

    let (tx, mut rx) = mpsc::channel(OUTPUT_BUFFER);
    let span = tracing::info_span!("execution", id = %id);
    state
        .executions
        .spawn(run_admitted(state.clone(), request, permit, tx).instrument(span));

    Some(stream::poll_fn(move |cx| rx.poll_recv(cx)).boxed())
}

async fn run_admitted(
    state: AppState,
    request: ExecutionRequest,
    _permit: AdmissionPermit,
    tx: mpsc::Sender<io::Result<Bytes>>,
) {
    let started = Instant::now();
    match drive(&state, request, &tx).await {
        Ok(()) => info!(elapsed = ?started.elapsed(), "Execution finished"),
        Err(ExecError::Disconnected) => info!("Client went away; sandbox stopped"),
        Err(e) => {
            if e.is_expected() {
                info!(error = %e.to_string().trim(), "Execution cut off");
            } else {
                warn!(error = %e.to_string().trim(), elapsed = ?started.elapsed(), "Execution failed");
            }
            let _ = tx.send(Ok(Bytes::from(e.to_string()))).await;
        }
    }
}

async fn drive(
    state: &AppState,
    request: ExecutionRequest,
    tx: &mpsc::Sender<io::Result<Bytes>>,
) -> Result<(), ExecError> {
    let timeout = request.timeout;
    let deadline = Instant::now() + timeout;
    let kill = state.terminate.child_token();
    if kill.is_cancelled() {
        return Err(ExecError::Shutdown);
    }

    let input: InputStream = Box::pin(request.input.take(state.limits.max_input_bytes));
    let SandboxProcess {
        mut output,
        mut exit,
    } = state
        .runtime
        .run(&state.limits.resources, input, kill.clone())
        .await?;

    let mut failure = loop {
        let chunk = tokio::select! {
            chunk = output.next() => chunk,
            _ = sleep_until(deadline) => break Some(ExecError::Timeout(timeout)),
            _ = tx.closed() => break Some(ExecError::Disconnected),
        };
        match chunk {
            Some(Ok(bytes)) => {
                tokio::select! {
                    sent = tx.send(Ok(bytes)) => {
                        if sent.is_err() {
                            break Some(ExecError::Disconnected);
                        }
                    }
                    _ = sleep_until(deadline) => break Some(ExecError::Timeout(timeout)),
                }
            }
            Some(Err(e)) => break Some(ExecError::Sandbox(SandboxError::Io(e))),
            None => break None,
        }
    };

    // The output can close before the process exits; the deadline still applies.
    let status = if failure.is_none() {
        tokio::select! {
            status = &mut exit => status,
            _ = sleep_until(deadline) => {
                failure = Some(ExecError::Timeout(timeout));
                kill.cancel();
                exit.await
            }
        }
    } else {
        kill.cancel();
        exit.await
    };
    debug!(status = ?status, "Sandbox gone");

    match (failure, status) {
        (Some(err), _) => Err(err),
        (None, Ok(())) => Ok(()),
        (None, Err(SandboxError::Killed)) if state.terminate.is_cancelled() => {
            Err(ExecError::Shutdown)
        }
        (None, Err(e)) => Err(e.into()),
    }
}


#[cfg(test)]
mod tests {
    use super::testing::{Behavior, FakeRuntime};
    use super::*;
    use crate::config::ExecLimits;
    use std::io::Cursor;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    fn state_with(runtime: FakeRuntime, limits: ExecLimits) -> (AppState, Arc<super::testing::Stats>) {
        let stats = runtime.stats.clone();
        let state = AppState::new(Arc::new(runtime), limits, CancellationToken::new());
        state.readiness.set_ready();
        (state, stats)
    }

    fn request(input: Vec<u8>, timeout: Duration) -> ExecutionRequest {
        ExecutionRequest::new(Box::pin(Cursor::new(input)), timeout)
    }

    async fn body_text(output: ExecutionOutput) -> String {
        let chunks: Vec<_> = output.collect().await;
        let mut out = Vec::new();
        for chunk in chunks {
            out.extend_from_slice(&chunk.unwrap());
        }
        String::from_utf8(out).unwrap()
    }

    #[tokio::test]
    async fn echoes_input() {
        let (state, stats) = state_with(FakeRuntime::new(Behavior::Echo), ExecLimits::default());
        let output = execute(&state, request(b"leak check".to_vec(), Duration::from_secs(5)))
            .await
            .unwrap();
        assert_eq!(body_text(output).await, "leak check");
        assert_eq!(stats.started.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn oversized_input_is_truncated() {
        let limits = ExecLimits {
            max_input_bytes: 1024 * 1024,
            ..ExecLimits::default()
        };
        let (state, stats) = state_with(FakeRuntime::new(Behavior::CountInput), limits);
        let output = execute(&state, request(vec![b'x'; 2 * 1024 * 1024], Duration::from_secs(5)))
            .await
            .unwrap();
        assert_eq!(body_text(output).await, "1048576 bytes");
        assert_eq!(*stats.inputs.lock().unwrap(), vec![1024 * 1024]);
    }

    #[tokio::test]
    async fn truncation_does_not_wait_for_rest_of_input() {
        let limits = ExecLimits {
            max_input_bytes: 4,
            ..ExecLimits::default()
        };
        let (state, _stats) = state_with(FakeRuntime::new(Behavior::CountInput), limits);

        // A reader that delivers five bytes and then never finishes.
        let (mut writer, reader) = tokio::io::duplex(64);
        tokio::io::AsyncWriteExt::write_all(&mut writer, b"abcde").await.unwrap();
        let req = ExecutionRequest::new(Box::pin(reader), Duration::from_secs(5));

        let output = execute(&state, req).await.unwrap();
        let text = tokio::time::timeout(Duration::from_secs(2), body_text(output))
            .await
            .expect("execution should not wait past the ceiling");
        assert_eq!(text, "4 bytes");
        drop(writer);
    }

    #[tokio::test]
    async fn nonzero_exit_is_appended_in_band() {
        let runtime = FakeRuntime::new(Behavior::Fail {
            output: "==1== ERROR SUMMARY: 3 errors\n",
            code: 1,
        });
        let (state, _stats) = state_with(runtime, ExecLimits::default());
        let output = execute(&state, request(Vec::new(), Duration::from_secs(5)))
            .await
            .unwrap();
        let text = body_text(output).await;
        assert!(text.starts_with("==1== ERROR SUMMARY"));
        assert!(text.ends_with("sandbox exited with exit status: 1\n"));
    }

    #[tokio::test]
    async fn spawn_failure_is_appended_in_band() {
        let (state, _stats) = state_with(FakeRuntime::new(Behavior::SpawnError), ExecLimits::default());
        let output = execute(&state, request(Vec::new(), Duration::from_secs(5)))
            .await
            .unwrap();
        assert!(body_text(output).await.contains("failed to start sandbox"));
        assert!(!state.admission.is_held());
    }

    #[tokio::test]
    async fn deadline_kills_sandbox_and_closes_stream() {
        let runtime = FakeRuntime::new(Behavior::Hang { output: "partial\n" });
        let (state, stats) = state_with(runtime, ExecLimits::default());
        let output = execute(&state, request(Vec::new(), Duration::from_millis(50)))
            .await
            .unwrap();
        let text = tokio::time::timeout(Duration::from_secs(2), body_text(output))
            .await
            .expect("response should close shortly after the deadline");
        assert!(text.starts_with("partial\n"));
        assert!(text.ends_with("sandbox killed: exceeded 50ms deadline\n"));
        assert_eq!(stats.killed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn terminate_cuts_off_inflight_execution() {
        let runtime = FakeRuntime::new(Behavior::Hang { output: "" });
        let (state, stats) = state_with(runtime, ExecLimits::default());
        let output = execute(&state, request(Vec::new(), Duration::from_secs(30)))
            .await
            .unwrap();

        state.terminate.cancel();
        let text = tokio::time::timeout(Duration::from_secs(2), body_text(output))
            .await
            .unwrap();
        assert!(text.contains("server shutting down"));
        assert_eq!(stats.killed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn no_sandbox_starts_once_terminated() {
        let (state, stats) = state_with(FakeRuntime::new(Behavior::Echo), ExecLimits::default());
        state.terminate.cancel();

        let output = execute(&state, request(b"late".to_vec(), Duration::from_secs(5)))
            .await
            .unwrap();
        let text = tokio::time::timeout(Duration::from_secs(2), body_text(output))
            .await
            .unwrap();
        assert_eq!(text, "\nsandbox killed: server shutting down\n");
        assert_eq!(stats.started.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn dropped_output_kills_sandbox_and_releases_slot() {
        let runtime = FakeRuntime::new(Behavior::Hang { output: "" });
        let (state, stats) = state_with(runtime, ExecLimits::default());
        let output = execute(&state, request(Vec::new(), Duration::from_secs(30)))
            .await
            .unwrap();
        assert!(state.admission.is_held());

        drop(output);
        tokio::time::timeout(Duration::from_secs(2), async {
            while state.admission.is_held() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(stats.killed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn executions_never_overlap() {
        let runtime = FakeRuntime::new(Behavior::Sleep {
            delay: Duration::from_millis(20),
        });
        let (state, stats) = state_with(runtime, ExecLimits::default());

        let mut tasks = Vec::new();
        for _ in 0..6 {
            let state = state.clone();
            tasks.push(tokio::spawn(async move {
                let output = execute(&state, request(Vec::new(), Duration::from_secs(5)))
                    .await
                    .unwrap();
                body_text(output).await
            }));
        }
        for task in tasks {
            assert_eq!(task.await.unwrap(), "done");
        }
        assert_eq!(stats.started.load(Ordering::SeqCst), 6);
        assert_eq!(stats.peak.load(Ordering::SeqCst), 1);
    }
}
