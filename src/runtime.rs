//! Container runtime capability and its CLI-backed implementation.
//!
//! The gateway only needs two things from a runtime: build the sandbox image
//! once, and run one disposable instance of it with stdin attached and the
//! combined output streamed back. Anything that can do that (a real runtime
//! CLI, or a fake in tests) implements [`ContainerRuntime`].

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::future::BoxFuture;
use futures_util::stream::{self, BoxStream};
use futures_util::{FutureExt, StreamExt};
use std::io;
use std::pin::Pin;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWriteExt};
use tokio::process::Command;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{ResourceLimits, RuntimeConfig};
use crate::error::{BuildError, SandboxError};

/// Bytes fed to the sandbox's stdin.
pub type InputStream = Pin<Box<dyn AsyncRead + Send>>;

/// Interleaved stdout/stderr chunks, in the order they were produced.
pub type OutputStream = BoxStream<'static, io::Result<Bytes>>;

/// How long to wait for the runtime to confirm a container kill.
pub(crate) const KILL_TIMEOUT: Duration = Duration::from_secs(10);

/// A running sandbox instance.
pub struct SandboxProcess {
    pub output: OutputStream,
    /// Resolves once the instance is gone. If the cancellation token handed
    /// to [`ContainerRuntime::run`] fires first, the instance is killed and
    /// this resolves to [`SandboxError::Killed`].
    pub exit: BoxFuture<'static, Result<(), SandboxError>>,
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync + 'static {
    /// Build the sandbox image. Aborted with [`BuildError::Aborted`] when `cancel` fires.
    async fn build(&self, cancel: CancellationToken) -> Result<(), BuildError>;

    /// Start one ephemeral sandbox instance reading from `input`.
    async fn run(
        &self,
        limits: &ResourceLimits,
        input: InputStream,
        cancel: CancellationToken,
    ) -> Result<SandboxProcess, SandboxError>;
}

/// Runtime driven through a docker-compatible CLI.
#[derive(Debug, Clone)]
pub struct CliRuntime {
    config: RuntimeConfig,
}

impl CliRuntime {
    pub fn new(config: RuntimeConfig) -> Self {
        Self { config }
    }

    fn build_args(&self) -> Vec<String> {
        vec![
            "build".to_string(),
            "-t".to_string(),
            self.config.image.clone(),
            self.config.build_context.display().to_string(),
        ]
    }

    fn run_args(&self, name: &str, limits: &ResourceLimits) -> Vec<String> {
        vec![
            "run".to_string(),
            "--rm".to_string(),
            "-i".to_string(),
            "--name".to_string(),
            name.to_string(),
            "--memory".to_string(),
            limits.memory.clone(),
            "--cpus".to_string(),
            limits.cpus.clone(),
            self.config.image.clone(),
        ]
    }
}

#[async_trait]
impl ContainerRuntime for CliRuntime {
    async fn build(&self, cancel: CancellationToken) -> Result<(), BuildError> {
        info!(image = %self.config.image, context = ?self.config.build_context, "Running image build");
        let mut child = Command::new(&self.config.program)
            .args(self.build_args())
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(BuildError::Spawn)?;

        tokio::select! {
            status = child.wait() => {
                let status = status.map_err(BuildError::Spawn)?;
                if status.success() {
                    Ok(())
                } else {
                    Err(BuildError::Failed(status))
                }
            }
            _ = cancel.cancelled() => {
                let _ = child.kill().await;
                Err(BuildError::Aborted)
            }
        }
    }

    async fn run(
        &self,
        limits: &ResourceLimits,
        input: InputStream,
        cancel: CancellationToken,
    ) -> Result<SandboxProcess, SandboxError> {
        let name = format!("vgrind-{}", uuid::Uuid::new_v4());
        debug!(container = %name, memory = %limits.memory, cpus = %limits.cpus, "Starting sandbox");

        let mut command = Command::new(&self.config.program);
        command.args(self.run_args(&name, limits));

        // Killing the CLI client does not stop the container, so ask the
        // runtime to kill it by name as well.
        let mut kill = Command::new(&self.config.program);
        kill.args(["kill", name.as_str()]);

        spawn_process(command, input, cancel, Some(kill))
    }
}

/// Spawn `command` with stdin fed from `input` and stdout/stderr merged into
/// one stream. When `cancel` fires the process is killed, `on_kill` (if any)
/// is run, and the process is reaped before the exit future resolves.
pub(crate) fn spawn_process(
    mut command: Command,
    input: InputStream,
    cancel: CancellationToken,
    on_kill: Option<Command>,
) -> Result<SandboxProcess, SandboxError> {
    let mut child = command
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(SandboxError::Spawn)?;

    let (stdin, stdout, stderr) = match (child.stdin.take(), child.stdout.take(), child.stderr.take()) {
        (Some(stdin), Some(stdout), Some(stderr)) => (stdin, stdout, stderr),
        _ => return Err(SandboxError::Io(io::Error::other("sandbox stdio not captured"))),
    };

    let pump = tokio::spawn(async move {
        let mut input = input;
        let mut stdin = stdin;
        match tokio::io::copy(&mut input, &mut stdin).await {
            Ok(n) => debug!(bytes = n, "Sandbox input delivered"),
            // The sandbox may exit without reading all of its input.
            Err(e) => debug!(error = %e, "Sandbox input pump stopped"),
        }
        let _ = stdin.shutdown().await;
    });

    let output = stream::select(ReaderStream::new(stdout), ReaderStream::new(stderr)).boxed();

    let exit = async move {
        let result = tokio::select! {
            status = child.wait() => match status {
                Ok(status) if status.success() => Ok(()),
                Ok(status) => Err(SandboxError::Exit(status)),
                Err(e) => Err(SandboxError::Io(e)),
            },
            _ = cancel.cancelled() => {
                if let Err(e) = child.start_kill() {
                    debug!(error = %e, "Sandbox process already gone");
                }
                if let Some(mut kill) = on_kill {
                    let status = kill.stdout(Stdio::null()).stderr(Stdio::null()).status();
                    match tokio::time::timeout(KILL_TIMEOUT, status).await {
                        Ok(Ok(_)) => {}
                        Ok(Err(e)) => warn!(error = %e, "Failed to run container kill"),
                        Err(_) => warn!("Container kill timed out"),
                    }
                }
                let _ = child.wait().await;
                Err(SandboxError::Killed)
            }
        };
        pump.abort();
        result
    }
    .boxed();

    Ok(SandboxProcess { output, exit })
}
