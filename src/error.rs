//! Error types for the gateway.

use std::io;
use std::process::ExitStatus;
use std::time::Duration;
use thiserror::Error;

/// Failure of the one-shot image build. Every variant is fatal; `Aborted`
/// only means shutdown got there first.
#[derive(Error, Debug)]
pub enum BuildError {
    #[error("failed to start image build: {0}")]
    Spawn(#[source] io::Error),

    #[error("image build failed: {0}")]
    Failed(ExitStatus),

    #[error("image build timed out after {0:?}")]
    Timeout(Duration),

    #[error("image build aborted by shutdown")]
    Aborted,

    #[error("image build task failed: {0}")]
    Task(String),
}

/// Failure reported by a container runtime for a single sandbox instance.
#[derive(Error, Debug)]
pub enum SandboxError {
    #[error("failed to start sandbox: {0}")]
    Spawn(#[source] io::Error),

    #[error("sandbox i/o: {0}")]
    Io(#[from] io::Error),

    #[error("sandbox exited with {0}")]
    Exit(ExitStatus),

    #[error("sandbox killed")]
    Killed,
}

/// Why an admitted execution ended badly. The `Display` text is what gets
/// appended to the already-streaming response body.
#[derive(Error, Debug)]
pub enum ExecError {
    #[error("\n{0}\n")]
    Sandbox(#[from] SandboxError),

    #[error("\nsandbox killed: exceeded {0:?} deadline\n")]
    Timeout(Duration),

    #[error("\nsandbox killed: server shutting down\n")]
    Shutdown,

    #[error("client disconnected")]
    Disconnected,
}

impl ExecError {
    /// Whether the error is an expected consequence of shutdown or of the
    /// caller going away, rather than a service failure.
    pub fn is_expected(&self) -> bool {
        matches!(self, ExecError::Shutdown | ExecError::Disconnected)
    }
}

/// Top-level error for the binary.
#[derive(Error, Debug)]
pub enum Error {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: std::net::SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Build(#[from] BuildError),

    #[error("http server failed: {0}")]
    Server(#[source] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
