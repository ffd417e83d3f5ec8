//! vgrind gateway - runs untrusted input inside a prebuilt container image,
//! one execution at a time, and streams the output back over HTTP.
//!
//! Endpoints:
//!   GET  /status   "starting" until the image is built, then "ready"
//!   POST /vgrind   request body is fed to the sandbox's stdin (truncated),
//!                  response body is its combined stdout/stderr

pub mod builder;
pub mod config;
pub mod error;
pub mod gateway;
pub mod http_server;
pub mod lifecycle;
pub mod runtime;
pub mod state;

pub use config::{Config, ExecLimits, ResourceLimits, RuntimeConfig};
pub use error::{Error, Result};
pub use runtime::{CliRuntime, ContainerRuntime, InputStream, OutputStream, SandboxProcess};
pub use state::{AdmissionSlot, AppState, ReadinessGate, ReadinessState};
