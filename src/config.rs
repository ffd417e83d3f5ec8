//! Runtime configuration.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_IMAGE: &str = "jadendw.dev/vgrind";
pub const DEFAULT_RUNTIME: &str = "docker";

/// Resource caps applied to every sandbox instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceLimits {
    /// Memory ceiling in the runtime's notation (e.g. "100m").
    pub memory: String,
    /// CPU quota in cores (e.g. "1", "0.5").
    pub cpus: String,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            memory: "100m".to_string(),
            cpus: "1".to_string(),
        }
    }
}

/// Per-request execution bounds.
#[derive(Debug, Clone)]
pub struct ExecLimits {
    pub timeout: Duration,
    pub max_input_bytes: u64,
    pub resources: ResourceLimits,
}

impl Default for ExecLimits {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            max_input_bytes: 1024 * 1024,
            resources: ResourceLimits::default(),
        }
    }
}

/// Where and how the container runtime is invoked.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub program: String,
    pub image: String,
    pub build_context: PathBuf,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            program: DEFAULT_RUNTIME.to_string(),
            image: DEFAULT_IMAGE.to_string(),
            build_context: PathBuf::from("."),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub addr: SocketAddr,
    pub build_timeout: Duration,
    pub shutdown_grace: Duration,
    pub exec: ExecLimits,
    pub runtime: RuntimeConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([0, 0, 0, 0], 80)),
            build_timeout: Duration::from_secs(5 * 60),
            shutdown_grace: Duration::from_secs(10),
            exec: ExecLimits::default(),
            runtime: RuntimeConfig::default(),
        }
    }
}
