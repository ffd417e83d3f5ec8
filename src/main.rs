//! vgrind gateway - sandboxed execution over HTTP.
//!
//! Usage:
//!   vgrind-gateway [--port 80] [--image jadendw.dev/vgrind] [--build-context .]

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};
use tracing_subscriber::EnvFilter;

use vgrind_gateway::config::{self, Config, ExecLimits, ResourceLimits, RuntimeConfig};
use vgrind_gateway::error::BuildError;
use vgrind_gateway::{lifecycle, CliRuntime, Error};

#[derive(Parser, Debug)]
#[command(name = "vgrind-gateway")]
#[command(about = "Run untrusted input in an ephemeral container, one request at a time")]
struct Args {
    /// Port to listen on
    #[arg(long, default_value = "80")]
    port: u16,

    /// Image tag to build and run
    #[arg(long, default_value = config::DEFAULT_IMAGE)]
    image: String,

    /// Build context directory for the image
    #[arg(long, default_value = ".")]
    build_context: PathBuf,

    /// Container runtime CLI
    #[arg(long, default_value = config::DEFAULT_RUNTIME)]
    runtime: String,

    /// Image build deadline in seconds
    #[arg(long, default_value = "300")]
    build_timeout_secs: u64,

    /// Per-request execution deadline in seconds
    #[arg(long, default_value = "60")]
    exec_timeout_secs: u64,

    /// Request bodies beyond this many bytes are dropped
    #[arg(long, default_value = "1048576")]
    max_input_bytes: u64,

    /// Sandbox memory limit
    #[arg(long, default_value = "100m")]
    memory: String,

    /// Sandbox CPU quota in cores
    #[arg(long, default_value = "1")]
    cpus: String,

    /// Graceful HTTP shutdown deadline in seconds
    #[arg(long, default_value = "10")]
    shutdown_grace_secs: u64,
}

impl From<Args> for Config {
    fn from(args: Args) -> Self {
        Config {
            addr: SocketAddr::from(([0, 0, 0, 0], args.port)),
            build_timeout: Duration::from_secs(args.build_timeout_secs),
            shutdown_grace: Duration::from_secs(args.shutdown_grace_secs),
            exec: ExecLimits {
                timeout: Duration::from_secs(args.exec_timeout_secs),
                max_input_bytes: args.max_input_bytes,
                resources: ResourceLimits {
                    memory: args.memory,
                    cpus: args.cpus,
                },
            },
            runtime: RuntimeConfig {
                program: args.runtime,
                image: args.image,
                build_context: args.build_context,
            },
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::from(Args::parse());

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e @ Error::Build(BuildError::Aborted)) => {
            warn!("{}", e);
            ExitCode::FAILURE
        }
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(config: Config) -> Result<(), Error> {
    let listener = tokio::net::TcpListener::bind(config.addr)
        .await
        .map_err(|source| Error::Bind {
            addr: config.addr,
            source,
        })?;

    let shutdown = CancellationToken::new();
    let signals = tokio::spawn(lifecycle::watch_signals(shutdown.clone()));

    let runtime = Arc::new(CliRuntime::new(config.runtime.clone()));
    let result = lifecycle::run(&config, runtime, listener, shutdown.clone()).await;

    shutdown.cancel();
    let _ = signals.await;
    result
}
