//! Process lifecycle: signal handling, the startup build, graceful HTTP
//! shutdown and joining every background task before exit.
//!
//! Two cancellation scopes drive everything:
//! - `shutdown` fires on an interrupt (or a fatal error). The listener stops
//!   accepting and a running build is aborted.
//! - `terminate` fires once the graceful deadline expires. In-flight sandbox
//!   executions observe it and are killed.

use axum::Router;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::builder;
use crate::config::Config;
use crate::error::{BuildError, Error, Result};
use crate::http_server;
use crate::runtime::{ContainerRuntime, KILL_TIMEOUT};
use crate::state::AppState;

/// Upper bound on joining execution tasks once `terminate` has fired: the
/// runtime's kill confirmation plus reaping the killed process.
const REAP_TIMEOUT: Duration = Duration::from_secs(KILL_TIMEOUT.as_secs() + 5);

/// Cancel `shutdown` on SIGINT or SIGTERM. Returns early if `shutdown` is
/// cancelled by someone else, so the task can always be joined.
pub async fn watch_signals(shutdown: CancellationToken) {
    let interrupt = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Cannot listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };
    let terminate = async {
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = interrupt => info!("Interrupt received"),
        _ = terminate => info!("SIGTERM received"),
        _ = shutdown.cancelled() => return,
    }
    shutdown.cancel();
}

/// Serve HTTP on `listener`, build the image, and run until `shutdown` fires.
///
/// Returns only after the server, the build, every execution and the
/// shutdown watcher have finished. A failed build is fatal and returned as
/// [`Error::Build`]; that includes a build cut short by shutdown.
pub async fn run(
    config: &Config,
    runtime: Arc<dyn ContainerRuntime>,
    listener: TcpListener,
    shutdown: CancellationToken,
) -> Result<()> {
    let terminate = CancellationToken::new();
    let state = AppState::new(runtime.clone(), config.exec.clone(), terminate.clone());

    let server = tokio::spawn(serve(
        listener,
        http_server::router(state.clone()),
        shutdown.clone(),
    ));
    let watcher = tokio::spawn(shutdown_watcher(
        server,
        state.clone(),
        config.shutdown_grace,
        shutdown.clone(),
    ));

    let build = {
        let readiness = state.readiness.clone();
        let timeout = config.build_timeout;
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            builder::build_image(runtime.as_ref(), &readiness, timeout, &shutdown).await
        })
    };

    let fatal = match build.await {
        Ok(Ok(())) => None,
        Ok(Err(e)) => Some(e),
        Err(e) => Some(BuildError::Task(e.to_string())),
    };
    match &fatal {
        Some(BuildError::Aborted) => warn!("Image build aborted by shutdown"),
        Some(e) => {
            error!(error = %e, "Image build failed");
            terminate.cancel();
            shutdown.cancel();
        }
        None => {}
    }

    shutdown.cancelled().await;
    let served = match watcher.await {
        Ok(result) => result,
        Err(e) => Err(io::Error::other(e.to_string())),
    };
    info!("Goodbye");

    if let Some(e) = fatal {
        return Err(e.into());
    }
    served.map_err(Error::Server)
}

async fn serve(listener: TcpListener, app: Router, shutdown: CancellationToken) -> io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!("Starting HTTP server on {}", addr);
    }
    let result = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.clone().cancelled_owned())
        .await;
    if let Err(e) = &result {
        if !shutdown.is_cancelled() {
            error!(error = %e, "HTTP server failed");
        }
    }
    shutdown.cancel();
    result
}

/// Wait for shutdown and give in-flight requests `grace` to finish. After
/// that, kill remaining executions, wait up to [`REAP_TIMEOUT`] for their
/// sandboxes to be reaped, and stop the accept loop.
///
/// Aborting the server task does not close connections axum has already
/// spawned. Those end once their response bodies close, which happens as
/// soon as their executions are joined, or when the runtime is dropped.
async fn shutdown_watcher(
    mut server: JoinHandle<io::Result<()>>,
    state: AppState,
    grace: Duration,
    shutdown: CancellationToken,
) -> io::Result<()> {
    shutdown.cancelled().await;
    info!(grace = ?grace, "Shutting down; draining in-flight requests");

    let joined = match tokio::time::timeout(grace, &mut server).await {
        Ok(joined) => {
            reap_executions(&state).await;
            joined
        }
        Err(_) => {
            warn!("Graceful shutdown deadline expired; killing in-flight executions");
            reap_executions(&state).await;
            server.abort();
            server.await
        }
    };

    match joined {
        Ok(result) => result,
        Err(e) if e.is_cancelled() => Ok(()),
        Err(e) => Err(io::Error::other(e.to_string())),
    }
}

/// Kill whatever is still running and join every execution task.
async fn reap_executions(state: &AppState) {
    state.terminate.cancel();
    state.executions.close();
    if tokio::time::timeout(REAP_TIMEOUT, state.executions.wait())
        .await
        .is_err()
    {
        warn!(
            remaining = state.executions.len(),
            "Sandbox still running at exit"
        );
    }
}
