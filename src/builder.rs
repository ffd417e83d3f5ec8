//! One-shot, time-bounded build of the sandbox image.

use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::error::BuildError;
use crate::runtime::ContainerRuntime;
use crate::state::ReadinessGate;

/// Build the image and flip `readiness` on success.
///
/// The build runs under a child scope of `shutdown`: if shutdown fires first
/// the build is aborted, and if `timeout` elapses it is killed and reported
/// as [`BuildError::Timeout`]. Readiness is left untouched on any failure.
pub async fn build_image(
    runtime: &dyn ContainerRuntime,
    readiness: &ReadinessGate,
    timeout: Duration,
    shutdown: &CancellationToken,
) -> Result<(), BuildError> {
    let scope = shutdown.child_token();

    info!("Building container image");
    let build = runtime.build(scope.clone());
    tokio::pin!(build);

    let result = tokio::select! {
        result = &mut build => result,
        _ = tokio::time::sleep(timeout) => {
            scope.cancel();
            // Wait for the runtime to tear the build down before reporting.
            let _ = build.await;
            Err(BuildError::Timeout(timeout))
        }
    };
    result?;

    info!("Done building image");
    readiness.set_ready();
    info!("Ready");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ResourceLimits;
    use crate::error::SandboxError;
    use crate::runtime::{InputStream, SandboxProcess};
    use async_trait::async_trait;

    /// Builds that take `delay` and then succeed, unless cancelled.
    struct SlowBuild {
        delay: Duration,
    }

    #[async_trait]
    impl ContainerRuntime for SlowBuild {
        async fn build(&self, cancel: CancellationToken) -> Result<(), BuildError> {
            tokio::select! {
                _ = tokio::time::sleep(self.delay) => Ok(()),
                _ = cancel.cancelled() => Err(BuildError::Aborted),
            }
        }

        async fn run(
            &self,
            _limits: &ResourceLimits,
            _input: InputStream,
            _cancel: CancellationToken,
        ) -> Result<SandboxProcess, SandboxError> {
            Err(SandboxError::Killed)
        }
    }

    #[tokio::test]
    async fn success_marks_ready() {
        let gate = ReadinessGate::new();
        let runtime = SlowBuild { delay: Duration::from_millis(10) };
        build_image(&runtime, &gate, Duration::from_secs(5), &CancellationToken::new())
            .await
            .unwrap();
        assert!(gate.is_ready());
    }

    #[tokio::test]
    async fn timeout_kills_build_and_stays_starting() {
        let gate = ReadinessGate::new();
        let runtime = SlowBuild { delay: Duration::from_secs(30) };
        let err = build_image(&runtime, &gate, Duration::from_millis(20), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, BuildError::Timeout(_)));
        assert!(!gate.is_ready());
    }

    #[tokio::test]
    async fn shutdown_aborts_build() {
        let gate = ReadinessGate::new();
        let runtime = SlowBuild { delay: Duration::from_secs(30) };
        let shutdown = CancellationToken::new();
        shutdown.cancel();
        let err = build_image(&runtime, &gate, Duration::from_secs(5), &shutdown)
            .await
            .unwrap_err();
        assert!(matches!(err, BuildError::Aborted));
        assert!(!gate.is_ready());
    }
}
