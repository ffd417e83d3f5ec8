//! Shared application state: the readiness gate and the admission slot.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::ExecLimits;
use crate::runtime::ContainerRuntime;

/// Process-wide readiness. Moves from `Starting` to `Ready` once and never back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReadinessState {
    Starting = 0,
    Ready = 1,
}

impl ReadinessState {
    pub fn as_str(self) -> &'static str {
        match self {
            ReadinessState::Starting => "starting",
            ReadinessState::Ready => "ready",
        }
    }
}

/// Lock-free readiness flag, written once by the image build and read by every request.
#[derive(Debug)]
pub struct ReadinessGate {
    state: AtomicU8,
}

impl ReadinessGate {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(ReadinessState::Starting as u8),
        }
    }

    pub fn set_ready(&self) {
        self.state.store(ReadinessState::Ready as u8, Ordering::Release);
    }

    pub fn is_ready(&self) -> bool {
        self.state() == ReadinessState::Ready
    }

    pub fn state(&self) -> ReadinessState {
        match self.state.load(Ordering::Acquire) {
            0 => ReadinessState::Starting,
            _ => ReadinessState::Ready,
        }
    }
}

impl Default for ReadinessGate {
    fn default() -> Self {
        Self::new()
    }
}

/// Capacity-1 guard serializing sandbox executions.
///
/// Waiters queue rather than being rejected. The permit is released when the
/// returned [`AdmissionPermit`] drops, so every exit path (including a panic in
/// the holder's task) gives the slot back exactly once.
#[derive(Debug, Clone)]
pub struct AdmissionSlot {
    slot: Arc<Semaphore>,
}

/// Proof of holding the admission slot.
#[derive(Debug)]
pub struct AdmissionPermit {
    _permit: OwnedSemaphorePermit,
}

impl AdmissionSlot {
    pub fn new() -> Self {
        Self {
            slot: Arc::new(Semaphore::new(1)),
        }
    }

    /// Wait for the slot. The semaphore is never closed, so this only
    /// returns `None` if that invariant is broken.
    pub async fn acquire(&self) -> Option<AdmissionPermit> {
        let permit = self.slot.clone().acquire_owned().await.ok()?;
        Some(AdmissionPermit { _permit: permit })
    }

    pub fn is_held(&self) -> bool {
        self.slot.available_permits() == 0
    }
}

impl Default for AdmissionSlot {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub readiness: Arc<ReadinessGate>,
    pub admission: AdmissionSlot,
    pub runtime: Arc<dyn ContainerRuntime>,
    pub limits: Arc<ExecLimits>,
    /// Fired when in-flight executions must be cut off.
    pub terminate: CancellationToken,
    /// Background execution tasks, joined before the process exits.
    pub executions: TaskTracker,
}

impl AppState {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        limits: ExecLimits,
        terminate: CancellationToken,
    ) -> Self {
        Self {
            readiness: Arc::new(ReadinessGate::new()),
            admission: AdmissionSlot::new(),
            runtime,
            limits: Arc::new(limits),
            terminate,
            executions: TaskTracker::new(),
        }
    }
}
