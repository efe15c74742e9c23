//! Suspend-fork-dump-resume coordination.
//!
//! The coordinator freezes the runtime's mutator threads just long enough
//! to fork a process holding a consistent copy-on-write heap image, then
//! resumes the original threads while the clone does the slow disk write.
//! The visible stall on the monitored application is bounded by the fork
//! interval, not the dump-write interval.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use log::{debug, error, info};

use crate::bridge::{self, ForkOutcome, RuntimeControlBridge};
use crate::errors::{HdumpError, HdumpResult};

/// One dump request: destination path plus the reason the capture was
/// triggered. The reason is diagnostic metadata only.
#[derive(Debug, Clone)]
pub struct CaptureRequest {
    path: PathBuf,
    reason: String,
}

impl CaptureRequest {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            reason: "manual".to_string(),
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = reason.into();
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }
}

/// Where a single capture currently stands. Lives only for the duration
/// of one `capture_snapshot` call; transitions are logged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CaptureState {
    Ready,
    Rejected,
    Forking,
    ChildBranch,
    ParentBranch,
    ForkFailed,
    Completed,
}

/// The runtime's own heap-serialization routine. External collaborator;
/// the bytes it writes are an opaque runtime-native format.
pub trait HeapSerializer {
    fn write_heap_dump(&self, path: &Path) -> HdumpResult<()>;
}

/// Coordinates one snapshot at a time for the monitored process.
///
/// The capability gate is evaluated once at construction; a bridge that
/// reports unloaded makes every later capture fail fast with no bridge
/// invocation.
pub struct SnapshotCoordinator<B> {
    bridge: B,
    serializer: Box<dyn HeapSerializer + Send + Sync>,
    bridge_loaded: bool,
    in_flight: AtomicBool,
}

impl<B: RuntimeControlBridge> SnapshotCoordinator<B> {
    pub fn new(bridge: B, serializer: Box<dyn HeapSerializer + Send + Sync>) -> Self {
        let bridge_loaded = bridge.is_loaded();
        Self {
            bridge,
            serializer,
            bridge_loaded,
            in_flight: AtomicBool::new(false),
        }
    }

    /// Capture a heap snapshot to the requested path.
    ///
    /// Blocks for the suspend+fork+resume+wait duration, not for the
    /// clone's dump-write time. Every failure collapses to `false` here;
    /// a failed capture never disturbs the monitored process. In the
    /// child branch this function does not return at all.
    pub fn capture_snapshot(&self, request: &CaptureRequest) -> bool {
        match self.try_capture(request) {
            Ok(completed) => completed,
            Err(err) => {
                error!(
                    "capture to {} failed: {err}",
                    request.path().display()
                );
                false
            }
        }
    }

    fn try_capture(&self, request: &CaptureRequest) -> HdumpResult<bool> {
        let mut state = CaptureState::Ready;

        if !self.bridge_loaded {
            transition(&mut state, CaptureState::Rejected);
            return Err(HdumpError::BridgeUnavailable);
        }
        let abi = self.bridge.runtime_abi();
        if !bridge::abi_supported(abi) {
            transition(&mut state, CaptureState::Rejected);
            return Err(HdumpError::UnsupportedRuntime(abi));
        }

        let _guard = self.begin_flight()?;

        info!(
            "capturing heap snapshot to {} (reason: {})",
            request.path().display(),
            request.reason()
        );

        transition(&mut state, CaptureState::Forking);
        match self.bridge.suspend_and_fork()? {
            ForkOutcome::Child => {
                transition(&mut state, CaptureState::ChildBranch);
                self.child_branch(request)
            }
            ForkOutcome::Parent(child) => {
                transition(&mut state, CaptureState::ParentBranch);
                let completed = self.bridge.resume_and_wait(child)?;
                transition(&mut state, CaptureState::Completed);
                info!("completion signal from dump child {child}: {completed}");
                Ok(completed)
            }
            ForkOutcome::Failed => {
                // No clone was created and the bridge has already resumed
                // the mutator threads; nothing is left suspended.
                transition(&mut state, CaptureState::ForkFailed);
                Err(HdumpError::ForkFailed)
            }
        }
    }

    /// The clone's entire life: write the dump, then terminate. There is
    /// no error channel back to the original process; a failed write is
    /// observable only as a missing or truncated file.
    fn child_branch(&self, request: &CaptureRequest) -> ! {
        if let Err(err) = self.serializer.write_heap_dump(request.path()) {
            error!("dump write failed in child: {err}");
        }
        self.bridge.terminate_self()
    }

    fn begin_flight(&self) -> HdumpResult<FlightGuard<'_>> {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(HdumpError::CaptureInFlight);
        }
        Ok(FlightGuard(&self.in_flight))
    }
}

fn transition(state: &mut CaptureState, next: CaptureState) {
    debug!("capture state {state:?} -> {next:?}");
    *state = next;
}

/// Clears the single-flight latch when the capture call unwinds or
/// returns. The child branch never drops it; the clone exits instead.
struct FlightGuard<'a>(&'a AtomicBool);

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}
