//! Control bridge over the managed runtime: mutator-thread suspension,
//! copy-on-write forking, resumption and child reaping.

use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, warn};
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::{ForkResult, Pid, fork};

use crate::errors::{HdumpError, HdumpResult};

/// Lowest runtime ABI level the suspension hooks are known to work on.
pub const MIN_SUPPORTED_ABI: u32 = 21;

/// Highest runtime ABI level the suspension hooks are known to work on.
pub const MAX_SUPPORTED_ABI: u32 = 30;

/// Whether an ABI level falls inside the closed supported window.
/// Values outside are a static "unsupported" classification, never a
/// transient error.
pub fn abi_supported(abi: u32) -> bool {
    (MIN_SUPPORTED_ABI..=MAX_SUPPORTED_ABI).contains(&abi)
}

/// Which side of the fork the current process ended up on.
///
/// The same `suspend_and_fork` call returns in two divergent processes;
/// callers dispatch by matching the variant, never by comparing a raw
/// pid against zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForkOutcome {
    /// This process is the fresh clone holding the copy-on-write heap image.
    Child,
    /// This process is the original; the clone is reachable through its pid.
    Parent(Pid),
    /// No clone was created. Mutator threads have already been resumed.
    Failed,
}

/// Consumed interface to the runtime's native thread-control capability.
///
/// Implementations pause and resume the runtime's own mutator threads and
/// duplicate the process while they are halted. The halt starts at
/// `suspend_and_fork` and, in the parent, lasts until `resume_and_wait`
/// issues the resume; that interval is the only latency the snapshot
/// imposes on the monitored application.
pub trait RuntimeControlBridge {
    /// Whether the native side finished loading in this process.
    /// Idempotent; repeated calls return the same answer with no side
    /// effects.
    fn is_loaded(&self) -> bool;

    /// ABI level of the runtime this process is executing on.
    fn runtime_abi(&self) -> u32;

    /// Halt all mutator threads, then fork while halted.
    fn suspend_and_fork(&self) -> HdumpResult<ForkOutcome>;

    /// Parent only: resume mutator threads immediately, then block until
    /// `child` produces a definitive completion signal. At most one call
    /// per fork, never from the child branch.
    fn resume_and_wait(&self, child: Pid) -> HdumpResult<bool>;

    /// Child only: end the current process without returning. A divergent
    /// clone must not flush shared buffers, release shared locks, or
    /// resume threads it does not own.
    fn terminate_self(&self) -> !;
}

/// Suspension and resumption entry points supplied by the embedding
/// runtime, resolved once at bridge initialization.
pub struct RuntimeHooks {
    pub suspend: Box<dyn Fn() + Send + Sync>,
    pub resume: Box<dyn Fn() + Send + Sync>,
}

impl RuntimeHooks {
    /// Hooks that control no threads. Suitable only for single-threaded
    /// processes snapshotting themselves, where there is nothing to halt.
    pub fn noop() -> Self {
        Self {
            suspend: Box::new(|| {}),
            resume: Box::new(|| {}),
        }
    }
}

const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Production bridge backed by `fork(2)`/`waitpid(2)` and the injected
/// runtime hooks.
pub struct NativeBridge {
    hooks: OnceLock<RuntimeHooks>,
    load_failed: AtomicBool,
    abi_level: u32,
    wait_ceiling: Duration,
}

impl NativeBridge {
    /// Create an uninitialized bridge; `initialize` must succeed before
    /// any other operation.
    pub fn new(abi_level: u32, wait_ceiling: Duration) -> Self {
        Self {
            hooks: OnceLock::new(),
            load_failed: AtomicBool::new(false),
            abi_level,
            wait_ceiling,
        }
    }

    /// Create a bridge that is already initialized with `hooks`.
    pub fn with_hooks(hooks: RuntimeHooks, abi_level: u32, wait_ceiling: Duration) -> Self {
        let bridge = Self::new(abi_level, wait_ceiling);
        let _ = bridge.hooks.set(hooks);
        bridge
    }

    /// One-time setup: resolve the runtime's suspend/resume entry points.
    /// Idempotent once successful; a failed resolution marks the bridge
    /// unloaded for the rest of the process lifetime.
    pub fn initialize<R>(&self, resolve: R) -> HdumpResult<()>
    where
        R: FnOnce() -> Option<RuntimeHooks>,
    {
        if self.hooks.get().is_some() {
            return Ok(());
        }
        if self.load_failed.load(Ordering::Acquire) {
            return Err(HdumpError::BridgeUnavailable);
        }
        match resolve() {
            Some(hooks) => {
                let _ = self.hooks.set(hooks);
                Ok(())
            }
            None => {
                self.load_failed.store(true, Ordering::Release);
                Err(HdumpError::BridgeUnavailable)
            }
        }
    }

    fn hooks(&self) -> HdumpResult<&RuntimeHooks> {
        self.hooks.get().ok_or(HdumpError::BridgeUnavailable)
    }
}

impl RuntimeControlBridge for NativeBridge {
    fn is_loaded(&self) -> bool {
        self.hooks.get().is_some()
    }

    fn runtime_abi(&self) -> u32 {
        self.abi_level
    }

    fn suspend_and_fork(&self) -> HdumpResult<ForkOutcome> {
        let hooks = self.hooks()?;
        (hooks.suspend)();
        // SAFETY: mutator threads are halted, so the clone inherits a
        // consistent heap image. The child performs a single dump write
        // and `_exit`s; it never returns into shared-process logic.
        match unsafe { fork() } {
            Ok(ForkResult::Child) => Ok(ForkOutcome::Child),
            Ok(ForkResult::Parent { child }) => {
                debug!("forked dump child {child}");
                Ok(ForkOutcome::Parent(child))
            }
            Err(errno) => {
                // No clone exists; the runtime must not stay halted.
                (hooks.resume)();
                warn!("fork failed: {errno}");
                Ok(ForkOutcome::Failed)
            }
        }
    }

    fn resume_and_wait(&self, child: Pid) -> HdumpResult<bool> {
        let hooks = self.hooks()?;
        (hooks.resume)();
        debug!("mutator threads resumed, waiting on dump child {child}");

        let deadline = Instant::now() + self.wait_ceiling;
        loop {
            match waitpid(child, Some(WaitPidFlag::WNOHANG))? {
                WaitStatus::StillAlive => {
                    if Instant::now() >= deadline {
                        warn!("dump child {child} exceeded wait ceiling, killing it");
                        let _ = signal::kill(child, Signal::SIGKILL);
                        let _ = waitpid(child, None);
                        return Err(HdumpError::WaitTimeout {
                            child,
                            ceiling: self.wait_ceiling,
                        });
                    }
                    thread::sleep(WAIT_POLL_INTERVAL);
                }
                WaitStatus::Exited(_, code) => {
                    debug!("dump child {child} exited with code {code}");
                    return Ok(code == 0);
                }
                WaitStatus::Signaled(_, sig, _) => {
                    warn!("dump child {child} killed by {sig}");
                    return Ok(false);
                }
                status => {
                    debug!("ignoring wait status {status:?} from dump child {child}");
                }
            }
        }
    }

    fn terminate_self(&self) -> ! {
        // _exit, not exit: atexit handlers and stdio buffers belong to the
        // original process, and this clone must not flush or run them.
        unsafe { nix::libc::_exit(0) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn abi_window_is_closed_and_inclusive() {
        assert!(!abi_supported(MIN_SUPPORTED_ABI - 1));
        assert!(abi_supported(MIN_SUPPORTED_ABI));
        assert!(abi_supported(MAX_SUPPORTED_ABI));
        assert!(!abi_supported(MAX_SUPPORTED_ABI + 1));
    }

    #[test]
    fn initialize_is_idempotent_once_loaded() {
        let bridge = NativeBridge::new(24, Duration::from_secs(1));
        assert!(!bridge.is_loaded());

        bridge
            .initialize(|| Some(RuntimeHooks::noop()))
            .expect("first initialize");
        assert!(bridge.is_loaded());

        // Second call must not re-resolve.
        bridge
            .initialize(|| panic!("resolver must not run again"))
            .expect("second initialize");
        assert!(bridge.is_loaded());
    }

    #[test]
    fn failed_initialize_marks_bridge_unloaded_for_good() {
        let bridge = NativeBridge::new(24, Duration::from_secs(1));
        assert!(bridge.initialize(|| None).is_err());
        assert!(!bridge.is_loaded());

        // Even a later resolver that would succeed is not consulted.
        assert!(matches!(
            bridge.initialize(|| Some(RuntimeHooks::noop())),
            Err(HdumpError::BridgeUnavailable)
        ));
        assert!(!bridge.is_loaded());
    }

    #[test]
    fn is_loaded_is_idempotent() {
        let bridge = NativeBridge::with_hooks(RuntimeHooks::noop(), 24, Duration::from_secs(1));
        assert!(bridge.is_loaded());
        assert!(bridge.is_loaded());
    }
}
