//! Error taxonomy for the snapshot core.

use std::path::PathBuf;
use std::time::Duration;

use nix::errno;
use nix::unistd::Pid;
use thiserror::Error;

/// Unified result type across the snapshot core.
pub type HdumpResult<T> = Result<T, HdumpError>;

/// Error cases
#[derive(Debug, Error)]
pub enum HdumpError {
    /// The native control bridge never finished loading in this process.
    #[error("runtime control bridge not loaded")]
    BridgeUnavailable,

    /// Runtime version outside the supported window. Static, not retryable.
    #[error("runtime abi level {0} is outside the supported window")]
    UnsupportedRuntime(u32),

    #[error("suspend-and-fork produced no child process")]
    ForkFailed,

    #[error("no completion signal from dump child {child} within {ceiling:?}")]
    WaitTimeout { child: Pid, ceiling: Duration },

    /// Another capture is still in flight on this coordinator.
    #[error("capture already in flight")]
    CaptureInFlight,

    #[error("not enough free space in {}: {available} bytes available, {required} required", .dir.display())]
    InsufficientSpace {
        dir: PathBuf,
        available: u64,
        required: u64,
    },

    #[error("system call failed: {0}")]
    SysCall(#[from] errno::Errno),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
