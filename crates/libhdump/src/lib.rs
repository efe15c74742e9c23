//! Core library for the hdump heap snapshotter.
//!
//! Captures a point-in-time heap snapshot of a running process by
//! suspending its mutator threads, forking a copy-on-write clone, and
//! letting the clone do the slow dump write while the original resumes.
//! Provides modules reused by the CLI front end and by embedding
//! runtimes.

pub mod bridge;
pub mod config;
pub mod coordinator;
pub mod errors;
pub mod files;
pub mod monitor;
pub mod report;
pub mod sysinfo;
pub mod tracker;

pub use bridge::{ForkOutcome, NativeBridge, RuntimeControlBridge, RuntimeHooks};
pub use coordinator::{CaptureRequest, HeapSerializer, SnapshotCoordinator};
pub use errors::{HdumpError, HdumpResult};

/// Exposes the crate version for CLI reporting and artifact prefixes.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
