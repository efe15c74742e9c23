//! Command-line interface for the hdump heap snapshotter.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use libhdump::bridge::{NativeBridge, RuntimeHooks};
use libhdump::config::MonitorConfig;
use libhdump::coordinator::{CaptureRequest, SnapshotCoordinator};
use libhdump::files::DumpDirectory;
use libhdump::monitor::LeakMonitor;
use libhdump::report::HeapReport;
use libhdump::sysinfo::{self, ProcSmapsSerializer, RuntimeHeap, SystemSnapshot};
use log::info;

/// Top-level argument parser describing the snapshotter interface.
#[derive(Parser, Debug)]
#[command(
    name = "hdump",
    version,
    about = "Fork-based heap snapshots for leak diagnosis",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

/// Subcommands exposed by the snapshotter frontend.
#[derive(Subcommand, Debug)]
enum Command {
    /// Capture one snapshot of this process to a file.
    Capture {
        /// Destination path for the dump.
        #[arg(long)]
        out: PathBuf,
        /// Trigger reason, recorded as diagnostic metadata.
        #[arg(long, default_value = "manual")]
        reason: String,
        /// Ceiling in seconds on the wait for the dump child.
        #[arg(long, default_value_t = 60)]
        wait_ceiling: u64,
        /// ABI level reported for the supported-window check.
        #[arg(long, default_value_t = 24)]
        abi_level: u32,
    },
    /// Print current process and device memory statistics.
    Stat,
    /// Poll this process and dump once a leak tracker fires.
    Watch {
        /// Root directory for dump artifacts.
        #[arg(long)]
        root: PathBuf,
        /// Heap limit in megabytes used to derive the used ratio from
        /// resident memory.
        #[arg(long, default_value_t = 512)]
        heap_limit_mb: u64,
        /// Poll interval in seconds.
        #[arg(long, default_value_t = 15)]
        interval: u64,
        /// ABI level reported for the supported-window check.
        #[arg(long, default_value_t = 24)]
        abi_level: u32,
    },
    /// Summarize an analysis report file.
    Report { file: PathBuf },
    /// Display version information for diagnostics.
    Version,
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();
    match cli.cmd {
        Command::Capture {
            out,
            reason,
            wait_ceiling,
            abi_level,
        } => capture(&out, reason, wait_ceiling, abi_level),
        Command::Stat => stat(),
        Command::Watch {
            root,
            heap_limit_mb,
            interval,
            abi_level,
        } => watch(root, heap_limit_mb, interval, abi_level),
        Command::Report { file } => summarize_report(&file),
        Command::Version => {
            println!("hdump {}", libhdump::version());
            Ok(())
        }
    }
}

fn capture(out: &Path, reason: String, wait_ceiling: u64, abi_level: u32) -> Result<()> {
    info!("Capturing snapshot to {}", out.display());
    let bridge = NativeBridge::with_hooks(
        RuntimeHooks::noop(),
        abi_level,
        Duration::from_secs(wait_ceiling),
    );
    let coordinator = SnapshotCoordinator::new(bridge, Box::new(ProcSmapsSerializer));
    let request = CaptureRequest::new(out).with_reason(reason);
    if !coordinator.capture_snapshot(&request) {
        bail!("capture failed, see logs for the classification");
    }
    println!("dump written to {}", out.display());
    Ok(())
}

fn stat() -> Result<()> {
    let mut snapshot = SystemSnapshot::default();
    snapshot.refresh(resident_heap(0))?;

    println!(
        "process: VmSize {} kB, VmRSS {} kB, {} threads, {} fds",
        snapshot.status.vss_kb, snapshot.status.rss_kb, snapshot.status.threads, snapshot.status.fds
    );
    println!(
        "device:  MemTotal {} kB, MemAvailable {} kB ({:.0}% available)",
        snapshot.mem.total_kb,
        snapshot.mem.available_kb,
        snapshot.mem.available_ratio * 100.0
    );
    Ok(())
}

fn watch(root: PathBuf, heap_limit_mb: u64, interval: u64, abi_level: u32) -> Result<()> {
    let heap_limit = heap_limit_mb * 1024 * 1024;
    let config = MonitorConfig::builder()
        .poll_interval(Duration::from_secs(interval))
        .build(heap_limit);

    let bridge = NativeBridge::with_hooks(RuntimeHooks::noop(), abi_level, config.wait_ceiling);
    let coordinator = Arc::new(SnapshotCoordinator::new(bridge, Box::new(ProcSmapsSerializer)));
    let files = DumpDirectory::new(root, libhdump::version());
    let monitor = LeakMonitor::new(
        config,
        coordinator,
        files,
        Box::new(move || resident_heap(heap_limit)),
    )?;

    info!("Watching this process, heap limit {heap_limit_mb} MB");
    monitor.start()?.join();
    Ok(())
}

/// Heap figures for a native process: resident memory against a fixed
/// limit. An embedding managed runtime reports its real heap instead.
fn resident_heap(limit: u64) -> RuntimeHeap {
    let status = sysinfo::read_process_status(Path::new("/proc/self/status")).unwrap_or_default();
    let used = status.rss_kb * 1024;
    RuntimeHeap::from_figures(limit, used, 0)
}

fn summarize_report(file: &Path) -> Result<()> {
    let raw = std::fs::read_to_string(file)
        .with_context(|| format!("reading report {}", file.display()))?;
    let report: HeapReport =
        serde_json::from_str(&raw).with_context(|| format!("parsing report {}", file.display()))?;

    let info = &report.running_info;
    println!(
        "dump reason: {}  analysis done: {}  re-analyses: {}",
        non_empty(&info.dump_reason),
        report
            .analysis_done
            .map_or_else(|| "unknown".to_string(), |done| done.to_string()),
        report.re_analysis_times.unwrap_or(0)
    );
    println!(
        "process at dump time: heap {}/{}, {} threads, {} fds",
        non_empty(&info.heap_used),
        non_empty(&info.heap_max),
        non_empty(&info.thread_count),
        non_empty(&info.fd_count)
    );

    println!("{} reference chain(s):", report.gc_paths.len());
    for path in &report.gc_paths {
        let short_signature: String = path.signature.chars().take(12).collect();
        println!(
            "  x{} [{}] {} (root: {})",
            path.instance_count, short_signature, path.leak_reason, path.gc_root
        );
        for item in &path.path {
            println!("    {:?} {}", item.reference_type, item.reference);
        }
    }

    if !report.class_infos.is_empty() {
        println!("watched classes:");
        for class in &report.class_infos {
            println!("  {} x{}", class.class_name, class.instance_count);
        }
    }
    if !report.leak_objects.is_empty() {
        println!("large leaked objects:");
        for object in &report.leak_objects {
            println!(
                "  {} ({} bytes) id {}",
                object.class_name, object.size, object.object_id
            );
        }
    }
    Ok(())
}

fn non_empty(value: &str) -> &str {
    if value.is_empty() { "?" } else { value }
}
