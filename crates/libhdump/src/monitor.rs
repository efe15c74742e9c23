//! Background leak monitor: polls process statistics, evaluates the
//! trackers, and triggers at most one fork snapshot per process
//! lifetime.

use std::fs;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

use chrono::Local;
use log::{error, info, warn};

use crate::bridge::RuntimeControlBridge;
use crate::config::MonitorConfig;
use crate::coordinator::{CaptureRequest, SnapshotCoordinator};
use crate::errors::HdumpResult;
use crate::files::{AnalysisLedger, DumpDirectory};
use crate::sysinfo::{self, RuntimeHeap, SystemSnapshot};
use crate::tracker::{LeakTracker, default_trackers};

/// What one poll decided about the loop's future.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Continue,
    /// The monitor's work for this process lifetime is done.
    Terminate,
}

/// Supplies managed-heap figures each poll; procfs cannot see them.
pub type HeapStatsFn = Box<dyn Fn() -> RuntimeHeap + Send>;

pub struct LeakMonitor<B> {
    config: MonitorConfig,
    coordinator: Arc<SnapshotCoordinator<B>>,
    files: DumpDirectory,
    ledger: AnalysisLedger,
    trackers: Vec<Box<dyn LeakTracker + Send>>,
    snapshot: SystemSnapshot,
    heap_stats: HeapStatsFn,
    has_dumped: bool,
}

impl<B> LeakMonitor<B>
where
    B: RuntimeControlBridge + Send + Sync + 'static,
{
    pub fn new(
        config: MonitorConfig,
        coordinator: Arc<SnapshotCoordinator<B>>,
        files: DumpDirectory,
        heap_stats: HeapStatsFn,
    ) -> HdumpResult<Self> {
        let ledger = AnalysisLedger::load_or_create(files.ledger_path(), crate::version())?;
        let pending = files.sweep_stale()?;
        if !pending.is_empty() {
            info!("{} dump(s) from earlier runs await analysis", pending.len());
        }
        let trackers = default_trackers(&config);
        Ok(Self {
            config,
            coordinator,
            files,
            ledger,
            trackers,
            snapshot: SystemSnapshot::default(),
            heap_stats,
            has_dumped: false,
        })
    }

    /// One monitor tick: refresh statistics, run every tracker, and dump
    /// when any of them fire and the analysis budget allows it.
    pub fn poll_once(&mut self) -> LoopState {
        if self.has_dumped {
            return LoopState::Terminate;
        }

        let heap = (self.heap_stats)();
        if let Err(err) = self.snapshot.refresh(heap) {
            warn!("skipping poll, statistics refresh failed: {err}");
            return LoopState::Continue;
        }

        let mut reasons = Vec::new();
        for tracker in &mut self.trackers {
            if tracker.track(&self.snapshot) {
                reasons.push(tracker.reason());
            }
        }
        if reasons.is_empty() {
            return LoopState::Continue;
        }
        info!("dump triggered by: {}", reasons.join(","));

        if !self.ledger.within_budget(
            self.config.analysis_max_times_per_version,
            self.config.analysis_period_per_version,
        ) {
            warn!("triggered, but analysis budget for this version is spent");
            return LoopState::Terminate;
        }

        // One dump per process lifetime, whatever its outcome.
        self.has_dumped = true;
        if let Err(err) = self.dump_for(&reasons) {
            error!("triggered dump failed: {err}");
        }
        LoopState::Terminate
    }

    fn dump_for(&mut self, reasons: &[&'static str]) -> HdumpResult<()> {
        // A copy-on-write dump needs roughly the current heap on disk,
        // with headroom for metadata.
        let required = self.snapshot.heap.used.max(self.snapshot.status.rss_kb * 1024) * 3 / 2;
        self.files.ensure_space(required)?;

        self.files
            .write_threshold_dump(&self.files.thread_dump_dir(), &sysinfo::thread_names())?;
        self.files
            .write_threshold_dump(&self.files.fd_dump_dir(), &sysinfo::fd_names())?;

        let now = Local::now();
        let dump_path = self.files.analysis_dump_path(now)?;
        let report_path = self.files.report_path(now)?;
        // The report file exists from the start so a crash mid-analysis
        // is distinguishable from an analysis that never began.
        fs::write(&report_path, b"")?;

        let request = CaptureRequest::new(&dump_path).with_reason(reasons.join(","));
        let completed = self.coordinator.capture_snapshot(&request);
        info!(
            "dump to {} completed: {completed}",
            dump_path.display()
        );
        if completed {
            self.ledger.record_analysis()?;
        }
        Ok(())
    }

    /// Spawn the polling loop on a background thread.
    pub fn start(mut self) -> HdumpResult<MonitorHandle> {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = stop.clone();
        let interval = self.config.poll_interval;
        let join = thread::Builder::new()
            .name("hdump-monitor".to_string())
            .spawn(move || {
                info!("leak monitor started, polling every {interval:?}");
                while !stop_flag.load(Ordering::Acquire) {
                    if self.poll_once() == LoopState::Terminate {
                        info!("leak monitor finished");
                        break;
                    }
                    thread::sleep(interval);
                }
            })?;
        Ok(MonitorHandle {
            stop,
            join: Some(join),
        })
    }
}

/// Stops and joins the monitor thread.
pub struct MonitorHandle {
    stop: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl MonitorHandle {
    pub fn stop(mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }

    /// Block until the monitor finishes of its own accord.
    pub fn join(mut self) {
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::ForkOutcome;
    use crate::coordinator::HeapSerializer;
    use crate::errors::HdumpResult;
    use nix::unistd::Pid;
    use std::path::Path;
    use std::time::Duration;

    /// Parent-side bridge: every fork lands in the parent branch and the
    /// child reports success.
    struct ParentBridge;

    impl RuntimeControlBridge for ParentBridge {
        fn is_loaded(&self) -> bool {
            true
        }

        fn runtime_abi(&self) -> u32 {
            24
        }

        fn suspend_and_fork(&self) -> HdumpResult<ForkOutcome> {
            Ok(ForkOutcome::Parent(Pid::from_raw(1234)))
        }

        fn resume_and_wait(&self, _child: Pid) -> HdumpResult<bool> {
            Ok(true)
        }

        fn terminate_self(&self) -> ! {
            unreachable!("parent-side fake")
        }
    }

    struct NoopSerializer;

    impl HeapSerializer for NoopSerializer {
        fn write_heap_dump(&self, _path: &Path) -> HdumpResult<()> {
            Ok(())
        }
    }

    fn monitor_in(
        root: &Path,
        config: MonitorConfig,
        heap_stats: HeapStatsFn,
    ) -> LeakMonitor<ParentBridge> {
        let coordinator = Arc::new(SnapshotCoordinator::new(
            ParentBridge,
            Box::new(NoopSerializer),
        ));
        LeakMonitor::new(
            config,
            coordinator,
            DumpDirectory::new(root, "test"),
            heap_stats,
        )
        .unwrap()
    }

    fn tight_config() -> MonitorConfig {
        MonitorConfig::builder()
            .force_dump_heap_ratio(0.9)
            .poll_interval(Duration::from_millis(1))
            .build(512 * 1024 * 1024)
    }

    #[test]
    fn calm_process_keeps_looping() {
        let dir = tempfile::tempdir().unwrap();
        let mut monitor = monitor_in(
            dir.path(),
            tight_config(),
            Box::new(|| RuntimeHeap::from_figures(1000, 100, 90)),
        );
        assert_eq!(monitor.poll_once(), LoopState::Continue);
        assert_eq!(monitor.poll_once(), LoopState::Continue);
    }

    #[test]
    fn nearly_full_heap_triggers_one_dump_then_terminates() {
        let dir = tempfile::tempdir().unwrap();
        let mut monitor = monitor_in(
            dir.path(),
            tight_config(),
            // used ratio 0.95, forces an immediate dump
            Box::new(|| RuntimeHeap::from_figures(1000, 1000, 50)),
        );

        assert_eq!(monitor.poll_once(), LoopState::Terminate);
        assert_eq!(monitor.ledger.analysis_times(), 1);

        // The trigger artifacts are on disk.
        assert!(monitor.files.thread_dump_dir().join("dump.txt").exists());
        assert!(monitor.files.fd_dump_dir().join("dump.txt").exists());
        let reports: Vec<_> = std::fs::read_dir(monitor.files.analysis_dir())
            .unwrap()
            .flatten()
            .filter(|e| e.path().extension().is_some_and(|ext| ext == "json"))
            .collect();
        assert_eq!(reports.len(), 1);

        // Later polls are a no-op.
        assert_eq!(monitor.poll_once(), LoopState::Terminate);
        assert_eq!(monitor.ledger.analysis_times(), 1);
    }

    #[test]
    fn spent_budget_blocks_the_dump() {
        let dir = tempfile::tempdir().unwrap();
        let config = MonitorConfig::builder()
            .force_dump_heap_ratio(0.9)
            .analysis_max_times_per_version(0)
            .build(512 * 1024 * 1024);
        let mut monitor = monitor_in(
            dir.path(),
            config,
            Box::new(|| RuntimeHeap::from_figures(1000, 1000, 50)),
        );

        assert_eq!(monitor.poll_once(), LoopState::Terminate);
        assert_eq!(monitor.ledger.analysis_times(), 0);
        assert!(!monitor.has_dumped);
    }

    #[test]
    fn start_and_stop_join_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let monitor = monitor_in(
            dir.path(),
            tight_config(),
            Box::new(|| RuntimeHeap::from_figures(1000, 100, 90)),
        );
        let handle = monitor.start().unwrap();
        thread::sleep(Duration::from_millis(10));
        handle.stop();
    }
}
