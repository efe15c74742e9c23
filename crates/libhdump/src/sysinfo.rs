//! Process and device memory statistics, read from procfs.

use std::fs;
use std::path::Path;
use std::sync::LazyLock;

use log::info;
use regex::Regex;
use serde::Serialize;

use crate::coordinator::HeapSerializer;
use crate::errors::HdumpResult;

static VSS_RE: LazyLock<Regex> = LazyLock::new(|| re(r"VmSize:\s*(\d+)\s*kB"));
static RSS_RE: LazyLock<Regex> = LazyLock::new(|| re(r"VmRSS:\s*(\d+)\s*kB"));
static THREADS_RE: LazyLock<Regex> = LazyLock::new(|| re(r"Threads:\s*(\d+)\s*"));
static MEM_TOTAL_RE: LazyLock<Regex> = LazyLock::new(|| re(r"MemTotal:\s*(\d+)\s*kB"));
static MEM_FREE_RE: LazyLock<Regex> = LazyLock::new(|| re(r"MemFree:\s*(\d+)\s*kB"));
static MEM_AVA_RE: LazyLock<Regex> = LazyLock::new(|| re(r"MemAvailable:\s*(\d+)\s*kB"));
static MEM_CMA_RE: LazyLock<Regex> = LazyLock::new(|| re(r"CmaTotal:\s*(\d+)\s*kB"));
static MEM_ION_RE: LazyLock<Regex> = LazyLock::new(|| re(r"ION_heap:\s*(\d+)\s*kB"));

fn re(pattern: &str) -> Regex {
    Regex::new(pattern).expect("static pattern")
}

fn match_value(regex: &Regex, line: &str) -> Option<u64> {
    regex
        .captures(line)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// Figures from `/proc/self/status` plus the open-fd count.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ProcessStatus {
    pub vss_kb: u64,
    pub rss_kb: u64,
    pub threads: u32,
    pub fds: u32,
}

/// Device-wide figures from `/proc/meminfo`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Serialize)]
pub struct MemInfo {
    pub total_kb: u64,
    pub free_kb: u64,
    pub available_kb: u64,
    pub cma_total_kb: u64,
    pub ion_heap_kb: u64,
    pub available_ratio: f32,
}

/// Managed-heap figures supplied by the embedding runtime.
#[derive(Debug, Default, Clone, Copy, PartialEq, Serialize)]
pub struct RuntimeHeap {
    pub max: u64,
    pub total: u64,
    pub free: u64,
    pub used: u64,
    pub used_ratio: f32,
}

impl RuntimeHeap {
    pub fn from_figures(max: u64, total: u64, free: u64) -> Self {
        let used = total.saturating_sub(free);
        let used_ratio = if max == 0 {
            0.0
        } else {
            used as f32 / max as f32
        };
        Self {
            max,
            total,
            free,
            used,
            used_ratio,
        }
    }
}

/// Current and previous readings of every figure the trackers watch.
/// Trackers compare a reading against the previous poll to tell a high
/// plateau from a spike that is already draining.
#[derive(Debug, Default, Clone)]
pub struct SystemSnapshot {
    pub status: ProcessStatus,
    pub mem: MemInfo,
    pub heap: RuntimeHeap,
    pub last_status: ProcessStatus,
    pub last_mem: MemInfo,
    pub last_heap: RuntimeHeap,
}

impl SystemSnapshot {
    /// Roll the current readings into the previous slot and re-read
    /// procfs. `heap` comes from the caller since the managed heap is
    /// not visible through procfs.
    pub fn refresh(&mut self, heap: RuntimeHeap) -> HdumpResult<()> {
        self.last_status = self.status;
        self.last_mem = self.mem;
        self.last_heap = self.heap;

        let mut status = read_process_status(Path::new("/proc/self/status"))?;
        status.fds = count_open_fds();
        self.status = status;
        self.mem = read_mem_info(Path::new("/proc/meminfo"))?;
        self.heap = heap;

        info!(
            "[heap] max:{} used ratio:{}%",
            self.heap.max,
            (self.heap.used_ratio * 100.0) as u32
        );
        info!(
            "[proc] VmSize:{}kB VmRSS:{}kB Threads:{} fds:{}",
            self.status.vss_kb, self.status.rss_kb, self.status.threads, self.status.fds
        );
        info!(
            "[meminfo] MemTotal:{}kB MemFree:{}kB MemAvailable:{}kB ratio:{}%",
            self.mem.total_kb,
            self.mem.free_kb,
            self.mem.available_kb,
            (self.mem.available_ratio * 100.0) as u32
        );
        Ok(())
    }
}

/// Parse the VmSize/VmRSS/Threads lines of a status file.
pub fn read_process_status(path: &Path) -> HdumpResult<ProcessStatus> {
    let mut status = ProcessStatus::default();
    for line in fs::read_to_string(path)?.lines() {
        if line.starts_with("VmSize") {
            status.vss_kb = match_value(&VSS_RE, line).unwrap_or(0);
        } else if line.starts_with("VmRSS") {
            status.rss_kb = match_value(&RSS_RE, line).unwrap_or(0);
        } else if line.starts_with("Threads") {
            status.threads = match_value(&THREADS_RE, line).unwrap_or(0) as u32;
        }
    }
    Ok(status)
}

/// Parse the interesting lines of a meminfo file.
pub fn read_mem_info(path: &Path) -> HdumpResult<MemInfo> {
    let mut mem = MemInfo::default();
    for line in fs::read_to_string(path)?.lines() {
        if line.starts_with("MemTotal") {
            mem.total_kb = match_value(&MEM_TOTAL_RE, line).unwrap_or(0);
        } else if line.starts_with("MemFree") {
            mem.free_kb = match_value(&MEM_FREE_RE, line).unwrap_or(0);
        } else if line.starts_with("MemAvailable") {
            mem.available_kb = match_value(&MEM_AVA_RE, line).unwrap_or(0);
        } else if line.starts_with("CmaTotal") {
            mem.cma_total_kb = match_value(&MEM_CMA_RE, line).unwrap_or(0);
        } else if line.starts_with("ION_heap") {
            mem.ion_heap_kb = match_value(&MEM_ION_RE, line).unwrap_or(0);
        }
    }
    if mem.total_kb > 0 {
        mem.available_ratio = mem.available_kb as f32 / mem.total_kb as f32;
    }
    Ok(mem)
}

/// Number of open file descriptors, or 0 when procfs is unreadable.
pub fn count_open_fds() -> u32 {
    fs::read_dir("/proc/self/fd")
        .map(|entries| entries.count() as u32)
        .unwrap_or(0)
}

/// Names of every thread in this process, from `/proc/self/task/*/comm`.
pub fn thread_names() -> Vec<String> {
    let Ok(tasks) = fs::read_dir("/proc/self/task") else {
        return Vec::new();
    };
    tasks
        .flatten()
        .map(|task| {
            fs::read_to_string(task.path().join("comm"))
                .map(|name| name.trim_end_matches('\n').to_string())
                .unwrap_or_else(|_| format!("failed to read {}", task.path().display()))
        })
        .collect()
}

/// Targets of every open descriptor, from `/proc/self/fd`.
pub fn fd_names() -> Vec<String> {
    let Ok(entries) = fs::read_dir("/proc/self/fd") else {
        return Vec::new();
    };
    entries
        .flatten()
        .map(|entry| {
            fs::read_link(entry.path())
                .map(|target| target.display().to_string())
                .unwrap_or_else(|_| entry.file_name().to_string_lossy().into_owned())
        })
        .collect()
}

/// Dump routine for a native process snapshotting itself: copies the
/// clone's per-mapping memory accounting. A managed runtime substitutes
/// its own serializer here.
pub struct ProcSmapsSerializer;

impl HeapSerializer for ProcSmapsSerializer {
    fn write_heap_dump(&self, path: &Path) -> HdumpResult<()> {
        let contents = fs::read("/proc/self/smaps")?;
        fs::write(path, contents)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn parses_status_fixture() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "Name:\thdump").unwrap();
        writeln!(file, "VmSize:\t  123456 kB").unwrap();
        writeln!(file, "VmRSS:\t    7890 kB").unwrap();
        writeln!(file, "Threads:\t42").unwrap();

        let status = read_process_status(file.path()).unwrap();
        assert_eq!(status.vss_kb, 123_456);
        assert_eq!(status.rss_kb, 7_890);
        assert_eq!(status.threads, 42);
    }

    #[test]
    fn parses_meminfo_fixture() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "MemTotal:        8000000 kB").unwrap();
        writeln!(file, "MemFree:         1000000 kB").unwrap();
        writeln!(file, "MemAvailable:    2000000 kB").unwrap();
        writeln!(file, "CmaTotal:          32768 kB").unwrap();

        let mem = read_mem_info(file.path()).unwrap();
        assert_eq!(mem.total_kb, 8_000_000);
        assert_eq!(mem.available_kb, 2_000_000);
        assert_eq!(mem.cma_total_kb, 32_768);
        assert!((mem.available_ratio - 0.25).abs() < 1e-6);
    }

    #[test]
    fn missing_fields_default_to_zero() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "Name:\thdump").unwrap();

        let status = read_process_status(file.path()).unwrap();
        assert_eq!(status, ProcessStatus::default());
    }

    #[test]
    fn heap_figures_derive_used_and_ratio() {
        let heap = RuntimeHeap::from_figures(1000, 600, 100);
        assert_eq!(heap.used, 500);
        assert!((heap.used_ratio - 0.5).abs() < 1e-6);

        let empty = RuntimeHeap::from_figures(0, 0, 0);
        assert_eq!(empty.used_ratio, 0.0);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn live_snapshot_refresh_sees_this_process() {
        let mut snapshot = SystemSnapshot::default();
        snapshot
            .refresh(RuntimeHeap::from_figures(1024, 512, 256))
            .unwrap();
        assert!(snapshot.status.rss_kb > 0);
        assert!(snapshot.status.threads >= 1);
        assert!(snapshot.mem.total_kb > 0);
        assert_eq!(snapshot.heap.used, 256);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn thread_and_fd_listings_are_nonempty() {
        assert!(!thread_names().is_empty());
        assert!(!fd_names().is_empty());
    }
}
