//! Leak trackers: per-resource heuristics that decide when the monitor
//! should trigger a dump.

use log::info;

use crate::config::MonitorConfig;
use crate::sysinfo::SystemSnapshot;

/// Thread/fd counts fluctuate; a reading still counts as "at the high
/// water mark" while it stays within this many units below the previous
/// poll.
const COUNT_THRESHOLD_GAP: u32 = 50;

/// Heap ratio equivalent of the count gap.
const HEAP_RATIO_GAP: f32 = 0.05;

/// One dump-trigger heuristic. `track` is fed every poll; returning
/// `true` means this tracker wants a dump, and `reason` labels it in the
/// report and the logs.
pub trait LeakTracker {
    fn track(&mut self, snapshot: &SystemSnapshot) -> bool;
    fn reset(&mut self);
    fn reason(&self) -> &'static str;
}

/// Fires after the heap used ratio holds above threshold for the
/// configured number of consecutive polls.
pub struct HeapGrowthTracker {
    threshold: f32,
    max_over_count: u32,
    last_ratio: f32,
    over_count: u32,
}

impl HeapGrowthTracker {
    pub fn new(config: &MonitorConfig) -> Self {
        Self {
            threshold: config.heap_threshold,
            max_over_count: config.max_over_threshold_count,
            last_ratio: 0.0,
            over_count: 0,
        }
    }
}

impl LeakTracker for HeapGrowthTracker {
    fn track(&mut self, snapshot: &SystemSnapshot) -> bool {
        let ratio = snapshot.heap.used_ratio;
        if ratio > self.threshold && ratio >= self.last_ratio - HEAP_RATIO_GAP {
            self.over_count += 1;
            info!(
                "heap over threshold: ratio {ratio:.2}, streak {}",
                self.over_count
            );
        } else {
            self.reset();
        }
        self.last_ratio = ratio;
        self.over_count >= self.max_over_count
    }

    fn reset(&mut self) {
        self.last_ratio = 0.0;
        self.over_count = 0;
    }

    fn reason(&self) -> &'static str {
        "heap_over_threshold"
    }
}

/// Fires after the thread count plateaus above threshold.
pub struct ThreadCountTracker {
    threshold: u32,
    max_over_count: u32,
    last_count: u32,
    over_count: u32,
}

impl ThreadCountTracker {
    pub fn new(config: &MonitorConfig) -> Self {
        Self {
            threshold: config.thread_threshold,
            max_over_count: config.max_over_threshold_count,
            last_count: 0,
            over_count: 0,
        }
    }
}

impl LeakTracker for ThreadCountTracker {
    fn track(&mut self, snapshot: &SystemSnapshot) -> bool {
        let count = snapshot.status.threads;
        if count > self.threshold && count >= self.last_count.saturating_sub(COUNT_THRESHOLD_GAP) {
            self.over_count += 1;
            info!(
                "threads over threshold: {count}, streak {}",
                self.over_count
            );
        } else {
            self.reset();
        }
        self.last_count = count;
        self.over_count >= self.max_over_count
    }

    fn reset(&mut self) {
        self.last_count = 0;
        self.over_count = 0;
    }

    fn reason(&self) -> &'static str {
        "thread_over_threshold"
    }
}

/// Fires after the open-fd count plateaus above threshold.
pub struct FdCountTracker {
    threshold: u32,
    max_over_count: u32,
    last_count: u32,
    over_count: u32,
}

impl FdCountTracker {
    pub fn new(config: &MonitorConfig) -> Self {
        Self {
            threshold: config.fd_threshold,
            max_over_count: config.max_over_threshold_count,
            last_count: 0,
            over_count: 0,
        }
    }
}

impl LeakTracker for FdCountTracker {
    fn track(&mut self, snapshot: &SystemSnapshot) -> bool {
        let count = snapshot.status.fds;
        if count > self.threshold && count >= self.last_count.saturating_sub(COUNT_THRESHOLD_GAP) {
            self.over_count += 1;
            info!("fds over threshold: {count}, streak {}", self.over_count);
        } else {
            self.reset();
        }
        self.last_count = count;
        self.over_count >= self.max_over_count
    }

    fn reset(&mut self) {
        self.last_count = 0;
        self.over_count = 0;
    }

    fn reason(&self) -> &'static str {
        "fd_over_threshold"
    }
}

/// Fires after device memory availability stays below threshold.
pub struct DeviceMemoryTracker {
    threshold: f32,
    max_over_count: u32,
    over_count: u32,
}

impl DeviceMemoryTracker {
    pub fn new(config: &MonitorConfig) -> Self {
        Self {
            threshold: config.device_memory_threshold,
            max_over_count: config.max_over_threshold_count,
            over_count: 0,
        }
    }
}

impl LeakTracker for DeviceMemoryTracker {
    fn track(&mut self, snapshot: &SystemSnapshot) -> bool {
        let ratio = snapshot.mem.available_ratio;
        if ratio < self.threshold {
            self.over_count += 1;
            info!(
                "device memory low: available ratio {ratio:.2}, streak {}",
                self.over_count
            );
        } else {
            self.reset();
        }
        self.over_count >= self.max_over_count
    }

    fn reset(&mut self) {
        self.over_count = 0;
    }

    fn reason(&self) -> &'static str {
        "low_device_memory"
    }
}

/// Fires immediately when the heap is nearly full or grew by a huge
/// amount since the previous poll; waiting for a streak here would risk
/// the process dying before any dump is taken.
pub struct HugeDeltaTracker {
    force_ratio: f32,
    force_delta: u64,
}

impl HugeDeltaTracker {
    pub fn new(config: &MonitorConfig) -> Self {
        Self {
            force_ratio: config.force_dump_heap_ratio,
            force_delta: config.force_dump_heap_delta,
        }
    }
}

impl LeakTracker for HugeDeltaTracker {
    fn track(&mut self, snapshot: &SystemSnapshot) -> bool {
        if snapshot.heap.used_ratio >= self.force_ratio {
            info!(
                "heap nearly full: ratio {:.2} >= {:.2}",
                snapshot.heap.used_ratio, self.force_ratio
            );
            return true;
        }
        let delta = snapshot.heap.used.saturating_sub(snapshot.last_heap.used);
        if snapshot.last_heap.used > 0 && delta >= self.force_delta {
            info!("huge allocation delta: {delta} bytes since last poll");
            return true;
        }
        false
    }

    fn reset(&mut self) {}

    fn reason(&self) -> &'static str {
        "huge_allocation_delta"
    }
}

/// The production tracker set, in the order their reasons should appear.
pub fn default_trackers(config: &MonitorConfig) -> Vec<Box<dyn LeakTracker + Send>> {
    vec![
        Box::new(HeapGrowthTracker::new(config)),
        Box::new(ThreadCountTracker::new(config)),
        Box::new(FdCountTracker::new(config)),
        Box::new(DeviceMemoryTracker::new(config)),
        Box::new(HugeDeltaTracker::new(config)),
    ]
}
