//! Monitor thresholds and pacing.

use std::time::Duration;

/// Tunables for the leak monitor loop and the capture wait step.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Managed-heap used ratio above which the heap tracker counts a poll
    /// as over threshold.
    pub heap_threshold: f32,
    /// Thread count above which the thread tracker counts a poll.
    pub thread_threshold: u32,
    /// Open-fd count above which the fd tracker counts a poll.
    pub fd_threshold: u32,
    /// Device memory availability ratio below which the device tracker
    /// counts a poll.
    pub device_memory_threshold: f32,
    /// Consecutive over-threshold polls before a tracker fires.
    pub max_over_threshold_count: u32,
    /// Heap used ratio that forces a dump regardless of streaks.
    pub force_dump_heap_ratio: f32,
    /// Heap growth between two polls that forces a dump, in bytes.
    pub force_dump_heap_delta: u64,
    /// Monitor poll interval.
    pub poll_interval: Duration,
    /// Analyses allowed per app version.
    pub analysis_max_times_per_version: u32,
    /// Window after first launch in which analyses may run.
    pub analysis_period_per_version: Duration,
    /// Ceiling on the parent's wait for the dump child. Expiry is a
    /// failed capture; the wait is never unbounded.
    pub wait_ceiling: Duration,
}

impl MonitorConfig {
    pub fn builder() -> MonitorConfigBuilder {
        MonitorConfigBuilder::default()
    }
}

/// Builder with the production defaults; only the thresholds that depend
/// on the process need explicit values.
#[derive(Debug, Default)]
pub struct MonitorConfigBuilder {
    heap_threshold: Option<f32>,
    thread_threshold: Option<u32>,
    fd_threshold: Option<u32>,
    device_memory_threshold: Option<f32>,
    max_over_threshold_count: Option<u32>,
    force_dump_heap_ratio: Option<f32>,
    force_dump_heap_delta: Option<u64>,
    poll_interval: Option<Duration>,
    analysis_max_times_per_version: Option<u32>,
    analysis_period_per_version: Option<Duration>,
    wait_ceiling: Option<Duration>,
}

impl MonitorConfigBuilder {
    pub fn heap_threshold(mut self, ratio: f32) -> Self {
        self.heap_threshold = Some(ratio);
        self
    }

    pub fn thread_threshold(mut self, count: u32) -> Self {
        self.thread_threshold = Some(count);
        self
    }

    pub fn fd_threshold(mut self, count: u32) -> Self {
        self.fd_threshold = Some(count);
        self
    }

    pub fn device_memory_threshold(mut self, ratio: f32) -> Self {
        self.device_memory_threshold = Some(ratio);
        self
    }

    pub fn max_over_threshold_count(mut self, count: u32) -> Self {
        self.max_over_threshold_count = Some(count);
        self
    }

    pub fn force_dump_heap_ratio(mut self, ratio: f32) -> Self {
        self.force_dump_heap_ratio = Some(ratio);
        self
    }

    pub fn force_dump_heap_delta(mut self, bytes: u64) -> Self {
        self.force_dump_heap_delta = Some(bytes);
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = Some(interval);
        self
    }

    pub fn analysis_max_times_per_version(mut self, times: u32) -> Self {
        self.analysis_max_times_per_version = Some(times);
        self
    }

    pub fn analysis_period_per_version(mut self, period: Duration) -> Self {
        self.analysis_period_per_version = Some(period);
        self
    }

    pub fn wait_ceiling(mut self, ceiling: Duration) -> Self {
        self.wait_ceiling = Some(ceiling);
        self
    }

    /// Finalize against the process's maximum managed-heap size, which
    /// picks the default heap ratio tier: small heaps run closer to the
    /// edge before a dump is worth its cost.
    pub fn build(self, max_heap_bytes: u64) -> MonitorConfig {
        let max_heap_mb = max_heap_bytes / (1024 * 1024);
        let default_heap_threshold = if max_heap_mb >= 512 - 10 {
            0.8
        } else if max_heap_mb >= 256 - 10 {
            0.85
        } else {
            0.9
        };

        MonitorConfig {
            heap_threshold: self.heap_threshold.unwrap_or(default_heap_threshold),
            thread_threshold: self.thread_threshold.unwrap_or(750),
            fd_threshold: self.fd_threshold.unwrap_or(1000),
            device_memory_threshold: self.device_memory_threshold.unwrap_or(0.05),
            max_over_threshold_count: self.max_over_threshold_count.unwrap_or(3),
            force_dump_heap_ratio: self.force_dump_heap_ratio.unwrap_or(0.90),
            force_dump_heap_delta: self.force_dump_heap_delta.unwrap_or(350 * 1024 * 1024),
            poll_interval: self.poll_interval.unwrap_or(Duration::from_secs(15)),
            analysis_max_times_per_version: self.analysis_max_times_per_version.unwrap_or(5),
            analysis_period_per_version: self
                .analysis_period_per_version
                .unwrap_or(Duration::from_secs(15 * 24 * 60 * 60)),
            wait_ceiling: self.wait_ceiling.unwrap_or(Duration::from_secs(60)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MB: u64 = 1024 * 1024;

    #[test]
    fn heap_threshold_defaults_by_heap_tier() {
        assert_eq!(MonitorConfig::builder().build(512 * MB).heap_threshold, 0.8);
        assert_eq!(
            MonitorConfig::builder().build(256 * MB).heap_threshold,
            0.85
        );
        assert_eq!(MonitorConfig::builder().build(128 * MB).heap_threshold, 0.9);
    }

    #[test]
    fn explicit_values_override_defaults() {
        let config = MonitorConfig::builder()
            .heap_threshold(0.5)
            .thread_threshold(200)
            .wait_ceiling(Duration::from_secs(5))
            .build(512 * MB);
        assert_eq!(config.heap_threshold, 0.5);
        assert_eq!(config.thread_threshold, 200);
        assert_eq!(config.wait_ceiling, Duration::from_secs(5));
        assert_eq!(config.fd_threshold, 1000);
    }
}
