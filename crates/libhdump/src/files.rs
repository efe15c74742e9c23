//! On-disk bookkeeping for dump artifacts and the analysis budget.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Local, Utc};
use log::info;
use nix::sys::statvfs::statvfs;
use serde::{Deserialize, Serialize};

use crate::errors::{HdumpError, HdumpResult};

const TIME_FORMAT: &str = "%Y-%m-%d_%H-%M-%S_%3f";

/// Version-prefixed artifact layout under one root:
///
/// ```text
/// <root>/memory/hprof-aly/<prefix>_<time>.hprof   dumps awaiting analysis
/// <root>/memory/hprof-aly/<prefix>_<time>.json    analysis reports
/// <root>/memory/hprof-aly/thread/dump.txt         thread listing at trigger
/// <root>/memory/hprof-aly/fd/dump.txt             fd listing at trigger
/// <root>/memory/hprof-man/<prefix>_<time>.hprof   manually requested dumps
/// ```
#[derive(Debug, Clone)]
pub struct DumpDirectory {
    root: PathBuf,
    prefix: String,
}

impl DumpDirectory {
    pub fn new(root: impl Into<PathBuf>, version_prefix: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            prefix: version_prefix.into(),
        }
    }

    pub fn analysis_dir(&self) -> PathBuf {
        self.root.join("memory/hprof-aly")
    }

    pub fn manual_dir(&self) -> PathBuf {
        self.root.join("memory/hprof-man")
    }

    pub fn thread_dump_dir(&self) -> PathBuf {
        self.analysis_dir().join("thread")
    }

    pub fn fd_dump_dir(&self) -> PathBuf {
        self.analysis_dir().join("fd")
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.root.join("memory/analysis-ledger.json")
    }

    pub fn analysis_dump_path(&self, at: DateTime<Local>) -> HdumpResult<PathBuf> {
        self.stamped_path(&self.analysis_dir(), at, "hprof")
    }

    pub fn report_path(&self, at: DateTime<Local>) -> HdumpResult<PathBuf> {
        self.stamped_path(&self.analysis_dir(), at, "json")
    }

    pub fn manual_dump_path(&self, at: DateTime<Local>) -> HdumpResult<PathBuf> {
        self.stamped_path(&self.manual_dir(), at, "hprof")
    }

    fn stamped_path(
        &self,
        dir: &Path,
        at: DateTime<Local>,
        extension: &str,
    ) -> HdumpResult<PathBuf> {
        fs::create_dir_all(dir)?;
        let time = at.format(TIME_FORMAT);
        Ok(dir.join(format!("{}_{time}.{extension}", self.prefix)))
    }

    /// Write one threshold listing (thread names or fd targets) into its
    /// dump subdirectory.
    pub fn write_threshold_dump(&self, dir: &Path, lines: &[String]) -> HdumpResult<PathBuf> {
        fs::create_dir_all(dir)?;
        let path = dir.join("dump.txt");
        fs::write(&path, lines.join(","))?;
        Ok(path)
    }

    /// Fail unless the filesystem under the root has `required` bytes
    /// free for the coming dump.
    pub fn ensure_space(&self, required: u64) -> HdumpResult<()> {
        fs::create_dir_all(&self.root)?;
        let stats = statvfs(&self.root)?;
        let available = stats.blocks_available() as u64 * stats.fragment_size() as u64;
        if available < required {
            return Err(HdumpError::InsufficientSpace {
                dir: self.root.clone(),
                available,
                required,
            });
        }
        Ok(())
    }

    /// Clean the analysis directory: artifacts from other version
    /// prefixes are deleted, dump/report pairs are deleted (their
    /// analysis already ran, successfully or not), and dumps with no
    /// report yet are returned for re-analysis.
    pub fn sweep_stale(&self) -> HdumpResult<Vec<PathBuf>> {
        let dir = self.analysis_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut pending = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if !path.is_file() {
                continue;
            }
            let name = path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or_default();
            if !name.starts_with(&self.prefix) {
                info!("deleting artifact from another version: {name}");
                let _ = fs::remove_file(&path);
                continue;
            }
            if path.extension().is_some_and(|ext| ext == "hprof") {
                let report = path.with_extension("json");
                if report.exists() {
                    info!("deleting analyzed dump pair: {name}");
                    let _ = fs::remove_file(&report);
                    let _ = fs::remove_file(&path);
                } else {
                    pending.push(path);
                }
            }
        }
        Ok(pending)
    }
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct LedgerState {
    version: String,
    first_launch_ms: i64,
    analysis_times: u32,
}

/// Persisted per-version analysis budget: how many dumps this version
/// has analyzed and when it first launched. Kept as a small JSON file so
/// the budget survives process restarts.
#[derive(Debug)]
pub struct AnalysisLedger {
    path: PathBuf,
    state: LedgerState,
}

impl AnalysisLedger {
    /// Load the ledger, resetting it when the recorded version differs
    /// from the running one.
    pub fn load_or_create(path: impl Into<PathBuf>, version: &str) -> HdumpResult<Self> {
        let path = path.into();
        let state = fs::read_to_string(&path)
            .ok()
            .and_then(|raw| serde_json::from_str::<LedgerState>(&raw).ok())
            .filter(|state| state.version == version)
            .unwrap_or_else(|| LedgerState {
                version: version.to_string(),
                first_launch_ms: Utc::now().timestamp_millis(),
                analysis_times: 0,
            });
        let ledger = Self { path, state };
        ledger.save()?;
        Ok(ledger)
    }

    pub fn analysis_times(&self) -> u32 {
        self.state.analysis_times
    }

    pub fn record_analysis(&mut self) -> HdumpResult<()> {
        self.state.analysis_times += 1;
        self.save()
    }

    /// Whether another analysis fits the per-version budget.
    pub fn within_budget(&self, max_times: u32, period: Duration) -> bool {
        if self.state.analysis_times >= max_times {
            return false;
        }
        let elapsed_ms = Utc::now().timestamp_millis() - self.state.first_launch_ms;
        elapsed_ms < period.as_millis() as i64
    }

    fn save(&self) -> HdumpResult<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let raw = serde_json::to_string(&self.state).map_err(std::io::Error::other)?;
        fs::write(&self.path, raw)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn fixed_time() -> DateTime<Local> {
        Local.with_ymd_and_hms(2026, 3, 14, 15, 9, 26).unwrap()
    }

    #[test]
    fn dump_paths_carry_prefix_and_timestamp() {
        let dir = tempfile::tempdir().unwrap();
        let files = DumpDirectory::new(dir.path(), "1.4.0");

        let dump = files.analysis_dump_path(fixed_time()).unwrap();
        let name = dump.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with("1.4.0_2026-03-14_15-09-26"));
        assert!(name.ends_with(".hprof"));
        assert!(dump.parent().unwrap().ends_with("memory/hprof-aly"));

        let report = files.report_path(fixed_time()).unwrap();
        assert!(report.to_str().unwrap().ends_with(".json"));
    }

    #[test]
    fn sweep_removes_foreign_versions_and_analyzed_pairs() {
        let dir = tempfile::tempdir().unwrap();
        let files = DumpDirectory::new(dir.path(), "1.4.0");
        let aly = files.analysis_dir();
        fs::create_dir_all(&aly).unwrap();

        fs::write(aly.join("1.3.9_old.hprof"), b"x").unwrap();
        fs::write(aly.join("1.4.0_done.hprof"), b"x").unwrap();
        fs::write(aly.join("1.4.0_done.json"), b"{}").unwrap();
        fs::write(aly.join("1.4.0_pending.hprof"), b"x").unwrap();

        let pending = files.sweep_stale().unwrap();
        assert_eq!(pending, vec![aly.join("1.4.0_pending.hprof")]);
        assert!(!aly.join("1.3.9_old.hprof").exists());
        assert!(!aly.join("1.4.0_done.hprof").exists());
        assert!(!aly.join("1.4.0_done.json").exists());
        assert!(aly.join("1.4.0_pending.hprof").exists());
    }

    #[test]
    fn ensure_space_accepts_modest_requirements() {
        let dir = tempfile::tempdir().unwrap();
        let files = DumpDirectory::new(dir.path(), "1.4.0");
        files.ensure_space(1).unwrap();

        let err = files.ensure_space(u64::MAX).unwrap_err();
        assert!(matches!(err, HdumpError::InsufficientSpace { .. }));
    }

    #[test]
    fn ledger_counts_and_resets_across_versions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.json");

        let mut ledger = AnalysisLedger::load_or_create(&path, "1.4.0").unwrap();
        assert_eq!(ledger.analysis_times(), 0);
        ledger.record_analysis().unwrap();
        ledger.record_analysis().unwrap();

        let ledger = AnalysisLedger::load_or_create(&path, "1.4.0").unwrap();
        assert_eq!(ledger.analysis_times(), 2);

        let ledger = AnalysisLedger::load_or_create(&path, "1.5.0").unwrap();
        assert_eq!(ledger.analysis_times(), 0);
    }

    #[test]
    fn budget_is_exhausted_by_count() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.json");
        let mut ledger = AnalysisLedger::load_or_create(&path, "1.4.0").unwrap();

        let period = Duration::from_secs(15 * 24 * 60 * 60);
        assert!(ledger.within_budget(2, period));
        ledger.record_analysis().unwrap();
        assert!(ledger.within_budget(2, period));
        ledger.record_analysis().unwrap();
        assert!(!ledger.within_budget(2, period));
    }

    #[test]
    fn budget_is_exhausted_by_period() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.json");
        let ledger = AnalysisLedger::load_or_create(&path, "1.4.0").unwrap();
        std::thread::sleep(Duration::from_millis(5));
        assert!(!ledger.within_budget(5, Duration::ZERO));
        assert!(ledger.within_budget(5, Duration::from_secs(3600)));
    }
}
