//! Leak-report data contract.
//!
//! The analysis stage that parses a dump file into leak chains lives in a
//! separate process; this module only pins down the JSON schema the
//! coordinator side must stay compatible with.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Structured report produced from one dump file plus ambient telemetry.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HeapReport {
    pub running_info: RunningInfo,
    /// Reference chains of suspected objects.
    pub gc_paths: Vec<GcPath>,
    /// Instance counts, restricted to the analysis stage's fixed
    /// watch-list of suspect types.
    pub class_infos: Vec<ClassInfo>,
    /// Large leaked objects worth reporting individually.
    pub leak_objects: Vec<LeakObject>,
    /// Whether analysis of this dump ran to completion.
    pub analysis_done: Option<bool>,
    /// How many times analysis has been re-attempted on this dump.
    pub re_analysis_times: Option<u32>,
}

/// Environment and process state around the dump.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RunningInfo {
    pub heap_max: String,
    pub heap_used: String,

    pub vss: String,
    pub pss: String,
    pub rss: String,
    pub thread_count: String,
    pub fd_count: String,
    pub thread_list: Vec<String>,
    pub fd_list: Vec<String>,

    pub abi_level: String,
    pub manufacture: String,
    pub build_model: String,

    pub app_version: String,
    pub current_page: String,
    pub usage_seconds: String,
    pub now_time: String,
    pub device_mem_total: String,
    pub device_mem_available: String,

    /// Why the dump was triggered.
    pub dump_reason: String,
    /// Why analysis was triggered.
    pub analysis_reason: String,

    pub monitor_version: String,
    /// Time spent filtering leaked instances, in milliseconds.
    pub filter_instance_time: String,
    /// Time spent finding reference chains, in milliseconds.
    pub find_gc_path_time: String,
}

/// One reference chain from a suspected object to its GC root.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GcPath {
    /// How many instances collapse onto this same chain.
    pub instance_count: u32,
    pub leak_reason: String,
    /// Description of the terminal reachability anchor.
    pub gc_root: String,
    /// Content-derived hash over the chain, used for deduplication.
    pub signature: String,
    pub path: Vec<PathItem>,
}

impl GcPath {
    /// Derive the deduplication signature from the serialized chain.
    /// Two chains with identical steps and root hash to the same value
    /// regardless of instance counts or wording of the reason.
    pub fn compute_signature(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.gc_root.as_bytes());
        for item in &self.path {
            hasher.update(item.reference.as_bytes());
            hasher.update([item.reference_type as u8]);
            hasher.update(item.declared_class.as_bytes());
        }
        let digest = hasher.finalize();
        digest.iter().map(|b| format!("{b:02x}")).collect()
    }
}

/// One step along a reference chain.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PathItem {
    /// Referencing class plus field or slot name.
    pub reference: String,
    pub reference_type: ReferenceType,
    /// Declaring class, for fields inherited from an ancestor.
    pub declared_class: String,
}

/// Kind of slot a reference lives in.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReferenceType {
    #[default]
    InstanceField,
    ArrayEntry,
    StaticField,
}

/// Per-class instance counts for one watched type.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClassInfo {
    pub class_name: String,
    pub instance_count: String,
    pub leak_instance_count: String,
}

/// A single large leaked object.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LeakObject {
    pub class_name: String,
    pub size: String,
    pub object_id: String,
    pub ext_detail: String,
}
