//! Execution telemetry for kb command dispatch.
//!
//! Recorders are total: they never fail and never block the dispatcher. A
//! recorder that cannot persist (missing directory, full disk) drops the
//! record rather than surfacing an error into the dispatch path.
//!
//! Two backends are provided: [`MemoryRecorder`] accumulates per-command
//! counters for in-process introspection (`kb diagnose`), and
//! [`JsonlRecorder`] appends records to `.kb/telemetry.jsonl` when the
//! workspace already has a state directory.

use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use kb_types::ExecutionRecord;

/// Telemetry file name inside the workspace state directory.
pub const TELEMETRY_FILE: &str = "telemetry.jsonl";

/// Get the telemetry file path for a state directory.
pub fn telemetry_path(state_dir: &Path) -> PathBuf {
    state_dir.join(TELEMETRY_FILE)
}

/// Sink for per-execution telemetry. Implementations must be total.
pub trait ExecutionRecorder: Send + Sync {
    fn record_execution(&self, record: &ExecutionRecord);
}

/// Aggregated counters for one command id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandStats {
    pub executions: u64,
    pub failures: u64,
    pub total_duration_ms: u64,
    pub max_duration_ms: u64,
}

/// In-process accumulator keyed by command id.
#[derive(Debug, Default)]
pub struct MemoryRecorder {
    stats: Mutex<BTreeMap<String, CommandStats>>,
}

impl MemoryRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of accumulated counters.
    pub fn snapshot(&self) -> BTreeMap<String, CommandStats> {
        self.stats.lock().map(|s| s.clone()).unwrap_or_default()
    }

    /// Total number of recorded executions across all commands.
    pub fn total_executions(&self) -> u64 {
        self.snapshot().values().map(|s| s.executions).sum()
    }
}

impl ExecutionRecorder for MemoryRecorder {
    fn record_execution(&self, record: &ExecutionRecord) {
        let Ok(mut stats) = self.stats.lock() else {
            return;
        };
        let entry = stats.entry(record.command_id.clone()).or_default();
        entry.executions += 1;
        if !record.success {
            entry.failures += 1;
        }
        entry.total_duration_ms += record.duration_ms;
        entry.max_duration_ms = entry.max_duration_ms.max(record.duration_ms);
    }
}

/// Append-only JSONL recorder.
///
/// Records are only written when the target's parent directory already
/// exists: telemetry must never be the reason a pristine workspace grows a
/// `.kb/` directory.
#[derive(Debug, Clone)]
pub struct JsonlRecorder {
    path: PathBuf,
}

impl JsonlRecorder {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// The file records are appended to.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ExecutionRecorder for JsonlRecorder {
    fn record_execution(&self, record: &ExecutionRecord) {
        let Some(parent) = self.path.parent() else {
            return;
        };
        if !parent.exists() {
            return;
        }
        let Ok(line) = serde_json::to_string(record) else {
            return;
        };
        let Ok(mut file) = OpenOptions::new().create(true).append(true).open(&self.path) else {
            return;
        };
        let _ = writeln!(file, "{line}");
    }
}

/// Recorder that drops everything. Used where telemetry is disabled.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullRecorder;

impl ExecutionRecorder for NullRecorder {
    fn record_execution(&self, _record: &ExecutionRecord) {}
}

/// Read all records from a JSONL telemetry file. Lines that do not parse
/// are skipped; telemetry is best-effort evidence, not a source of truth.
pub fn read_records(path: &Path) -> Vec<ExecutionRecord> {
    let Ok(content) = std::fs::read_to_string(path) else {
        return Vec::new();
    };
    content
        .lines()
        .filter_map(|line| serde_json::from_str(line).ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tempfile::tempdir;

    fn record(command_id: &str, duration_ms: u64, success: bool) -> ExecutionRecord {
        ExecutionRecord {
            command_id: command_id.to_string(),
            duration_ms,
            success,
            error_code: if success {
                None
            } else {
                Some("HANDLER_FAILED".to_string())
            },
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn memory_recorder_accumulates_per_command() {
        let recorder = MemoryRecorder::new();
        recorder.record_execution(&record("devlink:plan", 120, true));
        recorder.record_execution(&record("devlink:plan", 80, false));
        recorder.record_execution(&record("hello", 5, true));

        let snapshot = recorder.snapshot();
        let plan = snapshot.get("devlink:plan").expect("stats");
        assert_eq!(plan.executions, 2);
        assert_eq!(plan.failures, 1);
        assert_eq!(plan.total_duration_ms, 200);
        assert_eq!(plan.max_duration_ms, 120);
        assert_eq!(recorder.total_executions(), 3);
    }

    #[test]
    fn jsonl_recorder_appends_parseable_lines() {
        let td = tempdir().expect("tempdir");
        let path = td.path().join("telemetry.jsonl");
        let recorder = JsonlRecorder::new(path.clone());

        recorder.record_execution(&record("hello", 3, true));
        recorder.record_execution(&record("hello", 4, true));

        let records = read_records(&path);
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| r.command_id == "hello"));
    }

    #[test]
    fn jsonl_recorder_never_creates_the_parent_directory() {
        let td = tempdir().expect("tempdir");
        let path = td.path().join(".kb").join("telemetry.jsonl");
        let recorder = JsonlRecorder::new(path.clone());

        recorder.record_execution(&record("hello", 3, true));

        assert!(!path.exists());
        assert!(!td.path().join(".kb").exists());
    }

    #[test]
    fn read_records_skips_garbage_lines() {
        let td = tempdir().expect("tempdir");
        let path = td.path().join("telemetry.jsonl");
        let recorder = JsonlRecorder::new(path.clone());
        recorder.record_execution(&record("hello", 3, true));

        let mut content = std::fs::read_to_string(&path).expect("read");
        content.push_str("not json\n");
        std::fs::write(&path, content).expect("write");
        recorder.record_execution(&record("hello", 4, true));

        assert_eq!(read_records(&path).len(), 2);
    }

    #[test]
    fn null_recorder_is_silent() {
        NullRecorder.record_execution(&record("hello", 1, true));
    }
}
