//! Persistence: append-only journals and the learner blob
//!
//! Everything lives in the per-user data directory:
//! - `overrides.log`: every override record/clear event, newline-delimited
//!   JSON
//! - `preferences.log`: `(control, old value, new value, snapshot context)`
//!   tuples for offline learning
//! - `patterns.bin`: the learner's opaque blob behind a versioned header
//!   (the learner itself is an external contract; this module only stores
//!   and validates the container)
//!
//! `health.log` rotation is handled by the logging module's RotatingLog.

use crate::action::ControlTarget;
use crate::overrides::Scenario;
use crate::snapshot::{Snapshot, WorkloadClass};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use std::path::PathBuf;
use tracing::warn;

/// Magic + version for `patterns.bin`.
const PATTERNS_MAGIC: &[u8; 4] = b"PPAT";
const PATTERNS_VERSION: u16 = 1;

/// One line of `overrides.log`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OverrideJournalEntry {
    pub timestamp: DateTime<Utc>,
    /// "record" or "clear".
    pub event: String,
    pub control: ControlTarget,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scenario: Option<Scenario>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,
}

/// Snapshot context captured alongside a preference change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotContext {
    pub workload_class: WorkloadClass,
    pub on_ac: bool,
    pub battery_pct: Option<f32>,
    pub cpu_temp_c: Option<f32>,
}

impl SnapshotContext {
    pub fn from_snapshot(snapshot: &Snapshot) -> Self {
        Self {
            workload_class: snapshot.workload_class,
            on_ac: snapshot.on_ac,
            battery_pct: snapshot.battery.map(|b| b.pct),
            cpu_temp_c: snapshot.cpu_temp_c,
        }
    }
}

/// One line of `preferences.log`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreferenceEntry {
    pub timestamp: DateTime<Utc>,
    pub control: ControlTarget,
    pub old_value: Option<serde_json::Value>,
    pub new_value: serde_json::Value,
    pub context: SnapshotContext,
}

/// Append-only journal store.
pub struct Persistence {
    overrides_path: PathBuf,
    preferences_path: PathBuf,
    patterns_path: PathBuf,
}

impl Persistence {
    pub fn new(overrides_path: PathBuf, preferences_path: PathBuf, patterns_path: PathBuf) -> Self {
        Self {
            overrides_path,
            preferences_path,
            patterns_path,
        }
    }

    pub fn at_default_paths() -> Self {
        use crate::config::Config;
        Self::new(
            Config::overrides_log_path(),
            Config::preferences_log_path(),
            Config::patterns_file_path(),
        )
    }

    fn append(path: &PathBuf, line: &str) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")
    }

    /// Journal an override record. I/O failures are logged, never fatal.
    pub fn journal_override_record(
        &self,
        control: ControlTarget,
        scenario: Scenario,
        value: serde_json::Value,
    ) {
        let entry = OverrideJournalEntry {
            timestamp: Utc::now(),
            event: "record".to_string(),
            control,
            scenario: Some(scenario),
            value: Some(value),
        };
        self.write_override_entry(&entry);
    }

    pub fn journal_override_clear(&self, control: ControlTarget) {
        let entry = OverrideJournalEntry {
            timestamp: Utc::now(),
            event: "clear".to_string(),
            control,
            scenario: None,
            value: None,
        };
        self.write_override_entry(&entry);
    }

    fn write_override_entry(&self, entry: &OverrideJournalEntry) {
        match serde_json::to_string(entry) {
            Ok(line) => {
                if let Err(e) = Self::append(&self.overrides_path, &line) {
                    warn!("Persist: overrides journal write failed: {}", e);
                }
            }
            Err(e) => warn!("Persist: overrides entry serialize failed: {}", e),
        }
    }

    /// Journal a user preference change with its snapshot context.
    pub fn journal_preference(
        &self,
        control: ControlTarget,
        old_value: Option<serde_json::Value>,
        new_value: serde_json::Value,
        snapshot: &Snapshot,
    ) {
        let entry = PreferenceEntry {
            timestamp: Utc::now(),
            control,
            old_value,
            new_value,
            context: SnapshotContext::from_snapshot(snapshot),
        };
        match serde_json::to_string(&entry) {
            Ok(line) => {
                if let Err(e) = Self::append(&self.preferences_path, &line) {
                    warn!("Persist: preferences journal write failed: {}", e);
                }
            }
            Err(e) => warn!("Persist: preference entry serialize failed: {}", e),
        }
    }

    /// Read back every override journal line that still parses. Torn or
    /// corrupt lines are skipped, not fatal.
    pub fn read_override_journal(&self) -> Vec<OverrideJournalEntry> {
        let content = match std::fs::read_to_string(&self.overrides_path) {
            Ok(c) => c,
            Err(_) => return Vec::new(),
        };
        content
            .lines()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect()
    }

    /// Write the learner blob behind the versioned header.
    pub fn write_patterns(&self, payload: &[u8]) -> std::io::Result<()> {
        if let Some(parent) = self.patterns_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = std::fs::File::create(&self.patterns_path)?;
        file.write_all(PATTERNS_MAGIC)?;
        file.write_all(&PATTERNS_VERSION.to_le_bytes())?;
        file.write_all(&(payload.len() as u32).to_le_bytes())?;
        file.write_all(payload)
    }

    /// Read and validate the learner blob. None when the file is absent,
    /// truncated, or carries the wrong magic/version.
    pub fn read_patterns(&self) -> Option<Vec<u8>> {
        let mut file = std::fs::File::open(&self.patterns_path).ok()?;
        let mut header = [0u8; 10];
        file.read_exact(&mut header).ok()?;
        if &header[0..4] != PATTERNS_MAGIC {
            warn!("Persist: patterns.bin has wrong magic, ignoring");
            return None;
        }
        let version = u16::from_le_bytes([header[4], header[5]]);
        if version != PATTERNS_VERSION {
            warn!("Persist: patterns.bin version {} unsupported", version);
            return None;
        }
        let len = u32::from_le_bytes([header[6], header[7], header[8], header[9]]) as usize;
        let mut payload = Vec::with_capacity(len);
        file.read_to_end(&mut payload).ok()?;
        if payload.len() != len {
            warn!(
                "Persist: patterns.bin truncated ({} of {} bytes), ignoring",
                payload.len(),
                len
            );
            return None;
        }
        Some(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn persistence_in(dir: &std::path::Path) -> Persistence {
        Persistence::new(
            dir.join("overrides.log"),
            dir.join("preferences.log"),
            dir.join("patterns.bin"),
        )
    }

    #[test]
    fn override_journal_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let persist = persistence_in(dir.path());
        persist.journal_override_record(
            ControlTarget::RefreshRateHz,
            Scenario::VideoWatching,
            json!(60),
        );
        persist.journal_override_clear(ControlTarget::RefreshRateHz);

        let entries = persist.read_override_journal();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].event, "record");
        assert_eq!(entries[0].control, ControlTarget::RefreshRateHz);
        assert_eq!(entries[0].value, Some(json!(60)));
        assert_eq!(entries[1].event, "clear");
        assert!(entries[1].scenario.is_none());
    }

    #[test]
    fn corrupt_journal_lines_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let persist = persistence_in(dir.path());
        persist.journal_override_clear(ControlTarget::FanProfile);
        std::fs::OpenOptions::new()
            .append(true)
            .open(dir.path().join("overrides.log"))
            .unwrap()
            .write_all(b"{torn line\n")
            .unwrap();
        persist.journal_override_clear(ControlTarget::FanProfile);
        assert_eq!(persist.read_override_journal().len(), 2);
    }

    #[test]
    fn preference_entry_captures_context() {
        let dir = tempfile::tempdir().unwrap();
        let persist = persistence_in(dir.path());
        let snapshot = Snapshot {
            workload_class: WorkloadClass::MediaPlayback,
            on_ac: false,
            ..Default::default()
        };
        persist.journal_preference(
            ControlTarget::RefreshRateHz,
            Some(json!(144)),
            json!(60),
            &snapshot,
        );
        let content = std::fs::read_to_string(dir.path().join("preferences.log")).unwrap();
        let entry: PreferenceEntry = serde_json::from_str(content.lines().next().unwrap()).unwrap();
        assert_eq!(entry.context.workload_class, WorkloadClass::MediaPlayback);
        assert!(!entry.context.on_ac);
        assert_eq!(entry.old_value, Some(json!(144)));
    }

    #[test]
    fn patterns_blob_round_trips_with_header() {
        let dir = tempfile::tempdir().unwrap();
        let persist = persistence_in(dir.path());
        let payload = vec![1u8, 2, 3, 4, 5];
        persist.write_patterns(&payload).unwrap();
        assert_eq!(persist.read_patterns(), Some(payload));
    }

    #[test]
    fn patterns_with_bad_magic_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let persist = persistence_in(dir.path());
        std::fs::write(dir.path().join("patterns.bin"), b"NOPExxxxxx").unwrap();
        assert_eq!(persist.read_patterns(), None);
    }

    #[test]
    fn truncated_patterns_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let persist = persistence_in(dir.path());
        persist.write_patterns(&[9u8; 100]).unwrap();
        let full = std::fs::read(dir.path().join("patterns.bin")).unwrap();
        std::fs::write(dir.path().join("patterns.bin"), &full[..50]).unwrap();
        assert_eq!(persist.read_patterns(), None);
    }
}
