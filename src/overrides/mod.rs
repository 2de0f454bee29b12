//! Cooling-period / override registry
//!
//! When the user changes a control by hand, the engine backs off from that
//! control for a scenario-dependent time window. The registry is a
//! thread-safe map keyed by control: at most one record per control,
//! insertion replaces, expiry is lazy.
//!
//! Consumers treat the registry as optional: every caller takes
//! `Option<&CoolingRegistry>` and keeps working without one, merely losing
//! override protection.

use crate::action::ControlTarget;
use crate::snapshot::WorkloadClass;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// User activity scenario driving the cooling-period length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Scenario {
    VideoWatching,
    GamingSession,
    DevelopmentSession,
    OfficeWork,
    #[default]
    GeneralUse,
}

impl Scenario {
    /// Scenario TTL table.
    pub fn ttl(&self) -> Duration {
        match self {
            Scenario::VideoWatching => Duration::from_secs(120 * 60),
            Scenario::GamingSession => Duration::from_secs(90 * 60),
            Scenario::DevelopmentSession => Duration::from_secs(60 * 60),
            Scenario::OfficeWork => Duration::from_secs(15 * 60),
            Scenario::GeneralUse => Duration::from_secs(30 * 60),
        }
    }

    /// Best scenario guess for a workload class, used when the caller gives
    /// no explicit hint.
    pub fn from_workload(workload: WorkloadClass) -> Self {
        match workload {
            WorkloadClass::MediaPlayback => Scenario::VideoWatching,
            WorkloadClass::Gaming => Scenario::GamingSession,
            WorkloadClass::Compilation | WorkloadClass::HeavyProductivity => {
                Scenario::DevelopmentSession
            }
            WorkloadClass::LightProductivity | WorkloadClass::VideoConferencing => {
                Scenario::OfficeWork
            }
            _ => Scenario::GeneralUse,
        }
    }
}

impl std::str::FromStr for Scenario {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "video_watching" | "videowatching" => Ok(Scenario::VideoWatching),
            "gaming_session" | "gamingsession" | "gaming" => Ok(Scenario::GamingSession),
            "development_session" | "developmentsession" | "development" => {
                Ok(Scenario::DevelopmentSession)
            }
            "office_work" | "officework" | "office" => Ok(Scenario::OfficeWork),
            "general_use" | "generaluse" | "general" => Ok(Scenario::GeneralUse),
            other => Err(format!("unknown scenario {:?}", other)),
        }
    }
}

/// Public view of one active override.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OverrideRecord {
    pub control: ControlTarget,
    pub recorded_value: serde_json::Value,
    pub scenario: Scenario,
    pub started_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// Seconds until expiry at the time this view was taken.
    pub remaining_secs: u64,
}

struct Entry {
    recorded_value: serde_json::Value,
    scenario: Scenario,
    started_at_wall: DateTime<Utc>,
    started_at: Instant,
    ttl: Duration,
}

impl Entry {
    fn expired(&self, now: Instant) -> bool {
        now.duration_since(self.started_at) >= self.ttl
    }

    fn remaining(&self, now: Instant) -> Duration {
        self.ttl.saturating_sub(now.duration_since(self.started_at))
    }

    fn view(&self, control: ControlTarget, now: Instant) -> OverrideRecord {
        OverrideRecord {
            control,
            recorded_value: self.recorded_value.clone(),
            scenario: self.scenario,
            started_at: self.started_at_wall,
            expires_at: self.started_at_wall
                + chrono::Duration::from_std(self.ttl).unwrap_or(chrono::Duration::zero()),
            remaining_secs: self.remaining(now).as_secs(),
        }
    }
}

/// Thread-safe override map. One record per control; insertion replaces.
#[derive(Default)]
pub struct CoolingRegistry {
    entries: Mutex<HashMap<ControlTarget, Entry>>,
}

impl CoolingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a user-initiated change. Returns the stored view (for the
    /// journal). Replaces any previous record for the control.
    pub fn record_override(
        &self,
        control: ControlTarget,
        scenario: Scenario,
        value: serde_json::Value,
    ) -> OverrideRecord {
        let now = Instant::now();
        let entry = Entry {
            recorded_value: value,
            scenario,
            started_at_wall: Utc::now(),
            started_at: now,
            ttl: scenario.ttl(),
        };
        let view = entry.view(control, now);
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let replaced = entries.insert(control, entry).is_some();
        info!(
            "Overrides: recorded {} for {:?} (ttl {:?}{})",
            control,
            scenario,
            scenario.ttl(),
            if replaced { ", replaced previous" } else { "" }
        );
        view
    }

    /// O(1) cooling-period check. Expired entries are evicted here, so the
    /// map never accumulates garbage past its next query.
    pub fn is_in_cooling_period(&self, control: ControlTarget) -> (bool, Option<Duration>) {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        match entries.get(&control) {
            Some(entry) if !entry.expired(now) => (true, Some(entry.remaining(now))),
            Some(_) => {
                entries.remove(&control);
                debug!("Overrides: {} expired, evicted", control);
                (false, None)
            }
            None => (false, None),
        }
    }

    /// Whether an active override for this control matches the given value.
    /// Returns None when no override is active.
    pub fn active_value_matches(
        &self,
        control: ControlTarget,
        value: &serde_json::Value,
    ) -> Option<bool> {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        match entries.get(&control) {
            Some(entry) if !entry.expired(now) => Some(&entry.recorded_value == value),
            Some(_) => {
                entries.remove(&control);
                None
            }
            None => None,
        }
    }

    /// Remove a record immediately. Returns the removed view when present.
    pub fn clear(&self, control: ControlTarget) -> Option<OverrideRecord> {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let removed = entries.remove(&control).map(|e| e.view(control, now));
        if removed.is_some() {
            info!("Overrides: cleared {}", control);
        }
        removed
    }

    /// Snapshot of all unexpired records, for diagnostics.
    pub fn active_overrides(&self) -> Vec<OverrideRecord> {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.retain(|_, e| !e.expired(now));
        let mut views: Vec<OverrideRecord> = entries
            .iter()
            .map(|(control, e)| e.view(*control, now))
            .collect();
        views.sort_by_key(|v| v.control);
        views
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn scenario_ttl_table_is_exact() {
        assert_eq!(Scenario::VideoWatching.ttl(), Duration::from_secs(7200));
        assert_eq!(Scenario::GamingSession.ttl(), Duration::from_secs(5400));
        assert_eq!(Scenario::DevelopmentSession.ttl(), Duration::from_secs(3600));
        assert_eq!(Scenario::OfficeWork.ttl(), Duration::from_secs(900));
        assert_eq!(Scenario::GeneralUse.ttl(), Duration::from_secs(1800));
    }

    #[test]
    fn record_then_query_reports_cooling() {
        let registry = CoolingRegistry::new();
        registry.record_override(ControlTarget::RefreshRateHz, Scenario::VideoWatching, json!(60));
        let (active, remaining) = registry.is_in_cooling_period(ControlTarget::RefreshRateHz);
        assert!(active);
        let remaining = remaining.unwrap();
        assert!(remaining <= Duration::from_secs(7200));
        assert!(remaining > Duration::from_secs(7190));
        // Unrelated control is untouched.
        assert!(!registry.is_in_cooling_period(ControlTarget::FanProfile).0);
    }

    #[test]
    fn insertion_replaces_previous_record() {
        let registry = CoolingRegistry::new();
        registry.record_override(ControlTarget::RefreshRateHz, Scenario::OfficeWork, json!(120));
        registry.record_override(ControlTarget::RefreshRateHz, Scenario::GamingSession, json!(60));
        let views = registry.active_overrides();
        assert_eq!(views.len(), 1);
        assert_eq!(views[0].scenario, Scenario::GamingSession);
        assert_eq!(views[0].recorded_value, json!(60));
    }

    #[test]
    fn clear_removes_immediately() {
        let registry = CoolingRegistry::new();
        registry.record_override(ControlTarget::FanProfile, Scenario::GeneralUse, json!("quiet"));
        assert!(registry.clear(ControlTarget::FanProfile).is_some());
        assert!(!registry.is_in_cooling_period(ControlTarget::FanProfile).0);
        assert!(registry.clear(ControlTarget::FanProfile).is_none());
    }

    #[test]
    fn value_matching_distinguishes_agreeing_proposals() {
        let registry = CoolingRegistry::new();
        registry.record_override(ControlTarget::RefreshRateHz, Scenario::GeneralUse, json!(60));
        assert_eq!(
            registry.active_value_matches(ControlTarget::RefreshRateHz, &json!(60)),
            Some(true)
        );
        assert_eq!(
            registry.active_value_matches(ControlTarget::RefreshRateHz, &json!(144)),
            Some(false)
        );
        assert_eq!(
            registry.active_value_matches(ControlTarget::FanProfile, &json!("quiet")),
            None
        );
    }

    #[test]
    fn scenario_parses_cli_spellings() {
        assert_eq!("gaming".parse::<Scenario>().unwrap(), Scenario::GamingSession);
        assert_eq!(
            "video_watching".parse::<Scenario>().unwrap(),
            Scenario::VideoWatching
        );
        assert_eq!("office-work".parse::<Scenario>().unwrap(), Scenario::OfficeWork);
        assert!("afk".parse::<Scenario>().is_err());
    }

    #[test]
    fn workload_to_scenario_mapping() {
        assert_eq!(
            Scenario::from_workload(WorkloadClass::MediaPlayback),
            Scenario::VideoWatching
        );
        assert_eq!(
            Scenario::from_workload(WorkloadClass::Gaming),
            Scenario::GamingSession
        );
        assert_eq!(
            Scenario::from_workload(WorkloadClass::Unknown),
            Scenario::GeneralUse
        );
    }
}
