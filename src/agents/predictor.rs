//! Process-launch predictor
//!
//! Watches the snapshot's process list for newly appeared pids, classifies
//! each new process against a built-in table and publishes a
//! `ProcessLaunchPrediction` with a recommended GPU mode and a confidence.
//! Consumers (the GPU agent) treat predictions as hints, never commands.
//!
//! The predictor is not a proposing agent: the orchestrator feeds it every
//! tick and carries its latest prediction into the next tick's context.

use crate::action::HybridMode;
use crate::snapshot::Snapshot;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::{Duration, Instant};
use tracing::info;

/// How a launched process relates to the discrete GPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessClass {
    /// Needs the discrete GPU (heavy 3D / compute).
    Required,
    /// Runs better on the discrete GPU.
    Preferred,
    /// The integrated GPU is the better home (power).
    IGpuOptimal,
    /// Works fine on the integrated GPU.
    IGpuSufficient,
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessLaunchPrediction {
    pub process_name: String,
    pub class: ProcessClass,
    pub recommended_mode: Option<HybridMode>,
    /// 0-100.
    pub confidence: u8,
}

/// Predictions stay actionable this long after the launch.
const PREDICTION_TTL: Duration = Duration::from_secs(15);

/// Built-in classification table: (substring, class, mode, confidence).
const KNOWN_PROCESSES: &[(&str, ProcessClass, Option<HybridMode>, u8)] = &[
    ("cyberpunk2077", ProcessClass::Required, Some(HybridMode::Off), 95),
    ("witcher3", ProcessClass::Required, Some(HybridMode::Off), 95),
    ("eldenring", ProcessClass::Required, Some(HybridMode::Off), 95),
    ("doometernal", ProcessClass::Required, Some(HybridMode::Off), 95),
    ("cs2", ProcessClass::Required, Some(HybridMode::Off), 90),
    ("valorant", ProcessClass::Required, Some(HybridMode::Off), 90),
    ("blender", ProcessClass::Preferred, Some(HybridMode::Off), 85),
    ("resolve", ProcessClass::Preferred, Some(HybridMode::Off), 85),
    ("steam", ProcessClass::Preferred, Some(HybridMode::Off), 80),
    ("epicgameslauncher", ProcessClass::Preferred, Some(HybridMode::Off), 80),
    ("obs", ProcessClass::Preferred, Some(HybridMode::On), 75),
    ("vlc", ProcessClass::IGpuSufficient, Some(HybridMode::On), 70),
    ("mpv", ProcessClass::IGpuSufficient, Some(HybridMode::On), 70),
    ("firefox", ProcessClass::IGpuOptimal, Some(HybridMode::On), 70),
    ("chrome", ProcessClass::IGpuOptimal, Some(HybridMode::On), 70),
    ("code", ProcessClass::IGpuSufficient, None, 60),
];

/// Classify one process name. Unknown names get a low-confidence Unknown.
pub fn classify_process(name: &str) -> ProcessLaunchPrediction {
    let lowered = name.to_lowercase();
    let lowered = lowered.trim_end_matches(".exe");
    for (pattern, class, mode, confidence) in KNOWN_PROCESSES {
        if lowered.contains(pattern) {
            return ProcessLaunchPrediction {
                process_name: name.to_string(),
                class: *class,
                recommended_mode: *mode,
                confidence: *confidence,
            };
        }
    }
    ProcessLaunchPrediction {
        process_name: name.to_string(),
        class: ProcessClass::Unknown,
        recommended_mode: None,
        confidence: 10,
    }
}

pub struct LaunchPredictor {
    known_pids: HashSet<u32>,
    primed: bool,
    latest: Option<(ProcessLaunchPrediction, Instant)>,
}

impl LaunchPredictor {
    pub fn new() -> Self {
        Self {
            known_pids: HashSet::new(),
            primed: false,
            latest: None,
        }
    }

    /// Diff the pid set against the previous tick and classify launches.
    /// Returns the predictions for this tick (may be empty). The first
    /// observation only primes the pid set.
    pub fn observe(&mut self, snapshot: &Snapshot) -> Vec<ProcessLaunchPrediction> {
        let current: HashSet<u32> = snapshot.processes.iter().map(|p| p.pid).collect();
        if !self.primed {
            self.primed = true;
            self.known_pids = current;
            return Vec::new();
        }

        let mut predictions = Vec::new();
        for process in &snapshot.processes {
            if self.known_pids.contains(&process.pid) {
                continue;
            }
            let prediction = classify_process(&process.name);
            if prediction.class != ProcessClass::Unknown {
                info!(
                    "Predictor: {} launched, class {:?}, mode {:?}, confidence {}",
                    prediction.process_name,
                    prediction.class,
                    prediction.recommended_mode,
                    prediction.confidence
                );
            }
            predictions.push(prediction);
        }
        self.known_pids = current;

        // Keep the strongest actionable prediction for consumers.
        if let Some(best) = predictions
            .iter()
            .filter(|p| p.recommended_mode.is_some())
            .max_by_key(|p| p.confidence)
        {
            self.latest = Some((best.clone(), Instant::now()));
        }
        predictions
    }

    /// Latest actionable prediction, while fresh.
    pub fn latest(&self) -> Option<&ProcessLaunchPrediction> {
        match &self.latest {
            Some((prediction, at)) if at.elapsed() < PREDICTION_TTL => Some(prediction),
            _ => None,
        }
    }
}

impl Default for LaunchPredictor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::ProcessInfo;

    fn snap_with(pids_names: &[(u32, &str)]) -> Snapshot {
        Snapshot {
            processes: pids_names
                .iter()
                .map(|(pid, name)| ProcessInfo {
                    pid: *pid,
                    name: name.to_string(),
                    cpu_pct: 0.0,
                    cpu_time_ms: 0,
                    nice: Some(0),
                })
                .collect(),
            ..Default::default()
        }
    }

    #[test]
    fn known_game_classifies_required_with_mode_off() {
        let p = classify_process("Cyberpunk2077.exe");
        assert_eq!(p.class, ProcessClass::Required);
        assert_eq!(p.recommended_mode, Some(HybridMode::Off));
        assert_eq!(p.confidence, 95);
    }

    #[test]
    fn unknown_process_is_low_confidence() {
        let p = classify_process("mystery_tool");
        assert_eq!(p.class, ProcessClass::Unknown);
        assert!(p.confidence <= 10);
    }

    #[test]
    fn first_observation_only_primes() {
        let mut predictor = LaunchPredictor::new();
        let predictions = predictor.observe(&snap_with(&[(1, "init"), (2, "steam")]));
        assert!(predictions.is_empty());
        assert!(predictor.latest().is_none());
    }

    #[test]
    fn new_pid_produces_prediction() {
        let mut predictor = LaunchPredictor::new();
        predictor.observe(&snap_with(&[(1, "init")]));
        let predictions = predictor.observe(&snap_with(&[(1, "init"), (50, "cyberpunk2077.exe")]));
        assert_eq!(predictions.len(), 1);
        assert_eq!(predictions[0].class, ProcessClass::Required);
        let latest = predictor.latest().unwrap();
        assert_eq!(latest.process_name, "cyberpunk2077.exe");
    }

    #[test]
    fn strongest_actionable_prediction_wins() {
        let mut predictor = LaunchPredictor::new();
        predictor.observe(&snap_with(&[(1, "init")]));
        predictor.observe(&snap_with(&[
            (1, "init"),
            (51, "firefox"),
            (52, "eldenring.exe"),
        ]));
        assert_eq!(predictor.latest().unwrap().confidence, 95);
    }

    #[test]
    fn existing_pids_do_not_retrigger() {
        let mut predictor = LaunchPredictor::new();
        predictor.observe(&snap_with(&[(1, "init"), (2, "steam")]));
        let predictions = predictor.observe(&snap_with(&[(1, "init"), (2, "steam")]));
        assert!(predictions.is_empty());
    }
}
