//! Conflict planner
//!
//! Takes the tick's bag of proposals and turns it into an ordered list of
//! accepted actions. Rules run in a fixed order:
//!
//! 1. override filter (user cooling periods win, Critical bypasses)
//! 2. priority floor (a Critical action evicts lower ones on its control)
//! 3. minimum dwell for GPU mode transitions (5 min, Critical bypasses)
//! 4. oscillation guard (≥3 changes of one control by one agent in 2 min)
//! 5. cascading-effect preview (logged, can demote priority, never drops)
//! 6. safety caps (core parking floors, fan percentage clamp)
//!
//! Rejection is routine, not an error: every dropped action is returned
//! with its tagged reason so the executor can count and journal it.

use crate::action::{Action, ActionValue, ControlTarget, Priority, Proposal};
use crate::agents::ActionHistory;
use crate::error::EngineError;
use crate::overrides::CoolingRegistry;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Minimum dwell between non-Critical GPU mode transitions.
pub const GPU_MIN_DWELL: Duration = Duration::from_secs(5 * 60);
/// Oscillation guard: this many changes of one target by one agent...
const OSCILLATION_LIMIT: usize = 3;
/// ...within this window.
const OSCILLATION_WINDOW: Duration = Duration::from_secs(2 * 60);
/// Core parking floor.
pub const CORE_PARK_FLOOR_PCT: f32 = 25.0;

/// Second-order effect estimate from the static cascade table.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CascadePrediction {
    /// Expected battery life change, percent per hour (negative = drain).
    pub battery_delta_pct_hr: f32,
    /// Expected package temperature change over the next minutes, °C.
    pub temp_delta_c: f32,
    /// Expected fan reaction.
    pub fan_response: &'static str,
}

/// Static second-order effect table. Deliberately coarse; the point is a
/// logged preview, not a simulation.
pub fn predict_cascade(action: &Action) -> CascadePrediction {
    match (action.target, &action.value) {
        (ControlTarget::FanFullSpeed, _) => CascadePrediction {
            battery_delta_pct_hr: -4.0,
            temp_delta_c: -12.0,
            fan_response: "both fans to maximum",
        },
        (ControlTarget::FanSpeedCpu | ControlTarget::FanSpeedGpu, ActionValue::Percent(p)) => {
            CascadePrediction {
                battery_delta_pct_hr: -(p / 25.0),
                temp_delta_c: -(p / 10.0),
                fan_response: "ramp to requested duty",
            }
        }
        (ControlTarget::GpuHybridMode, ActionValue::GpuMode(mode)) => match mode {
            crate::action::HybridMode::Off => CascadePrediction {
                battery_delta_pct_hr: -12.0,
                temp_delta_c: 6.0,
                fan_response: "gpu fan engages",
            },
            crate::action::HybridMode::IGpuOnly => CascadePrediction {
                battery_delta_pct_hr: 10.0,
                temp_delta_c: -5.0,
                fan_response: "gpu fan idles",
            },
            _ => CascadePrediction {
                battery_delta_pct_hr: 2.0,
                temp_delta_c: -1.0,
                fan_response: "unchanged",
            },
        },
        (ControlTarget::CoreParkMaxPct, ActionValue::Percent(p)) if *p < 100.0 => {
            CascadePrediction {
                battery_delta_pct_hr: 5.0,
                temp_delta_c: -3.0,
                fan_response: "fans slow as package cools",
            }
        }
        (ControlTarget::RefreshRateHz, ActionValue::RefreshHz(hz)) if *hz <= 60 => {
            CascadePrediction {
                battery_delta_pct_hr: 6.0,
                temp_delta_c: -1.0,
                fan_response: "unchanged",
            }
        }
        _ => CascadePrediction {
            battery_delta_pct_hr: 0.0,
            temp_delta_c: 0.0,
            fan_response: "unchanged",
        },
    }
}

/// Records the last successful transition per dwell-guarded control.
/// Written by the executor, read by the planner.
#[derive(Default)]
pub struct DwellTracker {
    gpu_transition: Mutex<Option<Instant>>,
}

impl DwellTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_gpu_transition(&self) {
        *self.gpu_transition.lock().unwrap_or_else(|e| e.into_inner()) = Some(Instant::now());
    }

    pub fn gpu_dwell_remaining(&self, min_dwell: Duration) -> Option<Duration> {
        let last = *self.gpu_transition.lock().unwrap_or_else(|e| e.into_inner());
        last.and_then(|at| min_dwell.checked_sub(at.elapsed()))
            .filter(|d| !d.is_zero())
    }
}

/// One dropped action with its tagged reason.
#[derive(Debug)]
pub struct Rejection {
    pub action: Action,
    pub reason: EngineError,
}

/// Planner output: accepted actions in execution order plus rejections.
#[derive(Debug, Default)]
pub struct PlanOutcome {
    pub accepted: Vec<Action>,
    pub rejected: Vec<Rejection>,
}

/// Execution ordering among equal priorities:
/// thermal > battery > power > gpu > display > others.
fn agent_rank(agent: &str) -> u8 {
    match agent {
        "thermal" => 0,
        "battery" => 1,
        "power" => 2,
        "gpu" => 3,
        "refresh" | "display" => 4,
        _ => 5,
    }
}

pub struct Planner {
    gpu_min_dwell: Duration,
}

impl Planner {
    pub fn new() -> Self {
        Self {
            gpu_min_dwell: GPU_MIN_DWELL,
        }
    }

    #[cfg(test)]
    pub fn with_dwell(gpu_min_dwell: Duration) -> Self {
        Self { gpu_min_dwell }
    }

    /// Apply the rule pipeline to one tick's proposals.
    pub fn plan(
        &self,
        proposals: Vec<Proposal>,
        overrides: Option<&CoolingRegistry>,
        histories: &HashMap<String, ActionHistory>,
        dwell: &DwellTracker,
        on_battery: bool,
    ) -> PlanOutcome {
        let mut outcome = PlanOutcome::default();
        let mut candidates: Vec<Action> = Vec::new();

        // Rule 1: override filter.
        for proposal in proposals {
            for action in proposal.actions {
                if action.priority != Priority::Critical {
                    if let Some(registry) = overrides {
                        if let Some(matches) =
                            registry.active_value_matches(action.target, &action.value.to_json())
                        {
                            if !matches {
                                outcome.rejected.push(Rejection {
                                    reason: EngineError::OverrideActive {
                                        control: action.target.to_string(),
                                    },
                                    action,
                                });
                                continue;
                            }
                        }
                    }
                }
                candidates.push(action);
            }
        }

        // Rule 2: priority floor. A Critical action on a control evicts
        // every lower-priority action on the same control.
        let critical_controls: HashSet<ControlTarget> = candidates
            .iter()
            .filter(|a| a.priority == Priority::Critical)
            .map(|a| a.target)
            .collect();
        let (kept, floored): (Vec<Action>, Vec<Action>) = candidates.into_iter().partition(|a| {
            a.priority == Priority::Critical || !critical_controls.contains(&a.target)
        });
        for action in floored {
            outcome.rejected.push(Rejection {
                reason: EngineError::Unexpected(format!(
                    "superseded by a critical action on {}",
                    action.target
                )),
                action,
            });
        }
        let mut candidates = kept;

        // Rule 3: minimum dwell for GPU transitions.
        if let Some(remaining) = dwell.gpu_dwell_remaining(self.gpu_min_dwell) {
            let (kept, dwelled): (Vec<Action>, Vec<Action>) =
                candidates.into_iter().partition(|a| {
                    a.target != ControlTarget::GpuHybridMode || a.priority == Priority::Critical
                });
            for action in dwelled {
                outcome.rejected.push(Rejection {
                    reason: EngineError::DwellViolation(format!(
                        "gpu mode settled {:?} ago, {:?} of dwell remaining",
                        self.gpu_min_dwell.saturating_sub(remaining),
                        remaining
                    )),
                    action,
                });
            }
            candidates = kept;
        }

        // Rule 4: oscillation guard.
        let (kept, oscillating): (Vec<Action>, Vec<Action>) =
            candidates.into_iter().partition(|a| {
                let changes = histories
                    .get(&a.origin_agent)
                    .map(|h| h.changes_within(a.target, OSCILLATION_WINDOW))
                    .unwrap_or(0);
                changes < OSCILLATION_LIMIT
            });
        for action in oscillating {
            outcome.rejected.push(Rejection {
                reason: EngineError::OscillationGuard(format!(
                    "{} changed {} {} times in the last {:?}",
                    action.origin_agent, action.target, OSCILLATION_LIMIT, OSCILLATION_WINDOW
                )),
                action,
            });
        }
        let mut candidates = kept;

        // Rule 5: cascading preview. Logged; a worsening battery forecast
        // demotes High to Normal on battery, nothing is dropped.
        for action in candidates.iter_mut() {
            let prediction = predict_cascade(action);
            debug!(
                "Planner: cascade {} {} -> battery {:+.1}%/h, temp {:+.1}C, fans: {}",
                action.target,
                action.value,
                prediction.battery_delta_pct_hr,
                prediction.temp_delta_c,
                prediction.fan_response
            );
            if on_battery
                && action.priority == Priority::High
                && prediction.battery_delta_pct_hr < -5.0
            {
                info!(
                    "Planner: demoting {} from {} (predicted {:+.1}%/h on battery)",
                    action.target, action.origin_agent, prediction.battery_delta_pct_hr
                );
                action.priority = Priority::Normal;
            }
        }

        // Rule 6: safety caps.
        let park_min = candidates.iter().find_map(|a| {
            (a.target == ControlTarget::CoreParkMinPct).then(|| match &a.value {
                ActionValue::Percent(p) => *p,
                _ => CORE_PARK_FLOOR_PCT,
            })
        });
        for action in candidates.iter_mut() {
            match (action.target, &mut action.value) {
                (ControlTarget::CoreParkMinPct, ActionValue::Percent(p)) => {
                    *p = p.max(CORE_PARK_FLOOR_PCT);
                }
                (ControlTarget::CoreParkMaxPct, ActionValue::Percent(p)) => {
                    let floor = park_min.unwrap_or(CORE_PARK_FLOOR_PCT).max(CORE_PARK_FLOOR_PCT);
                    *p = p.max(floor);
                }
                (
                    ControlTarget::FanSpeedCpu
                    | ControlTarget::FanSpeedGpu
                    | ControlTarget::DisplayBrightness
                    | ControlTarget::KbdBrightness,
                    ActionValue::Percent(p),
                ) => {
                    *p = p.clamp(0.0, 100.0);
                }
                _ => {}
            }
        }

        // Final ordering: priority first, then the fixed agent ranking.
        candidates.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| agent_rank(&a.origin_agent).cmp(&agent_rank(&b.origin_agent)))
        });
        outcome.accepted = candidates;
        outcome
    }
}

impl Default for Planner {
    fn default() -> Self {
        Self::new()
    }
}
