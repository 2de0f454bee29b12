//! Power agent: profile ladder over C-states, core parking, Wi-Fi and
//! memory power
//!
//! Picks one of four profiles from the battery level and load, then emits
//! the per-knob actions for it. A proposal is only emitted when the
//! selected profile changes, so a stable machine generates no traffic.
//!
//! Profile selection:
//! - on battery below 15 %: MaximumPowerSaving
//! - on battery below 30 %: PowerSaving
//! - on AC with cpu util above 40 %: Performance
//! - otherwise: Balanced
//!
//! The battery agent's discharge band escalates the ladder one step when
//! the machine is draining critically fast.

use crate::action::{
    Action, ActionValue, ControlTarget, CstateLimit, MemoryProfile, Priority, Proposal,
    WifiPsaveMode,
};
use crate::agents::{Agent, AgentContext, DischargeBand};

const LOW_BATTERY_PCT: f32 = 15.0;
const SAVER_BATTERY_PCT: f32 = 30.0;
const PERFORMANCE_UTIL_PCT: f32 = 40.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerProfile {
    MaximumPowerSaving,
    PowerSaving,
    Balanced,
    Performance,
}

struct ProfileSettings {
    park_min_pct: f32,
    park_max_pct: f32,
    cstate: CstateLimit,
    wifi: WifiPsaveMode,
    memory: MemoryProfile,
}

impl PowerProfile {
    fn settings(&self) -> ProfileSettings {
        match self {
            PowerProfile::MaximumPowerSaving => ProfileSettings {
                park_min_pct: 25.0,
                park_max_pct: 50.0,
                cstate: CstateLimit::Unlimited,
                wifi: WifiPsaveMode::MaxPsp,
                memory: MemoryProfile::MaxPowerSaving,
            },
            PowerProfile::PowerSaving => ProfileSettings {
                park_min_pct: 25.0,
                park_max_pct: 75.0,
                cstate: CstateLimit::Unlimited,
                wifi: WifiPsaveMode::MaxPsp,
                memory: MemoryProfile::Balanced,
            },
            PowerProfile::Balanced => ProfileSettings {
                park_min_pct: 25.0,
                park_max_pct: 100.0,
                cstate: CstateLimit::Unlimited,
                wifi: WifiPsaveMode::MediumPsp,
                memory: MemoryProfile::Balanced,
            },
            PowerProfile::Performance => ProfileSettings {
                park_min_pct: 100.0,
                park_max_pct: 100.0,
                cstate: CstateLimit::C2,
                wifi: WifiPsaveMode::Disabled,
                memory: MemoryProfile::Performance,
            },
        }
    }

    /// One step further down the ladder (more saving). Performance and
    /// Balanced step to PowerSaving; the saving profiles step to maximum.
    fn escalated(&self) -> Self {
        match self {
            PowerProfile::Performance | PowerProfile::Balanced => PowerProfile::PowerSaving,
            PowerProfile::PowerSaving | PowerProfile::MaximumPowerSaving => {
                PowerProfile::MaximumPowerSaving
            }
        }
    }
}

pub struct PowerAgent {
    last_profile: Option<PowerProfile>,
}

impl PowerAgent {
    pub fn new() -> Self {
        Self { last_profile: None }
    }

    fn select(ctx: &AgentContext<'_>) -> PowerProfile {
        let snap = ctx.snapshot;
        let mut profile = if snap.on_battery_below(LOW_BATTERY_PCT) {
            PowerProfile::MaximumPowerSaving
        } else if snap.on_battery_below(SAVER_BATTERY_PCT) {
            PowerProfile::PowerSaving
        } else if snap.on_ac && snap.cpu_util_pct > PERFORMANCE_UTIL_PCT {
            PowerProfile::Performance
        } else {
            PowerProfile::Balanced
        };

        if snap.on_battery() && ctx.discharge_band == DischargeBand::Critical {
            profile = profile.escalated();
        }
        profile
    }
}

impl Default for PowerAgent {
    fn default() -> Self {
        Self::new()
    }
}

impl Agent for PowerAgent {
    fn name(&self) -> &'static str {
        "power"
    }

    fn propose(&mut self, ctx: &AgentContext<'_>) -> Proposal {
        let mut proposal = Proposal::empty(self.name());
        let profile = Self::select(ctx);
        if self.last_profile == Some(profile) {
            return proposal;
        }
        self.last_profile = Some(profile);

        let settings = profile.settings();
        let priority = if profile == PowerProfile::MaximumPowerSaving {
            Priority::High
        } else {
            Priority::Normal
        };
        proposal.priority = priority;
        let why = format!("profile {:?}", profile);

        for (target, value) in [
            (
                ControlTarget::CoreParkMinPct,
                ActionValue::Percent(settings.park_min_pct),
            ),
            (
                ControlTarget::CoreParkMaxPct,
                ActionValue::Percent(settings.park_max_pct),
            ),
            (ControlTarget::WifiPsaveMode, ActionValue::Wifi(settings.wifi)),
            (
                ControlTarget::MemoryProfile,
                ActionValue::Memory(settings.memory),
            ),
        ] {
            if !ctx.control_overridden(target) {
                proposal
                    .actions
                    .push(Action::new(target, value, priority, self.name(), why.clone()));
            }
        }

        // The C-state limit needs the MSR path; a failed startup probe
        // permanently disables it.
        if ctx.capabilities.has_msr && !ctx.control_overridden(ControlTarget::CstateLimit) {
            proposal.actions.push(Action::new(
                ControlTarget::CstateLimit,
                ActionValue::Cstate(settings.cstate),
                priority,
                self.name(),
                why,
            ));
        }

        proposal
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::testutil::CtxParts;
    use crate::hal::battery::BatteryStatus;
    use crate::snapshot::Snapshot;

    fn snap(on_ac: bool, battery_pct: f32, cpu_util: f32) -> Snapshot {
        Snapshot {
            on_ac,
            cpu_util_pct: cpu_util,
            battery: Some(BatteryStatus {
                pct: battery_pct,
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn action_value(proposal: &Proposal, target: ControlTarget) -> Option<&ActionValue> {
        proposal
            .actions
            .iter()
            .find(|a| a.target == target)
            .map(|a| &a.value)
    }

    #[test]
    fn critical_battery_selects_maximum_saving() {
        let mut agent = PowerAgent::new();
        let parts = CtxParts::new(snap(false, 12.0, 10.0));
        let proposal = agent.propose(&parts.ctx());
        assert_eq!(proposal.priority, Priority::High);
        assert_eq!(
            action_value(&proposal, ControlTarget::CoreParkMinPct),
            Some(&ActionValue::Percent(25.0))
        );
        assert_eq!(
            action_value(&proposal, ControlTarget::CoreParkMaxPct),
            Some(&ActionValue::Percent(50.0))
        );
        assert_eq!(
            action_value(&proposal, ControlTarget::WifiPsaveMode),
            Some(&ActionValue::Wifi(WifiPsaveMode::MaxPsp))
        );
        assert_eq!(
            action_value(&proposal, ControlTarget::MemoryProfile),
            Some(&ActionValue::Memory(MemoryProfile::MaxPowerSaving))
        );
        assert_eq!(
            action_value(&proposal, ControlTarget::CstateLimit),
            Some(&ActionValue::Cstate(CstateLimit::Unlimited))
        );
    }

    #[test]
    fn loaded_ac_machine_selects_performance() {
        let mut agent = PowerAgent::new();
        let parts = CtxParts::new(snap(true, 80.0, 55.0));
        let proposal = agent.propose(&parts.ctx());
        assert_eq!(
            action_value(&proposal, ControlTarget::CoreParkMinPct),
            Some(&ActionValue::Percent(100.0))
        );
        assert_eq!(
            action_value(&proposal, ControlTarget::CstateLimit),
            Some(&ActionValue::Cstate(CstateLimit::C2))
        );
    }

    #[test]
    fn unchanged_profile_emits_nothing() {
        let mut agent = PowerAgent::new();
        let parts = CtxParts::new(snap(true, 80.0, 10.0));
        assert!(!agent.propose(&parts.ctx()).is_empty());
        assert!(agent.propose(&parts.ctx()).is_empty());
    }

    #[test]
    fn profile_transition_reproposes() {
        let mut agent = PowerAgent::new();
        let balanced = CtxParts::new(snap(true, 80.0, 10.0));
        agent.propose(&balanced.ctx());
        let saving = CtxParts::new(snap(false, 25.0, 10.0));
        let proposal = agent.propose(&saving.ctx());
        assert_eq!(
            action_value(&proposal, ControlTarget::CoreParkMaxPct),
            Some(&ActionValue::Percent(75.0))
        );
    }

    #[test]
    fn critical_discharge_band_escalates() {
        let mut agent = PowerAgent::new();
        let mut parts = CtxParts::new(snap(false, 50.0, 10.0));
        parts.discharge_band = DischargeBand::Critical;
        let proposal = agent.propose(&parts.ctx());
        // Balanced would cap parking at 100; the escalation to PowerSaving
        // caps it at 75.
        assert_eq!(
            action_value(&proposal, ControlTarget::CoreParkMaxPct),
            Some(&ActionValue::Percent(75.0))
        );
    }

    #[test]
    fn missing_msr_drops_only_the_cstate_action() {
        let mut agent = PowerAgent::new();
        let mut parts = CtxParts::new(snap(false, 12.0, 10.0));
        parts.capabilities.has_msr = false;
        let proposal = agent.propose(&parts.ctx());
        assert!(action_value(&proposal, ControlTarget::CstateLimit).is_none());
        assert!(action_value(&proposal, ControlTarget::CoreParkMinPct).is_some());
    }
}
