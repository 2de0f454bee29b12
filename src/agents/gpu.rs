//! GPU agent: hybrid graphics mode selection
//!
//! Computes the desired mux position from the workload class, the display
//! topology and process-launch predictions. Two hard rules live in the
//! agent itself:
//! - with an external display on the discrete GPU, iGPU-only is never
//!   proposed (powering the dGPU down would black the monitor)
//! - mode flips are only proposed when the desired mode differs from the
//!   mode observed in the snapshot
//!
//! The 5-minute minimum dwell between transitions is the planner's job;
//! Critical proposals (gaming launch, forced mode) bypass it there.

use crate::action::{Action, ActionValue, ControlTarget, HybridMode, Priority, Proposal};
use crate::agents::predictor::ProcessClass;
use crate::agents::{Agent, AgentContext};
use crate::snapshot::WorkloadClass;

/// Launchers that mean a game is imminent even before load shows up.
const GAMING_LAUNCHERS: &[&str] = &[
    "steam",
    "epicgameslauncher",
    "gog galaxy",
    "battle.net",
    "riotclientservices",
];

/// Prediction confidence required before the agent acts on a hint.
const PREDICTION_CONFIDENCE_FLOOR: u8 = 80;

pub struct GpuAgent;

impl GpuAgent {
    pub fn new() -> Self {
        Self
    }

    fn desired_mode(ctx: &AgentContext<'_>) -> Option<(HybridMode, Priority, String)> {
        let snap = ctx.snapshot;

        // A confident launch prediction outranks workload inference.
        if let Some(prediction) = ctx.prediction {
            if prediction.confidence >= PREDICTION_CONFIDENCE_FLOOR {
                let priority = match prediction.class {
                    ProcessClass::Required => Priority::Critical,
                    ProcessClass::Preferred => Priority::High,
                    _ => Priority::Normal,
                };
                if let Some(mode) = prediction.recommended_mode {
                    return Some((
                        mode,
                        priority,
                        format!(
                            "launch of {} predicts {} (confidence {})",
                            prediction.process_name, mode, prediction.confidence
                        ),
                    ));
                }
            }
        }

        let launcher_running = snap
            .running_workload_hints
            .iter()
            .any(|h| GAMING_LAUNCHERS.iter().any(|l| h.contains(l)));

        if matches!(
            snap.workload_class,
            WorkloadClass::Gaming | WorkloadClass::AiWorkload
        ) || launcher_running
        {
            return Some((
                HybridMode::Off,
                Priority::Normal,
                format!("{:?} workload wants the discrete GPU", snap.workload_class),
            ));
        }

        if snap.on_battery()
            && matches!(
                snap.workload_class,
                WorkloadClass::Idle | WorkloadClass::LightProductivity | WorkloadClass::Unknown
            )
        {
            return Some((
                HybridMode::IGpuOnly,
                Priority::Normal,
                "light workload on battery".to_string(),
            ));
        }

        None
    }
}

impl Default for GpuAgent {
    fn default() -> Self {
        Self::new()
    }
}

impl Agent for GpuAgent {
    fn name(&self) -> &'static str {
        "gpu"
    }

    fn propose(&mut self, ctx: &AgentContext<'_>) -> Proposal {
        let mut proposal = Proposal::empty(self.name());
        if !ctx.capabilities.has_gpu_control {
            return proposal;
        }
        let snap = ctx.snapshot;

        let (mut mode, priority, rationale) = match Self::desired_mode(ctx) {
            Some(d) => d,
            None => return proposal,
        };

        // Invariant: never power the discrete GPU down while an external
        // display hangs off it. Degrade to hybrid-on instead.
        if mode == HybridMode::IGpuOnly && snap.display_topology.has_external_on_dgpu {
            mode = HybridMode::On;
        }

        if snap.gpu_mode == Some(mode) {
            return proposal;
        }
        if priority != Priority::Critical && ctx.control_overridden(ControlTarget::GpuHybridMode) {
            return proposal;
        }

        proposal.priority = priority;
        proposal.actions.push(Action::new(
            ControlTarget::GpuHybridMode,
            ActionValue::GpuMode(mode),
            priority,
            self.name(),
            rationale,
        ));
        proposal
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::testutil::CtxParts;
    use crate::agents::ProcessLaunchPrediction;
    use crate::hal::battery::BatteryStatus;
    use crate::snapshot::Snapshot;

    fn snap(workload: WorkloadClass, on_ac: bool, mode: HybridMode) -> Snapshot {
        Snapshot {
            workload_class: workload,
            on_ac,
            gpu_mode: Some(mode),
            battery: Some(BatteryStatus {
                pct: 50.0,
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn gaming_workload_proposes_discrete_on() {
        let mut agent = GpuAgent::new();
        let parts = CtxParts::new(snap(WorkloadClass::Gaming, true, HybridMode::On));
        let proposal = agent.propose(&parts.ctx());
        assert_eq!(proposal.actions.len(), 1);
        assert_eq!(
            proposal.actions[0].value,
            ActionValue::GpuMode(HybridMode::Off)
        );
    }

    #[test]
    fn light_battery_workload_proposes_igpu_only() {
        let mut agent = GpuAgent::new();
        let parts = CtxParts::new(snap(WorkloadClass::Idle, false, HybridMode::On));
        let proposal = agent.propose(&parts.ctx());
        assert_eq!(
            proposal.actions[0].value,
            ActionValue::GpuMode(HybridMode::IGpuOnly)
        );
    }

    #[test]
    fn external_display_on_dgpu_never_gets_igpu_only() {
        let mut agent = GpuAgent::new();
        let mut snapshot = snap(WorkloadClass::Idle, false, HybridMode::Off);
        snapshot.display_topology.has_external_on_dgpu = true;
        snapshot.display_topology.dgpu_display_count = 1;
        let parts = CtxParts::new(snapshot);
        let proposal = agent.propose(&parts.ctx());
        // Degrades to hybrid-on rather than proposing iGPU-only.
        assert!(proposal
            .actions
            .iter()
            .all(|a| a.value != ActionValue::GpuMode(HybridMode::IGpuOnly)));
        assert_eq!(
            proposal.actions[0].value,
            ActionValue::GpuMode(HybridMode::On)
        );
    }

    #[test]
    fn matching_mode_is_not_reproposed() {
        let mut agent = GpuAgent::new();
        let parts = CtxParts::new(snap(WorkloadClass::Gaming, true, HybridMode::Off));
        assert!(agent.propose(&parts.ctx()).is_empty());
    }

    #[test]
    fn required_prediction_is_critical() {
        let mut agent = GpuAgent::new();
        let mut parts = CtxParts::new(snap(WorkloadClass::Unknown, false, HybridMode::On));
        parts.prediction = Some(ProcessLaunchPrediction {
            process_name: "cyberpunk2077.exe".into(),
            class: ProcessClass::Required,
            recommended_mode: Some(HybridMode::Off),
            confidence: 95,
        });
        let proposal = agent.propose(&parts.ctx());
        assert_eq!(proposal.priority, Priority::Critical);
        assert_eq!(
            proposal.actions[0].value,
            ActionValue::GpuMode(HybridMode::Off)
        );
    }

    #[test]
    fn low_confidence_prediction_is_ignored() {
        let mut agent = GpuAgent::new();
        let mut parts = CtxParts::new(snap(WorkloadClass::HeavyProductivity, true, HybridMode::On));
        parts.prediction = Some(ProcessLaunchPrediction {
            process_name: "mystery.exe".into(),
            class: ProcessClass::Unknown,
            recommended_mode: Some(HybridMode::Off),
            confidence: 20,
        });
        assert!(agent.propose(&parts.ctx()).is_empty());
    }

    #[test]
    fn override_blocks_normal_but_not_critical() {
        use crate::overrides::{CoolingRegistry, Scenario};

        let mut agent = GpuAgent::new();
        let mut parts = CtxParts::new(snap(WorkloadClass::Gaming, true, HybridMode::On));
        let registry = CoolingRegistry::new();
        registry.record_override(
            ControlTarget::GpuHybridMode,
            Scenario::GeneralUse,
            serde_json::json!("on"),
        );
        parts.overrides = Some(registry);
        // Normal-priority gaming flip is self-censored under the override.
        assert!(agent.propose(&parts.ctx()).is_empty());

        // A Critical prediction still goes out.
        parts.prediction = Some(ProcessLaunchPrediction {
            process_name: "cyberpunk2077.exe".into(),
            class: ProcessClass::Required,
            recommended_mode: Some(HybridMode::Off),
            confidence: 95,
        });
        let proposal = agent.propose(&parts.ctx());
        assert_eq!(proposal.priority, Priority::Critical);
    }
}
