//! Thermal agent: fan speeds from piecewise temperature curves
//!
//! Keys the curve on (power mode, cpu temp, gpu temp, trend). The trend is
//! a short EWMA of cpu temperatures held in agent memory; a rising trend
//! biases the curve one step hotter so the fans lead the heat instead of
//! chasing it.
//!
//! Above the critical thresholds (CPU ≥ 90 °C, GPU ≥ 85 °C) the agent
//! proposes full fan speed at Critical priority and keeps it latched until
//! temperatures fall back through the hysteresis band.

use crate::action::{Action, ActionValue, ControlTarget, Priority, Proposal};
use crate::agents::{Agent, AgentContext};

const CPU_CRITICAL_C: f32 = 90.0;
const GPU_CRITICAL_C: f32 = 85.0;
/// Hysteresis: once latched, stay critical until below these.
const CPU_RELEASE_C: f32 = 85.0;
const GPU_RELEASE_C: f32 = 80.0;

/// EWMA smoothing factor for the cpu temperature trend.
const TREND_ALPHA: f32 = 0.3;
/// Degrees of positive trend that push the curve one step hotter.
const RISING_TREND_C: f32 = 2.0;

/// Minimum percentage-point change worth re-proposing.
const MIN_DELTA_PCT: f32 = 5.0;

pub struct ThermalAgent {
    cpu_ewma: Option<f32>,
    critical_latched: bool,
    last_cpu_fan_pct: Option<f32>,
    last_gpu_fan_pct: Option<f32>,
}

impl ThermalAgent {
    pub fn new() -> Self {
        Self {
            cpu_ewma: None,
            critical_latched: false,
            last_cpu_fan_pct: None,
            last_gpu_fan_pct: None,
        }
    }

    /// Piecewise fan curve. `on_ac` lifts the quiet floor; a rising trend
    /// moves to the next step early.
    fn curve(on_ac: bool, temp_c: f32, rising: bool) -> f32 {
        let effective = if rising { temp_c + 5.0 } else { temp_c };
        match effective {
            t if t < 50.0 => {
                if on_ac {
                    20.0
                } else {
                    0.0
                }
            }
            t if t < 65.0 => 30.0,
            t if t < 75.0 => 45.0,
            t if t < 85.0 => 65.0,
            _ => 85.0,
        }
    }

    fn update_trend(&mut self, cpu_temp: f32) -> f32 {
        let ewma = match self.cpu_ewma {
            Some(prev) => prev + TREND_ALPHA * (cpu_temp - prev),
            None => cpu_temp,
        };
        self.cpu_ewma = Some(ewma);
        cpu_temp - ewma
    }
}

impl Default for ThermalAgent {
    fn default() -> Self {
        Self::new()
    }
}

impl Agent for ThermalAgent {
    fn name(&self) -> &'static str {
        "thermal"
    }

    fn propose(&mut self, ctx: &AgentContext<'_>) -> Proposal {
        let mut proposal = Proposal::empty(self.name());
        if !ctx.capabilities.has_ec {
            return proposal;
        }
        let snap = ctx.snapshot;
        let (cpu_temp, gpu_temp) = match (snap.cpu_temp_c, snap.gpu_temp_c) {
            (Some(c), g) => (c, g.unwrap_or(0.0)),
            // Without a cpu temperature there is nothing to key the curve on.
            (None, _) => return proposal,
        };

        let trend = self.update_trend(cpu_temp);
        let rising = trend > RISING_TREND_C;

        // Critical path with hysteresis.
        let over_critical = cpu_temp >= CPU_CRITICAL_C || gpu_temp >= GPU_CRITICAL_C;
        let released = cpu_temp < CPU_RELEASE_C && gpu_temp < GPU_RELEASE_C;
        if over_critical || (self.critical_latched && !released) {
            let newly = !self.critical_latched;
            self.critical_latched = true;
            if newly {
                proposal.priority = Priority::Critical;
                proposal.actions.push(Action::new(
                    ControlTarget::FanFullSpeed,
                    ActionValue::Switch(true),
                    Priority::Critical,
                    self.name(),
                    format!("cpu {:.0}C / gpu {:.0}C over critical threshold", cpu_temp, gpu_temp),
                ));
                self.last_cpu_fan_pct = Some(100.0);
                self.last_gpu_fan_pct = Some(100.0);
            }
            return proposal;
        }
        if self.critical_latched && released {
            self.critical_latched = false;
            // Fall through to the normal curve, which will restore speeds.
            self.last_cpu_fan_pct = None;
            self.last_gpu_fan_pct = None;
        }

        let cpu_pct = Self::curve(snap.on_ac, cpu_temp, rising);
        let gpu_pct = Self::curve(snap.on_ac, gpu_temp, false);

        let cpu_changed = self
            .last_cpu_fan_pct
            .map(|last| (last - cpu_pct).abs() >= MIN_DELTA_PCT)
            .unwrap_or(true);
        if cpu_changed && !ctx.control_overridden(ControlTarget::FanSpeedCpu) {
            proposal.actions.push(Action::new(
                ControlTarget::FanSpeedCpu,
                ActionValue::Percent(cpu_pct),
                Priority::Normal,
                self.name(),
                format!("cpu {:.0}C trend {:+.1}C", cpu_temp, trend),
            ));
            self.last_cpu_fan_pct = Some(cpu_pct);
        }

        let gpu_changed = self
            .last_gpu_fan_pct
            .map(|last| (last - gpu_pct).abs() >= MIN_DELTA_PCT)
            .unwrap_or(true);
        if gpu_changed
            && snap.gpu_temp_c.is_some()
            && !ctx.control_overridden(ControlTarget::FanSpeedGpu)
        {
            proposal.actions.push(Action::new(
                ControlTarget::FanSpeedGpu,
                ActionValue::Percent(gpu_pct),
                Priority::Normal,
                self.name(),
                format!("gpu {:.0}C", gpu_temp),
            ));
            self.last_gpu_fan_pct = Some(gpu_pct);
        }

        proposal
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::testutil::CtxParts;
    use crate::snapshot::Snapshot;

    fn snap(cpu: f32, gpu: f32, on_ac: bool) -> Snapshot {
        Snapshot {
            cpu_temp_c: Some(cpu),
            gpu_temp_c: Some(gpu),
            on_ac,
            ..Default::default()
        }
    }

    #[test]
    fn cool_machine_on_battery_stops_fans() {
        let mut agent = ThermalAgent::new();
        let parts = CtxParts::new(snap(42.0, 40.0, false));
        let proposal = agent.propose(&parts.ctx());
        let cpu_action = proposal
            .actions
            .iter()
            .find(|a| a.target == ControlTarget::FanSpeedCpu)
            .unwrap();
        assert_eq!(cpu_action.value, ActionValue::Percent(0.0));
    }

    #[test]
    fn critical_cpu_temp_goes_full_speed_critical() {
        let mut agent = ThermalAgent::new();
        let parts = CtxParts::new(snap(92.0, 70.0, true));
        let proposal = agent.propose(&parts.ctx());
        assert_eq!(proposal.priority, Priority::Critical);
        assert_eq!(proposal.actions.len(), 1);
        assert_eq!(proposal.actions[0].target, ControlTarget::FanFullSpeed);
        assert_eq!(proposal.actions[0].value, ActionValue::Switch(true));
    }

    #[test]
    fn critical_latches_until_hysteresis_release() {
        let mut agent = ThermalAgent::new();
        let hot = CtxParts::new(snap(91.0, 70.0, true));
        assert_eq!(agent.propose(&hot.ctx()).priority, Priority::Critical);

        // 87C is below the trigger but above the release: stay latched and
        // do not start proposing normal curve speeds yet.
        let warm = CtxParts::new(snap(87.0, 70.0, true));
        let during = agent.propose(&warm.ctx());
        assert!(during.actions.is_empty());

        // Below the release band the curve resumes.
        let cool = CtxParts::new(snap(70.0, 60.0, true));
        let after = agent.propose(&cool.ctx());
        assert!(after
            .actions
            .iter()
            .any(|a| a.target == ControlTarget::FanSpeedCpu));
    }

    #[test]
    fn small_changes_are_not_reproposed() {
        let mut agent = ThermalAgent::new();
        let first = CtxParts::new(snap(70.0, 60.0, true));
        assert!(!agent.propose(&first.ctx()).actions.is_empty());
        // Same band -> same percentages -> nothing new to say.
        let second = CtxParts::new(snap(71.0, 61.0, true));
        assert!(agent.propose(&second.ctx()).actions.is_empty());
    }

    #[test]
    fn missing_cpu_sensor_yields_empty_proposal() {
        let mut agent = ThermalAgent::new();
        let parts = CtxParts::new(Snapshot::default());
        assert!(agent.propose(&parts.ctx()).is_empty());
    }

    #[test]
    fn gpu_critical_also_triggers() {
        let mut agent = ThermalAgent::new();
        let parts = CtxParts::new(snap(60.0, 86.0, true));
        let proposal = agent.propose(&parts.ctx());
        assert_eq!(proposal.priority, Priority::Critical);
    }
}
