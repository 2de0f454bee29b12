//! Keyboard backlight agent
//!
//! Small quality-of-life saver: the backlight follows the power source and
//! activity. Idle on battery turns it off, active use on battery dims it,
//! AC restores full brightness. One proposal per level change.

use crate::action::{Action, ActionValue, ControlTarget, Priority, Proposal};
use crate::agents::{Agent, AgentContext};
use crate::snapshot::WorkloadClass;

const LEVEL_OFF: f32 = 0.0;
const LEVEL_DIM: f32 = 30.0;
const LEVEL_FULL: f32 = 100.0;

pub struct KbdLightAgent {
    last_level: Option<f32>,
}

impl KbdLightAgent {
    pub fn new() -> Self {
        Self { last_level: None }
    }
}

impl Default for KbdLightAgent {
    fn default() -> Self {
        Self::new()
    }
}

impl Agent for KbdLightAgent {
    fn name(&self) -> &'static str {
        "kbdlight"
    }

    fn propose(&mut self, ctx: &AgentContext<'_>) -> Proposal {
        let mut proposal = Proposal::empty(self.name());
        if !ctx.capabilities.has_ec {
            return proposal;
        }
        if ctx.control_overridden(ControlTarget::KbdBrightness) {
            return proposal;
        }
        let snap = ctx.snapshot;

        let level = if snap.on_ac {
            LEVEL_FULL
        } else if snap.workload_class == WorkloadClass::Idle {
            LEVEL_OFF
        } else {
            LEVEL_DIM
        };

        if self.last_level == Some(level) {
            return proposal;
        }
        self.last_level = Some(level);
        proposal.actions.push(Action::new(
            ControlTarget::KbdBrightness,
            ActionValue::Percent(level),
            Priority::Normal,
            self.name(),
            format!(
                "{} / {:?}",
                if snap.on_ac { "AC" } else { "battery" },
                snap.workload_class
            ),
        ));
        proposal
    }
}
