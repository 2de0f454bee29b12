//! Battery agent: discharge-rate bands as an aggressiveness dial
//!
//! This agent drives no hardware. It watches the instantaneous discharge
//! rate, buckets it into bands and exposes the band as a shared dial that
//! other agents consult (the power agent escalates its profile ladder on a
//! Critical band). A proposal is emitted only when the band changes, so
//! the change shows up in cycle accounting and the journals.

use crate::action::Proposal;
use crate::agents::{Agent, AgentContext};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tracing::info;

/// Discharge-rate bands (W): Low < 15, Medium 15-30, High 30-50,
/// Critical > 50.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DischargeBand {
    #[default]
    Low,
    Medium,
    High,
    Critical,
}

impl DischargeBand {
    pub fn from_watts(watts: f32) -> Self {
        if watts > 50.0 {
            DischargeBand::Critical
        } else if watts > 30.0 {
            DischargeBand::High
        } else if watts >= 15.0 {
            DischargeBand::Medium
        } else {
            DischargeBand::Low
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            DischargeBand::Low => 0,
            DischargeBand::Medium => 1,
            DischargeBand::High => 2,
            DischargeBand::Critical => 3,
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            1 => DischargeBand::Medium,
            2 => DischargeBand::High,
            3 => DischargeBand::Critical,
            _ => DischargeBand::Low,
        }
    }
}

/// Shared dial: written by the battery agent, read by the orchestrator
/// when assembling the next context.
#[derive(Default)]
pub struct AggressivenessDial {
    band: AtomicU8,
}

impl AggressivenessDial {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn get(&self) -> DischargeBand {
        DischargeBand::from_u8(self.band.load(Ordering::Relaxed))
    }

    fn set(&self, band: DischargeBand) {
        self.band.store(band.as_u8(), Ordering::Relaxed);
    }
}

pub struct BatteryAgent {
    dial: Arc<AggressivenessDial>,
    last_band: Option<DischargeBand>,
}

impl BatteryAgent {
    pub fn new(dial: Arc<AggressivenessDial>) -> Self {
        Self {
            dial,
            last_band: None,
        }
    }
}

impl Agent for BatteryAgent {
    fn name(&self) -> &'static str {
        "battery"
    }

    fn propose(&mut self, ctx: &AgentContext<'_>) -> Proposal {
        let proposal = Proposal::empty(self.name());
        let snap = ctx.snapshot;

        let band = if snap.on_battery() {
            snap.battery
                .and_then(|b| b.discharge_w())
                .map(DischargeBand::from_watts)
                .unwrap_or(DischargeBand::Low)
        } else {
            DischargeBand::Low
        };

        self.dial.set(band);
        if self.last_band != Some(band) {
            if let Some(previous) = self.last_band {
                info!(
                    "Battery: discharge band {:?} -> {:?} ({}% charge)",
                    previous,
                    band,
                    snap.battery.map(|b| b.pct).unwrap_or(0.0)
                );
            }
            self.last_band = Some(band);
        }
        // The proposal never carries actuator changes; the band is consumed
        // through the shared dial.
        proposal
    }
}
