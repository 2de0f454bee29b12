//! Domain agents
//!
//! Each agent looks at the latest snapshot (plus its own small private
//! memory) and proposes zero or more actions. Proposals are pure functions
//! of their inputs: no blocking I/O inside `propose`, no direct hardware
//! access. The orchestrator calls agents in a fixed order, the planner
//! arbitrates, the executor actuates.

pub mod battery;
pub mod gpu;
pub mod kbdlight;
pub mod parking;
pub mod power;
pub mod predictor;
pub mod refresh;
pub mod thermal;

use crate::action::{ActionValue, ControlTarget, Proposal};
use crate::hal::Capabilities;
use crate::overrides::CoolingRegistry;
use crate::snapshot::Snapshot;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

pub use battery::{AggressivenessDial, BatteryAgent, DischargeBand};
pub use predictor::ProcessLaunchPrediction;

/// Bounded per-agent action history used for oscillation detection and
/// dwell bookkeeping. The executor appends after every successful action.
pub const HISTORY_CAPACITY: usize = 50;

#[derive(Debug, Clone)]
pub struct HistoryEntry {
    pub target: ControlTarget,
    pub value: serde_json::Value,
    pub at: Instant,
}

#[derive(Debug, Default)]
pub struct ActionHistory {
    entries: VecDeque<HistoryEntry>,
}

impl ActionHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, target: ControlTarget, value: &ActionValue) {
        self.record_at(target, value, Instant::now());
    }

    pub fn record_at(&mut self, target: ControlTarget, value: &ActionValue, at: Instant) {
        if self.entries.len() == HISTORY_CAPACITY {
            self.entries.pop_front();
        }
        self.entries.push_back(HistoryEntry {
            target,
            value: value.to_json(),
            at,
        });
    }

    /// Number of recorded changes for a target within the trailing window.
    pub fn changes_within(&self, target: ControlTarget, window: Duration) -> usize {
        let cutoff = Instant::now().checked_sub(window);
        self.entries
            .iter()
            .filter(|e| e.target == target)
            .filter(|e| match cutoff {
                Some(cutoff) => e.at >= cutoff,
                None => true,
            })
            .count()
    }

    pub fn last_for(&self, target: ControlTarget) -> Option<&HistoryEntry> {
        self.entries.iter().rev().find(|e| e.target == target)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &HistoryEntry> {
        self.entries.iter()
    }
}

/// Everything an agent may consult while proposing.
pub struct AgentContext<'a> {
    pub snapshot: &'a Snapshot,
    /// Optional by contract: the engine operates without the registry,
    /// merely losing override protection.
    pub overrides: Option<&'a CoolingRegistry>,
    pub history: &'a ActionHistory,
    pub capabilities: Capabilities,
    /// Battery agent's aggressiveness dial, consumed by other agents.
    pub discharge_band: DischargeBand,
    /// Latest process-launch prediction, a hint, never a command.
    pub prediction: Option<&'a ProcessLaunchPrediction>,
    /// Affinity mask of the efficiency cores (0 on uniform packages).
    pub e_core_mask: u64,
    /// Affinity mask of every managed logical processor.
    pub all_core_mask: u64,
}

impl<'a> AgentContext<'a> {
    /// True when the control is inside a user cooling period. Without a
    /// registry this is always false.
    pub fn control_overridden(&self, control: ControlTarget) -> bool {
        self.overrides
            .map(|r| r.is_in_cooling_period(control).0)
            .unwrap_or(false)
    }
}

/// Common agent contract. `propose` must not block and must not panic;
/// the orchestrator additionally shields itself against panics and turns
/// them into health events.
pub trait Agent: Send {
    fn name(&self) -> &'static str;
    fn propose(&mut self, ctx: &AgentContext<'_>) -> Proposal;
}
