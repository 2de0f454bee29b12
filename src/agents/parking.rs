//! Core-parking / hybrid big.LITTLE affinity agent
//!
//! On a hybrid package running on low battery, background work belongs on
//! the efficiency cores. The agent walks the snapshot's process list and
//! proposes E-core affinity masks for every unprotected process; back on
//! AC it restores the all-cores mask.
//!
//! Protected processes are never touched: a fixed system-critical name
//! set, anything with elevated scheduler priority, and anything with more
//! than 300 s of accumulated CPU time (long-running foreground work).
//! Masks are never empty: on a package with no efficiency cores the agent
//! stays silent.

use crate::action::{Action, ActionValue, ControlTarget, Priority, Proposal};
use crate::agents::{Agent, AgentContext};
use crate::snapshot::ProcessInfo;
use std::collections::HashSet;

const BATTERY_THRESHOLD_PCT: f32 = 30.0;
/// Cumulative CPU time above which a process counts as protected.
const PROTECTED_CPU_TIME_MS: u64 = 300_000;
/// Affinity changes proposed per tick, to bound executor work.
const MAX_ACTIONS_PER_TICK: usize = 16;

/// Processes the engine must never re-pin.
const PROTECTED_NAMES: &[&str] = &[
    "dwm", "csrss", "winlogon", "services", "lsass", "smss", "powerpilot", "systemd", "init",
];

pub struct ParkingAgent {
    /// Pids currently pinned to the efficiency cores, pending restoration.
    pinned: HashSet<u32>,
}

impl ParkingAgent {
    pub fn new() -> Self {
        Self {
            pinned: HashSet::new(),
        }
    }

    fn protected(process: &ProcessInfo) -> bool {
        let name = process.name.to_lowercase();
        let name = name.trim_end_matches(".exe");
        if PROTECTED_NAMES.iter().any(|p| name == *p) {
            return true;
        }
        if process.nice.map(|n| n < 0).unwrap_or(false) {
            return true;
        }
        process.cpu_time_ms > PROTECTED_CPU_TIME_MS
    }
}

impl Default for ParkingAgent {
    fn default() -> Self {
        Self::new()
    }
}

impl Agent for ParkingAgent {
    fn name(&self) -> &'static str {
        "parking"
    }

    fn propose(&mut self, ctx: &AgentContext<'_>) -> Proposal {
        let mut proposal = Proposal::empty(self.name());
        if !ctx.capabilities.is_hybrid_cpu || ctx.e_core_mask == 0 {
            return proposal;
        }
        if ctx.control_overridden(ControlTarget::ProcessAffinity) {
            return proposal;
        }
        let snap = ctx.snapshot;

        let pin_to_e = snap.on_battery() && snap.on_battery_below(BATTERY_THRESHOLD_PCT);

        if pin_to_e {
            for process in &snap.processes {
                if proposal.actions.len() >= MAX_ACTIONS_PER_TICK {
                    break;
                }
                if self.pinned.contains(&process.pid) || Self::protected(process) {
                    continue;
                }
                proposal.actions.push(Action::new(
                    ControlTarget::ProcessAffinity,
                    ActionValue::Affinity {
                        pid: process.pid,
                        mask: ctx.e_core_mask,
                    },
                    Priority::Normal,
                    self.name(),
                    "low battery, pinning background work to E-cores",
                ));
                self.pinned.insert(process.pid);
            }
        } else if !self.pinned.is_empty() {
            // Restore everything previously pinned; pids that exited just
            // drop out of the set.
            let alive: HashSet<u32> = snap.processes.iter().map(|p| p.pid).collect();
            let mut restored = Vec::new();
            for pid in self.pinned.iter().copied() {
                if !alive.contains(&pid) {
                    restored.push(pid);
                    continue;
                }
                if proposal.actions.len() >= MAX_ACTIONS_PER_TICK {
                    break;
                }
                proposal.actions.push(Action::new(
                    ControlTarget::ProcessAffinity,
                    ActionValue::Affinity {
                        pid,
                        mask: ctx.all_core_mask,
                    },
                    Priority::Normal,
                    self.name(),
                    "restoring all-core affinity",
                ));
                restored.push(pid);
            }
            for pid in restored {
                self.pinned.remove(&pid);
            }
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

    fn proc(pid: u32, name: &str, cpu_time_ms: u64) -> ProcessInfo {
        ProcessInfo {
            pid,
            name: name.to_string(),
            cpu_pct: 2.0,
            cpu_time_ms,
            nice: Some(0),
        }
    }

    fn low_battery_snap(processes: Vec<ProcessInfo>) -> Snapshot {
        Snapshot {
            on_ac: false,
            battery: Some(BatteryStatus {
                pct: 20.0,
                ..Default::default()
            }),
            processes,
            ..Default::default()
        }
    }

    #[test]
    fn pins_unprotected_processes_to_e_cores_on_low_battery() {
        let mut agent = ParkingAgent::new();
        let parts = CtxParts::new(low_battery_snap(vec![
            proc(100, "browser", 5_000),
            proc(101, "editor", 8_000),
        ]));
        let proposal = agent.propose(&parts.ctx());
        assert_eq!(proposal.actions.len(), 2);
        for action in &proposal.actions {
            match &action.value {
                ActionValue::Affinity { mask, .. } => assert_eq!(*mask, 0xF0),
                other => panic!("unexpected value {:?}", other),
            }
        }
    }

    #[test]
    fn protected_names_and_busy_processes_are_skipped() {
        let mut agent = ParkingAgent::new();
        let parts = CtxParts::new(low_battery_snap(vec![
            proc(1, "csrss", 1_000),
            proc(2, "lsass.exe", 1_000),
            proc(3, "compiler", PROTECTED_CPU_TIME_MS + 1),
            proc(4, "browser", 1_000),
        ]));
        let proposal = agent.propose(&parts.ctx());
        assert_eq!(proposal.actions.len(), 1);
        match &proposal.actions[0].value {
            ActionValue::Affinity { pid, .. } => assert_eq!(*pid, 4),
            other => panic!("unexpected value {:?}", other),
        }
    }

    #[test]
    fn elevated_priority_is_protected() {
        let mut agent = ParkingAgent::new();
        let mut elevated = proc(7, "daw", 1_000);
        elevated.nice = Some(-5);
        let parts = CtxParts::new(low_battery_snap(vec![elevated]));
        assert!(agent.propose(&parts.ctx()).is_empty());
    }

    #[test]
    fn already_pinned_pids_are_not_reproposed() {
        let mut agent = ParkingAgent::new();
        let parts = CtxParts::new(low_battery_snap(vec![proc(100, "browser", 1_000)]));
        assert_eq!(agent.propose(&parts.ctx()).actions.len(), 1);
        assert!(agent.propose(&parts.ctx()).is_empty());
    }

    #[test]
    fn returning_to_ac_restores_all_cores_for_pinned() {
        let mut agent = ParkingAgent::new();
        let battery = CtxParts::new(low_battery_snap(vec![proc(100, "browser", 1_000)]));
        agent.propose(&battery.ctx());

        let ac = CtxParts::new(Snapshot {
            on_ac: true,
            processes: vec![proc(100, "browser", 1_000)],
            ..Default::default()
        });
        let proposal = agent.propose(&ac.ctx());
        assert_eq!(proposal.actions.len(), 1);
        match &proposal.actions[0].value {
            ActionValue::Affinity { mask, .. } => assert_eq!(*mask, 0xFF),
            other => panic!("unexpected value {:?}", other),
        }
    }

    #[test]
    fn uniform_package_stays_silent() {
        let mut agent = ParkingAgent::new();
        let mut parts = CtxParts::new(low_battery_snap(vec![proc(100, "browser", 1_000)]));
        parts.capabilities.is_hybrid_cpu = false;
        assert!(agent.propose(&parts.ctx()).is_empty());
    }
}
