//! Orchestrator loop
//!
//! The engine's heartbeat. On every fast tick while `Running`:
//! 1. build and publish a snapshot
//! 2. feed the launch predictor
//! 3. ask each registered agent (fixed order) for a proposal
//! 4. hand the bag to the conflict planner
//! 5. execute the accepted actions
//! 6. bump counters and emit the cycle event
//!
//! State machine: `Stopped → Starting → Running → Stopping → Stopped`,
//! transitions idempotent. The master tick service provides the clock;
//! the orchestrator never spawns its own timer. On battery below 20 %
//! every other fast tick is skipped, halving the cadence.

use crate::action::Proposal;
use crate::agents::predictor::{LaunchPredictor, ProcessLaunchPrediction};
use crate::agents::{ActionHistory, Agent, AgentContext, AggressivenessDial};
use crate::executor::Executor;
use crate::hal::Hal;
use crate::overrides::CoolingRegistry;
use crate::planner::{DwellTracker, Planner};
use crate::snapshot::ContextStore;
use crate::tick::{next_tick, Tick, TickKind};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Battery percentage below which the tick cadence halves.
const THROTTLE_BATTERY_PCT: f32 = 20.0;

/// Engine lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

/// Single atomic state cell replacing scattered status flags.
pub struct StateCell(AtomicU8);

impl StateCell {
    pub fn new() -> Self {
        Self(AtomicU8::new(EngineState::Stopped as u8))
    }

    pub fn get(&self) -> EngineState {
        match self.0.load(Ordering::SeqCst) {
            x if x == EngineState::Starting as u8 => EngineState::Starting,
            x if x == EngineState::Running as u8 => EngineState::Running,
            x if x == EngineState::Stopping as u8 => EngineState::Stopping,
            _ => EngineState::Stopped,
        }
    }

    pub fn set(&self, state: EngineState) {
        self.0.store(state as u8, Ordering::SeqCst);
    }

    /// Compare-and-set; returns whether the transition happened.
    pub fn transition(&self, from: EngineState, to: EngineState) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new()
    }
}

/// Emitted after every completed optimization cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleReport {
    pub cycle_id: u64,
    pub snapshot_seq: u64,
    pub accepted: usize,
    pub rejected: usize,
    pub executed: usize,
    pub failed: usize,
    pub duration_ms: u64,
}

/// Engine event bus payloads, consumed by the UI contract and the logs.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    CycleCompleted(CycleReport),
    AgentFailed { agent: &'static str, message: String },
    Prediction(ProcessLaunchPrediction),
    EmergencyThermal { cpu_temp_c: f32, gpu_temp_c: f32 },
    Stopped,
}

/// Cumulative counters, serialized into `statistics()`.
#[derive(Default)]
pub struct OrchestratorCounters {
    pub total_cycles: AtomicU64,
    pub total_actions: AtomicU64,
    pub accepted_actions: AtomicU64,
    pub rejected_actions: AtomicU64,
    pub executed_actions: AtomicU64,
    pub failed_actions: AtomicU64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineStats {
    pub state: EngineState,
    pub total_cycles: u64,
    pub total_actions: u64,
    pub accepted_actions: u64,
    pub rejected_actions: u64,
    pub executed_actions: u64,
    pub failed_actions: u64,
    pub uptime_secs: u64,
}

pub struct Orchestrator {
    state: Arc<StateCell>,
    hal: Arc<Hal>,
    store: Arc<ContextStore>,
    agents: Mutex<Vec<Box<dyn Agent>>>,
    planner: Planner,
    executor: Executor,
    registry: Option<Arc<CoolingRegistry>>,
    histories: Arc<Mutex<HashMap<String, ActionHistory>>>,
    dwell: Arc<DwellTracker>,
    dial: Arc<AggressivenessDial>,
    predictor: Mutex<LaunchPredictor>,
    /// Out-of-band proposals (forced GPU mode) merged into the next tick.
    injected: Mutex<Vec<Proposal>>,
    pub counters: OrchestratorCounters,
    events: broadcast::Sender<EngineEvent>,
    started_at: Mutex<Option<Instant>>,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        state: Arc<StateCell>,
        hal: Arc<Hal>,
        store: Arc<ContextStore>,
        agents: Vec<Box<dyn Agent>>,
        registry: Option<Arc<CoolingRegistry>>,
        histories: Arc<Mutex<HashMap<String, ActionHistory>>>,
        dwell: Arc<DwellTracker>,
        dial: Arc<AggressivenessDial>,
        events: broadcast::Sender<EngineEvent>,
    ) -> Self {
        let executor = Executor::new(hal.clone(), histories.clone(), dwell.clone());
        Self {
            state,
            hal,
            store,
            agents: Mutex::new(agents),
            planner: Planner::new(),
            executor,
            registry,
            histories,
            dwell,
            dial,
            predictor: Mutex::new(LaunchPredictor::new()),
            injected: Mutex::new(Vec::new()),
            counters: OrchestratorCounters::default(),
            events,
            started_at: Mutex::new(None),
        }
    }

    pub fn cycle_count(&self) -> u64 {
        self.counters.total_cycles.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            state: self.state.get(),
            total_cycles: self.counters.total_cycles.load(Ordering::Relaxed),
            total_actions: self.counters.total_actions.load(Ordering::Relaxed),
            accepted_actions: self.counters.accepted_actions.load(Ordering::Relaxed),
            rejected_actions: self.counters.rejected_actions.load(Ordering::Relaxed),
            executed_actions: self.counters.executed_actions.load(Ordering::Relaxed),
            failed_actions: self.counters.failed_actions.load(Ordering::Relaxed),
            uptime_secs: self
                .started_at
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .map(|t| t.elapsed().as_secs())
                .unwrap_or(0),
        }
    }

    /// Queue an out-of-band proposal for the next tick.
    pub fn inject(&self, proposal: Proposal) {
        self.injected
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(proposal);
    }

    /// Drive the loop until cancellation. Intended to run on its own task;
    /// the clock comes from the master tick service.
    pub async fn run(
        self: Arc<Self>,
        mut ticks: broadcast::Receiver<Tick>,
        token: CancellationToken,
    ) {
        if !self.state.transition(EngineState::Starting, EngineState::Running) {
            // start() was not called or we are already running; run() is
            // idempotent about it.
            self.state.set(EngineState::Running);
        }
        *self.started_at.lock().unwrap_or_else(|e| e.into_inner()) = Some(Instant::now());
        info!("Orchestrator: running");

        let mut skip_next_fast = false;
        loop {
            let tick = tokio::select! {
                _ = token.cancelled() => {
                    debug!("Orchestrator: cancellation observed");
                    break;
                }
                tick = next_tick(&mut ticks, TickKind::Fast) => match tick {
                    Some(t) => t,
                    None => break,
                },
            };

            if skip_next_fast {
                skip_next_fast = false;
                continue;
            }

            self.cycle(tick.seq).await;

            // Throttle: on low battery, drop every other fast tick.
            let snapshot = self.store.last_snapshot();
            skip_next_fast = snapshot.on_battery_below(THROTTLE_BATTERY_PCT);
        }

        self.state.set(EngineState::Stopped);
        let _ = self.events.send(EngineEvent::Stopped);
        info!("Orchestrator: stopped after {} cycles", self.cycle_count());
    }

    async fn cycle(&self, tick_seq: u64) {
        let started = Instant::now();
        let snapshot = self.store.collect_and_publish();

        // Launch predictor feeds the GPU agent one tick later by contract.
        let latest_prediction = {
            let mut predictor = self.predictor.lock().unwrap_or_else(|e| e.into_inner());
            for prediction in predictor.observe(&snapshot) {
                let _ = self.events.send(EngineEvent::Prediction(prediction));
            }
            predictor.latest().cloned()
        };

        let mut proposals: Vec<Proposal> = Vec::new();
        {
            let mut agents = self.agents.lock().unwrap_or_else(|e| e.into_inner());
            let histories = self.histories.lock().unwrap_or_else(|e| e.into_inner());
            for agent in agents.iter_mut() {
                let name = agent.name();
                let empty = ActionHistory::new();
                let history = histories.get(name).unwrap_or(&empty);
                let ctx = AgentContext {
                    snapshot: &snapshot,
                    overrides: self.registry.as_deref(),
                    history,
                    capabilities: self.hal.caps,
                    discharge_band: self.dial.get(),
                    prediction: latest_prediction.as_ref(),
                    e_core_mask: self.hal.topology.e_core_mask(),
                    all_core_mask: self.hal.topology.all_mask(),
                };
                match std::panic::catch_unwind(AssertUnwindSafe(|| agent.propose(&ctx))) {
                    Ok(proposal) => {
                        if !proposal.actions.is_empty() {
                            debug!(
                                "Orchestrator: {} proposes {} action(s)",
                                name,
                                proposal.actions.len()
                            );
                        }
                        proposals.push(proposal);
                    }
                    Err(panic) => {
                        let message = panic_message(panic);
                        error!("Orchestrator: agent {} panicked: {}", name, message);
                        let _ = self.events.send(EngineEvent::AgentFailed {
                            agent: name,
                            message,
                        });
                        proposals.push(Proposal::empty(name));
                    }
                }
            }
        }

        // Out-of-band commands join the same arbitration as everyone else.
        {
            let mut injected = self.injected.lock().unwrap_or_else(|e| e.into_inner());
            proposals.append(&mut injected);
        }

        let total_proposed: usize = proposals.iter().map(|p| p.actions.len()).sum();
        let outcome = {
            let histories = self.histories.lock().unwrap_or_else(|e| e.into_inner());
            self.planner.plan(
                proposals,
                self.registry.as_deref(),
                &histories,
                &self.dwell,
                snapshot.on_battery(),
            )
        };
        for rejection in &outcome.rejected {
            debug!(
                "Orchestrator: rejected {} from {}: {}",
                rejection.action.target, rejection.action.origin_agent, rejection.reason
            );
        }

        let accepted = outcome.accepted.len();
        let rejected = outcome.rejected.len();
        let report = self.executor.execute(outcome.accepted).await;

        self.counters.total_cycles.fetch_add(1, Ordering::Relaxed);
        self.counters
            .total_actions
            .fetch_add(total_proposed as u64, Ordering::Relaxed);
        self.counters
            .accepted_actions
            .fetch_add(accepted as u64, Ordering::Relaxed);
        self.counters
            .rejected_actions
            .fetch_add(rejected as u64, Ordering::Relaxed);
        self.counters
            .executed_actions
            .fetch_add(report.executed.len() as u64, Ordering::Relaxed);
        self.counters
            .failed_actions
            .fetch_add(report.failed.len() as u64, Ordering::Relaxed);

        let cycle = CycleReport {
            cycle_id: tick_seq,
            snapshot_seq: snapshot.seq,
            accepted,
            rejected,
            executed: report.executed.len(),
            failed: report.failed.len(),
            duration_ms: started.elapsed().as_millis() as u64,
        };
        if accepted > 0 || rejected > 0 {
            info!(
                "Orchestrator: cycle {} accepted={} rejected={} executed={} failed={} in {} ms",
                cycle.cycle_id,
                cycle.accepted,
                cycle.rejected,
                cycle.executed,
                cycle.failed,
                cycle.duration_ms
            );
        }
        let _ = self.events.send(EngineEvent::CycleCompleted(cycle));

        if !report.failed.is_empty() {
            warn!(
                "Orchestrator: {} action(s) failed this cycle",
                report.failed.len()
            );
        }
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "opaque panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{Action, ActionValue, ControlTarget, HybridMode, Priority};
    use crate::hal::testutil::stub_hal;

    struct NoopAgent;

    impl Agent for NoopAgent {
        fn name(&self) -> &'static str {
            "noop"
        }

        fn propose(&mut self, _ctx: &AgentContext<'_>) -> Proposal {
            Proposal::empty(self.name())
        }
    }

    struct PanickyAgent;

    impl Agent for PanickyAgent {
        fn name(&self) -> &'static str {
            "panicky"
        }

        fn propose(&mut self, _ctx: &AgentContext<'_>) -> Proposal {
            panic!("agent exploded");
        }
    }

    fn orchestrator_with(agents: Vec<Box<dyn Agent>>) -> (Arc<Orchestrator>, broadcast::Receiver<EngineEvent>) {
        let stub = stub_hal();
        let store = Arc::new(ContextStore::new(stub.hal.clone()));
        let (events, events_rx) = broadcast::channel(64);
        let orchestrator = Arc::new(Orchestrator::new(
            Arc::new(StateCell::new()),
            stub.hal,
            store,
            agents,
            Some(Arc::new(CoolingRegistry::new())),
            Arc::new(Mutex::new(HashMap::new())),
            Arc::new(DwellTracker::new()),
            AggressivenessDial::new(),
            events,
        ));
        (orchestrator, events_rx)
    }

    #[tokio::test]
    async fn cycle_advances_counters_and_emits_event() {
        let (orchestrator, mut events) = orchestrator_with(vec![Box::new(NoopAgent)]);
        orchestrator.cycle(1).await;
        assert_eq!(orchestrator.cycle_count(), 1);
        let event = events.try_recv().unwrap();
        match event {
            EngineEvent::CycleCompleted(report) => {
                assert_eq!(report.cycle_id, 1);
                assert_eq!(report.executed, 0);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn agent_panic_becomes_event_not_crash() {
        let (orchestrator, mut events) = orchestrator_with(vec![Box::new(PanickyAgent)]);
        orchestrator.cycle(1).await;
        let mut saw_failure = false;
        while let Ok(event) = events.try_recv() {
            if let EngineEvent::AgentFailed { agent, .. } = event {
                assert_eq!(agent, "panicky");
                saw_failure = true;
            }
        }
        assert!(saw_failure);
        assert_eq!(orchestrator.cycle_count(), 1);
    }

    #[tokio::test]
    async fn injected_critical_proposal_executes() {
        let (orchestrator, _events) = orchestrator_with(vec![Box::new(NoopAgent)]);
        orchestrator.inject(Proposal {
            agent: "api".to_string(),
            actions: vec![Action::new(
                ControlTarget::GpuHybridMode,
                ActionValue::GpuMode(HybridMode::IGpuOnly),
                Priority::Critical,
                "api",
                "forced via public api",
            )],
            priority: Priority::Critical,
        });
        orchestrator.cycle(1).await;
        assert_eq!(
            orchestrator.counters.executed_actions.load(Ordering::Relaxed),
            1
        );
    }

    #[tokio::test]
    async fn thermal_spike_forces_fans_through_the_whole_pipeline() {
        use crate::hal::ec::{EC_REG_CPU_TEMP, EC_REG_FAN1_DUTY, EC_REG_FAN2_DUTY, EC_REG_GPU_TEMP};

        let stub = stub_hal();
        stub.ec_mem.set_register(EC_REG_CPU_TEMP, 92);
        stub.ec_mem.set_register(EC_REG_GPU_TEMP, 70);

        let store = Arc::new(ContextStore::new(stub.hal.clone()));
        let (events, _events_rx) = broadcast::channel(64);
        let orchestrator = Arc::new(Orchestrator::new(
            Arc::new(StateCell::new()),
            stub.hal.clone(),
            store,
            vec![Box::new(crate::agents::thermal::ThermalAgent::new())],
            None,
            Arc::new(Mutex::new(HashMap::new())),
            Arc::new(DwellTracker::new()),
            AggressivenessDial::new(),
            events,
        ));
        orchestrator.cycle(1).await;

        let writes = stub.ec_mem.recorded_writes();
        assert!(writes.contains(&(EC_REG_FAN1_DUTY, 0xFF)));
        assert!(writes.contains(&(EC_REG_FAN2_DUTY, 0xFF)));
        assert_eq!(
            orchestrator.counters.executed_actions.load(Ordering::Relaxed),
            1
        );
    }

    #[test]
    fn state_cell_transitions_are_compare_and_set() {
        let cell = StateCell::new();
        assert_eq!(cell.get(), EngineState::Stopped);
        assert!(cell.transition(EngineState::Stopped, EngineState::Starting));
        assert!(!cell.transition(EngineState::Stopped, EngineState::Starting));
        assert!(cell.transition(EngineState::Starting, EngineState::Running));
        assert_eq!(cell.get(), EngineState::Running);
    }
}
