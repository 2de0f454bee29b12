//! Health monitor & recovery
//!
//! Independent watchdog on a 5 s schedule. Each subsystem gets a
//! non-mutating probe; failures drive a recovery ladder with exponential
//! backoff (1 s · 2^attempts, 5 attempts, then permanently Degraded until
//! an external reset). The orchestrator is observed, never restarted.
//!
//! The emergency thermal safety path lives here too, deliberately outside
//! the agent/planner pipeline: critical temperatures with stalled fans
//! force both fan registers to maximum directly, ignoring overrides, with
//! at least 60 s between triggers.
//!
//! The monitor itself never dies: probe panics and errors are swallowed
//! after logging.

use crate::error::EngineError;
use crate::hal::ec::{EmbeddedController, EC_REG_CPU_TEMP, EC_REG_FAN1_DUTY, EC_REG_FAN2_DUTY, EC_REG_GPU_TEMP, FanId};
use crate::logging::RotatingLog;
use crate::orchestrator::EngineEvent;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Watchdog cadence.
pub const PROBE_INTERVAL: Duration = Duration::from_secs(5);
/// Recovery ladder: 1 s · 2^attempts, then give up.
pub const MAX_RECOVERY_ATTEMPTS: u32 = 5;
/// Emergency thermal thresholds.
pub const EMERGENCY_CPU_C: f32 = 95.0;
pub const EMERGENCY_GPU_C: f32 = 87.0;
pub const EMERGENCY_FAN_RPM: u16 = 500;
/// Minimum spacing between emergency triggers.
pub const EMERGENCY_COOLDOWN: Duration = Duration::from_secs(60);
/// Bounded health event ring.
pub const EVENT_RING_CAPACITY: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    #[default]
    Unknown,
    Healthy,
    Degraded,
    Failed,
    Recovering,
    NotAvailable,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub status: HealthStatus,
    pub message: String,
    pub last_update: DateTime<Utc>,
}

impl Default for ComponentHealth {
    fn default() -> Self {
        Self {
            status: HealthStatus::Unknown,
            message: String::new(),
            last_update: Utc::now(),
        }
    }
}

/// Per-component recovery bookkeeping.
#[derive(Debug, Default)]
pub struct RecoveryState {
    pub attempts: u32,
    pub last_attempt: Option<Instant>,
    pub last_success: Option<Instant>,
}

impl RecoveryState {
    /// Delay before the next attempt: 1 s · 2^attempts.
    pub fn backoff(&self) -> Duration {
        Duration::from_secs(1u64 << self.attempts.min(16))
    }

    pub fn due(&self, now: Instant) -> bool {
        match self.last_attempt {
            Some(at) => now.duration_since(at) >= self.backoff(),
            None => true,
        }
    }
}

/// One entry of the bounded event history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthEvent {
    pub timestamp: DateTime<Utc>,
    pub component: String,
    pub status: HealthStatus,
    pub message: String,
}

/// Probe outcome mapping: `HwUnavailable` means the subsystem is absent
/// (NotAvailable, no recovery), everything else is a failure.
pub type ProbeResult = Result<(), EngineError>;

/// One watched subsystem.
pub trait HealthProbe: Send + Sync {
    fn name(&self) -> &'static str;
    /// Non-mutating liveness check.
    fn probe(&self) -> ProbeResult;
    /// Attempt to bring the subsystem back. Default: re-probe.
    fn recover(&self) -> ProbeResult {
        self.probe()
    }
    /// Probes that must only be observed (the orchestrator) return false:
    /// a failure marks them Degraded without recovery attempts.
    fn recoverable(&self) -> bool {
        true
    }
}

/// Snapshot of all component healths, serialized for `health.json` and the
/// CLI.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct HealthReport {
    pub components: Vec<(String, ComponentHealth)>,
    pub emergency_triggers: u64,
}

pub struct HealthMonitor {
    probes: Vec<Box<dyn HealthProbe>>,
    components: Mutex<HashMap<String, ComponentHealth>>,
    recovery: Mutex<HashMap<String, RecoveryState>>,
    events: Mutex<VecDeque<HealthEvent>>,
    journal: Option<RotatingLog>,
    emergency: Option<EmergencyThermal>,
    emergency_count: std::sync::atomic::AtomicU64,
    bus: Option<broadcast::Sender<EngineEvent>>,
}

impl HealthMonitor {
    pub fn new(
        probes: Vec<Box<dyn HealthProbe>>,
        journal: Option<RotatingLog>,
        emergency: Option<EmergencyThermal>,
        bus: Option<broadcast::Sender<EngineEvent>>,
    ) -> Self {
        Self {
            probes,
            components: Mutex::new(HashMap::new()),
            recovery: Mutex::new(HashMap::new()),
            events: Mutex::new(VecDeque::with_capacity(EVENT_RING_CAPACITY)),
            journal,
            emergency,
            emergency_count: std::sync::atomic::AtomicU64::new(0),
            bus,
        }
    }

    /// Run until cancelled. Every pass is shielded: a panicking probe is
    /// logged and the monitor keeps going.
    pub async fn run(self: Arc<Self>, token: CancellationToken) {
        let mut interval = tokio::time::interval(PROBE_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!("Health: monitor started ({} probes)", self.probes.len());
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = interval.tick() => {
                    let monitor = self.clone();
                    // Probes may touch hardware; keep them off the runtime.
                    let _ = tokio::task::spawn_blocking(move || monitor.pass()).await;
                }
            }
        }
        info!("Health: monitor stopped");
    }

    /// One watchdog pass over every probe plus the emergency check.
    pub fn pass(&self) {
        for probe in &self.probes {
            let name = probe.name();
            let result =
                std::panic::catch_unwind(AssertUnwindSafe(|| probe.probe())).unwrap_or_else(|_| {
                    Err(EngineError::Unexpected(format!("probe {} panicked", name)))
                });
            match result {
                Ok(()) => self.mark(name, HealthStatus::Healthy, "probe ok"),
                Err(EngineError::HwUnavailable(msg)) => {
                    self.mark(name, HealthStatus::NotAvailable, &msg)
                }
                Err(e) => {
                    if probe.recoverable() {
                        self.mark(name, HealthStatus::Failed, &e.to_string());
                        self.try_recover(probe.as_ref());
                    } else {
                        // Observe-only subsystems degrade, they are never
                        // restarted from here.
                        self.mark(name, HealthStatus::Degraded, &e.to_string());
                    }
                }
            }
        }

        if let Some(emergency) = &self.emergency {
            if let Some((cpu, gpu)) = emergency.check() {
                self.emergency_count
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                self.push_event(
                    "thermal-safety",
                    HealthStatus::Degraded,
                    &format!("emergency fan override at cpu {:.0}C gpu {:.0}C", cpu, gpu),
                );
                if let Some(bus) = &self.bus {
                    let _ = bus.send(EngineEvent::EmergencyThermal {
                        cpu_temp_c: cpu,
                        gpu_temp_c: gpu,
                    });
                }
            }
        }
    }

    fn try_recover(&self, probe: &dyn HealthProbe) {
        let name = probe.name();
        let now = Instant::now();
        {
            let mut recovery = self.recovery.lock().unwrap_or_else(|e| e.into_inner());
            let state = recovery.entry(name.to_string()).or_default();
            if state.attempts >= MAX_RECOVERY_ATTEMPTS {
                self.mark(
                    name,
                    HealthStatus::Degraded,
                    "recovery attempts exhausted, waiting for external reset",
                );
                return;
            }
            if !state.due(now) {
                return;
            }
            state.last_attempt = Some(now);
        }

        self.mark(name, HealthStatus::Recovering, "attempting recovery");
        let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| probe.recover()))
            .unwrap_or_else(|_| Err(EngineError::Unexpected("recovery panicked".into())));

        let mut recovery = self.recovery.lock().unwrap_or_else(|e| e.into_inner());
        let state = recovery.entry(name.to_string()).or_default();
        match outcome {
            Ok(()) => {
                state.attempts = 0;
                state.last_success = Some(Instant::now());
                drop(recovery);
                self.mark(name, HealthStatus::Healthy, "recovered");
            }
            Err(e) => {
                state.attempts += 1;
                let attempts = state.attempts;
                let backoff = state.backoff();
                drop(recovery);
                if attempts >= MAX_RECOVERY_ATTEMPTS {
                    warn!("Health: {} recovery gave up after {} attempts", name, attempts);
                    self.mark(
                        name,
                        HealthStatus::Degraded,
                        "recovery attempts exhausted, waiting for external reset",
                    );
                } else {
                    debug!(
                        "Health: {} recovery attempt {} failed ({}), next in {:?}",
                        name, attempts, e, backoff
                    );
                    self.mark(name, HealthStatus::Failed, &e.to_string());
                }
            }
        }
    }

    /// Update a component's health; transitions are journaled and ringed.
    fn mark(&self, component: &str, status: HealthStatus, message: &str) {
        let mut components = self.components.lock().unwrap_or_else(|e| e.into_inner());
        let entry = components.entry(component.to_string()).or_default();
        let changed = entry.status != status;
        entry.status = status;
        entry.message = message.to_string();
        entry.last_update = Utc::now();
        drop(components);

        if changed {
            info!("Health: {} -> {:?} ({})", component, status, message);
            self.push_event(component, status, message);
        }
    }

    fn push_event(&self, component: &str, status: HealthStatus, message: &str) {
        let event = HealthEvent {
            timestamp: Utc::now(),
            component: component.to_string(),
            status,
            message: message.to_string(),
        };
        if let Some(journal) = &self.journal {
            if let Ok(line) = serde_json::to_string(&event) {
                if let Err(e) = journal.append_line(&line) {
                    error!("Health: journal write failed: {}", e);
                }
            }
        }
        let mut events = self.events.lock().unwrap_or_else(|e| e.into_inner());
        if events.len() == EVENT_RING_CAPACITY {
            events.pop_front();
        }
        events.push_back(event);
    }

    pub fn component_status(&self, name: &str) -> HealthStatus {
        self.components
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .map(|c| c.status)
            .unwrap_or(HealthStatus::Unknown)
    }

    pub fn report(&self) -> HealthReport {
        let components = self.components.lock().unwrap_or_else(|e| e.into_inner());
        let mut list: Vec<(String, ComponentHealth)> = components
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        list.sort_by(|a, b| a.0.cmp(&b.0));
        HealthReport {
            components: list,
            emergency_triggers: self
                .emergency_count
                .load(std::sync::atomic::Ordering::Relaxed),
        }
    }

    pub fn recent_events(&self) -> Vec<HealthEvent> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }
}

/// Emergency thermal safety path. Reads temperatures and fan speeds from
/// the EC directly and, when the machine is critically hot with stalled
/// fans, forces both fan registers to maximum. Works entirely outside the
/// agent pipeline and ignores the override registry.
pub struct EmergencyThermal {
    ec: Arc<EmbeddedController>,
    last_trigger: Mutex<Option<Instant>>,
}

impl EmergencyThermal {
    pub fn new(ec: Arc<EmbeddedController>) -> Self {
        Self {
            ec,
            last_trigger: Mutex::new(None),
        }
    }

    /// Returns the temperatures when a trigger fired.
    pub fn check(&self) -> Option<(f32, f32)> {
        let cpu = self.ec.temperature(EC_REG_CPU_TEMP).ok()?;
        let gpu = self.ec.temperature(EC_REG_GPU_TEMP).unwrap_or(0.0);
        if cpu < EMERGENCY_CPU_C && gpu < EMERGENCY_GPU_C {
            return None;
        }
        let fan1 = self.ec.fan_rpm(FanId::Cpu).unwrap_or(0);
        let fan2 = self.ec.fan_rpm(FanId::Gpu).unwrap_or(0);
        if fan1 >= EMERGENCY_FAN_RPM || fan2 >= EMERGENCY_FAN_RPM {
            return None;
        }

        {
            let mut last = self.last_trigger.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(at) = *last {
                if at.elapsed() < EMERGENCY_COOLDOWN {
                    return None;
                }
            }
            *last = Some(Instant::now());
        }

        error!(
            "Health: EMERGENCY thermal override, cpu {:.0}C gpu {:.0}C fans {}/{} rpm",
            cpu, gpu, fan1, fan2
        );
        // Direct register writes, no planner, no overrides.
        if let Err(e) = self.ec.write_register(EC_REG_FAN1_DUTY, 0xFF) {
            error!("Health: emergency fan1 write failed: {}", e);
        }
        if let Err(e) = self.ec.write_register(EC_REG_FAN2_DUTY, 0xFF) {
            error!("Health: emergency fan2 write failed: {}", e);
        }
        Some((cpu, gpu))
    }
}

/// Probe: is the orchestrator's cycle counter advancing? Observe-only.
pub struct OrchestratorProbe {
    orchestrator: Arc<crate::orchestrator::Orchestrator>,
    last: Mutex<Option<(u64, Instant)>>,
    /// The loop must advance within this window to count as alive.
    stall_after: Duration,
}

impl OrchestratorProbe {
    pub fn new(orchestrator: Arc<crate::orchestrator::Orchestrator>) -> Self {
        Self {
            orchestrator,
            last: Mutex::new(None),
            stall_after: Duration::from_secs(10),
        }
    }
}

impl HealthProbe for OrchestratorProbe {
    fn name(&self) -> &'static str {
        "orchestrator"
    }

    fn probe(&self) -> ProbeResult {
        use crate::orchestrator::EngineState;
        if self.orchestrator.stats().state != EngineState::Running {
            // A stopped loop is not a fault.
            return Ok(());
        }
        let count = self.orchestrator.cycle_count();
        let now = Instant::now();
        let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());
        match *last {
            Some((seen, at)) if count == seen => {
                if now.duration_since(at) > self.stall_after {
                    return Err(EngineError::Unexpected(format!(
                        "cycle count stuck at {} for {:?}",
                        count,
                        now.duration_since(at)
                    )));
                }
                Ok(())
            }
            _ => {
                *last = Some((count, now));
                Ok(())
            }
        }
    }

    fn recoverable(&self) -> bool {
        false
    }
}

/// Probe: does a 1-byte EC read return a plausible value?
pub struct EcProbe {
    ec: Arc<EmbeddedController>,
}

impl EcProbe {
    pub fn new(ec: Arc<EmbeddedController>) -> Self {
        Self { ec }
    }
}

impl HealthProbe for EcProbe {
    fn name(&self) -> &'static str {
        "hal-ec"
    }

    fn probe(&self) -> ProbeResult {
        self.ec.temperature(EC_REG_CPU_TEMP).map(|_| ())
    }
}

/// Probe: does a no-op GPU mode read complete?
pub struct GpuProbe {
    gpu: Arc<crate::hal::gpu::GpuControl>,
}

impl GpuProbe {
    pub fn new(gpu: Arc<crate::hal::gpu::GpuControl>) -> Self {
        Self { gpu }
    }
}

impl HealthProbe for GpuProbe {
    fn name(&self) -> &'static str {
        "hal-gpu"
    }

    fn probe(&self) -> ProbeResult {
        self.gpu.probe_alive()
    }
}

/// Probe: battery readable through either path?
pub struct BatteryProbe {
    battery: Arc<crate::hal::battery::BatteryReader>,
}

impl BatteryProbe {
    pub fn new(battery: Arc<crate::hal::battery::BatteryReader>) -> Self {
        Self { battery }
    }
}

impl HealthProbe for BatteryProbe {
    fn name(&self) -> &'static str {
        "battery-service"
    }

    fn probe(&self) -> ProbeResult {
        self.battery.battery_info().map(|_| ())
    }
}

/// Probe: power scheme tool answering?
pub struct PowerSchemeProbe {
    scheme: Arc<crate::hal::power::PowerSchemes>,
}

impl PowerSchemeProbe {
    pub fn new(scheme: Arc<crate::hal::power::PowerSchemes>) -> Self {
        Self { scheme }
    }
}

impl HealthProbe for PowerSchemeProbe {
    fn name(&self) -> &'static str {
        "power-state-listener"
    }

    fn probe(&self) -> ProbeResult {
        self.scheme.get_active_scheme().map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::ec::MemEcTransport;
    use crate::hal::HalCounters;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FlakyProbe {
        fail_times: AtomicU32,
        calls: AtomicU32,
    }

    impl FlakyProbe {
        fn failing(times: u32) -> Self {
            Self {
                fail_times: AtomicU32::new(times),
                calls: AtomicU32::new(0),
            }
        }
    }

    impl HealthProbe for FlakyProbe {
        fn name(&self) -> &'static str {
            "flaky"
        }

        fn probe(&self) -> ProbeResult {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_times.load(Ordering::SeqCst) > 0 {
                self.fail_times.fetch_sub(1, Ordering::SeqCst);
                Err(EngineError::HwTransient("flaky".into()))
            } else {
                Ok(())
            }
        }
    }

    struct AbsentProbe;

    impl HealthProbe for AbsentProbe {
        fn name(&self) -> &'static str {
            "absent"
        }

        fn probe(&self) -> ProbeResult {
            Err(EngineError::HwUnavailable("not on this machine".into()))
        }
    }

    fn monitor_with(probes: Vec<Box<dyn HealthProbe>>) -> HealthMonitor {
        HealthMonitor::new(probes, None, None, None)
    }

    #[test]
    fn healthy_probe_marks_healthy() {
        let monitor = monitor_with(vec![Box::new(FlakyProbe::failing(0))]);
        monitor.pass();
        assert_eq!(monitor.component_status("flaky"), HealthStatus::Healthy);
    }

    #[test]
    fn unavailable_probe_marks_not_available() {
        let monitor = monitor_with(vec![Box::new(AbsentProbe)]);
        monitor.pass();
        assert_eq!(monitor.component_status("absent"), HealthStatus::NotAvailable);
    }

    #[test]
    fn backoff_doubles_per_attempt() {
        let state = RecoveryState {
            attempts: 0,
            ..Default::default()
        };
        assert_eq!(state.backoff(), Duration::from_secs(1));
        let state = RecoveryState {
            attempts: 3,
            ..Default::default()
        };
        assert_eq!(state.backoff(), Duration::from_secs(8));
        let state = RecoveryState {
            attempts: 4,
            ..Default::default()
        };
        assert_eq!(state.backoff(), Duration::from_secs(16));
    }

    #[test]
    fn failed_probe_recovers_and_heals() {
        // Fails the probe once; recovery (default = re-probe) succeeds.
        let monitor = monitor_with(vec![Box::new(FlakyProbe::failing(1))]);
        monitor.pass();
        assert_eq!(monitor.component_status("flaky"), HealthStatus::Healthy);
        let events = monitor.recent_events();
        // Failed -> Recovering -> Healthy transitions were ringed.
        let statuses: Vec<HealthStatus> = events.iter().map(|e| e.status).collect();
        assert!(statuses.contains(&HealthStatus::Failed));
        assert!(statuses.contains(&HealthStatus::Recovering));
        assert!(statuses.contains(&HealthStatus::Healthy));
    }

    #[test]
    fn event_ring_is_bounded() {
        let monitor = monitor_with(vec![]);
        for i in 0..(EVENT_RING_CAPACITY + 50) {
            monitor.push_event("x", HealthStatus::Healthy, &format!("event {}", i));
        }
        assert_eq!(monitor.recent_events().len(), EVENT_RING_CAPACITY);
    }

    fn emergency_over(values: &[(u8, u8)]) -> (EmergencyThermal, Arc<MemEcTransport>) {
        let mem = Arc::new(MemEcTransport::preset(values));
        let ec = Arc::new(EmbeddedController::with_transport(
            Box::new(mem.clone()),
            Arc::new(HalCounters::new()),
        ));
        (EmergencyThermal::new(ec), mem)
    }

    #[test]
    fn emergency_fires_once_per_cooldown_window() {
        let (emergency, mem) = emergency_over(&[
            (EC_REG_CPU_TEMP, 100),
            (EC_REG_GPU_TEMP, 90),
            // All fan rpm registers default to 0.
        ]);
        assert!(emergency.check().is_some());
        assert_eq!(
            mem.recorded_writes(),
            vec![(EC_REG_FAN1_DUTY, 0xFF), (EC_REG_FAN2_DUTY, 0xFF)]
        );
        // Second check inside the 60 s window: no second write pair.
        assert!(emergency.check().is_none());
        assert_eq!(mem.recorded_writes().len(), 2);
    }

    #[test]
    fn emergency_requires_both_stalled_fans() {
        let (emergency, mem) = emergency_over(&[
            (EC_REG_CPU_TEMP, 100),
            (crate::hal::ec::EC_REG_FAN1_RPM_HI, 0x0B),
            (crate::hal::ec::EC_REG_FAN1_RPM_LO, 0xB8), // 3000 rpm
        ]);
        assert!(emergency.check().is_none());
        assert!(mem.recorded_writes().is_empty());
    }

    #[test]
    fn emergency_ignores_cool_machines() {
        let (emergency, mem) = emergency_over(&[(EC_REG_CPU_TEMP, 70), (EC_REG_GPU_TEMP, 60)]);
        assert!(emergency.check().is_none());
        assert!(mem.recorded_writes().is_empty());
    }
}
