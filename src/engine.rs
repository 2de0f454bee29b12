//! Engine assembly and public API
//!
//! Wires the hardware layer, context store, override registry, agents,
//! planner, executor, orchestrator, health monitor and persistence into
//! one `Engine` with the public surface:
//! - queries: `snapshot()`, `active_overrides()`, `statistics()`,
//!   `health_report()`
//! - commands: `start()`, `stop()`, `record_user_change()`,
//!   `clear_cooling()`, `force_gpu_mode()`
//!
//! Out-of-process consumers (the CLI, the UI) talk through the data
//! directory: the running engine republishes `snapshot.json` and
//! `health.json` on its tick grades and polls `control.json` (mtime
//! check, then consume-and-truncate) for commands appended by the CLI.

use crate::action::{Action, ActionValue, ControlTarget, HybridMode, Priority, Proposal};
use crate::agents::refresh::{RefreshAgent, StaticScreenDetector, SAMPLE_INTERVAL};
use crate::agents::{
    battery::BatteryAgent, gpu::GpuAgent, kbdlight::KbdLightAgent, parking::ParkingAgent,
    power::PowerAgent, thermal::ThermalAgent, ActionHistory, Agent, AggressivenessDial,
};
use crate::config::{Config, FeatureFlags};
use crate::error::EngineError;
use crate::hal::{Capabilities, Hal};
use crate::health::{
    BatteryProbe, EcProbe, EmergencyThermal, GpuProbe, HealthMonitor, HealthReport,
    OrchestratorProbe, PowerSchemeProbe,
};
use crate::logging::RotatingLog;
use crate::orchestrator::{EngineEvent, EngineState, EngineStats, Orchestrator, StateCell};
use crate::overrides::{CoolingRegistry, OverrideRecord, Scenario};
use crate::persist::Persistence;
use crate::planner::DwellTracker;
use crate::snapshot::{ContextStore, Snapshot};
use crate::tick::{MasterTickService, TickKind};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Cumulative grace for task shutdown after `stop()`.
const STOP_GRACE: Duration = Duration::from_secs(5);
/// Health journal rotation: 10 MiB cap, 5 generations.
const HEALTH_LOG_CAP: u64 = 10 * 1024 * 1024;
const HEALTH_LOG_GENERATIONS: usize = 5;

/// Commands accepted through `control.json` (one JSON object per line).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "kebab-case")]
pub enum ControlCommand {
    Stop,
    ForceGpuMode {
        mode: HybridMode,
        reason: String,
    },
    OverrideRecord {
        control: ControlTarget,
        value: serde_json::Value,
        #[serde(skip_serializing_if = "Option::is_none")]
        scenario: Option<Scenario>,
    },
    OverrideClear {
        control: ControlTarget,
    },
}

/// What the engine publishes into `health.json` for external consumers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishedHealth {
    pub state: EngineState,
    pub capabilities: Capabilities,
    pub report: HealthReport,
    pub stats: EngineStats,
}

pub struct Engine {
    state: Arc<StateCell>,
    hal: Arc<Hal>,
    store: Arc<ContextStore>,
    registry: Arc<CoolingRegistry>,
    orchestrator: Arc<Orchestrator>,
    health: Arc<HealthMonitor>,
    persist: Arc<Persistence>,
    events: broadcast::Sender<EngineEvent>,
    root_token: CancellationToken,
    detector: Mutex<Option<StaticScreenDetector>>,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
    tick_service: Mutex<Option<MasterTickService>>,
    #[allow(dead_code)]
    flags: FeatureFlags,
}

impl Engine {
    /// Probe the machine and assemble a stopped engine.
    pub fn new(flags: FeatureFlags) -> Self {
        let hal = Arc::new(Hal::probe(flags.wmi_cache));
        Self::with_hal(hal, flags)
    }

    pub fn with_hal(hal: Arc<Hal>, flags: FeatureFlags) -> Self {
        let state = Arc::new(StateCell::new());
        let store = Arc::new(ContextStore::new(hal.clone()));
        let registry = Arc::new(CoolingRegistry::new());
        let histories: Arc<Mutex<HashMap<String, ActionHistory>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let dwell = Arc::new(DwellTracker::new());
        let dial = AggressivenessDial::new();
        let (events, _) = broadcast::channel(256);

        // Panel rates are learned once; the refresh agent stays silent on
        // machines without rate control.
        let native_hz = hal.display.get_refresh_rate().ok();
        let lowest_hz = hal.display.lowest_refresh_rate().ok();
        let detector = StaticScreenDetector::new();
        let refresh_signal = detector.signal();

        // Fixed registration order: the battery agent runs first so its
        // dial is fresh for everyone behind it.
        let agents: Vec<Box<dyn Agent>> = vec![
            Box::new(BatteryAgent::new(dial.clone())),
            Box::new(ThermalAgent::new()),
            Box::new(PowerAgent::new()),
            Box::new(GpuAgent::new()),
            Box::new(RefreshAgent::new(refresh_signal, native_hz, lowest_hz)),
            Box::new(ParkingAgent::new()),
            Box::new(KbdLightAgent::new()),
        ];

        let orchestrator = Arc::new(Orchestrator::new(
            state.clone(),
            hal.clone(),
            store.clone(),
            agents,
            Some(registry.clone()),
            histories,
            dwell,
            dial,
            events.clone(),
        ));

        let health = Arc::new(HealthMonitor::new(
            vec![
                Box::new(OrchestratorProbe::new(orchestrator.clone())),
                Box::new(EcProbe::new(hal.ec.clone())),
                Box::new(GpuProbe::new(hal.gpu.clone())),
                Box::new(BatteryProbe::new(hal.battery.clone())),
                Box::new(PowerSchemeProbe::new(hal.scheme.clone())),
            ],
            Some(RotatingLog::new(
                Config::health_log_path(),
                HEALTH_LOG_CAP,
                HEALTH_LOG_GENERATIONS,
            )),
            Some(EmergencyThermal::new(hal.ec.clone())),
            Some(events.clone()),
        ));

        Self {
            state,
            hal,
            store,
            registry,
            orchestrator,
            health,
            persist: Arc::new(Persistence::at_default_paths()),
            events,
            root_token: CancellationToken::new(),
            detector: Mutex::new(Some(detector)),
            tasks: Mutex::new(Vec::new()),
            tick_service: Mutex::new(None),
            flags,
        }
    }

    // ---- public queries -------------------------------------------------

    pub fn state(&self) -> EngineState {
        self.state.get()
    }

    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.store.last_snapshot()
    }

    pub fn snapshot_stream(&self) -> tokio::sync::watch::Receiver<Arc<Snapshot>> {
        self.store.snapshot_stream()
    }

    pub fn active_overrides(&self) -> Vec<OverrideRecord> {
        self.registry.active_overrides()
    }

    pub fn statistics(&self) -> EngineStats {
        self.orchestrator.stats()
    }

    pub fn health_report(&self) -> HealthReport {
        self.health.report()
    }

    pub fn capabilities(&self) -> Capabilities {
        self.hal.caps
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    // ---- public commands ------------------------------------------------

    /// Start every task. Idempotent: calling while running is a no-op.
    pub fn start(&self) {
        if !self.state.transition(EngineState::Stopped, EngineState::Starting) {
            debug!("Engine: start() while {:?}, ignoring", self.state.get());
            return;
        }
        info!("Engine: starting (version {})", Config::version());
        let token = self.root_token.clone();

        let tick_service = MasterTickService::start(token.child_token());
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());

        // Orchestrator loop on the fast tick.
        tasks.push(tokio::spawn(
            self.orchestrator
                .clone()
                .run(tick_service.subscribe(), token.child_token()),
        ));

        // Health watchdog on its own independent timer.
        tasks.push(tokio::spawn(
            self.health.clone().run(token.child_token()),
        ));

        // Frame capture worker: blocking captures stay off the tick path.
        if self.hal.display.has_frame_capture() {
            let hal = self.hal.clone();
            let capture_token = token.child_token();
            let detector = self
                .detector
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .take();
            tasks.push(tokio::spawn(async move {
                let mut detector = detector;
                let mut interval = tokio::time::interval(SAMPLE_INTERVAL);
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        _ = capture_token.cancelled() => break,
                        _ = interval.tick() => {
                            let hal = hal.clone();
                            let frame = tokio::task::spawn_blocking(move || {
                                hal.display.capture_frame()
                            })
                            .await;
                            if let (Some(d), Ok(Ok(frame))) = (detector.as_mut(), frame) {
                                d.ingest(frame);
                            }
                        }
                    }
                }
            }));
        }

        // Publisher / control-file / cache-sweep worker on the tick grades.
        tasks.push(tokio::spawn(publisher_loop(
            PublisherDeps {
                state: self.state.clone(),
                hal: self.hal.clone(),
                store: self.store.clone(),
                registry: self.registry.clone(),
                orchestrator: self.orchestrator.clone(),
                health: self.health.clone(),
                persist: self.persist.clone(),
            },
            tick_service.subscribe(),
            token.child_token(),
        )));

        *self
            .tick_service
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(tick_service);
        // run() flips Starting -> Running on its first pass.
    }

    /// Cancel the root token and wait out the grace period. Idempotent.
    pub async fn stop(&self) {
        match self.state.get() {
            EngineState::Stopped | EngineState::Stopping => return,
            _ => {}
        }
        self.state.set(EngineState::Stopping);
        info!("Engine: stopping");
        self.root_token.cancel();

        let tasks: Vec<_> = std::mem::take(
            &mut *self.tasks.lock().unwrap_or_else(|e| e.into_inner()),
        );
        let drain = async {
            for task in tasks {
                let _ = task.await;
            }
        };
        if tokio::time::timeout(STOP_GRACE, drain).await.is_err() {
            warn!("Engine: tasks did not drain within {:?}", STOP_GRACE);
        }
        if let Some(service) = self
            .tick_service
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            service.shutdown().await;
        }
        self.state.set(EngineState::Stopped);
        info!("Engine: stopped");
    }

    /// Record a user-initiated change: the control enters its cooling
    /// period and both journals learn about it.
    pub fn record_user_change(
        &self,
        control: ControlTarget,
        value: serde_json::Value,
        scenario_hint: Option<Scenario>,
    ) -> OverrideRecord {
        let snapshot = self.store.last_snapshot();
        let scenario =
            scenario_hint.unwrap_or_else(|| Scenario::from_workload(snapshot.workload_class));
        let old_value = self
            .registry
            .active_overrides()
            .into_iter()
            .find(|r| r.control == control)
            .map(|r| r.recorded_value);
        let record = self
            .registry
            .record_override(control, scenario, value.clone());
        self.persist
            .journal_override_record(control, scenario, value.clone());
        self.persist
            .journal_preference(control, old_value, value, &snapshot);
        record
    }

    /// End a cooling period immediately.
    pub fn clear_cooling(&self, control: ControlTarget) -> bool {
        let cleared = self.registry.clear(control).is_some();
        if cleared {
            self.persist.journal_override_clear(control);
        }
        cleared
    }

    /// Force a GPU mode at Critical priority: bypasses dwell and override
    /// filtering, still flows through planner ordering and the executor.
    pub fn force_gpu_mode(&self, mode: HybridMode, reason: &str) -> Result<(), EngineError> {
        if !self.hal.caps.has_gpu_control {
            return Err(EngineError::HwUnavailable(
                "no GPU control on this machine".into(),
            ));
        }
        info!("Engine: forcing GPU mode {} ({})", mode, reason);
        self.orchestrator.inject(Proposal {
            agent: "api".to_string(),
            actions: vec![Action::new(
                ControlTarget::GpuHybridMode,
                ActionValue::GpuMode(mode),
                Priority::Critical,
                "api",
                reason.to_string(),
            )],
            priority: Priority::Critical,
        });
        Ok(())
    }

    /// Token observed by the foreground runner; cancelled by `stop()`,
    /// Ctrl-C or a `stop` control command.
    pub fn cancelled(&self) -> CancellationToken {
        self.root_token.clone()
    }
}

struct PublisherDeps {
    state: Arc<StateCell>,
    hal: Arc<Hal>,
    store: Arc<ContextStore>,
    registry: Arc<CoolingRegistry>,
    orchestrator: Arc<Orchestrator>,
    health: Arc<HealthMonitor>,
    persist: Arc<Persistence>,
}

/// Publishes `snapshot.json` (medium tick) and `health.json` (slow tick),
/// polls `control.json` (medium tick, mtime), sweeps the WMI cache (very
/// slow tick).
async fn publisher_loop(
    deps: PublisherDeps,
    mut ticks: broadcast::Receiver<crate::tick::Tick>,
    token: CancellationToken,
) {
    let control_path = Config::control_file_path();
    let mut last_control_mtime: Option<SystemTime> = None;
    // The very-slow tick fires every 10 s; the cache sweep wants 60 s.
    let mut very_slow_count: u64 = 0;

    loop {
        let tick = tokio::select! {
            _ = token.cancelled() => break,
            tick = ticks.recv() => match tick {
                Ok(t) => t,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            },
        };

        match tick.kind {
            TickKind::Medium => {
                publish_snapshot(&deps);
                match poll_control_file(&control_path, &mut last_control_mtime) {
                    Ok(commands) => {
                        for command in commands {
                            apply_published_command(&deps, command, &token);
                        }
                    }
                    Err(e) => debug!("Engine: control file poll failed: {}", e),
                }
            }
            TickKind::Slow => publish_health(&deps),
            TickKind::VerySlow => {
                very_slow_count += 1;
                if very_slow_count % 6 == 0 {
                    deps.hal.wmi.sweep();
                }
            }
            TickKind::Fast => {}
        }
    }
}

fn apply_published_command(deps: &PublisherDeps, command: ControlCommand, token: &CancellationToken) {
    match command {
        ControlCommand::Stop => {
            info!("Engine: stop command received via control file");
            token.cancel();
        }
        ControlCommand::ForceGpuMode { mode, reason } => {
            info!("Engine: forced GPU mode {} via control file ({})", mode, reason);
            deps.orchestrator.inject(Proposal {
                agent: "api".to_string(),
                actions: vec![Action::new(
                    ControlTarget::GpuHybridMode,
                    ActionValue::GpuMode(mode),
                    Priority::Critical,
                    "api",
                    reason,
                )],
                priority: Priority::Critical,
            });
        }
        ControlCommand::OverrideRecord {
            control,
            value,
            scenario,
        } => {
            let snapshot = deps.store.last_snapshot();
            let scenario =
                scenario.unwrap_or_else(|| Scenario::from_workload(snapshot.workload_class));
            deps.registry
                .record_override(control, scenario, value.clone());
            deps.persist
                .journal_override_record(control, scenario, value.clone());
            deps.persist
                .journal_preference(control, None, value, &snapshot);
        }
        ControlCommand::OverrideClear { control } => {
            if deps.registry.clear(control).is_some() {
                deps.persist.journal_override_clear(control);
            }
        }
    }
}

fn publish_snapshot(deps: &PublisherDeps) {
    let snapshot = deps.store.last_snapshot();
    if let Ok(json) = serde_json::to_string_pretty(&*snapshot) {
        write_atomically(&Config::snapshot_file_path(), &json);
    }
}

fn publish_health(deps: &PublisherDeps) {
    let published = PublishedHealth {
        state: deps.state.get(),
        capabilities: deps.hal.caps,
        report: deps.health.report(),
        stats: deps.orchestrator.stats(),
    };
    if let Ok(json) = serde_json::to_string_pretty(&published) {
        write_atomically(&Config::health_file_path(), &json);
    }
}

/// Write-then-rename so readers never see a torn file.
fn write_atomically(path: &Path, content: &str) {
    let tmp = path.with_extension("tmp");
    let result = std::fs::write(&tmp, content).and_then(|_| std::fs::rename(&tmp, path));
    if let Err(e) = result {
        error!("Engine: failed to publish {:?}: {}", path, e);
    }
}

/// Mtime-gated control file read. Commands are consumed exactly once: the
/// file is removed after a successful parse pass.
fn poll_control_file(
    path: &Path,
    last_mtime: &mut Option<SystemTime>,
) -> std::io::Result<Vec<ControlCommand>> {
    let metadata = match std::fs::metadata(path) {
        Ok(m) => m,
        Err(_) => return Ok(Vec::new()),
    };
    let mtime = metadata.modified()?;
    if Some(mtime) == *last_mtime {
        return Ok(Vec::new());
    }
    *last_mtime = Some(mtime);

    let content = std::fs::read_to_string(path)?;
    let mut commands = Vec::new();
    for line in content.lines().filter(|l| !l.trim().is_empty()) {
        match serde_json::from_str::<ControlCommand>(line) {
            Ok(command) => commands.push(command),
            Err(e) => warn!("Engine: ignoring malformed control line {:?}: {}", line, e),
        }
    }
    std::fs::remove_file(path)?;
    Ok(commands)
}

// ---- pid file helpers (single-instance guard) ---------------------------

pub fn write_pid_file() -> std::io::Result<()> {
    Config::ensure_data_dir()?;
    std::fs::write(Config::pid_file_path(), std::process::id().to_string())
}

pub fn remove_pid_file() {
    let _ = std::fs::remove_file(Config::pid_file_path());
}

/// Pid of a live engine instance, if any. Stale pid files are cleaned up.
pub fn running_engine_pid() -> Option<u32> {
    let raw = std::fs::read_to_string(Config::pid_file_path()).ok()?;
    let pid: u32 = raw.trim().parse().ok()?;
    if pid_alive(pid) {
        Some(pid)
    } else {
        remove_pid_file();
        None
    }
}

#[cfg(unix)]
fn pid_alive(pid: u32) -> bool {
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

#[cfg(not(unix))]
fn pid_alive(_pid: u32) -> bool {
    false
}

/// Append one command to the control file for a running engine to pick up.
pub fn append_control_command(command: &ControlCommand) -> std::io::Result<()> {
    use std::io::Write;
    Config::ensure_data_dir()?;
    let line = serde_json::to_string(command)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(Config::control_file_path())?;
    file.write_all(line.as_bytes())?;
    file.write_all(b"\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::testutil::stub_hal;
    use serde_json::json;

    fn stub_engine() -> Engine {
        Engine::with_hal(stub_hal().hal, FeatureFlags::default())
    }

    #[test]
    fn record_user_change_uses_scenario_hint_or_workload() {
        let engine = stub_engine();
        let record = engine.record_user_change(
            ControlTarget::RefreshRateHz,
            json!(60),
            Some(Scenario::VideoWatching),
        );
        assert_eq!(record.scenario, Scenario::VideoWatching);
        assert_eq!(engine.active_overrides().len(), 1);

        // Without a hint, the current workload decides (Unknown -> GeneralUse).
        let record = engine.record_user_change(ControlTarget::FanProfile, json!("quiet"), None);
        assert_eq!(record.scenario, Scenario::GeneralUse);
    }

    #[test]
    fn clear_cooling_reports_whether_anything_was_cleared() {
        let engine = stub_engine();
        engine.record_user_change(ControlTarget::RefreshRateHz, json!(60), None);
        assert!(engine.clear_cooling(ControlTarget::RefreshRateHz));
        assert!(!engine.clear_cooling(ControlTarget::RefreshRateHz));
    }

    #[test]
    fn force_gpu_mode_requires_gpu_control() {
        let engine = stub_engine();
        assert!(engine.force_gpu_mode(HybridMode::IGpuOnly, "test").is_ok());
    }

    #[tokio::test]
    async fn start_stop_round_trip_is_idempotent() {
        let engine = stub_engine();
        assert_eq!(engine.state(), EngineState::Stopped);
        engine.start();
        // Second start is a no-op.
        engine.start();
        // Give the loop a moment to flip to Running.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(engine.state(), EngineState::Running);
        engine.stop().await;
        assert_eq!(engine.state(), EngineState::Stopped);
        engine.stop().await;
        assert_eq!(engine.state(), EngineState::Stopped);
    }

    #[test]
    fn control_commands_round_trip_as_json_lines() {
        let commands = vec![
            ControlCommand::Stop,
            ControlCommand::ForceGpuMode {
                mode: HybridMode::IGpuOnly,
                reason: "docked test".into(),
            },
            ControlCommand::OverrideRecord {
                control: ControlTarget::RefreshRateHz,
                value: json!(60),
                scenario: Some(Scenario::VideoWatching),
            },
            ControlCommand::OverrideClear {
                control: ControlTarget::RefreshRateHz,
            },
        ];
        for command in commands {
            let line = serde_json::to_string(&command).unwrap();
            let parsed: ControlCommand = serde_json::from_str(&line).unwrap();
            assert_eq!(
                serde_json::to_string(&parsed).unwrap(),
                line,
                "round trip changed {:?}",
                command
            );
        }
    }

    #[test]
    fn poll_control_file_consumes_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("control.json");
        std::fs::write(&path, "{\"cmd\":\"stop\"}\nnot json\n").unwrap();

        let mut mtime = None;
        let commands = poll_control_file(&path, &mut mtime).unwrap();
        assert_eq!(commands.len(), 1);
        assert!(!path.exists());

        // Nothing left to consume.
        let commands = poll_control_file(&path, &mut mtime).unwrap();
        assert!(commands.is_empty());
    }
}
