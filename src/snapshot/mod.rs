//! Sensor & context store
//!
//! On each orchestrator tick the store issues the minimal set of hardware
//! reads, assembles an immutable `Snapshot`, classifies the workload and
//! publishes atomically. Single writer (the tick task), many readers:
//! `last_snapshot()` is a lock-free read of the published reference,
//! `snapshot_stream()` yields snapshots for subscribers while the engine
//! runs.
//!
//! Missing sensors are normal: numeric fields are `Option` and agents
//! handle absence.

use crate::action::HybridMode;
use crate::hal::battery::BatteryStatus;
use crate::hal::display::DisplayTopology;
use crate::hal::ec::{FanId, EC_REG_CPU_TEMP, EC_REG_GPU_TEMP};
use crate::hal::msr::{CstateResidency, CstateSampler, ThermStatus};
use crate::hal::Hal;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use sysinfo::{ProcessesToUpdate, System};
use tokio::sync::watch;
use tracing::debug;

/// Workload classes the engine optimizes for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WorkloadClass {
    Gaming,
    MediaPlayback,
    HeavyProductivity,
    LightProductivity,
    VideoConferencing,
    AiWorkload,
    Compilation,
    Idle,
    #[default]
    Unknown,
}

/// One running process as seen by the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessInfo {
    pub pid: u32,
    pub name: String,
    pub cpu_pct: f32,
    /// Accumulated CPU time in milliseconds.
    pub cpu_time_ms: u64,
    /// Scheduler nice value; negative means elevated priority. None when
    /// the process vanished before it could be read.
    pub nice: Option<i32>,
}

/// Immutable per-tick bundle of sensor and context readings. Never mutated
/// after publication; consumers hold the `Arc` until superseded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Snapshot {
    /// Monotonic sequence number, one per tick.
    pub seq: u64,
    /// Milliseconds since the Unix epoch, strictly increasing across
    /// published snapshots.
    pub timestamp_ms: i64,
    pub cpu_temp_c: Option<f32>,
    pub gpu_temp_c: Option<f32>,
    pub fan1_rpm: Option<u16>,
    pub fan2_rpm: Option<u16>,
    pub cpu_util_pct: f32,
    pub gpu_util_pct: Option<f32>,
    pub cpu_freq_ghz: Option<f32>,
    pub battery: Option<BatteryStatus>,
    pub on_ac: bool,
    pub gpu_mode: Option<HybridMode>,
    pub display_topology: DisplayTopology,
    pub workload_class: WorkloadClass,
    /// Names of interesting running processes (lowercased) feeding the
    /// classifier and the GPU agent's launcher check.
    pub running_workload_hints: Vec<String>,
    pub processes: Vec<ProcessInfo>,
    pub throttle_flags: ThrottleFlags,
    pub cstate_residency: CstateResidency,
    pub power_scheme_guid: Option<String>,
}

/// Throttle bits decoded from the thermal status register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ThrottleFlags {
    pub thermal: bool,
    pub prochot: bool,
    pub critical: bool,
    pub pkg_throttle: bool,
}

impl From<ThermStatus> for ThrottleFlags {
    fn from(s: ThermStatus) -> Self {
        Self {
            thermal: s.thermal,
            prochot: s.prochot,
            critical: s.critical,
            pkg_throttle: s.pkg_throttle,
        }
    }
}

impl Snapshot {
    /// On battery below the given percentage. False when no battery.
    pub fn on_battery_below(&self, pct: f32) -> bool {
        !self.on_ac && self.battery.map(|b| b.pct < pct).unwrap_or(false)
    }

    pub fn on_battery(&self) -> bool {
        !self.on_ac
    }
}

/// Process names that mark a gaming session (launchers included).
const GAMING_HINTS: &[&str] = &[
    "steam",
    "steamwebhelper",
    "epicgameslauncher",
    "gog galaxy",
    "battle.net",
    "riotclientservices",
    "cyberpunk2077",
    "witcher3",
    "eldenring",
    "doometernal",
    "csgo",
    "cs2",
    "dota2",
    "valorant",
];

const MEDIA_HINTS: &[&str] = &["vlc", "mpv", "mplayer", "plexmediaplayer", "spotify", "kodi"];

const CONFERENCE_HINTS: &[&str] = &["zoom", "teams", "webex", "skype", "slack"];

const AI_HINTS: &[&str] = &["ollama", "llama-server", "python-torch", "tritonserver", "comfyui"];

const COMPILE_HINTS: &[&str] = &[
    "cargo", "rustc", "cc1", "cc1plus", "clang", "clang++", "gcc", "g++", "ld", "ninja", "make",
    "msbuild", "cl", "javac", "tsc",
];

/// Classify the workload from process hints, the C-state distribution and
/// utilization. Hints win over utilization heuristics; utilization breaks
/// ties between productivity classes.
pub fn classify_workload(
    hints: &[String],
    cpu_util_pct: f32,
    gpu_util_pct: Option<f32>,
    cstates: &CstateResidency,
) -> WorkloadClass {
    let has_hint = |set: &[&str]| hints.iter().any(|h| set.iter().any(|s| h.contains(s)));

    if has_hint(GAMING_HINTS) {
        return WorkloadClass::Gaming;
    }
    if has_hint(AI_HINTS) {
        return WorkloadClass::AiWorkload;
    }
    if has_hint(COMPILE_HINTS) && cpu_util_pct > 50.0 {
        return WorkloadClass::Compilation;
    }
    if has_hint(CONFERENCE_HINTS) {
        return WorkloadClass::VideoConferencing;
    }
    if has_hint(MEDIA_HINTS) {
        return WorkloadClass::MediaPlayback;
    }

    let gpu = gpu_util_pct.unwrap_or(0.0);
    if gpu > 60.0 && cpu_util_pct > 25.0 {
        return WorkloadClass::Gaming;
    }

    // A package that spends most of its time in deep C-states is idle no
    // matter what instantaneous utilization says.
    if cpu_util_pct < 10.0 && cstates.deep_pct() > 50.0 {
        return WorkloadClass::Idle;
    }
    if cpu_util_pct < 5.0 {
        return WorkloadClass::Idle;
    }
    if cpu_util_pct > 60.0 {
        return WorkloadClass::HeavyProductivity;
    }
    if cpu_util_pct > 10.0 {
        return WorkloadClass::LightProductivity;
    }
    WorkloadClass::Unknown
}

/// Maximum processes carried in a snapshot, ordered by CPU usage.
const MAX_SNAPSHOT_PROCESSES: usize = 64;

/// Single-writer sensor store with atomic snapshot publication.
pub struct ContextStore {
    hal: Arc<Hal>,
    system: Mutex<System>,
    cstates: CstateSampler,
    tx: watch::Sender<Arc<Snapshot>>,
    rx: watch::Receiver<Arc<Snapshot>>,
    seq: Mutex<u64>,
    last_ts_ms: Mutex<i64>,
}

impl ContextStore {
    pub fn new(hal: Arc<Hal>) -> Self {
        let (tx, rx) = watch::channel(Arc::new(Snapshot::default()));
        Self {
            hal,
            system: Mutex::new(System::new()),
            cstates: CstateSampler::new(),
            tx,
            rx,
            seq: Mutex::new(0),
            last_ts_ms: Mutex::new(0),
        }
    }

    /// Most recently published snapshot. Lock-free on the reader side.
    pub fn last_snapshot(&self) -> Arc<Snapshot> {
        self.rx.borrow().clone()
    }

    /// Subscribe to snapshot publications. The stream ends when the store
    /// is dropped with the engine.
    pub fn snapshot_stream(&self) -> watch::Receiver<Arc<Snapshot>> {
        self.tx.subscribe()
    }

    /// Gather, classify and publish one snapshot. Called only from the
    /// orchestrator tick task.
    pub fn collect_and_publish(&self) -> Arc<Snapshot> {
        let snapshot = Arc::new(self.collect());
        self.tx.send_replace(snapshot.clone());
        snapshot
    }

    fn next_seq_and_timestamp(&self) -> (u64, i64) {
        let mut seq = self.seq.lock().unwrap_or_else(|e| e.into_inner());
        *seq += 1;
        let now_ms = chrono::Utc::now().timestamp_millis();
        let mut last = self.last_ts_ms.lock().unwrap_or_else(|e| e.into_inner());
        // Strictly increasing even when the wall clock stalls or steps back.
        let ts = now_ms.max(*last + 1);
        *last = ts;
        (*seq, ts)
    }

    fn collect(&self) -> Snapshot {
        let (seq, timestamp_ms) = self.next_seq_and_timestamp();

        let cpu_temp_c = self.hal.ec.temperature(EC_REG_CPU_TEMP).ok();
        let gpu_temp_c = self.hal.ec.temperature(EC_REG_GPU_TEMP).ok();
        let fan1_rpm = self.hal.ec.fan_rpm(FanId::Cpu).ok();
        let fan2_rpm = self.hal.ec.fan_rpm(FanId::Gpu).ok();

        let (cpu_util_pct, processes) = self.sample_processes();
        let running_workload_hints: Vec<String> = processes
            .iter()
            .filter(|p| p.cpu_pct > 1.0)
            .map(|p| p.name.to_lowercase())
            .collect();

        let throttle = self.hal.msr.therm_status().unwrap_or_default();
        let cpu_freq_ghz = self
            .hal
            .msr
            .cpu_frequency_ghz()
            .ok()
            .or_else(|| self.fallback_frequency_ghz());
        let cstate_residency = self
            .cstates
            .sample(&self.hal.msr)
            .unwrap_or_default();

        let battery = self.hal.battery.battery_info().ok();
        let on_ac = battery.map(|b| b.ac_online).unwrap_or(true);

        let gpu_mode = self.hal.gpu.get_hybrid_mode().ok();
        let display_topology = self.hal.gpu.display_topology().unwrap_or_default();
        let power_scheme_guid = self.hal.scheme.get_active_scheme().ok();

        // GPU utilization comes from the vendor interface when present;
        // absent sensors stay None.
        let gpu_util_pct = None;

        let workload_class =
            classify_workload(&running_workload_hints, cpu_util_pct, gpu_util_pct, &cstate_residency);

        debug!(
            "Store: snapshot seq={} cpu={:?}C gpu={:?}C util={:.0}% workload={:?}",
            seq, cpu_temp_c, gpu_temp_c, cpu_util_pct, workload_class
        );

        Snapshot {
            seq,
            timestamp_ms,
            cpu_temp_c,
            gpu_temp_c,
            fan1_rpm,
            fan2_rpm,
            cpu_util_pct,
            gpu_util_pct,
            cpu_freq_ghz,
            battery,
            on_ac,
            gpu_mode,
            display_topology,
            workload_class,
            running_workload_hints,
            processes,
            throttle_flags: throttle.into(),
            cstate_residency,
            power_scheme_guid,
        }
    }

    fn sample_processes(&self) -> (f32, Vec<ProcessInfo>) {
        let mut system = self.system.lock().unwrap_or_else(|e| e.into_inner());
        system.refresh_cpu_usage();
        system.refresh_processes(ProcessesToUpdate::All, true);
        let cpu_util = system.global_cpu_usage();

        let mut processes: Vec<ProcessInfo> = system
            .processes()
            .iter()
            .map(|(pid, proc)| ProcessInfo {
                pid: pid.as_u32(),
                name: proc.name().to_string_lossy().to_string(),
                cpu_pct: proc.cpu_usage(),
                cpu_time_ms: proc.accumulated_cpu_time(),
                nice: None,
            })
            .collect();
        processes.sort_by(|a, b| b.cpu_pct.partial_cmp(&a.cpu_pct).unwrap_or(std::cmp::Ordering::Equal));
        processes.truncate(MAX_SNAPSHOT_PROCESSES);
        for p in processes.iter_mut() {
            p.nice = crate::hal::topology::process_nice(p.pid);
        }
        (cpu_util, processes)
    }

    fn fallback_frequency_ghz(&self) -> Option<f32> {
        let system = self.system.lock().unwrap_or_else(|e| e.into_inner());
        let mhz = system.cpus().first().map(|c| c.frequency())?;
        if mhz == 0 {
            return None;
        }
        Some(mhz as f32 / 1000.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_cstates() -> CstateResidency {
        CstateResidency::default()
    }

    fn deep_cstates() -> CstateResidency {
        let mut c = CstateResidency::default();
        c.pct[9] = 70.0;
        c
    }

    #[test]
    fn gaming_hint_wins_over_utilization() {
        let hints = vec!["steam".to_string()];
        assert_eq!(
            classify_workload(&hints, 3.0, None, &no_cstates()),
            WorkloadClass::Gaming
        );
    }

    #[test]
    fn compile_hint_requires_cpu_load() {
        let hints = vec!["cargo".to_string()];
        assert_eq!(
            classify_workload(&hints, 80.0, None, &no_cstates()),
            WorkloadClass::Compilation
        );
        // cargo sitting idle is not a compilation workload
        assert_ne!(
            classify_workload(&hints, 2.0, None, &no_cstates()),
            WorkloadClass::Compilation
        );
    }

    #[test]
    fn deep_cstates_classify_idle() {
        assert_eq!(
            classify_workload(&[], 6.0, None, &deep_cstates()),
            WorkloadClass::Idle
        );
    }

    #[test]
    fn high_gpu_and_cpu_without_hints_is_gaming() {
        assert_eq!(
            classify_workload(&[], 40.0, Some(80.0), &no_cstates()),
            WorkloadClass::Gaming
        );
    }

    #[test]
    fn utilization_ladder() {
        assert_eq!(
            classify_workload(&[], 75.0, None, &no_cstates()),
            WorkloadClass::HeavyProductivity
        );
        assert_eq!(
            classify_workload(&[], 25.0, None, &no_cstates()),
            WorkloadClass::LightProductivity
        );
        assert_eq!(
            classify_workload(&[], 2.0, None, &no_cstates()),
            WorkloadClass::Idle
        );
    }

    #[test]
    fn media_and_conference_hints() {
        assert_eq!(
            classify_workload(&["vlc".to_string()], 15.0, None, &no_cstates()),
            WorkloadClass::MediaPlayback
        );
        assert_eq!(
            classify_workload(&["zoom".to_string()], 20.0, None, &no_cstates()),
            WorkloadClass::VideoConferencing
        );
    }

    #[test]
    fn published_timestamps_strictly_increase() {
        let stub = crate::hal::testutil::stub_hal();
        let store = ContextStore::new(stub.hal);
        let mut last = 0i64;
        for i in 1..=10u64 {
            let snap = store.collect_and_publish();
            assert_eq!(snap.seq, i);
            assert!(
                snap.timestamp_ms > last,
                "timestamp {} not after {}",
                snap.timestamp_ms,
                last
            );
            last = snap.timestamp_ms;
        }
    }

    #[test]
    fn last_snapshot_returns_latest_publication() {
        let stub = crate::hal::testutil::stub_hal();
        let store = ContextStore::new(stub.hal);
        let published = store.collect_and_publish();
        let read = store.last_snapshot();
        assert_eq!(read.seq, published.seq);
        assert_eq!(read.timestamp_ms, published.timestamp_ms);
    }

    #[test]
    fn snapshot_battery_helpers() {
        let snap = Snapshot {
            on_ac: false,
            battery: Some(BatteryStatus {
                pct: 12.0,
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(snap.on_battery());
        assert!(snap.on_battery_below(15.0));
        assert!(!snap.on_battery_below(10.0));
    }
}
