//! Hardware Access Layer
//!
//! Narrow, typed primitives over the machine's control surfaces:
//! - `ec`: embedded controller register I/O (fans, temps, battery fast path)
//! - `msr`: model-specific registers (thermal status, perf control, C-states)
//! - `wmi`: management queries with a TTL cache
//! - `battery`: hybrid EC + OS battery readings
//! - `display`: refresh rates, topology, frame capture
//! - `power`: power-scheme values through the vendor tool
//! - `gpu`: hybrid graphics mode (vendor-opaque)
//! - `topology`: logical processor enumeration and process affinity
//!
//! Callers never touch raw I/O. Every primitive returns a tagged result;
//! nothing in this layer panics. Availability is probed once at startup
//! into a read-only `Capabilities` value.

pub mod battery;
pub mod display;
pub mod ec;
pub mod gpu;
pub mod msr;
pub mod power;
pub mod topology;
pub mod wifi;
pub mod wmi;

use crate::error::{EngineError, HwResult};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// What this machine supports, probed once during startup and read-only
/// afterwards. Agents branch on this instead of re-probing.
#[derive(Debug, Clone, Copy, Default, serde::Serialize, serde::Deserialize)]
pub struct Capabilities {
    pub has_ec: bool,
    pub has_msr: bool,
    pub has_gpu_control: bool,
    pub is_hybrid_cpu: bool,
}

/// Consecutive-failure circuit breaker.
///
/// After `threshold` consecutive failures the breaker opens for
/// `open_for`; while open, calls short-circuit to `BackoffOpen` without
/// touching the hardware. A success closes it and resets the count.
pub struct CircuitBreaker {
    name: &'static str,
    threshold: u32,
    open_for: Duration,
    state: Mutex<BreakerState>,
}

#[derive(Debug, Default)]
struct BreakerState {
    consecutive_failures: u32,
    opened_at: Option<Instant>,
}

impl CircuitBreaker {
    pub fn new(name: &'static str, threshold: u32, open_for: Duration) -> Self {
        Self {
            name,
            threshold,
            open_for,
            state: Mutex::new(BreakerState::default()),
        }
    }

    /// Standard engine policy: 3 consecutive failures open for 30 s.
    pub fn standard(name: &'static str) -> Self {
        Self::new(name, 3, Duration::from_secs(30))
    }

    /// Err(BackoffOpen) while the breaker is open. The open window is not
    /// extended by further calls; it expires on its own.
    pub fn check(&self) -> HwResult<()> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(opened_at) = state.opened_at {
            if opened_at.elapsed() < self.open_for {
                return Err(EngineError::BackoffOpen(format!(
                    "{} open for {:?} more",
                    self.name,
                    self.open_for.saturating_sub(opened_at.elapsed())
                )));
            }
            // Window elapsed: half-open, let the next call probe the hardware.
            state.opened_at = None;
            state.consecutive_failures = 0;
        }
        Ok(())
    }

    pub fn record_success(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.consecutive_failures = 0;
        state.opened_at = None;
    }

    /// Returns true when this failure opened the breaker.
    pub fn record_failure(&self) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.consecutive_failures += 1;
        if state.consecutive_failures >= self.threshold && state.opened_at.is_none() {
            state.opened_at = Some(Instant::now());
            warn!(
                "Hal: breaker {} opened after {} consecutive failures",
                self.name, state.consecutive_failures
            );
            return true;
        }
        false
    }

    pub fn is_open(&self) -> bool {
        self.check().is_err()
    }
}

/// Per-primitive transient failure counters, visible to the health monitor.
#[derive(Default)]
pub struct HalCounters {
    counts: Mutex<HashMap<&'static str, u64>>,
    total: AtomicU64,
}

impl HalCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_failure(&self, primitive: &'static str) {
        let mut counts = self.counts.lock().unwrap_or_else(|e| e.into_inner());
        *counts.entry(primitive).or_insert(0) += 1;
        self.total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn failures(&self, primitive: &str) -> u64 {
        let counts = self.counts.lock().unwrap_or_else(|e| e.into_inner());
        counts.get(primitive).copied().unwrap_or(0)
    }

    pub fn total_failures(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> HashMap<&'static str, u64> {
        self.counts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

/// The assembled hardware access layer, shared read-only across the engine.
pub struct Hal {
    pub ec: std::sync::Arc<ec::EmbeddedController>,
    pub msr: std::sync::Arc<msr::MsrAccess>,
    pub wmi: std::sync::Arc<wmi::WmiCache>,
    pub battery: std::sync::Arc<battery::BatteryReader>,
    pub display: std::sync::Arc<display::DisplayControl>,
    pub scheme: std::sync::Arc<power::PowerSchemes>,
    pub gpu: std::sync::Arc<gpu::GpuControl>,
    pub wifi: std::sync::Arc<wifi::WifiControl>,
    pub topology: std::sync::Arc<topology::CpuTopology>,
    pub counters: std::sync::Arc<HalCounters>,
    pub caps: Capabilities,
}

impl Hal {
    /// Probe the machine and assemble the layer with production transports.
    pub fn probe(wmi_cache_enabled: bool) -> Self {
        let counters = std::sync::Arc::new(HalCounters::new());

        let ec = std::sync::Arc::new(ec::EmbeddedController::probe(counters.clone()));
        let msr = std::sync::Arc::new(msr::MsrAccess::probe(counters.clone()));
        let gpu = std::sync::Arc::new(gpu::GpuControl::probe(counters.clone()));
        let topology = std::sync::Arc::new(topology::CpuTopology::enumerate());
        let wmi = std::sync::Arc::new(wmi::WmiCache::new(wmi_cache_enabled));
        let battery = std::sync::Arc::new(battery::BatteryReader::new(
            ec.clone(),
            counters.clone(),
        ));
        let display = std::sync::Arc::new(display::DisplayControl::probe(counters.clone()));
        let scheme = std::sync::Arc::new(power::PowerSchemes::probe(counters.clone()));
        let wifi = std::sync::Arc::new(wifi::WifiControl::probe(counters.clone()));

        let caps = Capabilities {
            has_ec: ec.is_available(),
            has_msr: msr.is_available(),
            has_gpu_control: gpu.is_available(),
            is_hybrid_cpu: topology.is_hybrid(),
        };
        info!(
            "Hal: probed capabilities ec={} msr={} gpu={} hybrid_cpu={}",
            caps.has_ec, caps.has_msr, caps.has_gpu_control, caps.is_hybrid_cpu
        );

        Self {
            ec,
            msr,
            wmi,
            battery,
            display,
            scheme,
            gpu,
            wifi,
            topology,
            counters,
            caps,
        }
    }
}

/// Assembled layer over in-memory transports, for tests across the crate.
/// The returned handles stay shared with the `Hal`, so tests can preset
/// registers and inspect writes.
#[cfg(test)]
pub(crate) mod testutil {
    use super::*;
    use crate::action::HybridMode;
    use std::sync::Arc;

    pub(crate) struct StubHal {
        pub hal: Arc<Hal>,
        pub ec_mem: Arc<ec::MemEcTransport>,
        pub msr_mem: Arc<msr::MemMsrDevice>,
        pub gpu_mem: Arc<gpu::MemGpuBackend>,
        pub refresh_mem: Arc<display::MemRefreshBackend>,
        pub wifi_mem: Arc<wifi::MemWifiBackend>,
    }

    pub(crate) fn stub_hal() -> StubHal {
        let counters = Arc::new(HalCounters::new());
        let ec_mem = Arc::new(ec::MemEcTransport::new());
        let msr_mem = Arc::new(msr::MemMsrDevice::new());
        let gpu_mem = Arc::new(gpu::MemGpuBackend::new(HybridMode::On));
        let refresh_mem = Arc::new(display::MemRefreshBackend::new(vec![60, 120, 165], 165));

        let ec = Arc::new(ec::EmbeddedController::with_transport(
            Box::new(ec_mem.clone()),
            counters.clone(),
        ));
        let msr = Arc::new(msr::MsrAccess::with_device(
            Box::new(msr_mem.clone()),
            counters.clone(),
        ));
        let gpu = Arc::new(gpu::GpuControl::with_backend(
            Box::new(gpu_mem.clone()),
            counters.clone(),
        ));
        let battery = Arc::new(battery::BatteryReader::new(ec.clone(), counters.clone()));
        let display = Arc::new(display::DisplayControl::with_backends(
            Some(Box::new(refresh_mem.clone())),
            None,
            counters.clone(),
        ));
        let scheme = Arc::new(power::PowerSchemes::unavailable(counters.clone()));
        let wifi_mem = Arc::new(wifi::MemWifiBackend::default());
        let wifi = Arc::new(wifi::WifiControl::with_backend(
            Box::new(wifi_mem.clone()),
            counters.clone(),
        ));
        let topology = Arc::new(topology::CpuTopology::from_processors(
            (0..8)
                .map(|i| topology::LogicalProcessor {
                    lp_index: i,
                    group: 0,
                    efficiency_class: if i < 4 {
                        topology::EFFICIENCY_CLASS_PCORE
                    } else {
                        topology::EFFICIENCY_CLASS_ECORE
                    },
                    affinity_bit: 1 << i,
                })
                .collect(),
        ));
        let wmi = Arc::new(wmi::WmiCache::new(true));

        let caps = Capabilities {
            has_ec: true,
            has_msr: true,
            has_gpu_control: true,
            is_hybrid_cpu: true,
        };
        let hal = Arc::new(Hal {
            ec,
            msr,
            wmi,
            battery,
            display,
            scheme,
            gpu,
            wifi,
            topology,
            counters,
            caps,
        });
        StubHal {
            hal,
            ec_mem,
            msr_mem,
            gpu_mem,
            refresh_mem,
            wifi_mem,
        }
    }
}
