//! Hybrid graphics control (vendor-opaque actuator)
//!
//! The engine treats the GPU mux as an opaque switch with four positions
//! (`on`, `off`, `igpu-only`, `auto`) plus a topology question: which
//! displays hang off the discrete GPU. The vendor backend is a seam;
//! production drives the kernel's GPU switcher interface, tests inject an
//! in-memory backend.

use crate::action::HybridMode;
use crate::error::{EngineError, HwResult};
use crate::hal::display::DisplayTopology;
use crate::hal::HalCounters;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

/// Vendor backend seam.
pub trait GpuBackend: Send + Sync {
    fn get_mode(&self) -> HwResult<HybridMode>;
    fn set_mode(&self, mode: HybridMode) -> HwResult<()>;
    fn topology(&self) -> HwResult<DisplayTopology>;
}

/// Kernel GPU switcher backend: mode via the switcher control file,
/// topology via the DRM connector tree.
pub struct SwitcherooBackend {
    switch_path: PathBuf,
    drm_root: PathBuf,
}

impl SwitcherooBackend {
    pub fn probe() -> Option<Self> {
        let backend = Self {
            switch_path: PathBuf::from("/sys/kernel/debug/vgaswitcheroo/switch"),
            drm_root: PathBuf::from("/sys/class/drm"),
        };
        if backend.switch_path.exists() {
            Some(backend)
        } else {
            None
        }
    }

    /// DRM card directory of the discrete GPU (`boot_vga = 0`).
    fn dgpu_card(&self) -> Option<String> {
        let entries = std::fs::read_dir(&self.drm_root).ok()?;
        for entry in entries.filter_map(Result::ok) {
            let name = entry.file_name().to_string_lossy().into_owned();
            // Cards only, not connectors (card1 vs card1-HDMI-A-1).
            if !name.starts_with("card") || name.contains('-') {
                continue;
            }
            let boot_vga = entry.path().join("device").join("boot_vga");
            if let Ok(v) = std::fs::read_to_string(&boot_vga) {
                if v.trim() == "0" {
                    return Some(name);
                }
            }
        }
        None
    }
}

impl GpuBackend for SwitcherooBackend {
    fn get_mode(&self) -> HwResult<HybridMode> {
        let text = std::fs::read_to_string(&self.switch_path)?;
        // Active line carries a '+', e.g. "1:DIS: :DynOff:0000:01:00.0".
        for line in text.lines() {
            if !line.contains('+') {
                continue;
            }
            if line.contains("DIS") {
                return Ok(HybridMode::Off);
            }
            if line.contains("IGD") {
                return Ok(HybridMode::IGpuOnly);
            }
        }
        Ok(HybridMode::On)
    }

    fn set_mode(&self, mode: HybridMode) -> HwResult<()> {
        let word = match mode {
            HybridMode::Off => "DIS",
            HybridMode::IGpuOnly => "IGD",
            HybridMode::On | HybridMode::Auto => "DDIS",
        };
        std::fs::write(&self.switch_path, word)?;
        Ok(())
    }

    fn topology(&self) -> HwResult<DisplayTopology> {
        let card = match self.dgpu_card() {
            Some(c) => c,
            None => return Ok(DisplayTopology::default()),
        };
        let mut connected = 0u8;
        let entries = std::fs::read_dir(&self.drm_root)?;
        for entry in entries.filter_map(Result::ok) {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.starts_with(&format!("{}-", card)) {
                continue;
            }
            if let Ok(status) = std::fs::read_to_string(entry.path().join("status")) {
                if status.trim() == "connected" {
                    connected += 1;
                }
            }
        }
        Ok(DisplayTopology {
            has_external_on_dgpu: connected > 0,
            dgpu_display_count: connected,
        })
    }
}

/// In-memory backend for tests.
pub struct MemGpuBackend {
    mode: Mutex<HybridMode>,
    pub topology: Mutex<DisplayTopology>,
}

impl MemGpuBackend {
    pub fn new(mode: HybridMode) -> Self {
        Self {
            mode: Mutex::new(mode),
            topology: Mutex::new(DisplayTopology::default()),
        }
    }
}

impl GpuBackend for std::sync::Arc<MemGpuBackend> {
    fn get_mode(&self) -> HwResult<HybridMode> {
        (**self).get_mode()
    }

    fn set_mode(&self, mode: HybridMode) -> HwResult<()> {
        (**self).set_mode(mode)
    }

    fn topology(&self) -> HwResult<DisplayTopology> {
        (**self).topology()
    }
}

impl GpuBackend for MemGpuBackend {
    fn get_mode(&self) -> HwResult<HybridMode> {
        Ok(*self.mode.lock().unwrap())
    }

    fn set_mode(&self, mode: HybridMode) -> HwResult<()> {
        *self.mode.lock().unwrap() = mode;
        Ok(())
    }

    fn topology(&self) -> HwResult<DisplayTopology> {
        Ok(*self.topology.lock().unwrap())
    }
}

/// Typed GPU access with availability and counters.
pub struct GpuControl {
    backend: Option<Box<dyn GpuBackend>>,
    counters: Arc<HalCounters>,
}

impl GpuControl {
    pub fn probe(counters: Arc<HalCounters>) -> Self {
        let backend: Option<Box<dyn GpuBackend>> = match SwitcherooBackend::probe() {
            Some(b) => {
                info!("Hal: GPU switcher interface available");
                Some(Box::new(b))
            }
            None => {
                debug!("Hal: no GPU switcher interface, hybrid mode control disabled");
                None
            }
        };
        Self { backend, counters }
    }

    pub fn with_backend(backend: Box<dyn GpuBackend>, counters: Arc<HalCounters>) -> Self {
        Self {
            backend: Some(backend),
            counters,
        }
    }

    pub fn is_available(&self) -> bool {
        self.backend.is_some()
    }

    fn backend(&self) -> HwResult<&dyn GpuBackend> {
        self.backend
            .as_deref()
            .ok_or_else(|| EngineError::HwUnavailable("gpu control absent".into()))
    }

    pub fn get_hybrid_mode(&self) -> HwResult<HybridMode> {
        self.backend()?.get_mode().map_err(|e| {
            self.counters.record_failure("get_hybrid_mode");
            e
        })
    }

    pub fn set_hybrid_mode(&self, mode: HybridMode) -> HwResult<()> {
        self.backend()?.set_mode(mode).map_err(|e| {
            self.counters.record_failure("set_hybrid_mode");
            e
        })
    }

    pub fn display_topology(&self) -> HwResult<DisplayTopology> {
        self.backend()?.topology().map_err(|e| {
            self.counters.record_failure("display_topology");
            e
        })
    }

    /// Non-mutating liveness probe used by the health monitor.
    pub fn probe_alive(&self) -> HwResult<()> {
        self.get_hybrid_mode().map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mem_backend_round_trips_mode() {
        let control = GpuControl::with_backend(
            Box::new(MemGpuBackend::new(HybridMode::On)),
            Arc::new(HalCounters::new()),
        );
        assert_eq!(control.get_hybrid_mode().unwrap(), HybridMode::On);
        control.set_hybrid_mode(HybridMode::IGpuOnly).unwrap();
        assert_eq!(control.get_hybrid_mode().unwrap(), HybridMode::IGpuOnly);
    }

    #[test]
    fn absent_backend_is_unavailable() {
        let control = GpuControl {
            backend: None,
            counters: Arc::new(HalCounters::new()),
        };
        assert!(!control.is_available());
        assert!(matches!(
            control.get_hybrid_mode(),
            Err(EngineError::HwUnavailable(_))
        ));
    }
}
