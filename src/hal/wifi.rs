//! Wi-Fi adapter power save control (vendor-opaque actuator)
//!
//! The wireless stack exposes a coarse power-save switch; the finer PSP
//! levels are vendor-specific, so MediumPsp and MaxPsp both map onto the
//! stack's "on" with the distinction logged for the vendor path. Setting
//! the mode reports success once the tool accepts the command; the driver
//! gives no acknowledgement beyond that.

use crate::action::WifiPsaveMode;
use crate::error::{EngineError, HwResult};
use crate::hal::HalCounters;
use std::process::{Command, Stdio};
use std::sync::Arc;
use tracing::{debug, warn};

/// Seam over the wireless configuration tool.
pub trait WifiBackend: Send + Sync {
    fn set_power_save(&self, enabled: bool) -> HwResult<()>;
}

/// Production backend over `iw` against the first wireless interface.
pub struct IwBackend {
    interface: String,
}

impl IwBackend {
    pub fn probe() -> Option<Self> {
        let ok = Command::new("iw")
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false);
        if !ok {
            return None;
        }
        first_wireless_interface().map(|interface| Self { interface })
    }
}

fn first_wireless_interface() -> Option<String> {
    let entries = std::fs::read_dir("/sys/class/net").ok()?;
    for entry in entries.filter_map(Result::ok) {
        if entry.path().join("wireless").exists() {
            return Some(entry.file_name().to_string_lossy().into_owned());
        }
    }
    None
}

impl WifiBackend for IwBackend {
    fn set_power_save(&self, enabled: bool) -> HwResult<()> {
        let status = Command::new("iw")
            .args([
                "dev",
                &self.interface,
                "set",
                "power_save",
                if enabled { "on" } else { "off" },
            ])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map_err(|e| EngineError::HwTransient(format!("iw: {}", e)))?;
        if !status.success() {
            warn!(
                "Hal: iw set power_save {} on {} exited with {:?}",
                enabled, self.interface, status.code()
            );
        }
        Ok(())
    }
}

/// In-memory backend for tests.
#[derive(Default)]
pub struct MemWifiBackend {
    pub last: std::sync::Mutex<Option<bool>>,
}

impl WifiBackend for MemWifiBackend {
    fn set_power_save(&self, enabled: bool) -> HwResult<()> {
        *self.last.lock().unwrap() = Some(enabled);
        Ok(())
    }
}

impl WifiBackend for std::sync::Arc<MemWifiBackend> {
    fn set_power_save(&self, enabled: bool) -> HwResult<()> {
        (**self).set_power_save(enabled)
    }
}

pub struct WifiControl {
    backend: Option<Box<dyn WifiBackend>>,
    counters: Arc<HalCounters>,
}

impl WifiControl {
    pub fn probe(counters: Arc<HalCounters>) -> Self {
        let backend: Option<Box<dyn WifiBackend>> = match IwBackend::probe() {
            Some(b) => Some(Box::new(b)),
            None => {
                debug!("Hal: no wireless tool/interface, Wi-Fi power save disabled");
                None
            }
        };
        Self { backend, counters }
    }

    pub fn with_backend(backend: Box<dyn WifiBackend>, counters: Arc<HalCounters>) -> Self {
        Self {
            backend: Some(backend),
            counters,
        }
    }

    pub fn is_available(&self) -> bool {
        self.backend.is_some()
    }

    pub fn set_psave_mode(&self, mode: WifiPsaveMode) -> HwResult<()> {
        let backend = self
            .backend
            .as_ref()
            .ok_or_else(|| EngineError::HwUnavailable("wifi control absent".into()))?;
        let enabled = !matches!(mode, WifiPsaveMode::Disabled);
        debug!("Hal: wifi power save {:?} -> enabled={}", mode, enabled);
        backend.set_power_save(enabled).map_err(|e| {
            self.counters.record_failure("set_wifi_psave_mode");
            e
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn psp_levels_collapse_to_the_stack_switch() {
        let mem = std::sync::Arc::new(MemWifiBackend::default());
        let wifi = WifiControl::with_backend(Box::new(mem.clone()), Arc::new(HalCounters::new()));
        wifi.set_psave_mode(WifiPsaveMode::MaxPsp).unwrap();
        assert_eq!(*mem.last.lock().unwrap(), Some(true));
        wifi.set_psave_mode(WifiPsaveMode::Disabled).unwrap();
        assert_eq!(*mem.last.lock().unwrap(), Some(false));
    }

    #[test]
    fn absent_backend_is_unavailable() {
        let wifi = WifiControl {
            backend: None,
            counters: Arc::new(HalCounters::new()),
        };
        assert!(matches!(
            wifi.set_psave_mode(WifiPsaveMode::MaxPsp),
            Err(EngineError::HwUnavailable(_))
        ));
    }
}
