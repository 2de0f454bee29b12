//! Battery readings: hybrid EC fast path + OS fallback
//!
//! The EC exposes instantaneous voltage/current/state, which gives a
//! real-time discharge rate; the OS battery interface gives the stable
//! values (percentage, design/full capacity, cycle count).
//!
//! Hybrid rule: report the OS-derived percentage with the EC-derived
//! discharge rate. After 5 consecutive EC failures a 30 s circuit breaker
//! opens and the reader serves OS data only until it closes.

use crate::error::{EngineError, HwResult};
use crate::hal::ec::{
    EmbeddedController, EC_BAT_STATE_AC_ONLINE, EC_BAT_STATE_CHARGING, EC_REG_BAT_CURR_HI,
    EC_REG_BAT_CURR_LO, EC_REG_BAT_STATE, EC_REG_BAT_TEMP, EC_REG_BAT_VOLT_HI,
    EC_REG_BAT_VOLT_LO,
};
use crate::hal::{CircuitBreaker, HalCounters};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

const EC_FAILURE_THRESHOLD: u32 = 5;
const EC_BREAKER_OPEN: Duration = Duration::from_secs(30);

/// Battery state as published in snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct BatteryStatus {
    /// State of charge, 0-100. OS-derived (stable).
    pub pct: f32,
    pub charging: bool,
    pub ac_online: bool,
    /// Instantaneous discharge rate in mW. EC-derived when the EC path is
    /// healthy, OS-derived otherwise. None while charging.
    pub discharge_mw: Option<u32>,
    pub design_mwh: Option<u32>,
    pub full_mwh: Option<u32>,
    pub cycles: Option<u32>,
    pub temp_c: Option<f32>,
}

impl BatteryStatus {
    /// Discharge rate in watts, when known.
    pub fn discharge_w(&self) -> Option<f32> {
        self.discharge_mw.map(|mw| mw as f32 / 1000.0)
    }
}

/// EC-side instantaneous readings.
#[derive(Debug, Clone, Copy)]
struct EcBatterySample {
    discharge_mw: Option<u32>,
    charging: bool,
    ac_online: bool,
    temp_c: Option<f32>,
}

pub struct BatteryReader {
    ec: Arc<EmbeddedController>,
    ec_breaker: CircuitBreaker,
    counters: Arc<HalCounters>,
}

impl BatteryReader {
    pub fn new(ec: Arc<EmbeddedController>, counters: Arc<HalCounters>) -> Self {
        Self {
            ec,
            ec_breaker: CircuitBreaker::new("battery_ec", EC_FAILURE_THRESHOLD, EC_BREAKER_OPEN),
            counters,
        }
    }

    /// Hybrid battery info. Fails only when both paths fail.
    pub fn battery_info(&self) -> HwResult<BatteryStatus> {
        let os = self.read_os_battery();
        let ec = self.read_ec_battery();

        match (os, ec) {
            (Ok(mut status), Ok(sample)) => {
                // Hybrid rule: OS percentage, EC discharge rate and state.
                status.charging = sample.charging;
                status.ac_online = sample.ac_online;
                status.discharge_mw = if sample.charging {
                    None
                } else {
                    sample.discharge_mw
                };
                if status.temp_c.is_none() {
                    status.temp_c = sample.temp_c;
                }
                Ok(status)
            }
            (Ok(status), Err(e)) => {
                debug!("Hal: battery EC path unavailable ({}), OS-only data", e);
                Ok(status)
            }
            (Err(os_err), Ok(sample)) => {
                // No OS battery data; EC alone cannot give a percentage.
                debug!("Hal: OS battery path failed: {}", os_err);
                Ok(BatteryStatus {
                    pct: 0.0,
                    charging: sample.charging,
                    ac_online: sample.ac_online,
                    discharge_mw: sample.discharge_mw,
                    design_mwh: None,
                    full_mwh: None,
                    cycles: None,
                    temp_c: sample.temp_c,
                })
            }
            (Err(os_err), Err(_)) => Err(os_err),
        }
    }

    /// True while the EC breaker keeps the fast path closed.
    pub fn ec_path_suppressed(&self) -> bool {
        self.ec_breaker.is_open()
    }

    fn read_ec_battery(&self) -> HwResult<EcBatterySample> {
        self.ec_breaker.check()?;
        match self.read_ec_battery_inner() {
            Ok(sample) => {
                self.ec_breaker.record_success();
                Ok(sample)
            }
            Err(e) => {
                self.counters.record_failure("battery_info_ec");
                self.ec_breaker.record_failure();
                Err(e)
            }
        }
    }

    fn read_ec_battery_inner(&self) -> HwResult<EcBatterySample> {
        let voltage_mv = self.ec.read_u16(EC_REG_BAT_VOLT_HI, EC_REG_BAT_VOLT_LO)?;
        let current_raw = self.ec.read_u16(EC_REG_BAT_CURR_HI, EC_REG_BAT_CURR_LO)? as i16;
        let state = self.ec.read_register(EC_REG_BAT_STATE)?;

        if voltage_mv == 0 {
            return Err(EngineError::HwInvalid("EC battery voltage 0 mV".into()));
        }

        // Positive current = discharge, negative = charge.
        let discharge_mw = if current_raw > 0 {
            Some((voltage_mv as u32).saturating_mul(current_raw as u32) / 1000)
        } else {
            None
        };

        let temp_c = self
            .ec
            .read_register(EC_REG_BAT_TEMP)
            .ok()
            .filter(|raw| *raw != 0 && *raw != 0xFF)
            .map(|raw| raw as f32);

        Ok(EcBatterySample {
            discharge_mw,
            charging: state & EC_BAT_STATE_CHARGING != 0,
            ac_online: state & EC_BAT_STATE_AC_ONLINE != 0,
            temp_c,
        })
    }

    fn read_os_battery(&self) -> HwResult<BatteryStatus> {
        let manager = battery::Manager::new()
            .map_err(|e| EngineError::HwUnavailable(format!("battery manager: {}", e)))?;
        let mut batteries = manager
            .batteries()
            .map_err(|e| EngineError::HwUnavailable(format!("battery enumeration: {}", e)))?;
        let bat = match batteries.next() {
            Some(Ok(b)) => b,
            Some(Err(e)) => {
                self.counters.record_failure("battery_info_os");
                return Err(EngineError::HwTransient(format!("battery read: {}", e)));
            }
            None => return Err(EngineError::HwUnavailable("no battery present".into())),
        };

        let pct = bat
            .state_of_charge()
            .get::<battery::units::ratio::percent>();
        let charging = matches!(bat.state(), battery::State::Charging);
        let to_mwh = |energy: battery::units::Energy| -> u32 {
            (energy.get::<battery::units::energy::watt_hour>() * 1000.0) as u32
        };
        let discharge_mw = if matches!(bat.state(), battery::State::Discharging) {
            Some((bat.energy_rate().get::<battery::units::power::watt>() * 1000.0) as u32)
        } else {
            None
        };

        Ok(BatteryStatus {
            pct,
            charging,
            // The OS path cannot distinguish "full on AC" from "unplugged
            // and idle"; the EC state register refines this when healthy.
            ac_online: !matches!(bat.state(), battery::State::Discharging),
            discharge_mw,
            design_mwh: Some(to_mwh(bat.energy_full_design())),
            full_mwh: Some(to_mwh(bat.energy_full())),
            cycles: bat.cycle_count(),
            temp_c: bat
                .temperature()
                .map(|t| t.get::<battery::units::thermodynamic_temperature::degree_celsius>()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::ec::MemEcTransport;
    use std::sync::atomic::Ordering;

    fn reader_with_ec(mem: MemEcTransport) -> BatteryReader {
        let counters = Arc::new(HalCounters::new());
        let ec = Arc::new(EmbeddedController::with_transport(
            Box::new(mem),
            counters.clone(),
        ));
        BatteryReader::new(ec, counters)
    }

    fn discharging_regs() -> MemEcTransport {
        // 12.6 V, 2000 mA discharge, on battery.
        MemEcTransport::preset(&[
            (EC_REG_BAT_VOLT_HI, 0x31),
            (EC_REG_BAT_VOLT_LO, 0x38), // 0x3138 = 12600 mV
            (EC_REG_BAT_CURR_HI, 0x07),
            (EC_REG_BAT_CURR_LO, 0xD0), // 0x07D0 = 2000 mA
            (EC_REG_BAT_STATE, 0x00),
        ])
    }

    #[test]
    fn ec_sample_computes_discharge_milliwatts() {
        let reader = reader_with_ec(discharging_regs());
        let sample = reader.read_ec_battery().unwrap();
        assert_eq!(sample.discharge_mw, Some(25_200)); // 12.6 V * 2 A
        assert!(!sample.charging);
        assert!(!sample.ac_online);
    }

    #[test]
    fn charging_state_suppresses_discharge_rate() {
        let mem = MemEcTransport::preset(&[
            (EC_REG_BAT_VOLT_HI, 0x31),
            (EC_REG_BAT_VOLT_LO, 0x38),
            // Negative current (charging): -1500 mA two's complement.
            (EC_REG_BAT_CURR_HI, 0xFA),
            (EC_REG_BAT_CURR_LO, 0x24),
            (EC_REG_BAT_STATE, EC_BAT_STATE_CHARGING | EC_BAT_STATE_AC_ONLINE),
        ]);
        let reader = reader_with_ec(mem);
        let sample = reader.read_ec_battery().unwrap();
        assert_eq!(sample.discharge_mw, None);
        assert!(sample.charging);
        assert!(sample.ac_online);
    }

    #[test]
    fn zero_voltage_is_invalid_data() {
        let mem = MemEcTransport::preset(&[(EC_REG_BAT_STATE, 0)]);
        let reader = reader_with_ec(mem);
        match reader.read_ec_battery() {
            Err(EngineError::HwInvalid(_)) => {}
            other => panic!("expected HwInvalid, got {:?}", other),
        }
    }

    #[test]
    fn five_failures_open_the_ec_breaker_for_30s() {
        let mem = MemEcTransport::new();
        mem.fail.store(true, Ordering::Relaxed);
        let reader = reader_with_ec(mem);
        for _ in 0..EC_FAILURE_THRESHOLD {
            assert!(reader.read_ec_battery().is_err());
        }
        assert!(reader.ec_path_suppressed());
        // Even if the EC "recovers", the breaker short-circuits the call.
        match reader.read_ec_battery() {
            Err(EngineError::BackoffOpen(_)) => {}
            other => panic!("expected BackoffOpen, got {:?}", other),
        }
    }
}
