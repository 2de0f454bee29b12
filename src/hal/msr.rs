//! Model-specific register access and decoding
//!
//! Reads and writes go through the kernel MSR device (`/dev/cpu/N/msr`),
//! which requires elevated access. Availability is probed once at startup;
//! a failed probe permanently disables every MSR-dependent agent with a
//! logged reason.
//!
//! Decoders cover the registers the engine consumes:
//! - `0x19C` IA32_THERM_STATUS: throttle flags + digital temperature readout
//! - `0x198` IA32_PERF_STATUS: current ratio (ratio × 100 MHz = frequency)
//! - `0x199` IA32_PERF_CTL: requested ratio + turbo disable
//! - `0xE2`  MSR_PKG_C_STATE_LIMIT: package C-state limit code
//! - package C-state residency counters, turned into percentages by
//!   delta-sampling against the TSC

use crate::error::{EngineError, HwResult};
use crate::hal::{CircuitBreaker, HalCounters};
use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

pub const MSR_IA32_TSC: u32 = 0x10;
pub const MSR_PKG_C_STATE_LIMIT: u32 = 0xE2;
pub const MSR_IA32_PERF_STATUS: u32 = 0x198;
pub const MSR_IA32_PERF_CTL: u32 = 0x199;
pub const MSR_IA32_THERM_STATUS: u32 = 0x19C;
pub const MSR_PKG_C2_RESIDENCY: u32 = 0x60D;
pub const MSR_PKG_C3_RESIDENCY: u32 = 0x3F8;
pub const MSR_PKG_C6_RESIDENCY: u32 = 0x3F9;
pub const MSR_PKG_C7_RESIDENCY: u32 = 0x3FA;
pub const MSR_PKG_C8_RESIDENCY: u32 = 0x630;
pub const MSR_PKG_C9_RESIDENCY: u32 = 0x631;
pub const MSR_PKG_C10_RESIDENCY: u32 = 0x632;

/// Default Tj_max when the platform does not report one.
const DEFAULT_TJ_MAX_C: f32 = 100.0;

/// Raw 64-bit register transport, keyed by cpu index and MSR address.
pub trait MsrDevice: Send + Sync {
    fn read(&self, cpu: usize, msr: u32) -> HwResult<u64>;
    fn write(&self, cpu: usize, msr: u32, value: u64) -> HwResult<()>;
}

/// Production device over `/dev/cpu/N/msr`.
pub struct FileMsrDevice;

impl FileMsrDevice {
    fn path(cpu: usize) -> String {
        format!("/dev/cpu/{}/msr", cpu)
    }
}

impl MsrDevice for FileMsrDevice {
    fn read(&self, cpu: usize, msr: u32) -> HwResult<u64> {
        let mut file = std::fs::File::open(Self::path(cpu))?;
        file.seek(SeekFrom::Start(msr as u64))?;
        let mut buf = [0u8; 8];
        file.read_exact(&mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    fn write(&self, cpu: usize, msr: u32, value: u64) -> HwResult<()> {
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .open(Self::path(cpu))?;
        file.seek(SeekFrom::Start(msr as u64))?;
        file.write_all(&value.to_le_bytes())?;
        Ok(())
    }
}

/// In-memory MSR file for tests.
#[derive(Default)]
pub struct MemMsrDevice {
    regs: Mutex<std::collections::HashMap<u32, u64>>,
}

impl MemMsrDevice {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn preset(values: &[(u32, u64)]) -> Self {
        let d = Self::default();
        {
            let mut regs = d.regs.lock().unwrap();
            for (msr, v) in values {
                regs.insert(*msr, *v);
            }
        }
        d
    }

    pub fn set(&self, msr: u32, value: u64) {
        self.regs.lock().unwrap().insert(msr, value);
    }
}

impl MsrDevice for std::sync::Arc<MemMsrDevice> {
    fn read(&self, cpu: usize, msr: u32) -> HwResult<u64> {
        (**self).read(cpu, msr)
    }

    fn write(&self, cpu: usize, msr: u32, value: u64) -> HwResult<()> {
        (**self).write(cpu, msr, value)
    }
}

impl MsrDevice for MemMsrDevice {
    fn read(&self, _cpu: usize, msr: u32) -> HwResult<u64> {
        self.regs
            .lock()
            .unwrap()
            .get(&msr)
            .copied()
            .ok_or_else(|| EngineError::HwInvalid(format!("msr {:#x} not modelled", msr)))
    }

    fn write(&self, _cpu: usize, msr: u32, value: u64) -> HwResult<()> {
        self.regs.lock().unwrap().insert(msr, value);
        Ok(())
    }
}

/// Decoded IA32_THERM_STATUS.
#[derive(Debug, Clone, Copy, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ThermStatus {
    pub thermal: bool,
    pub prochot: bool,
    pub critical: bool,
    pub pkg_throttle: bool,
    /// Degrees below Tj_max (digital readout, bits 22:16).
    pub readout_offset_c: u8,
}

impl ThermStatus {
    pub fn from_raw(raw: u64) -> Self {
        Self {
            thermal: raw & 0x1 != 0,
            prochot: raw & 0x2 != 0,
            critical: raw & 0x4 != 0,
            pkg_throttle: raw & 0x8 != 0,
            readout_offset_c: ((raw >> 16) & 0x7F) as u8,
        }
    }

    /// Absolute temperature given the package Tj_max.
    pub fn temperature_c(&self, tj_max: f32) -> f32 {
        tj_max - self.readout_offset_c as f32
    }

    pub fn any_throttle(&self) -> bool {
        self.thermal || self.prochot || self.critical || self.pkg_throttle
    }
}

/// Current performance ratio from IA32_PERF_STATUS bits 15:8.
pub fn perf_status_ratio(raw: u64) -> u8 {
    ((raw >> 8) & 0xFF) as u8
}

/// Frequency implied by a performance ratio (ratio × 100 MHz).
pub fn ratio_to_ghz(ratio: u8) -> f32 {
    ratio as f32 * 0.1
}

/// Compose an IA32_PERF_CTL value: requested ratio in bits 15:8, turbo
/// disable in bit 32, all other bits preserved from `current`.
pub fn compose_perf_ctl(current: u64, ratio: u8, disable_turbo: bool) -> u64 {
    let mut value = current & !(0xFFu64 << 8) & !(1u64 << 32);
    value |= (ratio as u64) << 8;
    if disable_turbo {
        value |= 1u64 << 32;
    }
    value
}

/// Compose MSR_PKG_C_STATE_LIMIT: limit code in bits 2:0, rest preserved.
pub fn compose_cstate_limit(current: u64, code: u64) -> u64 {
    (current & !0x7) | (code & 0x7)
}

/// Typed MSR access bound to cpu 0 (package-scope registers).
pub struct MsrAccess {
    device: Option<Box<dyn MsrDevice>>,
    breaker: CircuitBreaker,
    counters: Arc<HalCounters>,
    tj_max_c: f32,
}

impl MsrAccess {
    /// Probe by reading IA32_PERF_STATUS once. A failed probe disables MSR
    /// access for the lifetime of the process.
    pub fn probe(counters: Arc<HalCounters>) -> Self {
        let device = FileMsrDevice;
        match device.read(0, MSR_IA32_PERF_STATUS) {
            Ok(_) => {
                info!("Hal: MSR device available");
                Self::with_device(Box::new(device), counters)
            }
            Err(e) => {
                warn!(
                    "Hal: MSR probe failed ({}), MSR-dependent agents disabled for this run",
                    e
                );
                Self {
                    device: None,
                    breaker: CircuitBreaker::standard("msr"),
                    counters,
                    tj_max_c: DEFAULT_TJ_MAX_C,
                }
            }
        }
    }

    pub fn with_device(device: Box<dyn MsrDevice>, counters: Arc<HalCounters>) -> Self {
        Self {
            device: Some(device),
            breaker: CircuitBreaker::standard("msr"),
            counters,
            tj_max_c: DEFAULT_TJ_MAX_C,
        }
    }

    pub fn is_available(&self) -> bool {
        self.device.is_some()
    }

    pub fn tj_max_c(&self) -> f32 {
        self.tj_max_c
    }

    pub fn read_msr(&self, msr: u32) -> HwResult<u64> {
        let device = self
            .device
            .as_ref()
            .ok_or_else(|| EngineError::HwUnavailable("MSR device not probed".into()))?;
        self.breaker.check()?;
        match device.read(0, msr) {
            Ok(v) => {
                self.breaker.record_success();
                Ok(v)
            }
            Err(e) => {
                self.counters.record_failure("read_msr");
                self.breaker.record_failure();
                Err(e)
            }
        }
    }

    pub fn write_msr(&self, msr: u32, value: u64) -> HwResult<()> {
        let device = self
            .device
            .as_ref()
            .ok_or_else(|| EngineError::HwUnavailable("MSR device not probed".into()))?;
        self.breaker.check()?;
        match device.write(0, msr, value) {
            Ok(()) => {
                self.breaker.record_success();
                Ok(())
            }
            Err(e) => {
                self.counters.record_failure("write_msr");
                self.breaker.record_failure();
                Err(e)
            }
        }
    }

    pub fn therm_status(&self) -> HwResult<ThermStatus> {
        Ok(ThermStatus::from_raw(self.read_msr(MSR_IA32_THERM_STATUS)?))
    }

    pub fn cpu_frequency_ghz(&self) -> HwResult<f32> {
        let ratio = perf_status_ratio(self.read_msr(MSR_IA32_PERF_STATUS)?);
        if ratio == 0 {
            return Err(EngineError::HwInvalid("perf status ratio 0".into()));
        }
        Ok(ratio_to_ghz(ratio))
    }

    /// Write a requested performance ratio, preserving every other bit of
    /// IA32_PERF_CTL.
    pub fn set_perf_ratio(&self, ratio: u8, disable_turbo: bool) -> HwResult<()> {
        let current = self.read_msr(MSR_IA32_PERF_CTL)?;
        self.write_msr(MSR_IA32_PERF_CTL, compose_perf_ctl(current, ratio, disable_turbo))
    }

    pub fn set_cstate_limit(&self, code: u64) -> HwResult<()> {
        let current = self.read_msr(MSR_PKG_C_STATE_LIMIT)?;
        self.write_msr(MSR_PKG_C_STATE_LIMIT, compose_cstate_limit(current, code))
    }
}

/// Package C-state residency percentages over the last sampling interval.
/// Index 0 is C1 (not measured at package scope, always 0 here), index 9
/// is C10. Missing mass is active time; the sum never exceeds 100.
#[derive(Debug, Clone, Copy, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct CstateResidency {
    pub pct: [f32; 10],
}

impl CstateResidency {
    /// Residency in the deep package states (C6 and below).
    pub fn deep_pct(&self) -> f32 {
        self.pct[5..].iter().sum()
    }

    pub fn total_pct(&self) -> f32 {
        self.pct.iter().sum()
    }
}

const RESIDENCY_MSRS: [(usize, u32); 7] = [
    (1, MSR_PKG_C2_RESIDENCY),
    (2, MSR_PKG_C3_RESIDENCY),
    (5, MSR_PKG_C6_RESIDENCY),
    (6, MSR_PKG_C7_RESIDENCY),
    (7, MSR_PKG_C8_RESIDENCY),
    (8, MSR_PKG_C9_RESIDENCY),
    (9, MSR_PKG_C10_RESIDENCY),
];

/// Delta-samples residency counters against the TSC. The first sample
/// after construction returns all zeros (no interval to compare).
pub struct CstateSampler {
    last: Mutex<Option<(u64, [u64; 10])>>,
}

impl CstateSampler {
    pub fn new() -> Self {
        Self {
            last: Mutex::new(None),
        }
    }

    pub fn sample(&self, msr: &MsrAccess) -> HwResult<CstateResidency> {
        let tsc = msr.read_msr(MSR_IA32_TSC)?;
        let mut counters = [0u64; 10];
        for (slot, reg) in RESIDENCY_MSRS {
            // Individual residency MSRs may be absent on some packages;
            // treat them as zero rather than failing the whole sample.
            counters[slot] = msr.read_msr(reg).unwrap_or(0);
        }

        let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());
        let result = match last.as_ref() {
            Some((last_tsc, last_counters)) => {
                let tsc_delta = tsc.saturating_sub(*last_tsc);
                if tsc_delta == 0 {
                    CstateResidency::default()
                } else {
                    let mut pct = [0f32; 10];
                    for i in 0..10 {
                        let delta = counters[i].saturating_sub(last_counters[i]);
                        pct[i] = (delta as f64 / tsc_delta as f64 * 100.0) as f32;
                    }
                    // Counter skew can nudge the sum past 100; renormalize so
                    // the published invariant (sum <= 100) holds.
                    let total: f32 = pct.iter().sum();
                    if total > 100.0 {
                        for p in pct.iter_mut() {
                            *p = *p * 100.0 / total;
                        }
                    }
                    CstateResidency { pct }
                }
            }
            None => CstateResidency::default(),
        };
        *last = Some((tsc, counters));
        Ok(result)
    }
}

impl Default for CstateSampler {
    fn default() -> Self {
        Self::new()
    }
}
