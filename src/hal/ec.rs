//! Embedded controller register I/O
//!
//! The EC exposes fan, thermal and battery registers through a byte-wide
//! register file. Access goes through a process-wide lock with a 1 s
//! acquisition timeout; writes take effect on the next EC scan (~500 ms).
//!
//! The transport is a seam: production uses the kernel's EC debug
//! interface, tests inject an in-memory register file.

use crate::error::{EngineError, HwResult};
use crate::hal::{CircuitBreaker, HalCounters};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Vendor register map (byte addresses in EC space).
pub const EC_REG_CPU_TEMP: u8 = 0xA0;
pub const EC_REG_GPU_TEMP: u8 = 0xA1;
pub const EC_REG_BAT_VOLT_HI: u8 = 0xA2;
pub const EC_REG_BAT_VOLT_LO: u8 = 0xA3;
pub const EC_REG_BAT_CURR_HI: u8 = 0xA4;
pub const EC_REG_BAT_CURR_LO: u8 = 0xA5;
pub const EC_REG_BAT_STATE: u8 = 0xA6;
pub const EC_REG_BAT_TEMP: u8 = 0xA7;
/// Fan duty registers: 0-255, written directly by the executor and the
/// emergency thermal path.
pub const EC_REG_FAN1_DUTY: u8 = 0xB0;
pub const EC_REG_FAN2_DUTY: u8 = 0xB1;
/// Vendor fan profile selector (quiet/balanced/performance/custom).
pub const EC_REG_FAN_PROFILE: u8 = 0xB2;
pub const EC_REG_FAN1_RPM_HI: u8 = 0xB4;
pub const EC_REG_FAN1_RPM_LO: u8 = 0xB5;
pub const EC_REG_FAN2_RPM_HI: u8 = 0xB6;
pub const EC_REG_FAN2_RPM_LO: u8 = 0xB7;
/// Panel and keyboard backlight levels (vendor-opaque scaling).
pub const EC_REG_PANEL_BACKLIGHT: u8 = 0xC2;
pub const EC_REG_KBD_BACKLIGHT: u8 = 0xC4;

/// EC battery state register bits.
pub const EC_BAT_STATE_CHARGING: u8 = 0x01;
pub const EC_BAT_STATE_AC_ONLINE: u8 = 0x02;

const EC_LOCK_TIMEOUT: Duration = Duration::from_secs(1);
const EC_LOCK_RETRY: Duration = Duration::from_millis(5);

/// Default kernel EC debug interface path.
const EC_IO_PATH: &str = "/sys/kernel/debug/ec/ec0/io";

/// Raw byte transport into EC register space.
pub trait EcTransport: Send + Sync {
    fn read(&self, addr: u8) -> HwResult<u8>;
    fn write(&self, addr: u8, value: u8) -> HwResult<()>;
    fn describe(&self) -> String;
}

/// Production transport over the kernel EC debug file.
pub struct FileEcTransport {
    path: PathBuf,
}

impl FileEcTransport {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn available(&self) -> bool {
        self.path.exists()
    }
}

impl EcTransport for FileEcTransport {
    fn read(&self, addr: u8) -> HwResult<u8> {
        let mut file = std::fs::File::open(&self.path)?;
        file.seek(SeekFrom::Start(addr as u64))?;
        let mut buf = [0u8; 1];
        file.read_exact(&mut buf)?;
        Ok(buf[0])
    }

    fn write(&self, addr: u8, value: u8) -> HwResult<()> {
        let mut file = std::fs::OpenOptions::new().write(true).open(&self.path)?;
        file.seek(SeekFrom::Start(addr as u64))?;
        file.write_all(&[value])?;
        Ok(())
    }

    fn describe(&self) -> String {
        format!("ec-debug:{}", self.path.display())
    }
}

/// In-memory register file for tests and for machines without an EC.
pub struct MemEcTransport {
    regs: Mutex<[u8; 256]>,
    /// When set, every access fails with a transient error.
    pub fail: AtomicBool,
    writes: Mutex<Vec<(u8, u8)>>,
}

impl Default for MemEcTransport {
    fn default() -> Self {
        Self {
            regs: Mutex::new([0u8; 256]),
            fail: AtomicBool::new(false),
            writes: Mutex::new(Vec::new()),
        }
    }
}

impl MemEcTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn preset(values: &[(u8, u8)]) -> Self {
        let t = Self::default();
        {
            let mut regs = t.regs.lock().unwrap();
            for (addr, v) in values {
                regs[*addr as usize] = *v;
            }
        }
        t
    }

    pub fn set_register(&self, addr: u8, value: u8) {
        self.regs.lock().unwrap()[addr as usize] = value;
    }

    /// All writes observed, in order. Used by tests to assert actuation.
    pub fn recorded_writes(&self) -> Vec<(u8, u8)> {
        self.writes.lock().unwrap().clone()
    }
}

impl EcTransport for std::sync::Arc<MemEcTransport> {
    fn read(&self, addr: u8) -> HwResult<u8> {
        (**self).read(addr)
    }

    fn write(&self, addr: u8, value: u8) -> HwResult<()> {
        (**self).write(addr, value)
    }

    fn describe(&self) -> String {
        (**self).describe()
    }
}

impl EcTransport for MemEcTransport {
    fn read(&self, addr: u8) -> HwResult<u8> {
        if self.fail.load(Ordering::Relaxed) {
            return Err(EngineError::HwTransient("ec read timed out".into()));
        }
        Ok(self.regs.lock().unwrap()[addr as usize])
    }

    fn write(&self, addr: u8, value: u8) -> HwResult<()> {
        if self.fail.load(Ordering::Relaxed) {
            return Err(EngineError::HwTransient("ec write timed out".into()));
        }
        self.regs.lock().unwrap()[addr as usize] = value;
        self.writes.lock().unwrap().push((addr, value));
        Ok(())
    }

    fn describe(&self) -> String {
        "ec-mem".to_string()
    }
}

/// Typed EC access with the process-wide lock, timeout, failure counters
/// and a standard circuit breaker per direction.
pub struct EmbeddedController {
    transport: Option<Box<dyn EcTransport>>,
    lock: Mutex<()>,
    read_breaker: CircuitBreaker,
    write_breaker: CircuitBreaker,
    counters: Arc<HalCounters>,
}

impl EmbeddedController {
    /// Probe the kernel EC interface; absent interface leaves the
    /// controller permanently unavailable.
    pub fn probe(counters: Arc<HalCounters>) -> Self {
        let transport = FileEcTransport::new(PathBuf::from(EC_IO_PATH));
        let transport: Option<Box<dyn EcTransport>> = if transport.available() {
            info!("Hal: EC transport available at {}", EC_IO_PATH);
            Some(Box::new(transport))
        } else {
            warn!("Hal: no EC interface at {}, EC primitives disabled", EC_IO_PATH);
            None
        };
        Self::with_transport_opt(transport, counters)
    }

    pub fn with_transport(
        transport: Box<dyn EcTransport>,
        counters: Arc<HalCounters>,
    ) -> Self {
        Self::with_transport_opt(Some(transport), counters)
    }

    pub fn unavailable(counters: Arc<HalCounters>) -> Self {
        Self::with_transport_opt(None, counters)
    }

    fn with_transport_opt(
        transport: Option<Box<dyn EcTransport>>,
        counters: Arc<HalCounters>,
    ) -> Self {
        Self {
            transport,
            lock: Mutex::new(()),
            read_breaker: CircuitBreaker::standard("ec_read"),
            write_breaker: CircuitBreaker::standard("ec_write"),
            counters,
        }
    }

    pub fn is_available(&self) -> bool {
        self.transport.is_some()
    }

    /// Acquire the process-wide EC lock, bounded by the 1 s timeout.
    fn lock_with_timeout(&self) -> HwResult<std::sync::MutexGuard<'_, ()>> {
        let deadline = Instant::now() + EC_LOCK_TIMEOUT;
        loop {
            match self.lock.try_lock() {
                Ok(guard) => return Ok(guard),
                Err(std::sync::TryLockError::Poisoned(p)) => return Ok(p.into_inner()),
                Err(std::sync::TryLockError::WouldBlock) => {
                    if Instant::now() >= deadline {
                        return Err(EngineError::HwTransient(
                            "ec lock acquisition timed out".into(),
                        ));
                    }
                    std::thread::sleep(EC_LOCK_RETRY);
                }
            }
        }
    }

    pub fn read_register(&self, addr: u8) -> HwResult<u8> {
        let transport = self
            .transport
            .as_ref()
            .ok_or_else(|| EngineError::HwUnavailable("no EC driver handle".into()))?;
        self.read_breaker.check()?;
        let _guard = self.lock_with_timeout()?;
        match transport.read(addr) {
            Ok(v) => {
                self.read_breaker.record_success();
                Ok(v)
            }
            Err(e) => {
                self.counters.record_failure("read_ec_register");
                self.read_breaker.record_failure();
                debug!("Hal: EC read {:#04x} failed: {}", addr, e);
                Err(e)
            }
        }
    }

    pub fn write_register(&self, addr: u8, value: u8) -> HwResult<()> {
        let transport = self
            .transport
            .as_ref()
            .ok_or_else(|| EngineError::HwUnavailable("no EC driver handle".into()))?;
        self.write_breaker.check()?;
        let _guard = self.lock_with_timeout()?;
        match transport.write(addr, value) {
            Ok(()) => {
                self.write_breaker.record_success();
                Ok(())
            }
            Err(e) => {
                self.counters.record_failure("write_ec_register");
                self.write_breaker.record_failure();
                debug!("Hal: EC write {:#04x}={:#04x} failed: {}", addr, value, e);
                Err(e)
            }
        }
    }

    /// Read a 16-bit value from a hi/lo register pair.
    pub fn read_u16(&self, hi: u8, lo: u8) -> HwResult<u16> {
        let h = self.read_register(hi)?;
        let l = self.read_register(lo)?;
        Ok(((h as u16) << 8) | l as u16)
    }

    /// Fan tachometer reading. Zero RPM with spinning duty is plausible
    /// during spin-up, so no validity filtering here.
    pub fn fan_rpm(&self, fan: FanId) -> HwResult<u16> {
        match fan {
            FanId::Cpu => self.read_u16(EC_REG_FAN1_RPM_HI, EC_REG_FAN1_RPM_LO),
            FanId::Gpu => self.read_u16(EC_REG_FAN2_RPM_HI, EC_REG_FAN2_RPM_LO),
        }
    }

    /// Temperature registers report degrees Celsius directly; 0 and 0xFF
    /// are sentinel values for a missing sensor.
    pub fn temperature(&self, reg: u8) -> HwResult<f32> {
        let raw = self.read_register(reg)?;
        if raw == 0 || raw == 0xFF {
            return Err(EngineError::HwInvalid(format!(
                "EC temp register {:#04x} returned sentinel {:#04x}",
                reg, raw
            )));
        }
        Ok(raw as f32)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FanId {
    Cpu,
    Gpu,
}
