//! Logical processor topology and process affinity
//!
//! Enumerates logical processors with their efficiency class (hybrid
//! big.LITTLE packages report P-cores and E-cores through separate CPU
//! type lists) and applies per-process affinity masks. An empty mask is
//! refused before it can reach the OS.

use crate::error::{EngineError, HwResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, info, warn};

/// Efficiency classes, ordered: higher = more performant.
pub const EFFICIENCY_CLASS_ECORE: u8 = 0;
pub const EFFICIENCY_CLASS_PCORE: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogicalProcessor {
    pub lp_index: usize,
    pub group: u16,
    pub efficiency_class: u8,
    pub affinity_bit: u64,
}

/// Read-only processor map, enumerated once at startup.
pub struct CpuTopology {
    processors: Vec<LogicalProcessor>,
    hybrid: bool,
}

impl CpuTopology {
    /// Enumerate from the OS topology interface. On a uniform package every
    /// logical processor lands in the performance class.
    pub fn enumerate() -> Self {
        let count = available_cpu_count();
        let p_list = read_cpulist("/sys/devices/cpu_core/cpus");
        let e_list = read_cpulist("/sys/devices/cpu_atom/cpus");
        let hybrid = !p_list.is_empty() && !e_list.is_empty();

        let mut processors = Vec::with_capacity(count);
        for lp_index in 0..count.min(64) {
            let efficiency_class = if hybrid && e_list.contains(&lp_index) {
                EFFICIENCY_CLASS_ECORE
            } else {
                EFFICIENCY_CLASS_PCORE
            };
            processors.push(LogicalProcessor {
                lp_index,
                group: 0,
                efficiency_class,
                affinity_bit: 1u64 << lp_index,
            });
        }
        if count > 64 {
            // Affinity masks are single-group 64-bit; processors beyond
            // that are observed but not managed.
            warn!("Hal: {} logical processors, managing the first 64", count);
        }
        info!(
            "Hal: topology {} logical processors, hybrid={}, e_cores={}",
            processors.len(),
            hybrid,
            processors
                .iter()
                .filter(|p| p.efficiency_class == EFFICIENCY_CLASS_ECORE)
                .count()
        );
        Self { processors, hybrid }
    }

    /// Build from an explicit processor list (tests).
    pub fn from_processors(processors: Vec<LogicalProcessor>) -> Self {
        let hybrid = processors
            .iter()
            .any(|p| p.efficiency_class == EFFICIENCY_CLASS_ECORE)
            && processors
                .iter()
                .any(|p| p.efficiency_class == EFFICIENCY_CLASS_PCORE);
        Self { processors, hybrid }
    }

    pub fn enumerate_logical_processors(&self) -> &[LogicalProcessor] {
        &self.processors
    }

    pub fn is_hybrid(&self) -> bool {
        self.hybrid
    }

    pub fn all_mask(&self) -> u64 {
        self.processors.iter().fold(0, |m, p| m | p.affinity_bit)
    }

    pub fn p_core_mask(&self) -> u64 {
        self.mask_for_class(EFFICIENCY_CLASS_PCORE)
    }

    pub fn e_core_mask(&self) -> u64 {
        self.mask_for_class(EFFICIENCY_CLASS_ECORE)
    }

    fn mask_for_class(&self, class: u8) -> u64 {
        self.processors
            .iter()
            .filter(|p| p.efficiency_class == class)
            .fold(0, |m, p| m | p.affinity_bit)
    }

    /// Apply an affinity mask to a process. Refuses `mask = 0` and bits
    /// outside the known processor set.
    pub fn set_process_affinity(&self, pid: u32, mask: u64) -> HwResult<()> {
        if mask == 0 {
            return Err(EngineError::HwInvalid(format!(
                "refusing empty affinity mask for pid {}",
                pid
            )));
        }
        let known = self.all_mask();
        if mask & !known != 0 {
            return Err(EngineError::HwInvalid(format!(
                "mask {:#x} names processors outside the package (known {:#x})",
                mask, known
            )));
        }
        set_affinity_os(pid, mask)
    }
}

fn available_cpu_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Parse a kernel cpulist string ("0-11,16-19") into indices. Missing or
/// unreadable files yield an empty list.
fn read_cpulist(path: impl AsRef<Path>) -> Vec<usize> {
    let raw = match std::fs::read_to_string(path.as_ref()) {
        Ok(r) => r,
        Err(_) => return Vec::new(),
    };
    parse_cpulist(raw.trim())
}

fn parse_cpulist(list: &str) -> Vec<usize> {
    let mut cpus = Vec::new();
    for part in list.split(',').filter(|p| !p.is_empty()) {
        if let Some((start, end)) = part.split_once('-') {
            if let (Ok(s), Ok(e)) = (start.trim().parse::<usize>(), end.trim().parse::<usize>()) {
                if s <= e {
                    cpus.extend(s..=e);
                }
            }
        } else if let Ok(v) = part.trim().parse::<usize>() {
            cpus.push(v);
        }
    }
    cpus
}

#[cfg(unix)]
fn set_affinity_os(pid: u32, mask: u64) -> HwResult<()> {
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        for bit in 0..64 {
            if mask & (1u64 << bit) != 0 {
                libc::CPU_SET(bit as usize, &mut set);
            }
        }
        let rc = libc::sched_setaffinity(
            pid as libc::pid_t,
            std::mem::size_of::<libc::cpu_set_t>(),
            &set,
        );
        if rc != 0 {
            let err = std::io::Error::last_os_error();
            debug!("Hal: sched_setaffinity(pid={}, mask={:#x}) failed: {}", pid, mask, err);
            return Err(err.into());
        }
    }
    Ok(())
}

#[cfg(not(unix))]
fn set_affinity_os(_pid: u32, _mask: u64) -> HwResult<()> {
    Err(EngineError::HwUnavailable(
        "process affinity not supported on this platform".into(),
    ))
}

/// Nice value of a process, read from the OS scheduler interface. None
/// when the process is gone or the field cannot be parsed. Negative nice
/// means elevated priority.
pub fn process_nice(pid: u32) -> Option<i32> {
    let stat = std::fs::read_to_string(format!("/proc/{}/stat", pid)).ok()?;
    // Field 19 (1-based), after the parenthesized comm which may itself
    // contain spaces; skip past the closing paren first.
    let after_comm = stat.rsplit_once(')')?.1;
    after_comm.split_whitespace().nth(16)?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hybrid_topology() -> CpuTopology {
        // 4 P-cores (0-3), 4 E-cores (4-7).
        let mut processors = Vec::new();
        for i in 0..8 {
            processors.push(LogicalProcessor {
                lp_index: i,
                group: 0,
                efficiency_class: if i < 4 {
                    EFFICIENCY_CLASS_PCORE
                } else {
                    EFFICIENCY_CLASS_ECORE
                },
                affinity_bit: 1 << i,
            });
        }
        CpuTopology::from_processors(processors)
    }

    #[test]
    fn cpulist_parsing() {
        assert_eq!(parse_cpulist("0-3"), vec![0, 1, 2, 3]);
        assert_eq!(parse_cpulist("0-1,4,6-7"), vec![0, 1, 4, 6, 7]);
        assert_eq!(parse_cpulist(""), Vec::<usize>::new());
        assert_eq!(parse_cpulist("garbage"), Vec::<usize>::new());
    }

    #[test]
    fn masks_partition_the_package() {
        let topo = hybrid_topology();
        assert!(topo.is_hybrid());
        assert_eq!(topo.p_core_mask(), 0x0F);
        assert_eq!(topo.e_core_mask(), 0xF0);
        assert_eq!(topo.all_mask(), 0xFF);
        assert_eq!(topo.p_core_mask() & topo.e_core_mask(), 0);
    }

    #[test]
    fn empty_mask_is_refused() {
        let topo = hybrid_topology();
        match topo.set_process_affinity(1234, 0) {
            Err(EngineError::HwInvalid(_)) => {}
            other => panic!("expected HwInvalid, got {:?}", other),
        }
    }

    #[test]
    fn out_of_package_bits_are_refused() {
        let topo = hybrid_topology();
        match topo.set_process_affinity(1234, 0x100) {
            Err(EngineError::HwInvalid(_)) => {}
            other => panic!("expected HwInvalid, got {:?}", other),
        }
    }
}
