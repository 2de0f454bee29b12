//! Action vocabulary shared by agents, planner and executor
//!
//! An `Action` names one actuator (`ControlTarget`), a target-typed value,
//! a priority and the proposing agent. Agents bundle actions into
//! `Proposal`s; the planner filters and orders them; the executor applies
//! them one by one through the hardware access layer.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Closed set of controls the engine may drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlTarget {
    FanProfile,
    FanSpeedCpu,
    FanSpeedGpu,
    FanFullSpeed,
    GpuHybridMode,
    CpuPerfCtlRatio,
    CstateLimit,
    CoreParkMinPct,
    CoreParkMaxPct,
    RefreshRateHz,
    DisplayBrightness,
    KbdBrightness,
    ProcessAffinity,
    WifiPsaveMode,
    MemoryProfile,
}

impl ControlTarget {
    pub const ALL: [ControlTarget; 15] = [
        ControlTarget::FanProfile,
        ControlTarget::FanSpeedCpu,
        ControlTarget::FanSpeedGpu,
        ControlTarget::FanFullSpeed,
        ControlTarget::GpuHybridMode,
        ControlTarget::CpuPerfCtlRatio,
        ControlTarget::CstateLimit,
        ControlTarget::CoreParkMinPct,
        ControlTarget::CoreParkMaxPct,
        ControlTarget::RefreshRateHz,
        ControlTarget::DisplayBrightness,
        ControlTarget::KbdBrightness,
        ControlTarget::ProcessAffinity,
        ControlTarget::WifiPsaveMode,
        ControlTarget::MemoryProfile,
    ];

    /// Canonical wire name (`FAN_PROFILE`, `REFRESH_RATE_HZ`, ...).
    pub fn as_str(&self) -> &'static str {
        match self {
            ControlTarget::FanProfile => "FAN_PROFILE",
            ControlTarget::FanSpeedCpu => "FAN_SPEED_CPU",
            ControlTarget::FanSpeedGpu => "FAN_SPEED_GPU",
            ControlTarget::FanFullSpeed => "FAN_FULL_SPEED",
            ControlTarget::GpuHybridMode => "GPU_HYBRID_MODE",
            ControlTarget::CpuPerfCtlRatio => "CPU_PERF_CTL_RATIO",
            ControlTarget::CstateLimit => "CSTATE_LIMIT",
            ControlTarget::CoreParkMinPct => "CORE_PARK_MIN_PCT",
            ControlTarget::CoreParkMaxPct => "CORE_PARK_MAX_PCT",
            ControlTarget::RefreshRateHz => "REFRESH_RATE_HZ",
            ControlTarget::DisplayBrightness => "DISPLAY_BRIGHTNESS",
            ControlTarget::KbdBrightness => "KBD_BRIGHTNESS",
            ControlTarget::ProcessAffinity => "PROCESS_AFFINITY",
            ControlTarget::WifiPsaveMode => "WIFI_PSAVE_MODE",
            ControlTarget::MemoryProfile => "MEMORY_PROFILE",
        }
    }
}

impl fmt::Display for ControlTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ControlTarget {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ControlTarget::ALL
            .iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(s))
            .copied()
            .ok_or_else(|| format!("unknown control {:?}", s))
    }
}

/// Fan behaviour presets selected through the EC profile register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FanProfile {
    Quiet,
    Balanced,
    Performance,
    Custom,
}

/// Hybrid graphics mode. `Off` disables hybrid switching (discrete GPU
/// drives everything), `IGpuOnly` powers the discrete GPU down entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HybridMode {
    On,
    Off,
    IGpuOnly,
    Auto,
}

impl fmt::Display for HybridMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HybridMode::On => "on",
            HybridMode::Off => "off",
            HybridMode::IGpuOnly => "igpu-only",
            HybridMode::Auto => "auto",
        };
        f.write_str(s)
    }
}

impl FromStr for HybridMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "on" => Ok(HybridMode::On),
            "off" => Ok(HybridMode::Off),
            "igpu-only" | "igpuonly" => Ok(HybridMode::IGpuOnly),
            "auto" => Ok(HybridMode::Auto),
            other => Err(format!("unknown gpu mode {:?}", other)),
        }
    }
}

/// Package C-state limit codes for MSR 0xE2 (bits 2:0).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CstateLimit {
    Unlimited,
    C2,
    C3,
    C6,
    C7,
    C8,
    C10,
}

impl CstateLimit {
    /// Limit code written to MSR_PKG_C_STATE_LIMIT bits 2:0.
    pub fn limit_code(&self) -> u64 {
        match self {
            CstateLimit::Unlimited => 0,
            CstateLimit::C2 => 1,
            CstateLimit::C3 => 2,
            CstateLimit::C6 => 3,
            CstateLimit::C7 => 4,
            CstateLimit::C8 => 5,
            CstateLimit::C10 => 7,
        }
    }
}

/// Wi-Fi adapter power save mode (vendor-opaque actuator).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WifiPsaveMode {
    Disabled,
    MediumPsp,
    MaxPsp,
}

/// Memory subsystem power profile (vendor-opaque actuator).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryProfile {
    Performance,
    Balanced,
    MaxPowerSaving,
}

/// Target-typed action value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionValue {
    /// Percentage 0-100 (fan speed, brightness, core parking).
    Percent(f32),
    /// Boolean switch (fan full speed).
    Switch(bool),
    FanProfile(FanProfile),
    GpuMode(HybridMode),
    /// Requested performance ratio for IA32_PERF_CTL (ratio * 100 MHz).
    PerfRatio(u8),
    Cstate(CstateLimit),
    RefreshHz(u32),
    /// CPU affinity mask for one process. A zero mask is rejected before
    /// it can reach the hardware layer.
    Affinity { pid: u32, mask: u64 },
    Wifi(WifiPsaveMode),
    Memory(MemoryProfile),
}

impl ActionValue {
    /// JSON form used for override matching and the journals.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

impl fmt::Display for ActionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActionValue::Percent(p) => write!(f, "{:.0}%", p),
            ActionValue::Switch(b) => write!(f, "{}", b),
            ActionValue::FanProfile(p) => write!(f, "{:?}", p),
            ActionValue::GpuMode(m) => write!(f, "{}", m),
            ActionValue::PerfRatio(r) => write!(f, "ratio {}", r),
            ActionValue::Cstate(c) => write!(f, "{:?}", c),
            ActionValue::RefreshHz(hz) => write!(f, "{} Hz", hz),
            ActionValue::Affinity { pid, mask } => write!(f, "pid {} mask {:#x}", pid, mask),
            ActionValue::Wifi(w) => write!(f, "{:?}", w),
            ActionValue::Memory(m) => write!(f, "{:?}", m),
        }
    }
}

/// Proposal priority. Critical bypasses override filtering and dwell.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    #[default]
    Normal,
    High,
    Critical,
}

/// One actuator change, proposed by an agent, consumed at most once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    pub target: ControlTarget,
    pub value: ActionValue,
    pub priority: Priority,
    pub origin_agent: String,
    pub rationale: String,
}

impl Action {
    pub fn new(
        target: ControlTarget,
        value: ActionValue,
        priority: Priority,
        origin_agent: &str,
        rationale: impl Into<String>,
    ) -> Self {
        Self {
            target,
            value,
            priority,
            origin_agent: origin_agent.to_string(),
            rationale: rationale.into(),
        }
    }
}

/// Bag of actions from one agent for one tick.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Proposal {
    pub agent: String,
    pub actions: Vec<Action>,
    pub priority: Priority,
}

impl Proposal {
    pub fn empty(agent: &str) -> Self {
        Self {
            agent: agent.to_string(),
            actions: Vec::new(),
            priority: Priority::Normal,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }
}

/// Translate a fan percentage into the EC duty byte.
/// Round-trip law: `ec_byte(pct) == round(pct * 255 / 100)`.
pub fn fan_pct_to_ec_byte(pct: f32) -> u8 {
    let clamped = pct.clamp(0.0, 100.0);
    (clamped * 255.0 / 100.0).round() as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_target_round_trips_names() {
        for target in ControlTarget::ALL {
            let parsed: ControlTarget = target.as_str().parse().unwrap();
            assert_eq!(parsed, target);
        }
        assert!("NOT_A_CONTROL".parse::<ControlTarget>().is_err());
    }

    #[test]
    fn control_target_serde_uses_wire_names() {
        let json = serde_json::to_string(&ControlTarget::RefreshRateHz).unwrap();
        assert_eq!(json, "\"REFRESH_RATE_HZ\"");
    }

    #[test]
    fn hybrid_mode_parses_cli_forms() {
        assert_eq!("igpu-only".parse::<HybridMode>().unwrap(), HybridMode::IGpuOnly);
        assert_eq!("OFF".parse::<HybridMode>().unwrap(), HybridMode::Off);
        assert!("dgpu".parse::<HybridMode>().is_err());
    }

    #[test]
    fn fan_pct_translation_rounds() {
        assert_eq!(fan_pct_to_ec_byte(0.0), 0);
        assert_eq!(fan_pct_to_ec_byte(100.0), 255);
        assert_eq!(fan_pct_to_ec_byte(50.0), 128); // round(127.5)
        // Out-of-range input clamps instead of wrapping.
        assert_eq!(fan_pct_to_ec_byte(150.0), 255);
        assert_eq!(fan_pct_to_ec_byte(-3.0), 0);
    }

    #[test]
    fn cstate_limit_codes_match_msr_contract() {
        assert_eq!(CstateLimit::Unlimited.limit_code(), 0);
        assert_eq!(CstateLimit::C10.limit_code(), 7);
    }

    #[test]
    fn priority_ordering() {
        assert!(Priority::Critical > Priority::High);
        assert!(Priority::High > Priority::Normal);
    }
}
