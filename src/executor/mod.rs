//! Action executor
//!
//! Applies the planner's ordered list through the hardware access layer.
//! Every action runs on a blocking worker under a per-action timeout
//! (default 15 s); a failed or timed-out action is reported and the next
//! one still runs. After a success the action is appended to the
//! originating agent's history and dwell-guarded transitions are recorded
//! for the planner.

use crate::action::{fan_pct_to_ec_byte, Action, ActionValue, ControlTarget, FanProfile};
use crate::agents::ActionHistory;
use crate::error::{EngineError, HwResult};
use crate::hal::ec::{
    EC_REG_FAN1_DUTY, EC_REG_FAN2_DUTY, EC_REG_FAN_PROFILE, EC_REG_KBD_BACKLIGHT,
    EC_REG_PANEL_BACKLIGHT,
};
use crate::hal::power::{
    PowerMode, SETTING_CORE_PARK_MAX, SETTING_CORE_PARK_MIN, SETTING_MEMORY_PROFILE,
    SUBGROUP_PROCESSOR, SUBGROUP_VENDOR_MEMORY,
};
use crate::hal::Hal;
use crate::planner::DwellTracker;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Per-action execution deadline.
pub const ACTION_TIMEOUT: Duration = Duration::from_secs(15);

/// What happened to one tick's accepted actions.
#[derive(Debug, Default)]
pub struct ExecutionReport {
    pub executed: Vec<Action>,
    pub failed: Vec<(Action, EngineError)>,
    pub duration: Duration,
}

pub struct Executor {
    hal: Arc<Hal>,
    histories: Arc<Mutex<HashMap<String, ActionHistory>>>,
    dwell: Arc<DwellTracker>,
    timeout: Duration,
}

impl Executor {
    pub fn new(
        hal: Arc<Hal>,
        histories: Arc<Mutex<HashMap<String, ActionHistory>>>,
        dwell: Arc<DwellTracker>,
    ) -> Self {
        Self {
            hal,
            histories,
            dwell,
            timeout: ACTION_TIMEOUT,
        }
    }

    /// Execute the ordered list. Failures never abort the batch.
    pub async fn execute(&self, actions: Vec<Action>) -> ExecutionReport {
        let started = Instant::now();
        let mut report = ExecutionReport::default();

        for action in actions {
            let hal = self.hal.clone();
            let work = action.clone();
            let result = tokio::time::timeout(
                self.timeout,
                tokio::task::spawn_blocking(move || apply(&hal, &work)),
            )
            .await;

            let outcome: HwResult<()> = match result {
                Ok(Ok(inner)) => inner,
                Ok(Err(join_err)) => Err(EngineError::Unexpected(format!(
                    "executor worker died: {}",
                    join_err
                ))),
                Err(_) => Err(EngineError::HwTransient(format!(
                    "action on {} timed out after {:?}",
                    action.target, self.timeout
                ))),
            };

            match outcome {
                Ok(()) => {
                    debug!(
                        "Executor: {} = {} ({}: {})",
                        action.target, action.value, action.origin_agent, action.rationale
                    );
                    if action.target == ControlTarget::GpuHybridMode {
                        self.dwell.record_gpu_transition();
                    }
                    let mut histories =
                        self.histories.lock().unwrap_or_else(|e| e.into_inner());
                    histories
                        .entry(action.origin_agent.clone())
                        .or_default()
                        .record(action.target, &action.value);
                    drop(histories);
                    report.executed.push(action);
                }
                Err(e) => {
                    warn!(
                        "Executor: {} = {} failed: {} ({})",
                        action.target, action.value, e, action.origin_agent
                    );
                    report.failed.push((action, e));
                }
            }
        }

        report.duration = started.elapsed();
        report
    }
}

fn fan_profile_code(profile: FanProfile) -> u8 {
    match profile {
        FanProfile::Quiet => 0x01,
        FanProfile::Balanced => 0x02,
        FanProfile::Performance => 0x03,
        FanProfile::Custom => 0x04,
    }
}

fn memory_profile_index(profile: crate::action::MemoryProfile) -> u32 {
    match profile {
        crate::action::MemoryProfile::Performance => 0,
        crate::action::MemoryProfile::Balanced => 1,
        crate::action::MemoryProfile::MaxPowerSaving => 2,
    }
}

/// Route one action to its HAL primitive (or tight composition). A value
/// that does not fit its target is invalid data, not a crash.
fn apply(hal: &Hal, action: &Action) -> HwResult<()> {
    match (&action.target, &action.value) {
        (ControlTarget::FanProfile, ActionValue::FanProfile(profile)) => hal
            .ec
            .write_register(EC_REG_FAN_PROFILE, fan_profile_code(*profile)),
        (ControlTarget::FanSpeedCpu, ActionValue::Percent(pct)) => hal
            .ec
            .write_register(EC_REG_FAN1_DUTY, fan_pct_to_ec_byte(*pct)),
        (ControlTarget::FanSpeedGpu, ActionValue::Percent(pct)) => hal
            .ec
            .write_register(EC_REG_FAN2_DUTY, fan_pct_to_ec_byte(*pct)),
        (ControlTarget::FanFullSpeed, ActionValue::Switch(true)) => {
            hal.ec.write_register(EC_REG_FAN1_DUTY, 0xFF)?;
            hal.ec.write_register(EC_REG_FAN2_DUTY, 0xFF)
        }
        // Releasing full speed is implicit: the thermal agent resumes its
        // curve once temperatures drop, so false has nothing to write.
        (ControlTarget::FanFullSpeed, ActionValue::Switch(false)) => Ok(()),
        (ControlTarget::GpuHybridMode, ActionValue::GpuMode(mode)) => {
            hal.gpu.set_hybrid_mode(*mode)
        }
        (ControlTarget::CpuPerfCtlRatio, ActionValue::PerfRatio(ratio)) => {
            hal.msr.set_perf_ratio(*ratio, false)
        }
        (ControlTarget::CstateLimit, ActionValue::Cstate(limit)) => {
            hal.msr.set_cstate_limit(limit.limit_code())
        }
        (ControlTarget::CoreParkMinPct, ActionValue::Percent(pct)) => {
            let value = *pct as u32;
            hal.scheme.set_power_scheme_value(
                SUBGROUP_PROCESSOR,
                SETTING_CORE_PARK_MIN,
                value,
                PowerMode::Ac,
            )?;
            hal.scheme.set_power_scheme_value(
                SUBGROUP_PROCESSOR,
                SETTING_CORE_PARK_MIN,
                value,
                PowerMode::Dc,
            )?;
            hal.scheme.activate_current()
        }
        (ControlTarget::CoreParkMaxPct, ActionValue::Percent(pct)) => {
            let value = *pct as u32;
            hal.scheme.set_power_scheme_value(
                SUBGROUP_PROCESSOR,
                SETTING_CORE_PARK_MAX,
                value,
                PowerMode::Ac,
            )?;
            hal.scheme.set_power_scheme_value(
                SUBGROUP_PROCESSOR,
                SETTING_CORE_PARK_MAX,
                value,
                PowerMode::Dc,
            )?;
            hal.scheme.activate_current()
        }
        (ControlTarget::RefreshRateHz, ActionValue::RefreshHz(hz)) => {
            hal.display.set_refresh_rate(*hz)
        }
        (ControlTarget::DisplayBrightness, ActionValue::Percent(pct)) => hal
            .ec
            .write_register(EC_REG_PANEL_BACKLIGHT, fan_pct_to_ec_byte(*pct)),
        (ControlTarget::KbdBrightness, ActionValue::Percent(pct)) => hal
            .ec
            .write_register(EC_REG_KBD_BACKLIGHT, fan_pct_to_ec_byte(*pct)),
        (ControlTarget::ProcessAffinity, ActionValue::Affinity { pid, mask }) => {
            hal.topology.set_process_affinity(*pid, *mask)
        }
        (ControlTarget::WifiPsaveMode, ActionValue::Wifi(mode)) => {
            hal.wifi.set_psave_mode(*mode)
        }
        (ControlTarget::MemoryProfile, ActionValue::Memory(profile)) => {
            let value = memory_profile_index(*profile);
            hal.scheme.set_power_scheme_value(
                SUBGROUP_VENDOR_MEMORY,
                SETTING_MEMORY_PROFILE,
                value,
                PowerMode::Ac,
            )?;
            hal.scheme.set_power_scheme_value(
                SUBGROUP_VENDOR_MEMORY,
                SETTING_MEMORY_PROFILE,
                value,
                PowerMode::Dc,
            )
        }
        (target, value) => Err(EngineError::HwInvalid(format!(
            "value {} does not fit control {}",
            value, target
        ))),
    }
}
