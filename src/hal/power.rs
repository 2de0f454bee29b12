//! Power scheme values through the vendor power tool
//!
//! Core parking and related knobs are standard power-policy settings
//! addressed by `(subgroup GUID, setting GUID)` pairs and written
//! separately for AC and DC. The engine shells out to the platform power
//! tool; every invocation is bounded by a 1 s timeout and a non-zero exit
//! is swallowed with a logged warning (the tool is chatty about harmless
//! conditions).

use crate::error::{EngineError, HwResult};
use crate::hal::HalCounters;
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Processor settings subgroup (core parking lives here).
pub const SUBGROUP_PROCESSOR: &str = "54533251-82be-4824-96c1-47b60b740d00";
/// Minimum percentage of unparked cores.
pub const SETTING_CORE_PARK_MIN: &str = "0cc5b647-c1df-4637-891a-dec35c318583";
/// Maximum percentage of unparked cores.
pub const SETTING_CORE_PARK_MAX: &str = "ea062031-0e34-4ff1-9b6d-eb1059334028";
/// Core parking increase threshold.
pub const SETTING_CORE_PARK_INCREASE: &str = "2ddd5a84-5a71-437e-912a-db0b8c788732";
/// Core parking decrease threshold.
pub const SETTING_CORE_PARK_DECREASE: &str = "68dd2f27-e4ee-4539-a929-7e7bba40db5d";
/// Vendor memory power profile setting (opaque actuator).
pub const SUBGROUP_VENDOR_MEMORY: &str = "8619b916-e004-4dd8-9b66-dae86f806698";
pub const SETTING_MEMORY_PROFILE: &str = "36687f9e-e3a5-4dbf-b1dc-15eb381c6863";

const TOOL_TIMEOUT: Duration = Duration::from_secs(1);

/// AC vs battery: the two halves of a scheme are written separately.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerMode {
    Ac,
    Dc,
}

/// Seam over the platform power tool.
pub trait SchemeTool: Send + Sync {
    /// Run one invocation; returns captured stdout. Non-zero exit is the
    /// implementation's concern (production swallows it with a warning).
    fn run(&self, args: &[&str]) -> HwResult<String>;
}

/// Production tool: `powercfg`, invoked with a hard 1 s deadline.
pub struct PowercfgTool;

impl PowercfgTool {
    pub fn probe() -> Option<Self> {
        match Command::new("powercfg")
            .arg("/?")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
        {
            Ok(_) => Some(Self),
            Err(_) => None,
        }
    }
}

impl SchemeTool for PowercfgTool {
    fn run(&self, args: &[&str]) -> HwResult<String> {
        let mut child = Command::new("powercfg")
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| EngineError::HwTransient(format!("powercfg spawn: {}", e)))?;

        let deadline = Instant::now() + TOOL_TIMEOUT;
        loop {
            match child.try_wait() {
                Ok(Some(status)) => {
                    let output = child
                        .wait_with_output()
                        .map_err(|e| EngineError::HwTransient(format!("powercfg wait: {}", e)))?;
                    if !status.success() {
                        warn!(
                            "Hal: powercfg {:?} exited with {:?}",
                            args,
                            status.code()
                        );
                    }
                    return Ok(String::from_utf8_lossy(&output.stdout).into_owned());
                }
                Ok(None) => {
                    if Instant::now() >= deadline {
                        let _ = child.kill();
                        let _ = child.wait();
                        return Err(EngineError::HwTransient(format!(
                            "powercfg {:?} timed out after {:?}",
                            args, TOOL_TIMEOUT
                        )));
                    }
                    std::thread::sleep(Duration::from_millis(10));
                }
                Err(e) => {
                    return Err(EngineError::HwTransient(format!("powercfg poll: {}", e)))
                }
            }
        }
    }
}

/// Typed access to power scheme values.
pub struct PowerSchemes {
    tool: Option<Box<dyn SchemeTool>>,
    counters: Arc<HalCounters>,
}

impl PowerSchemes {
    pub fn probe(counters: Arc<HalCounters>) -> Self {
        let tool: Option<Box<dyn SchemeTool>> = match PowercfgTool::probe() {
            Some(t) => Some(Box::new(t)),
            None => {
                debug!("Hal: power tool absent, scheme writes disabled");
                None
            }
        };
        Self { tool, counters }
    }

    pub fn with_tool(tool: Box<dyn SchemeTool>, counters: Arc<HalCounters>) -> Self {
        Self {
            tool: Some(tool),
            counters,
        }
    }

    /// A scheme layer with no tool; every call reports `HwUnavailable`.
    pub fn unavailable(counters: Arc<HalCounters>) -> Self {
        Self {
            tool: None,
            counters,
        }
    }

    pub fn is_available(&self) -> bool {
        self.tool.is_some()
    }

    fn tool(&self) -> HwResult<&dyn SchemeTool> {
        self.tool
            .as_deref()
            .ok_or_else(|| EngineError::HwUnavailable("power tool absent".into()))
    }

    /// Write one scheme value for one mode. The value applies after the
    /// active scheme is re-activated (see `activate_current`).
    pub fn set_power_scheme_value(
        &self,
        subgroup_guid: &str,
        setting_guid: &str,
        value: u32,
        mode: PowerMode,
    ) -> HwResult<()> {
        let verb = match mode {
            PowerMode::Ac => "/setacvalueindex",
            PowerMode::Dc => "/setdcvalueindex",
        };
        let scheme = self.get_active_scheme()?;
        let value_str = value.to_string();
        self.tool()?
            .run(&[verb, &scheme, subgroup_guid, setting_guid, &value_str])
            .map_err(|e| {
                self.counters.record_failure("set_power_scheme_value");
                e
            })?;
        Ok(())
    }

    /// Currently active scheme GUID.
    pub fn get_active_scheme(&self) -> HwResult<String> {
        let output = self.tool()?.run(&["/getactivescheme"]).map_err(|e| {
            self.counters.record_failure("get_active_scheme");
            e
        })?;
        let re = regex::Regex::new(
            r"([0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12})",
        )
        .unwrap();
        re.captures(&output)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_ascii_lowercase())
            .ok_or_else(|| EngineError::HwInvalid("no GUID in active scheme output".into()))
    }

    /// Re-activate the current scheme so newly written values take effect.
    pub fn activate_current(&self) -> HwResult<()> {
        let scheme = self.get_active_scheme()?;
        self.tool()?.run(&["/setactive", &scheme]).map_err(|e| {
            self.counters.record_failure("activate_scheme");
            e
        })?;
        Ok(())
    }

    /// Core parking floor/ceiling, written to both AC and DC halves.
    pub fn set_core_parking(&self, min_pct: u32, max_pct: u32) -> HwResult<()> {
        for mode in [PowerMode::Ac, PowerMode::Dc] {
            self.set_power_scheme_value(SUBGROUP_PROCESSOR, SETTING_CORE_PARK_MIN, min_pct, mode)?;
            self.set_power_scheme_value(SUBGROUP_PROCESSOR, SETTING_CORE_PARK_MAX, max_pct, mode)?;
        }
        self.activate_current()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Records invocations and answers `/getactivescheme` with a fixed GUID.
    struct RecordingTool {
        calls: Arc<Mutex<Vec<Vec<String>>>>,
    }

    impl RecordingTool {
        fn new() -> (Self, Arc<Mutex<Vec<Vec<String>>>>) {
            let calls = Arc::new(Mutex::new(Vec::new()));
            (
                Self {
                    calls: calls.clone(),
                },
                calls,
            )
        }
    }

    impl SchemeTool for RecordingTool {
        fn run(&self, args: &[&str]) -> HwResult<String> {
            self.calls
                .lock()
                .unwrap()
                .push(args.iter().map(|s| s.to_string()).collect());
            if args[0] == "/getactivescheme" {
                return Ok(
                    "Power Scheme GUID: 381b4222-f694-41f0-9685-ff5bb260df2e  (Balanced)\n"
                        .to_string(),
                );
            }
            Ok(String::new())
        }
    }

    #[test]
    fn active_scheme_guid_is_parsed_and_lowercased() {
        let (tool, _calls) = RecordingTool::new();
        let schemes =
            PowerSchemes::with_tool(Box::new(tool), Arc::new(HalCounters::new()));
        assert_eq!(
            schemes.get_active_scheme().unwrap(),
            "381b4222-f694-41f0-9685-ff5bb260df2e"
        );
    }

    #[test]
    fn core_parking_writes_ac_and_dc_then_activates() {
        let (tool, calls) = RecordingTool::new();
        let schemes =
            PowerSchemes::with_tool(Box::new(tool), Arc::new(HalCounters::new()));
        schemes.set_core_parking(25, 50).unwrap();

        let calls = calls.lock().unwrap();
        let verbs: Vec<&str> = calls.iter().map(|c| c[0].as_str()).collect();
        assert!(verbs.contains(&"/setacvalueindex"));
        assert!(verbs.contains(&"/setdcvalueindex"));
        assert_eq!(verbs.last(), Some(&"/setactive"));
        // Every value write names the processor subgroup and a parking GUID.
        for call in calls.iter().filter(|c| c[0].ends_with("valueindex")) {
            assert_eq!(call[2], SUBGROUP_PROCESSOR);
            assert!(call[3] == SETTING_CORE_PARK_MIN || call[3] == SETTING_CORE_PARK_MAX);
        }
    }

    #[test]
    fn missing_tool_is_unavailable() {
        let schemes = PowerSchemes {
            tool: None,
            counters: Arc::new(HalCounters::new()),
        };
        assert!(!schemes.is_available());
        assert!(matches!(
            schemes.get_active_scheme(),
            Err(EngineError::HwUnavailable(_))
        ));
    }
}
