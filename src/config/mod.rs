//! Configuration module for portable paths and feature flags
//!
//! Provides centralized configuration:
//! - Data directory layout (journals, pid file, published state files)
//! - Optional-subsystem feature flags read once from the environment
//! - Build information (version, authors)
//!
//! All paths live under `$HOME/.powerpilot/engine/` with a temp-dir
//! fallback when HOME is not available.

use std::path::PathBuf;

/// Configuration manager
pub struct Config;

impl Config {
    /// Root data directory: `$HOME/.powerpilot/engine`.
    pub fn data_dir() -> PathBuf {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(".powerpilot").join("engine");
        }
        std::env::temp_dir().join("powerpilot-engine")
    }

    /// Debug log file written by the tracing file layer.
    pub fn log_file_path() -> PathBuf {
        Self::data_dir().join("debug.log")
    }

    /// Append-only journal of override record/clear events.
    pub fn overrides_log_path() -> PathBuf {
        Self::data_dir().join("overrides.log")
    }

    /// Append-only journal of observed user preference changes.
    pub fn preferences_log_path() -> PathBuf {
        Self::data_dir().join("preferences.log")
    }

    /// Rotated health journal (10 MiB cap, 5 generations).
    pub fn health_log_path() -> PathBuf {
        Self::data_dir().join("health.log")
    }

    /// Opaque learner blob with a versioned header.
    pub fn patterns_file_path() -> PathBuf {
        Self::data_dir().join("patterns.bin")
    }

    /// Pid file for the running engine instance.
    pub fn pid_file_path() -> PathBuf {
        Self::data_dir().join("engine.pid")
    }

    /// Latest published snapshot, JSON, rewritten on a medium tick.
    pub fn snapshot_file_path() -> PathBuf {
        Self::data_dir().join("snapshot.json")
    }

    /// Latest component health report, JSON, rewritten on a slow tick.
    pub fn health_file_path() -> PathBuf {
        Self::data_dir().join("health.json")
    }

    /// Command intake file: newline-delimited JSON appended by the CLI,
    /// consumed (and truncated) by the running engine. Mtime-polled.
    pub fn control_file_path() -> PathBuf {
        Self::data_dir().join("control.json")
    }

    /// Ensure the data directory exists.
    pub fn ensure_data_dir() -> std::io::Result<()> {
        std::fs::create_dir_all(Self::data_dir())
    }

    /// Package version from CARGO_PKG_VERSION.
    pub fn version() -> String {
        env!("CARGO_PKG_VERSION").to_string()
    }

    /// Package authors from CARGO_PKG_AUTHORS.
    pub fn authors() -> String {
        env!("CARGO_PKG_AUTHORS").to_string()
    }
}

/// Optional-subsystem switches, read once at startup from the environment.
/// Each variable is `"true"` or `"false"`; anything else (or absence) takes
/// the default for that subsystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeatureFlags {
    pub adaptive_fan_curves: bool,
    pub ml_ai_controller: bool,
    pub reactive_sensors: bool,
    pub object_pooling: bool,
    pub wmi_cache: bool,
    pub telemetry: bool,
}

impl Default for FeatureFlags {
    fn default() -> Self {
        Self {
            adaptive_fan_curves: true,
            ml_ai_controller: false,
            reactive_sensors: true,
            object_pooling: false,
            wmi_cache: true,
            telemetry: false,
        }
    }
}

impl FeatureFlags {
    /// Read all `LLT_FEATURE_*` variables. Unparseable values fall back to
    /// the subsystem default and are logged at debug level.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            adaptive_fan_curves: read_flag(
                "LLT_FEATURE_ADAPTIVEFANCURVES",
                defaults.adaptive_fan_curves,
            ),
            ml_ai_controller: read_flag("LLT_FEATURE_MLAICONTROLLER", defaults.ml_ai_controller),
            reactive_sensors: read_flag("LLT_FEATURE_REACTIVESENSORS", defaults.reactive_sensors),
            object_pooling: read_flag("LLT_FEATURE_OBJECTPOOLING", defaults.object_pooling),
            wmi_cache: read_flag("LLT_FEATURE_WMICACHE", defaults.wmi_cache),
            telemetry: read_flag("LLT_FEATURE_TELEMETRY", defaults.telemetry),
        }
    }
}

fn read_flag(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(v) if v.eq_ignore_ascii_case("true") => true,
        Ok(v) if v.eq_ignore_ascii_case("false") => false,
        Ok(other) => {
            tracing::debug!(
                "Config: ignoring {}={:?}, keeping default {}",
                name,
                other,
                default
            );
            default
        }
        Err(_) => default,
    }
}
