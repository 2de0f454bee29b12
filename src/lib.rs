//! powerpilot library
//!
//! Autonomous power/thermal optimization engine for laptops.
//!
//! ## Architecture
//!
//! The codebase is organized into modules:
//! - `hal`: hardware access layer (EC, MSR, WMI cache, battery, display,
//!   power schemes, GPU, Wi-Fi, CPU topology)
//! - `snapshot`: sensor & context store with atomic snapshot publication
//! - `overrides`: cooling-period / override registry
//! - `agents`: domain agents proposing actions per tick
//! - `planner`: conflict arbitration (overrides, dwell, oscillation, caps)
//! - `executor`: timed action application through the HAL
//! - `orchestrator`: the periodic optimization loop and engine state
//! - `health`: watchdog, recovery backoff, emergency thermal safety
//! - `tick`: master tick service (one clock, four grades)
//! - `persist`: append-only journals and the learner blob
//! - `engine`: assembly and the public API surface
//! - `config` / `logging` / `error` / `action`: ambient plumbing
//!
//! ## Main entry points
//!
//! - `Engine::new(flags)` + `start()` / `stop()` for embedding
//! - `run_foreground(flags)` for the CLI daemon

pub mod action;
pub mod agents;
pub mod config;
pub mod engine;
pub mod error;
pub mod executor;
pub mod hal;
pub mod health;
pub mod logging;
pub mod orchestrator;
pub mod overrides;
pub mod persist;
pub mod planner;
pub mod snapshot;
pub mod tick;

pub use action::{ControlTarget, HybridMode};
pub use config::{Config, FeatureFlags};
pub use engine::{Engine, PublishedHealth};
pub use error::EngineError;
pub use logging::init_tracing;
pub use orchestrator::{EngineState, EngineStats};
pub use overrides::Scenario;
pub use snapshot::Snapshot;

use tracing::{error, info};

/// Run the engine in the foreground until Ctrl-C, `stop()` or a `stop`
/// control command. Installs the pid file for the single-instance guard.
pub async fn run_foreground(flags: FeatureFlags) -> anyhow::Result<()> {
    Config::ensure_data_dir()?;
    if let Some(pid) = engine::running_engine_pid() {
        anyhow::bail!("engine already running (pid {})", pid);
    }
    engine::write_pid_file()?;

    let engine = Engine::new(flags);
    let token = engine.cancelled();
    let ctrlc_token = token.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        info!("Engine: interrupt received, shutting down");
        ctrlc_token.cancel();
    }) {
        error!("Engine: could not install interrupt handler: {}", e);
    }

    engine.start();
    token.cancelled().await;
    engine.stop().await;
    engine::remove_pid_file();
    Ok(())
}
