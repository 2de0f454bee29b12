use clap::{Args, Parser, Subcommand};
use powerpilot::config::{Config, FeatureFlags};
use powerpilot::engine::{append_control_command, running_engine_pid, ControlCommand};
use powerpilot::{ControlTarget, HybridMode, PublishedHealth, Scenario};
use std::time::{Duration, Instant};

/// Exit codes shared with scripts and the UI.
const EXIT_OK: i32 = 0;
const EXIT_NOT_RUNNING: i32 = 2;
const EXIT_NOT_AVAILABLE: i32 = 3;
const EXIT_BAD_ARGS: i32 = 4;

#[derive(Parser, Debug)]
#[command(name = "powerpilot")]
#[command(about = "Autonomous power/thermal optimization engine for laptops")]
#[command(version)]
struct Cli {
    /// Verbosity level (use -v, -vv, or -vvv for increasing verbosity)
    #[arg(short = 'v', action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the engine in the foreground until interrupted
    Start,
    /// Ask a running engine to shut down
    Stop,
    /// Print the latest published snapshot as JSON and exit
    Snapshot,
    /// Force a GPU hybrid mode at critical priority (bypasses dwell)
    ForceGpuMode(ForceGpuModeArgs),
    /// Record or clear a user override (cooling period)
    Override(OverrideArgs),
    /// Print component health as JSON and exit
    Health,
}

#[derive(Args, Debug)]
struct ForceGpuModeArgs {
    /// One of: off, on, igpu-only, auto
    mode: String,
    /// Why the mode is being forced (journaled)
    #[arg(long)]
    reason: String,
}

#[derive(Args, Debug)]
struct OverrideArgs {
    /// record or clear
    action: String,
    /// Control name, e.g. REFRESH_RATE_HZ
    #[arg(long)]
    control: String,
    /// Value the user chose (JSON or plain string); required for record
    #[arg(long)]
    value: Option<String>,
    /// Scenario driving the cooling period TTL
    #[arg(long)]
    scenario: Option<String>,
}

fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            // Help/version requests are not argument errors.
            if matches!(
                e.kind(),
                clap::error::ErrorKind::DisplayHelp | clap::error::ErrorKind::DisplayVersion
            ) {
                let _ = e.print();
                std::process::exit(EXIT_OK);
            }
            let _ = e.print();
            std::process::exit(EXIT_BAD_ARGS);
        }
    };

    let verbosity = cli.verbose.min(3);
    powerpilot::init_tracing(verbosity, Some(Config::log_file_path()));

    let code = match cli.command {
        Command::Start => cmd_start(),
        Command::Stop => cmd_stop(),
        Command::Snapshot => cmd_snapshot(),
        Command::ForceGpuMode(args) => cmd_force_gpu_mode(args),
        Command::Override(args) => cmd_override(args),
        Command::Health => cmd_health(),
    };
    std::process::exit(code);
}

fn cmd_start() -> i32 {
    if let Some(pid) = running_engine_pid() {
        eprintln!("engine already running (pid {})", pid);
        return EXIT_OK;
    }
    let runtime = match tokio::runtime::Runtime::new() {
        Ok(r) => r,
        Err(e) => {
            eprintln!("failed to create runtime: {}", e);
            return EXIT_NOT_AVAILABLE;
        }
    };
    let flags = FeatureFlags::from_env();
    match runtime.block_on(powerpilot::run_foreground(flags)) {
        Ok(()) => EXIT_OK,
        Err(e) => {
            eprintln!("engine failed: {}", e);
            EXIT_NOT_AVAILABLE
        }
    }
}

fn cmd_stop() -> i32 {
    let pid = match running_engine_pid() {
        Some(pid) => pid,
        None => {
            eprintln!("engine is not running");
            return EXIT_NOT_RUNNING;
        }
    };
    if let Err(e) = append_control_command(&ControlCommand::Stop) {
        eprintln!("could not signal engine: {}", e);
        return EXIT_NOT_AVAILABLE;
    }
    // The engine polls the control file on its medium tick; give it a few
    // seconds to drain and exit.
    let deadline = Instant::now() + Duration::from_secs(8);
    while Instant::now() < deadline {
        if running_engine_pid().is_none() {
            println!("engine stopped");
            return EXIT_OK;
        }
        std::thread::sleep(Duration::from_millis(200));
    }
    eprintln!("engine (pid {}) did not stop within the deadline", pid);
    EXIT_NOT_AVAILABLE
}

fn cmd_snapshot() -> i32 {
    if running_engine_pid().is_none() {
        eprintln!("engine is not running");
        return EXIT_NOT_RUNNING;
    }
    match std::fs::read_to_string(Config::snapshot_file_path()) {
        Ok(json) => {
            println!("{}", json);
            EXIT_OK
        }
        Err(_) => {
            eprintln!("no snapshot published yet");
            EXIT_NOT_RUNNING
        }
    }
}

fn cmd_health() -> i32 {
    if running_engine_pid().is_none() {
        eprintln!("engine is not running");
        return EXIT_NOT_RUNNING;
    }
    match std::fs::read_to_string(Config::health_file_path()) {
        Ok(json) => {
            println!("{}", json);
            EXIT_OK
        }
        Err(_) => {
            eprintln!("no health report published yet");
            EXIT_NOT_RUNNING
        }
    }
}

fn cmd_force_gpu_mode(args: ForceGpuModeArgs) -> i32 {
    let mode: HybridMode = match args.mode.parse() {
        Ok(m) => m,
        Err(e) => {
            eprintln!("{}", e);
            return EXIT_BAD_ARGS;
        }
    };
    if running_engine_pid().is_none() {
        eprintln!("engine is not running");
        return EXIT_NOT_RUNNING;
    }
    // The published health report carries the capability probe; forcing a
    // GPU mode on a machine without GPU control is a hardware error, not
    // a usage error.
    if let Ok(json) = std::fs::read_to_string(Config::health_file_path()) {
        if let Ok(health) = serde_json::from_str::<PublishedHealth>(&json) {
            if !health.capabilities.has_gpu_control {
                eprintln!("GPU mode control is not available on this machine");
                return EXIT_NOT_AVAILABLE;
            }
        }
    }
    match append_control_command(&ControlCommand::ForceGpuMode {
        mode,
        reason: args.reason,
    }) {
        Ok(()) => {
            println!("requested GPU mode {}", mode);
            EXIT_OK
        }
        Err(e) => {
            eprintln!("could not signal engine: {}", e);
            EXIT_NOT_AVAILABLE
        }
    }
}

fn cmd_override(args: OverrideArgs) -> i32 {
    let control: ControlTarget = match args.control.parse() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("{}", e);
            return EXIT_BAD_ARGS;
        }
    };
    let scenario: Option<Scenario> = match args.scenario.as_deref().map(str::parse).transpose() {
        Ok(s) => s,
        Err(e) => {
            eprintln!("{}", e);
            return EXIT_BAD_ARGS;
        }
    };

    let command = match args.action.as_str() {
        "record" => {
            let raw = match args.value {
                Some(v) => v,
                None => {
                    eprintln!("override record requires --value");
                    return EXIT_BAD_ARGS;
                }
            };
            // Accept either JSON ("60", "true") or a bare string ("quiet").
            let value = serde_json::from_str(&raw)
                .unwrap_or_else(|_| serde_json::Value::String(raw.clone()));
            ControlCommand::OverrideRecord {
                control,
                value,
                scenario,
            }
        }
        "clear" => ControlCommand::OverrideClear { control },
        other => {
            eprintln!("unknown override action {:?} (expected record or clear)", other);
            return EXIT_BAD_ARGS;
        }
    };

    if running_engine_pid().is_none() {
        eprintln!("engine is not running");
        return EXIT_NOT_RUNNING;
    }
    match append_control_command(&command) {
        Ok(()) => {
            println!("override {} queued for {}", args.action, control);
            EXIT_OK
        }
        Err(e) => {
            eprintln!("could not signal engine: {}", e);
            EXIT_NOT_AVAILABLE
        }
    }
}
