//! Structured logging using tracing
//!
//! Two sinks:
//! - tracing subscriber with a stderr layer and an optional file layer
//!   (no ANSI in files), filter driven by verbosity or `RUST_LOG`
//! - a size-rotated newline-delimited-JSON journal used for health events
//!   (`health.log`, 10 MiB cap, 5 generations)

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize tracing with console and optional file output.
///
/// Verbosity 0-3 maps to error/info/debug/trace. `RUST_LOG` overrides the
/// mapped level when set.
pub fn init_tracing(verbosity: u8, log_file_path: Option<PathBuf>) {
    let filter_level = match verbosity {
        0 => "error",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter_level));

    let registry = tracing_subscriber::registry().with(filter);

    let console_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .with_thread_names(false);

    if let Some(log_path) = log_file_path {
        if let Some(parent) = log_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .ok();

        if let Some(file) = file {
            let file_layer = fmt::layer()
                .with_writer(file)
                .with_target(false)
                .with_thread_ids(false)
                .with_thread_names(false)
                .with_ansi(false);

            registry.with(console_layer).with(file_layer).init();
        } else {
            registry.with(console_layer).init();
        }
    } else {
        registry.with(console_layer).init();
    }
}

/// Size-rotated append-only journal.
///
/// Lines are appended to `<path>`; when the file exceeds `max_bytes` it is
/// renamed to `<path>.1` (shifting `<path>.1` → `<path>.2` and so on, the
/// oldest generation dropped) and a fresh file is started. With
/// `generations = 5` the on-disk set is `health.log` … `health.log.4`.
pub struct RotatingLog {
    path: PathBuf,
    max_bytes: u64,
    generations: usize,
}

impl RotatingLog {
    pub fn new(path: PathBuf, max_bytes: u64, generations: usize) -> Self {
        Self {
            path,
            max_bytes,
            generations: generations.max(1),
        }
    }

    /// Append one line (newline added here). Rotates first when the current
    /// file is at or over the cap. I/O errors are returned, not logged, so
    /// the caller decides whether the journal is critical.
    pub fn append_line(&self, line: &str) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if let Ok(meta) = std::fs::metadata(&self.path) {
            if meta.len() >= self.max_bytes {
                self.rotate()?;
            }
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;
        Ok(())
    }

    fn rotate(&self) -> std::io::Result<()> {
        // Drop the oldest, then shift .3 -> .4, .2 -> .3, ... , base -> .1
        let gen_path = |n: usize| -> PathBuf {
            let mut p = self.path.clone().into_os_string();
            p.push(format!(".{}", n));
            PathBuf::from(p)
        };

        let oldest = gen_path(self.generations - 1);
        if oldest.exists() {
            std::fs::remove_file(&oldest)?;
        }
        for n in (1..self.generations - 1).rev() {
            let from = gen_path(n);
            if from.exists() {
                std::fs::rename(&from, gen_path(n + 1))?;
            }
        }
        if self.path.exists() && self.generations > 1 {
            std::fs::rename(&self.path, gen_path(1))?;
        } else if self.path.exists() {
            // Single-generation config: truncate in place.
            File::create(&self.path)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rotating_log_appends_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("health.log");
        let log = RotatingLog::new(path.clone(), 10 * 1024 * 1024, 5);
        log.append_line("{\"a\":1}").unwrap();
        log.append_line("{\"a\":2}").unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 2);
    }

    #[test]
    fn rotating_log_rotates_and_caps_generations() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("health.log");
        // Tiny cap so every line forces a rotation.
        let log = RotatingLog::new(path.clone(), 8, 3);
        for i in 0..10 {
            log.append_line(&format!("{{\"event\":{}}}", i)).unwrap();
        }
        assert!(path.exists());
        assert!(dir.path().join("health.log.1").exists());
        assert!(dir.path().join("health.log.2").exists());
        assert!(!dir.path().join("health.log.3").exists());
    }
}
