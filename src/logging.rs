//! Logging setup: `tracing` events go to stdout and to a daily log file.

use anyhow::{Context, Result};
use chrono::Local;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Returns today's log file: `<log_dir>/streetmesh_YYYYMMDD.log`
pub fn log_file_path(log_dir: &Path) -> PathBuf {
    let date = Local::now().format("%Y%m%d");
    log_dir.join(format!("streetmesh_{}.log", date))
}

fn open_append(path: &Path) -> std::io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

/// Installs the global subscriber.
///
/// `default_level` is used unless `RUST_LOG` is set.
pub fn init(log_dir: &Path, default_level: &str) -> Result<PathBuf> {
    std::fs::create_dir_all(log_dir)
        .with_context(|| format!("Failed to create log directory {}", log_dir.display()))?;
    let path = log_file_path(log_dir);
    let file = open_append(&path)
        .with_context(|| format!("Failed to open log file {}", path.display()))?;

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .with(
            fmt::layer()
                .with_ansi(false)
                .with_writer(Mutex::new(file)),
        )
        .try_init()
        .context("Failed to install log subscriber")?;

    Ok(path)
}

/// Appends panics to the log file, even when the subscriber was never installed.
pub fn install_panic_hook(log_dir: PathBuf) {
    std::panic::set_hook(Box::new(move |panic_info| {
        let msg = if let Some(s) = panic_info.payload().downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = panic_info.payload().downcast_ref::<String>() {
            s.clone()
        } else {
            "Unknown panic".to_string()
        };
        let location = panic_info
            .location()
            .map(|loc| format!(" at {}:{}:{}", loc.file(), loc.line(), loc.column()))
            .unwrap_or_default();

        let timestamp = Local::now().format("%H:%M:%S%.3f");
        let line = format!("[{}] [PANIC]{} {}\n", timestamp, location, msg);
        eprint!("{}", line);
        if let Ok(mut file) = open_append(&log_file_path(&log_dir)) {
            let _ = file.write_all(line.as_bytes());
        }
    }));
}
