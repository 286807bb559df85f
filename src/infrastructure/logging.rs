use crate::infrastructure::error::InfraError;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

pub const ENGINE_LOG: &str = "engine.log";

/// Installs the global subscriber: compact lines on stderr plus JSON lines in
/// `<logs_dir>/engine.log`. `RUST_LOG` wins over `level` when set.
///
/// Returns `false` when a subscriber was already installed.
pub fn init_logging(logs_dir: &Path, level: &str) -> Result<bool, InfraError> {
    fs::create_dir_all(logs_dir)?;
    let log_path = log_file_path(logs_dir);
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)?;

    let stderr_layer = tracing_subscriber::fmt::layer()
        .compact()
        .with_target(true)
        .with_writer(std::io::stderr)
        .with_filter(env_filter(level));
    let file_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_target(true)
        .with_ansi(false)
        .with_writer(Mutex::new(file))
        .with_filter(env_filter(level));

    let installed = tracing_subscriber::registry()
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
        .is_ok();
    Ok(installed)
}

pub fn log_file_path(logs_dir: &Path) -> PathBuf {
    logs_dir.join(ENGINE_LOG)
}

fn env_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
}
