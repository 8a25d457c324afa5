//! Log subscriber setup.
//!
//! `TRIPBOARD_LOG` takes an `EnvFilter` directive (default `info`) for the
//! stderr output. Setting `TRIPBOARD_DEBUG_LOG` also writes this crate's
//! debug-level events, with thread ids, to `$TMPDIR/tripboard-debug.log`.

use std::fs::{File, OpenOptions};
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::{Context, Result};
use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};

pub const LOG_ENV: &str = "TRIPBOARD_LOG";
pub const DEBUG_LOG_ENV: &str = "TRIPBOARD_DEBUG_LOG";

const DEFAULT_DIRECTIVE: &str = "info";
const DEBUG_DIRECTIVE: &str = "tripboard=debug";

pub fn debug_log_path() -> PathBuf {
    std::env::temp_dir().join("tripboard-debug.log")
}

fn stderr_filter() -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVE))
}

fn open_debug_log() -> Result<File> {
    let path = debug_log_path();
    OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&path)
        .with_context(|| format!("Failed to open debug log {}", path.display()))
}

/// Install the global subscriber. Call once at startup.
pub fn init() -> Result<()> {
    let stderr = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_filter(stderr_filter());

    let debug_file = match std::env::var_os(DEBUG_LOG_ENV) {
        Some(_) => Some(open_debug_log()?),
        None => None,
    };
    let file = debug_file.map(|file| {
        fmt::layer()
            .with_writer(Mutex::new(file))
            .with_ansi(false)
            .with_thread_ids(true)
            .with_filter(EnvFilter::new(DEBUG_DIRECTIVE))
    });

    tracing_subscriber::registry()
        .with(stderr)
        .with(file)
        .try_init()
        .context("Failed to install log subscriber")?;

    tracing::debug!(path = %debug_log_path().display(), "Logging initialized");
    Ok(())
}
