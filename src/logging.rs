//! Tracing setup for the CLI and embedding applications.
//!
//! Records go to systemd-journald when a socket is available, otherwise to
//! a daily-rolled file under the modelvault state directory. The filter is
//! read from `MODELVAULT_LOG` and defaults to `info`.

use std::path::PathBuf;

use anyhow::Result;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Environment variable holding the tracing filter directive.
pub const LOG_FILTER_ENV: &str = "MODELVAULT_LOG";

/// Install the global subscriber. Passing a directory forces file logging
/// there; `None` prefers journald on Linux and falls back to
/// `~/.modelvault/logs`.
pub fn init(log_dir: Option<PathBuf>) -> Result<()> {
    let filter =
        EnvFilter::try_from_env(LOG_FILTER_ENV).unwrap_or_else(|_| EnvFilter::new("info"));

    #[cfg(target_os = "linux")]
    if log_dir.is_none() {
        if let Ok(journald) = tracing_journald::layer() {
            tracing_subscriber::registry()
                .with(filter)
                .with(journald)
                .init();
            tracing::info!("logging to journald");
            return Ok(());
        }
    }

    let dir = log_dir.unwrap_or_else(default_log_dir);
    std::fs::create_dir_all(&dir)?;

    let appender = tracing_appender::rolling::daily(&dir, "modelvault.log");
    let (writer, guard) = tracing_appender::non_blocking(appender);
    // Dropping the guard stops the background writer, so it is parked for
    // the life of the process.
    static GUARD: std::sync::OnceLock<tracing_appender::non_blocking::WorkerGuard> =
        std::sync::OnceLock::new();
    let _ = GUARD.set(guard);

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(writer).with_ansi(false))
        .init();

    tracing::info!(dir = %dir.display(), "logging to rolling file");
    Ok(())
}

/// Log location when none is given, next to the database and preview
/// caches under the home directory.
fn default_log_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".modelvault")
        .join("logs")
}
