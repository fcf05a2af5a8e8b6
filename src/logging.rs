//! Logging configuration with journald support on Linux.
//!
//! Sets up tracing-based logging that goes to systemd's journal on Linux,
//! with a rolling log file (CLI) or stderr (daemon) as fallback.

use anyhow::Result;
use std::path::PathBuf;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Where log lines go when journald is unavailable.
pub enum Fallback {
    /// Daily-rolling file in the given directory (or the data dir)
    File(Option<PathBuf>),
    Stderr,
}

/// Initialize the logging system.
///
/// Log level is controlled via the `FACESIFT_LOG` environment variable
/// (`debug`, `info`, `warn`, `error`; default `info`).
pub fn init(fallback: Fallback) -> Result<()> {
    let env_filter = EnvFilter::try_from_env("FACESIFT_LOG")
        .unwrap_or_else(|_| EnvFilter::new("info"));

    #[cfg(target_os = "linux")]
    {
        if let Ok(journald_layer) = tracing_journald::layer() {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(journald_layer)
                .try_init()?;

            tracing::info!("Logging initialized with journald backend");
            return Ok(());
        }
    }

    match fallback {
        Fallback::Stderr => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().with_writer(std::io::stderr))
                .try_init()?;
        }
        Fallback::File(log_dir) => {
            let log_dir = log_dir.unwrap_or_else(|| crate::config::Config::data_dir().join("logs"));
            std::fs::create_dir_all(&log_dir)?;

            let file_appender = tracing_appender::rolling::daily(&log_dir, "facesift.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

            // Dropping the guard stops the writer thread
            static GUARD: std::sync::OnceLock<tracing_appender::non_blocking::WorkerGuard> =
                std::sync::OnceLock::new();
            let _ = GUARD.set(guard);

            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
                .try_init()?;

            tracing::info!("Logging initialized with file backend at {:?}", log_dir);
        }
    }

    Ok(())
}
