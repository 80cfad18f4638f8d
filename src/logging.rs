//! Logging initialization.
//!
//! Short-lived command invocations log to stderr. Long-lived processes
//! (`watch`, `coordinator start`, `dashboard`) additionally append to
//! `.overstory/logs/overstory-{datetime}.log`.

use std::path::PathBuf;

use anyhow::Result;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;
use crate::paths::OverstoryHome;

/// Result of logging initialization.
pub struct LoggingHandle {
    /// Guard that must be kept alive for the duration of the program.
    /// When dropped, ensures all buffered logs are flushed.
    pub _guard: Option<WorkerGuard>,

    /// Path to the log file (only set for long-lived processes).
    pub log_file_path: Option<PathBuf>,
}

/// Initialize logging.
///
/// `RUST_LOG` wins over `logging.verbose`; `NO_COLOR`/`FORCE_COLOR` control
/// ANSI on the stderr layer.
pub fn init_logging(
    config: &Config,
    home: &OverstoryHome,
    long_lived: bool,
) -> Result<LoggingHandle> {
    let default_level = if config.logging.verbose {
        "debug"
    } else {
        "info"
    };
    let filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| default_level.to_string()),
    );

    // FORCE_COLOR overrides NO_COLOR
    let ansi =
        std::env::var_os("NO_COLOR").is_none() || std::env::var_os("FORCE_COLOR").is_some();

    if long_lived {
        let logs_dir = home.logs_dir();
        std::fs::create_dir_all(&logs_dir)?;

        let timestamp = chrono::Utc::now().format("%Y%m%dT%H%M%SZ");
        let log_filename = format!("overstory-{timestamp}.log");
        let log_file_path = logs_dir.join(&log_filename);

        let file_appender = tracing_appender::rolling::never(&logs_dir, &log_filename);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(false)
                    .with_ansi(false) // No ANSI codes in log files
                    .with_writer(non_blocking),
            )
            .init();

        Ok(LoggingHandle {
            _guard: Some(guard),
            log_file_path: Some(log_file_path),
        })
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(false)
                    .with_ansi(ansi)
                    .with_writer(std::io::stderr),
            )
            .init();

        Ok(LoggingHandle {
            _guard: None,
            log_file_path: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_logs_dir_under_overstory() {
        let temp = TempDir::new().unwrap();
        let home = OverstoryHome::at(temp.path());
        let logs_dir = home.logs_dir();
        assert!(logs_dir.ends_with("logs"));
        assert!(logs_dir.starts_with(temp.path()));
    }

    #[test]
    fn test_log_file_name_format() {
        let timestamp = chrono::Utc::now().format("%Y%m%dT%H%M%SZ");
        let log_filename = format!("overstory-{timestamp}.log");
        assert!(log_filename.starts_with("overstory-"));
        assert!(log_filename.ends_with(".log"));
    }
}
