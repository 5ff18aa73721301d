//! Structured logging setup with console and file output.
//!
//! The library only emits `tracing` events; installing a subscriber is up to
//! the host program. [`init_logging`] is provided for scripts and tools that
//! have none of their own:
//!
//! - stdout only when attached to a terminal
//! - otherwise a daily rotating log file plus stdout, falling back to stdout
//!   alone if the log directory is unusable
//! - filter from `CHIMEDB_LOG` or `RUST_LOG`

use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::EnvFilter;

/// Environment variable checked before `RUST_LOG`.
pub const LOG_ENV: &str = "CHIMEDB_LOG";

/// Logging configuration.
pub struct LogConfig {
    /// Directory for log files
    pub log_dir: PathBuf,
    /// Whether stdout is a terminal
    pub is_pty: bool,
    /// Optional custom log filter
    pub log_filter: Option<String>,
}

impl LogConfig {
    /// Create a new logging configuration.
    pub fn new(log_dir: PathBuf) -> Self {
        Self { log_dir, is_pty: atty::is(atty::Stream::Stdout), log_filter: None }
    }

    /// Set custom log filter.
    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.log_filter = Some(filter.into());
        self
    }
}

/// Guard that must be held for the lifetime of the program.
///
/// Dropping this guard flushes pending log entries.
pub struct LoggingGuard {
    _worker_guard: Option<WorkerGuard>,
}

/// Install a global subscriber.
///
/// Does nothing if the process already has one.
pub fn init_logging(config: LogConfig) -> LoggingGuard {
    if config.is_pty {
        return init_stdout_logging(config.log_filter.as_deref());
    }

    match init_file_logging(&config) {
        Ok(guard) => LoggingGuard { _worker_guard: guard },
        Err(e) => {
            eprintln!("Warning: Failed to initialize file logging: {e}. Using console only.");
            init_stdout_logging(config.log_filter.as_deref())
        }
    }
}

/// Initialize with defaults (convenience function).
pub fn init_logging_default() -> LoggingGuard {
    init_logging(LogConfig::new(log_dir()))
}

fn init_stdout_logging(filter: Option<&str>) -> LoggingGuard {
    let installed = tracing_subscriber::fmt()
        .with_env_filter(build_env_filter(filter))
        .with_target(false)
        .try_init()
        .is_ok();
    if !installed {
        tracing::debug!("A tracing subscriber is already installed");
    }

    LoggingGuard { _worker_guard: None }
}

fn init_file_logging(config: &LogConfig) -> Result<Option<WorkerGuard>, Box<dyn std::error::Error>> {
    std::fs::create_dir_all(&config.log_dir)?;

    let file_appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix("chimedb")
        .filename_suffix("log")
        .build(&config.log_dir)?;
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let stdout = std::io::stdout.with_max_level(tracing::Level::INFO);
    let installed = tracing_subscriber::fmt()
        .with_writer(stdout.and(non_blocking))
        .with_env_filter(build_env_filter(config.log_filter.as_deref()))
        .with_ansi(false)
        .with_target(true)
        .try_init()
        .is_ok();

    // Without an installed subscriber nothing writes to the file.
    Ok(installed.then_some(guard))
}

/// Filter priority: custom filter > `CHIMEDB_LOG` > `RUST_LOG` > default.
fn build_env_filter(custom_filter: Option<&str>) -> EnvFilter {
    if let Some(filter) = custom_filter {
        return EnvFilter::try_new(filter).unwrap_or_else(|_| EnvFilter::new(default_log_filter()));
    }

    EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(default_log_filter()))
}

/// Default filter, by build type.
pub fn default_log_filter() -> &'static str {
    #[cfg(debug_assertions)]
    {
        "info,chimedb_core=debug,tokio_postgres=warn,russh=warn"
    }
    #[cfg(not(debug_assertions))]
    {
        "warn,chimedb_core=info,tokio_postgres=warn,russh=warn"
    }
}

/// Default log directory (`<data dir>/chimedb/logs`, or `./logs`).
pub fn log_dir() -> PathBuf {
    dirs::data_local_dir()
        .map(|dir| dir.join("chimedb"))
        .unwrap_or_else(|| PathBuf::from("."))
        .join("logs")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_custom_filter_wins() {
        let filter = build_env_filter(Some("chimedb_core=trace"));
        assert_eq!(filter.to_string(), "chimedb_core=trace");
    }

    #[test]
    fn test_invalid_custom_filter_falls_back() {
        let filter = build_env_filter(Some("chimedb_core=[[["));
        assert_eq!(filter.to_string(), EnvFilter::new(default_log_filter()).to_string());
    }

    #[test]
    #[serial]
    fn test_chimedb_log_over_rust_log() {
        std::env::set_var(LOG_ENV, "chimedb_core=warn");
        std::env::set_var("RUST_LOG", "debug");
        assert_eq!(build_env_filter(None).to_string(), "chimedb_core=warn");

        std::env::remove_var(LOG_ENV);
        assert_eq!(build_env_filter(None).to_string(), "debug");
        std::env::remove_var("RUST_LOG");
    }

    #[test]
    fn test_log_dir_layout() {
        let dir = log_dir();
        assert!(dir.ends_with("logs"));
    }

    #[test]
    fn test_file_logging_creates_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let log_dir = tmp.path().join("nested").join("logs");
        let mut config = LogConfig::new(log_dir.clone());
        config.is_pty = false;

        let _guard = init_logging(config);
        assert!(log_dir.is_dir());
    }
}
