//! Logging initialization.
//!
//! - **Production**: JSON logs to daily rolling files + compact logs to stdout
//! - **Development**: Pretty logs to stdout with span events
//!
//! The filter comes from `RUST_LOG` if set, then `BODYSCALE_LOG_LEVEL`, then
//! the `[logging]` table.

use std::path::PathBuf;
use std::sync::OnceLock;

use bodyscale_core::LoggingConfig;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Environment variable overriding the configured log level.
pub const LOG_LEVEL_ENV: &str = "BODYSCALE_LOG_LEVEL";

/// Prefix of the rolling log files.
const LOG_FILE_PREFIX: &str = "bodyscale";

// Non-blocking writers flush on drop; the guards live for the whole process.
static FILE_GUARD: OnceLock<WorkerGuard> = OnceLock::new();
static STDOUT_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Install the global subscriber described by `config`.
///
/// # Errors
///
/// Returns an error if the filter directive cannot be parsed or the log
/// directory cannot be created.
pub fn init(config: &LoggingConfig) -> anyhow::Result<()> {
    let level = std::env::var(LOG_LEVEL_ENV).unwrap_or_else(|_| config.level.clone());

    let env_filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(&level))?;

    if config.production {
        init_production(env_filter, log_directory(config))?;
    } else {
        init_development(env_filter);
    }

    Ok(())
}

fn init_production(env_filter: EnvFilter, log_dir: PathBuf) -> anyhow::Result<()> {
    std::fs::create_dir_all(&log_dir)?;

    let file_appender = RollingFileAppender::new(Rotation::DAILY, &log_dir, LOG_FILE_PREFIX);
    let (non_blocking_file, file_guard) = tracing_appender::non_blocking(file_appender);
    let (non_blocking_stdout, stdout_guard) = tracing_appender::non_blocking(std::io::stdout());

    let file_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking_file)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    // journald adds its own timestamps and does not render ANSI
    let stdout_layer = tracing_subscriber::fmt::layer()
        .compact()
        .with_writer(non_blocking_stdout)
        .with_target(true)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(stdout_layer)
        .init();

    let _ = FILE_GUARD.set(file_guard);
    let _ = STDOUT_GUARD.set(stdout_guard);

    Ok(())
}

fn init_development(env_filter: EnvFilter) {
    let stdout_layer = tracing_subscriber::fmt::layer()
        .pretty()
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stdout_layer)
        .init();
}

/// The configured log directory, or the platform default.
fn log_directory(config: &LoggingConfig) -> PathBuf {
    config.directory.clone().unwrap_or_else(default_log_directory)
}

fn default_log_directory() -> PathBuf {
    #[cfg(target_os = "linux")]
    {
        PathBuf::from("/var/log/bodyscale")
    }
    #[cfg(not(target_os = "linux"))]
    {
        directories::ProjectDirs::from("", "", "bodyscale")
            .map(|dirs| dirs.data_dir().join("logs"))
            .unwrap_or_else(|| PathBuf::from("./logs"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_log_directory_is_valid_path() {
        let config = LoggingConfig::default();
        assert!(!log_directory(&config).as_os_str().is_empty());
    }

    #[test]
    fn test_configured_log_directory_wins() {
        let config = LoggingConfig {
            directory: Some(PathBuf::from("/tmp/bodyscale-logs")),
            ..LoggingConfig::default()
        };
        assert_eq!(log_directory(&config), PathBuf::from("/tmp/bodyscale-logs"));
    }
}
