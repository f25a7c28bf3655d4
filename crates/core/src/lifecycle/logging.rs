//! Logging initialization with optional file-based daily rotation.

use crate::config::LoggingConfig;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

/// Initialize the tracing subscriber.
///
/// - `to_file=true` → daily rotating `<app_name>.log` with non-blocking writer
/// - `to_file=false` → stderr output (default)
///
/// `RUST_LOG` takes precedence over the configured level. Returns an
/// `Option<WorkerGuard>` that **must be held** for the lifetime of the
/// application to ensure buffered logs are flushed on shutdown.
pub fn init_logging(app_name: &str, config: &LoggingConfig) -> Option<WorkerGuard> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    if config.to_file {
        let dir = config.log_dir.as_deref().unwrap_or("./logs");
        let file_appender = tracing_appender::rolling::daily(dir, format!("{app_name}.log"));
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_writer(non_blocking)
            .with_ansi(false)
            .init();

        Some(guard)
    } else {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();

        None
    }
}
