//! provides logging helpers

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::RollingFileAppender;
use tracing_appender::rolling::Rotation;
use tracing_subscriber::filter::{self};
use tracing_subscriber::fmt::layer;
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry;

/// Prefix of the daily-rolled log file written when a log directory is set.
pub const LOG_FILE_PREFIX: &str = "cc-manager.log";

#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("failed to create rolling file appender in `{dir}`")]
    Appender {
        dir: String,
        #[source]
        source: tracing_appender::rolling::InitError,
    },

    #[error("global tracing subscriber already installed")]
    AlreadyInstalled(#[from] tracing_subscriber::util::TryInitError),
}

fn env_filter(debug: bool) -> filter::EnvFilter {
    let level = if debug {
        filter::LevelFilter::DEBUG
    } else {
        filter::LevelFilter::INFO
    };
    filter::EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy()
}

/// initiate the global tracing subscriber
///
/// Logs go to stderr. When `log_dir` is given, the same events are also
/// written to a daily-rolled file in that directory; the returned guard must
/// be kept alive for the file writer to flush.
pub fn init(debug: bool, log_dir: Option<&Path>) -> Result<Option<WorkerGuard>, LoggingError> {
    let stderr_layer = layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_filter(env_filter(debug));

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            let appender = RollingFileAppender::builder()
                .rotation(Rotation::DAILY)
                .filename_prefix(LOG_FILE_PREFIX)
                .max_log_files(3)
                .build(dir)
                .map_err(|source| LoggingError::Appender {
                    dir: dir.display().to_string(),
                    source,
                })?;
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let file_layer = layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_filter(env_filter(debug));
            (Some(file_layer), Some(guard))
        }
        None => (None, None),
    };

    registry().with(stderr_layer).with(file_layer).try_init()?;
    Ok(guard)
}
