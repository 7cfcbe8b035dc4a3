//! Subscriber setup. Console output always; with `--log-dir`, a copy of
//! every event also goes to a daily-rolling file written off-thread.

use std::path::Path;

use anyhow::Context;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::types::LogLevel;

const LOG_FILE_PREFIX: &str = "chat-export";
const LOG_FILE_SUFFIX: &str = "log";
/// Daily files kept before the oldest is removed.
const MAX_LOG_FILES: usize = 14;

/// Keeps the file writer thread alive; drop it last so buffered lines are
/// flushed.
pub struct LogGuard {
    _file_guard: Option<WorkerGuard>,
}

pub fn init_logging(level: LogLevel, log_dir: Option<&Path>) -> LogGuard {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_filter()));
    let console_layer = fmt::layer();

    let Some(dir) = log_dir else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(console_layer)
            .init();
        return LogGuard { _file_guard: None };
    };

    match file_appender(dir) {
        Ok(appender) => {
            let (non_blocking, file_guard) = tracing_appender::non_blocking(appender);
            let file_layer = fmt::layer().with_ansi(false).with_writer(non_blocking);
            tracing_subscriber::registry()
                .with(env_filter)
                .with(console_layer)
                .with(file_layer)
                .init();
            tracing::debug!("Writing logs to {}", dir.display());
            LogGuard {
                _file_guard: Some(file_guard),
            }
        }
        Err(e) => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(console_layer)
                .init();
            tracing::warn!("File logging disabled: {:#}", e);
            LogGuard { _file_guard: None }
        }
    }
}

/// `<dir>/chat-export.YYYY-MM-DD.log`, creating `dir` if needed.
fn file_appender(dir: &Path) -> anyhow::Result<RollingFileAppender> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Cannot create log directory {}", dir.display()))?;
    RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(LOG_FILE_PREFIX)
        .filename_suffix(LOG_FILE_SUFFIX)
        .max_log_files(MAX_LOG_FILES)
        .build(dir)
        .with_context(|| format!("Cannot open log file in {}", dir.display()))
}
