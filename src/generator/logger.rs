//! Structured logging for the batch generator
//!
//! This module provides functionality for:
//! 1. Logging every task state change and batch summary
//! 2. Including batch ID, task key, numeric key and status
//! 3. Writing logs to a daily rolling file in JSON or line format

use std::path::{Path, PathBuf};

use chrono::Utc;
use thiserror::Error;
use tracing::{error, info, warn};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{
    EnvFilter,
    filter::LevelFilter,
    fmt::{self, format::FmtSpan, time::UtcTime},
    prelude::*,
};
use uuid::Uuid;

use crate::generator::config_loader::AppConfig;
use crate::generator::scheduler::BatchSummary;
use crate::generator::task::{DEFAULT_ERROR_DISPLAY_CHARS, TaskStateChange, TaskStatus, truncate_chars};

const LOG_FILE_NAME: &str = "sora_generator.log";

/// Error types for logging
#[derive(Error, Debug)]
pub enum LoggerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Logging error: {0}")]
    Logging(String),
}

/// Result type for logging operations
pub type LoggerResult<T> = Result<T, LoggerError>;

/// Log entry type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogEntryType {
    Task,
    Batch,
    System,
    Error,
}

impl std::fmt::Display for LogEntryType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogEntryType::Task => write!(f, "task"),
            LogEntryType::Batch => write!(f, "batch"),
            LogEntryType::System => write!(f, "system"),
            LogEntryType::Error => write!(f, "error"),
        }
    }
}

/// Logger for structured logging
pub struct Logger {
    log_dir: PathBuf,
    _guard: tracing_appender::non_blocking::WorkerGuard,
}

impl Logger {
    /// Create the log directory and install the global subscriber.
    /// Fails with [`LoggerError::Logging`] if a subscriber is already installed.
    pub fn new(app_config: &AppConfig) -> LoggerResult<Self> {
        let log_dir = PathBuf::from(&app_config.paths.log_directory);
        if !log_dir.exists() {
            std::fs::create_dir_all(&log_dir)?;
        }

        let guard = Self::init_logger(&log_dir, &app_config.logging.log_format, &app_config.logging.log_level)?;

        Ok(Self { log_dir, _guard: guard })
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    fn init_logger(
        log_dir: &Path,
        format: &str,
        level: &str,
    ) -> LoggerResult<tracing_appender::non_blocking::WorkerGuard> {
        let file_appender = RollingFileAppender::new(Rotation::DAILY, log_dir, LOG_FILE_NAME);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        let filter = EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(level))
            .map_err(|e| LoggerError::Logging(e.to_string()))?;

        let file_layer = match format {
            "json" => fmt::layer()
                .json()
                .with_writer(non_blocking)
                .with_timer(UtcTime::rfc_3339())
                .with_span_events(FmtSpan::CLOSE)
                .boxed(),
            _ => fmt::layer()
                .with_ansi(false)
                .with_writer(non_blocking)
                .with_timer(UtcTime::rfc_3339())
                .with_span_events(FmtSpan::CLOSE)
                .boxed(),
        };

        // The terminal belongs to the progress bar; only problems go to stderr
        let console_layer = fmt::layer()
            .compact()
            .with_target(false)
            .with_writer(std::io::stderr)
            .with_filter(LevelFilter::WARN);

        tracing_subscriber::registry()
            .with(filter)
            .with(file_layer)
            .with(console_layer)
            .try_init()
            .map_err(|e| LoggerError::Logging(e.to_string()))?;

        info!(log_format = format, log_level = level, message = "Logger initialized");

        Ok(guard)
    }

    /// Log a task state change
    pub fn log_task_change(&self, batch_id: Uuid, change: &TaskStateChange) {
        let detail = change
            .detail
            .as_deref()
            .map(|d| truncate_chars(d, DEFAULT_ERROR_DISPLAY_CHARS));

        if change.to == TaskStatus::Failed {
            warn!(
                entry_type = %LogEntryType::Task,
                batch_id = %batch_id,
                key = change.key,
                number = change.number.as_str(),
                from = %change.from,
                status = %change.to,
                detail = detail.as_deref(),
                message = %format!("Task {} failed", change.number),
            );
        } else {
            info!(
                entry_type = %LogEntryType::Task,
                batch_id = %batch_id,
                key = change.key,
                number = change.number.as_str(),
                from = %change.from,
                status = %change.to,
                detail = detail.as_deref(),
                message = %format!("Task {} {}", change.number, change.to),
            );
        }
    }

    /// Log a finished batch
    pub fn log_batch_summary(&self, summary: &BatchSummary) {
        let history_path = summary.history_path.as_ref().map(|p| p.display().to_string());
        info!(
            entry_type = %LogEntryType::Batch,
            batch_id = %summary.batch_id,
            total = summary.total,
            succeeded = summary.succeeded,
            failed = summary.failed,
            cancelled = summary.cancelled,
            elapsed_secs = summary.elapsed.as_secs_f64(),
            average_secs = summary.average_per_task.as_secs_f64(),
            history_path = history_path.as_deref(),
            timestamp = %Utc::now().to_rfc3339(),
            message = "Batch finished",
        );
    }

    /// Log a system event
    pub fn log_system_event(&self, event_type: &str, details: &str) {
        info!(
            entry_type = %LogEntryType::System,
            event_type = event_type,
            details = details,
            timestamp = %Utc::now().to_rfc3339(),
            message = %format!("System event: {}", event_type),
        );
    }

    /// Log an error
    pub fn log_error(&self, error_type: &str, details: &str) {
        error!(
            entry_type = %LogEntryType::Error,
            error_type = error_type,
            details = details,
            timestamp = %Utc::now().to_rfc3339(),
            message = %format!("Error: {}", error_type),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_entry_type_display() {
        assert_eq!(LogEntryType::Task.to_string(), "task");
        assert_eq!(LogEntryType::Batch.to_string(), "batch");
        assert_eq!(LogEntryType::System.to_string(), "system");
        assert_eq!(LogEntryType::Error.to_string(), "error");
    }

    #[test]
    fn test_logger_creates_directory_and_installs_once() {
        let dir = tempdir().unwrap();
        let mut config = AppConfig::default();
        config.paths.log_directory = dir.path().join("logs").to_string_lossy().into_owned();

        let logger = Logger::new(&config).unwrap();
        assert!(logger.log_dir().exists());
        logger.log_system_event("test", "logger installed");

        // A second global subscriber is refused
        assert!(matches!(Logger::new(&config), Err(LoggerError::Logging(_))));
    }
}
