//! Task model for the batch generator
//!
//! A [`Task`] is one prompt's unit of work from generation through download.
//! Status changes go through [`Task::transition`], which rejects any move the
//! lifecycle does not allow, so two pipeline stages can never disagree about
//! who currently owns a task.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Prefix attached to generation failures
pub const GENERATION_FAILED_PREFIX: &str = "request failed";

/// Prefix attached to download failures, kept distinct from generation failures
pub const DOWNLOAD_FAILED_PREFIX: &str = "download failed";

/// Default width used when showing error text in compact views
pub const DEFAULT_ERROR_DISPLAY_CHARS: usize = 80;

/// Error raised when a status change is not part of the lifecycle
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid transition for task {key}: {from} -> {to}")]
pub struct TransitionError {
    pub key: usize,
    pub from: TaskStatus,
    pub to: TaskStatus,
}

/// A named reference image injected into a request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceImage {
    pub name: String,
    pub source: ImageSource,
}

/// Where a reference image comes from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageSource {
    /// Path relative to the configured reference root (or absolute)
    LocalFile(String),
    /// Remote URL passed through as-is
    Url(String),
}

impl ReferenceImage {
    pub fn local(name: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source: ImageSource::LocalFile(path.into()),
        }
    }

    pub fn remote(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source: ImageSource::Url(url.into()),
        }
    }
}

/// Lifecycle state of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskStatus {
    Waiting,
    Generating,
    /// A recoverable attempt failed; `attempt` counts retries starting at 1
    Retrying { attempt: u32, limit: u32 },
    Downloading,
    Succeeded,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Succeeded | TaskStatus::Failed)
    }

    /// Generating, Retrying and Downloading all hold a concurrency slot
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            TaskStatus::Generating | TaskStatus::Retrying { .. } | TaskStatus::Downloading
        )
    }

    /// Whether `self -> next` is an edge of the lifecycle
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        match (*self, next) {
            (Waiting, Generating) => true,
            (Generating, Retrying { attempt, limit }) => attempt >= 1 && attempt <= limit,
            (Retrying { .. }, Generating) => true,
            (Generating, Downloading) => true,
            (Generating, Failed) | (Retrying { .. }, Failed) => true,
            (Downloading, Succeeded) | (Downloading, Failed) => true,
            (Succeeded, Waiting) | (Failed, Waiting) => true,
            _ => false,
        }
    }

    /// Label stored in history records
    pub fn label(&self) -> &'static str {
        match self {
            TaskStatus::Waiting => "等待中",
            TaskStatus::Generating => "生成中",
            TaskStatus::Retrying { .. } => "重试中",
            TaskStatus::Downloading => "下载中",
            TaskStatus::Succeeded => "成功",
            TaskStatus::Failed => "失败",
        }
    }

    /// Status to restore from a stored label. In-flight work does not survive a
    /// restart, so anything that is not terminal comes back as Waiting.
    pub fn from_label(label: &str) -> Self {
        match label.trim() {
            "成功" | "succeeded" => TaskStatus::Succeeded,
            "失败" | "failed" => TaskStatus::Failed,
            _ => TaskStatus::Waiting,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskStatus::Waiting => write!(f, "waiting"),
            TaskStatus::Generating => write!(f, "generating"),
            TaskStatus::Retrying { attempt, limit } => write!(f, "retrying ({}/{})", attempt, limit),
            TaskStatus::Downloading => write!(f, "downloading"),
            TaskStatus::Succeeded => write!(f, "succeeded"),
            TaskStatus::Failed => write!(f, "failed"),
        }
    }
}

/// One generation unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    /// Caller-assigned key, usually numeric, used for output naming. Not unique.
    pub number: String,
    /// Original prompt text, the join key for history identity
    pub prompt: String,
    pub reference_images: Vec<ReferenceImage>,
    pub status: TaskStatus,
    pub result_locator: Option<String>,
    pub local_filename: Option<String>,
    pub error_detail: Option<String>,
}

impl Task {
    pub fn new(number: impl ToString, prompt: impl Into<String>) -> Self {
        Self {
            number: number.to_string(),
            prompt: prompt.into(),
            reference_images: Vec::new(),
            status: TaskStatus::Waiting,
            result_locator: None,
            local_filename: None,
            error_detail: None,
        }
    }

    /// Move to `next`, rejecting edges the lifecycle does not have.
    /// `key` is only used for the error message.
    pub fn transition(&mut self, key: usize, next: TaskStatus) -> Result<TaskStatus, TransitionError> {
        if !self.status.can_transition_to(next) {
            return Err(TransitionError {
                key,
                from: self.status,
                to: next,
            });
        }
        let previous = self.status;
        self.status = next;
        Ok(previous)
    }

    /// Reset a terminal task so it is picked up again on the next submission
    pub fn reset(&mut self, key: usize) -> Result<TaskStatus, TransitionError> {
        let previous = self.transition(key, TaskStatus::Waiting)?;
        self.result_locator = None;
        self.local_filename = None;
        self.error_detail = None;
        Ok(previous)
    }

    /// Error text shortened for compact display; the full text stays in `error_detail`
    pub fn display_error(&self, max_chars: usize) -> Option<String> {
        self.error_detail
            .as_deref()
            .map(|detail| truncate_chars(detail, max_chars))
    }
}

/// Truncate on a character boundary, appending an ellipsis when shortened
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max_chars.saturating_sub(1)).collect();
    out.push('…');
    out
}

/// Notification emitted whenever a task changes state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskStateChange {
    /// Stable slot of the task inside its batch
    pub key: usize,
    pub number: String,
    pub from: TaskStatus,
    pub to: TaskStatus,
    pub detail: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_happy_path() {
        let mut task = Task::new(1, "a cat");
        task.transition(0, TaskStatus::Generating).unwrap();
        task.transition(0, TaskStatus::Retrying { attempt: 1, limit: 2 }).unwrap();
        task.transition(0, TaskStatus::Generating).unwrap();
        task.transition(0, TaskStatus::Downloading).unwrap();
        task.transition(0, TaskStatus::Succeeded).unwrap();
        assert!(task.status.is_terminal());
    }

    #[test]
    fn test_rejects_skipping_generation() {
        let mut task = Task::new(1, "a cat");
        let err = task.transition(3, TaskStatus::Downloading).unwrap_err();
        assert_eq!(err.key, 3);
        assert_eq!(err.from, TaskStatus::Waiting);
        assert_eq!(task.status, TaskStatus::Waiting);
    }

    #[test]
    fn test_download_failure_is_not_retried() {
        assert!(!TaskStatus::Downloading.can_transition_to(TaskStatus::Retrying { attempt: 1, limit: 3 }));
        assert!(!TaskStatus::Downloading.can_transition_to(TaskStatus::Generating));
    }

    #[test]
    fn test_retry_attempt_must_fit_limit() {
        assert!(!TaskStatus::Generating.can_transition_to(TaskStatus::Retrying { attempt: 4, limit: 3 }));
        assert!(!TaskStatus::Generating.can_transition_to(TaskStatus::Retrying { attempt: 0, limit: 3 }));
    }

    #[test]
    fn test_reset_clears_outcome() {
        let mut task = Task::new(7, "a dog");
        task.transition(0, TaskStatus::Generating).unwrap();
        task.transition(0, TaskStatus::Failed).unwrap();
        task.error_detail = Some("request failed: HTTP 500".to_string());
        task.reset(0).unwrap();
        assert_eq!(task.status, TaskStatus::Waiting);
        assert!(task.error_detail.is_none());

        // only terminal tasks can be reset
        task.transition(0, TaskStatus::Generating).unwrap();
        assert!(task.reset(0).is_err());
    }

    #[test]
    fn test_display_error_truncates_on_char_boundary() {
        let mut task = Task::new(1, "x");
        task.error_detail = Some("下载失败: 连接被重置了很多次".to_string());
        let shown = task.display_error(6).unwrap();
        assert_eq!(shown.chars().count(), 6);
        assert!(shown.ends_with('…'));
        assert_eq!(task.error_detail.as_deref(), Some("下载失败: 连接被重置了很多次"));
    }

    #[test]
    fn test_label_round_trip_for_terminal_states() {
        assert_eq!(TaskStatus::from_label(TaskStatus::Succeeded.label()), TaskStatus::Succeeded);
        assert_eq!(TaskStatus::from_label(TaskStatus::Failed.label()), TaskStatus::Failed);
        assert_eq!(TaskStatus::from_label(TaskStatus::Downloading.label()), TaskStatus::Waiting);
        assert_eq!(TaskStatus::from_label("something else"), TaskStatus::Waiting);
    }
}
