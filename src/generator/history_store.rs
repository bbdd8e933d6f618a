//! Batch history persistence
//!
//! A history record is a JSON snapshot of one batch: the configuration it ran
//! with and every prompt's outcome. Records are identified by a content hash
//! over the configuration and the ordered prompt texts only, so saving the
//! same batch again after more prompts finish rewrites the existing file
//! instead of adding another one.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, Local};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::generator::task::{Task, TaskStatus};

/// Format version written into every record
pub const HISTORY_VERSION: &str = "3.4";

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
const NAME_TIME_FORMAT: &str = "%Y%m%d_%H%M%S";

/// Error types for history persistence
#[derive(Error, Debug)]
pub enum HistoryError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid record name: {0}")]
    InvalidName(String),
}

/// Result type for history operations
pub type HistoryResult<T> = Result<T, HistoryError>;

/// Configuration values recorded with a batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigSnapshot {
    pub api_platform: String,
    pub model_type: String,
    pub thread_count: usize,
    pub retry_count: u32,
    pub image_ratio: String,
    pub current_style: String,
    pub custom_style_content: String,
}

impl Default for ConfigSnapshot {
    fn default() -> Self {
        Self {
            api_platform: String::new(),
            model_type: String::new(),
            thread_count: 5,
            retry_count: 3,
            image_ratio: "3:2".to_string(),
            current_style: String::new(),
            custom_style_content: String::new(),
        }
    }
}

/// Keys are free text; older records may hold them as JSON numbers
fn number_from_any<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum NumberOrText {
        Number(serde_json::Number),
        Text(String),
    }

    Ok(match NumberOrText::deserialize(deserializer)? {
        NumberOrText::Number(n) => n.to_string(),
        NumberOrText::Text(text) => text.trim().to_string(),
    })
}

/// One prompt's stored outcome
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptRecord {
    #[serde(deserialize_with = "number_from_any")]
    pub number: String,
    pub prompt: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub image_url: String,
    #[serde(default)]
    pub error_msg: String,
    #[serde(default)]
    pub actual_filename: String,
}

impl From<&Task> for PromptRecord {
    fn from(task: &Task) -> Self {
        Self {
            number: task.number.clone(),
            prompt: task.prompt.clone(),
            status: task.status.label().to_string(),
            image_url: task.result_locator.clone().unwrap_or_default(),
            error_msg: task.error_detail.clone().unwrap_or_default(),
            actual_filename: task.local_filename.clone().unwrap_or_default(),
        }
    }
}

impl PromptRecord {
    /// Rebuild a task; in-flight statuses come back as Waiting
    pub fn to_task(&self) -> Task {
        let non_empty = |s: &str| (!s.is_empty()).then(|| s.to_string());
        let mut task = Task::new(&self.number, self.prompt.clone());
        task.status = TaskStatus::from_label(&self.status);
        if task.status.is_terminal() {
            task.result_locator = non_empty(&self.image_url);
            task.local_filename = non_empty(&self.actual_filename);
            task.error_detail = non_empty(&self.error_msg);
        }
        task
    }
}

/// Stored snapshot of one batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryRecord {
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub created_time: String,
    #[serde(default)]
    pub total_prompts: usize,
    #[serde(default)]
    pub success_count: usize,
    #[serde(default)]
    pub failed_count: usize,
    #[serde(default)]
    pub config: ConfigSnapshot,
    #[serde(default)]
    pub prompts: Vec<PromptRecord>,
}

impl HistoryRecord {
    pub fn from_tasks(tasks: &[Task], config: &ConfigSnapshot) -> Self {
        let prompts: Vec<PromptRecord> = tasks.iter().map(PromptRecord::from).collect();
        Self {
            version: HISTORY_VERSION.to_string(),
            created_time: Local::now().format(TIME_FORMAT).to_string(),
            total_prompts: prompts.len(),
            success_count: tasks.iter().filter(|t| t.status == TaskStatus::Succeeded).count(),
            failed_count: tasks.iter().filter(|t| t.status == TaskStatus::Failed).count(),
            config: config.clone(),
            prompts,
        }
    }

    pub fn content_hash(&self) -> HistoryResult<String> {
        content_hash(&self.config, self.prompts.iter().map(|p| p.prompt.as_str()))
    }

    pub fn tasks(&self) -> Vec<Task> {
        self.prompts.iter().map(PromptRecord::to_task).collect()
    }
}

/// Identity of a batch: SHA-256 over sorted-key JSON of the config and the
/// ordered prompt texts. Statuses and results do not take part.
pub fn content_hash<'a, I>(config: &ConfigSnapshot, prompts: I) -> HistoryResult<String>
where
    I: IntoIterator<Item = &'a str>,
{
    let prompts: Vec<_> = prompts.into_iter().map(|p| json!({ "prompt": p })).collect();
    // serde_json::Value objects keep keys sorted
    let canonical = json!({
        "config": serde_json::to_value(config)?,
        "prompts": prompts,
    });
    let digest = Sha256::digest(serde_json::to_string(&canonical)?.as_bytes());
    Ok(hex::encode(digest))
}

/// Listing entry for a stored record
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HistorySummary {
    pub path: PathBuf,
    pub name: String,
    pub size: u64,
    pub modified_time: String,
    pub created_time: String,
    pub version: String,
    pub total_prompts: usize,
    pub success_count: usize,
    pub failed_count: usize,
}

/// Directory of history records
#[derive(Debug, Clone)]
pub struct HistoryStore {
    dir: PathBuf,
}

impl HistoryStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn ensure_dir(&self) -> HistoryResult<()> {
        if !self.dir.exists() {
            fs::create_dir_all(&self.dir)?;
            info!("Created history directory: {}", self.dir.display());
        }
        Ok(())
    }

    fn json_files(&self) -> HistoryResult<Vec<PathBuf>> {
        let mut files = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.is_file() && path.extension().is_some_and(|ext| ext == "json") {
                files.push(path);
            }
        }
        Ok(files)
    }

    /// Existing record with the same content hash, if any
    fn find_duplicate(&self, hash: &str) -> HistoryResult<Option<PathBuf>> {
        for path in self.json_files()? {
            match Self::load(&path).and_then(|record| record.content_hash()) {
                Ok(existing) if existing == hash => return Ok(Some(path)),
                Ok(_) => {}
                Err(e) => debug!("Ignoring {} during dedup scan: {}", path.display(), e),
            }
        }
        Ok(None)
    }

    /// Path for a new record, never reusing an existing file
    fn new_record_path(&self, preferred_name: Option<&str>) -> HistoryResult<PathBuf> {
        let stem = match preferred_name.map(str::trim).filter(|n| !n.is_empty()) {
            Some(name) => {
                if name.contains(['/', '\\']) || name == ".." {
                    return Err(HistoryError::InvalidName(name.to_string()));
                }
                name.strip_suffix(".json").unwrap_or(name).to_string()
            }
            None => format!("sora_history_{}", Local::now().format(NAME_TIME_FORMAT)),
        };

        let mut path = self.dir.join(format!("{}.json", stem));
        let mut n = 2;
        while path.exists() {
            path = self.dir.join(format!("{}_{}.json", stem, n));
            n += 1;
        }
        Ok(path)
    }

    /// Save a batch, updating the record of an identical batch in place
    pub fn save(
        &self,
        tasks: &[Task],
        config: &ConfigSnapshot,
        preferred_name: Option<&str>,
    ) -> HistoryResult<PathBuf> {
        self.ensure_dir()?;

        let record = HistoryRecord::from_tasks(tasks, config);
        let hash = record.content_hash()?;

        let path = match self.find_duplicate(&hash)? {
            Some(existing) => {
                info!("Updating existing history record: {}", existing.display());
                existing
            }
            None => self.new_record_path(preferred_name)?,
        };

        fs::write(&path, serde_json::to_string_pretty(&record)?)?;
        info!(
            "History saved to {} ({} prompts, {} succeeded, {} failed)",
            path.display(),
            record.total_prompts,
            record.success_count,
            record.failed_count
        );
        Ok(path)
    }

    pub fn load(path: &Path) -> HistoryResult<HistoryRecord> {
        let content = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn delete(&self, path: &Path) -> HistoryResult<()> {
        fs::remove_file(path)?;
        info!("Deleted history record: {}", path.display());
        Ok(())
    }

    /// Summaries of every readable record, newest modification first
    pub fn list(&self) -> HistoryResult<Vec<HistorySummary>> {
        self.ensure_dir()?;

        let mut entries: Vec<(SystemTime, HistorySummary)> = Vec::new();
        for path in self.json_files()? {
            let metadata = match fs::metadata(&path) {
                Ok(metadata) => metadata,
                Err(e) => {
                    warn!("Failed to stat history file {}: {}", path.display(), e);
                    continue;
                }
            };
            let record = match Self::load(&path) {
                Ok(record) => record,
                Err(e) => {
                    warn!("Failed to read history file {}: {}", path.display(), e);
                    continue;
                }
            };

            let modified = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            let modified_time = DateTime::<Local>::from(modified).format(TIME_FORMAT).to_string();
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();

            entries.push((
                modified,
                HistorySummary {
                    name,
                    size: metadata.len(),
                    created_time: if record.created_time.is_empty() {
                        modified_time.clone()
                    } else {
                        record.created_time
                    },
                    version: if record.version.is_empty() {
                        "unknown".to_string()
                    } else {
                        record.version
                    },
                    modified_time,
                    total_prompts: record.total_prompts,
                    success_count: record.success_count,
                    failed_count: record.failed_count,
                    path,
                },
            ));
        }

        entries.sort_by(|a, b| b.0.cmp(&a.0));
        Ok(entries.into_iter().map(|(_, summary)| summary).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::tempdir;

    fn snapshot() -> ConfigSnapshot {
        ConfigSnapshot {
            api_platform: "apiyi".to_string(),
            model_type: "sora_image".to_string(),
            ..ConfigSnapshot::default()
        }
    }

    fn batch() -> Vec<Task> {
        vec![Task::new(1, "一只小猫"), Task::new(2, "a dog")]
    }

    #[test]
    fn test_same_batch_is_saved_once() {
        let dir = tempdir().unwrap();
        let store = HistoryStore::new(dir.path());
        let mut tasks = batch();

        let first = store.save(&tasks, &snapshot(), None).unwrap();

        tasks[0].status = TaskStatus::Succeeded;
        tasks[0].local_filename = Some("1.png".to_string());
        tasks[1].status = TaskStatus::Failed;
        tasks[1].error_detail = Some("request failed: HTTP 500".to_string());
        let second = store.save(&tasks, &snapshot(), Some("auto_save_x")).unwrap();

        assert_eq!(first, second);
        assert_eq!(store.list().unwrap().len(), 1);

        let record = HistoryStore::load(&second).unwrap();
        assert_eq!(record.version, HISTORY_VERSION);
        assert_eq!(record.success_count, 1);
        assert_eq!(record.failed_count, 1);
        assert_eq!(record.prompts[0].status, "成功");
        assert_eq!(record.prompts[0].actual_filename, "1.png");
    }

    #[test]
    fn test_different_config_is_a_different_batch() {
        let dir = tempdir().unwrap();
        let store = HistoryStore::new(dir.path());

        store.save(&batch(), &snapshot(), Some("one")).unwrap();
        let other = ConfigSnapshot {
            image_ratio: "2:3".to_string(),
            ..snapshot()
        };
        let path = store.save(&batch(), &other, Some("two.json")).unwrap();

        assert_eq!(path.file_name().unwrap(), "two.json");
        assert_eq!(store.list().unwrap().len(), 2);
    }

    #[test]
    fn test_hash_ignores_outcomes_but_not_order() {
        let config = snapshot();
        let mut tasks = batch();
        let before = HistoryRecord::from_tasks(&tasks, &config).content_hash().unwrap();
        tasks[1].status = TaskStatus::Failed;
        let after = HistoryRecord::from_tasks(&tasks, &config).content_hash().unwrap();
        assert_eq!(before, after);

        tasks.reverse();
        let reordered = HistoryRecord::from_tasks(&tasks, &config).content_hash().unwrap();
        assert_ne!(before, reordered);
    }

    #[test]
    fn test_list_is_newest_first_and_skips_broken_files() {
        let dir = tempdir().unwrap();
        let store = HistoryStore::new(dir.path());

        store.save(&batch(), &snapshot(), Some("older")).unwrap();
        std::thread::sleep(Duration::from_millis(50));
        store.save(&[Task::new(9, "another")], &snapshot(), Some("newer")).unwrap();
        std::fs::write(dir.path().join("broken.json"), "not json").unwrap();

        let names: Vec<_> = store.list().unwrap().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["newer.json", "older.json"]);
    }

    #[test]
    fn test_load_accepts_string_numbers() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("legacy.json");
        std::fs::write(
            &path,
            r#"{"version":"3.4","prompts":[
                {"number":"12","prompt":"p","status":"失败","error_msg":"download failed: HTTP 404"},
                {"number":3,"prompt":"q","status":"生成中","image_url":"http://h/x.png"}
            ]}"#,
        )
        .unwrap();

        let tasks = HistoryStore::load(&path).unwrap().tasks();
        assert_eq!(tasks[0].number, "12");
        assert_eq!(tasks[0].status, TaskStatus::Failed);
        assert_eq!(tasks[0].error_detail.as_deref(), Some("download failed: HTTP 404"));
        assert_eq!(tasks[1].status, TaskStatus::Waiting);
        assert!(tasks[1].result_locator.is_none());
    }

    #[test]
    fn test_text_keys_survive_load_list_and_save() {
        let dir = tempdir().unwrap();
        let store = HistoryStore::new(dir.path());
        let path = dir.path().join("imported.json");
        std::fs::write(
            &path,
            r#"{"version":"3.4","total_prompts":2,"prompts":[
                {"number":"S01","prompt":"opening shot","status":"成功","actual_filename":"S01.png"},
                {"number":"S02","prompt":"close up","status":"等待中"}
            ]}"#,
        )
        .unwrap();

        let tasks = HistoryStore::load(&path).unwrap().tasks();
        assert_eq!(tasks[0].number, "S01");
        assert_eq!(tasks[1].number, "S02");
        assert_eq!(tasks[1].status, TaskStatus::Waiting);

        let listed: Vec<_> = store.list().unwrap().into_iter().map(|s| s.name).collect();
        assert_eq!(listed, vec!["imported.json"]);

        let saved = store.save(&tasks, &snapshot(), Some("again")).unwrap();
        let reloaded = HistoryStore::load(&saved).unwrap();
        assert_eq!(reloaded.prompts[0].number, "S01");
    }

    #[test]
    fn test_delete_and_name_validation() {
        let dir = tempdir().unwrap();
        let store = HistoryStore::new(dir.path());
        let path = store.save(&batch(), &snapshot(), None).unwrap();
        assert!(path.file_name().unwrap().to_string_lossy().starts_with("sora_history_"));

        store.delete(&path).unwrap();
        assert!(store.list().unwrap().is_empty());

        let err = store.save(&batch(), &snapshot(), Some("../escape")).unwrap_err();
        assert!(matches!(err, HistoryError::InvalidName(_)));
    }
}
