use std::fs;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{Level, error, info, warn};

use crate::generator::api_client::{ApiClientConfig, GENERATION_TIMEOUT_SECS, ModelVariant, Platform};
use crate::generator::download_manager::{DOWNLOAD_TIMEOUT_SECS, DownloadConfig};
use crate::generator::history_store::ConfigSnapshot;
use crate::generator::prompt_styler::PromptStyle;
use crate::generator::scheduler::{MAX_CONCURRENCY, MIN_CONCURRENCY};

const CONFIG_FILE: &str = "config.toml";

// Define error types for config loading
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML serialization error: {0}")]
    TomlSer(String),

    #[error("API key is not configured")]
    MissingCredential,

    #[error("Output directory is not configured")]
    MissingOutputDirectory,

    #[error("thread_count {0} must be between 1 and 2000")]
    InvalidThreadCount(usize),
}

// Result type alias for config operations
pub type ConfigResult<T> = Result<T, ConfigError>;

// Config structs for config.toml
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct Api {
    pub platform: Platform,
    pub model: ModelVariant,
    pub api_key: String,
    pub allow_insecure_ssl: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint_override: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct Generation {
    pub thread_count: usize,
    pub retry_count: u32,
    pub image_ratio: String,
    pub current_style: String,
    pub custom_style_content: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct Paths {
    pub save_path: String,
    pub history_directory: String,
    pub log_directory: String,
    pub reference_root: String,
    pub reference_library: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct Logging {
    pub log_level: String,
    pub log_format: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, Eq)]
#[serde(default)]
pub struct AppConfig {
    pub api: Api,
    pub generation: Generation,
    pub paths: Paths,
    pub logging: Logging,
}

impl Default for Api {
    fn default() -> Self {
        Self {
            platform: Platform::default(),
            model: ModelVariant::default(),
            api_key: String::new(),
            allow_insecure_ssl: false,
            endpoint_override: None,
        }
    }
}

impl Default for Generation {
    fn default() -> Self {
        Self {
            thread_count: 5,
            retry_count: 3,
            image_ratio: "3:2".to_string(),
            current_style: String::new(),
            custom_style_content: String::new(),
        }
    }
}

impl Default for Paths {
    fn default() -> Self {
        Self {
            save_path: "./output".to_string(),
            history_directory: "./history".to_string(),
            log_directory: "./logs".to_string(),
            reference_root: ".".to_string(),
            reference_library: "./references.json".to_string(),
        }
    }
}

impl Default for Logging {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: "text".to_string(),
        }
    }
}

impl AppConfig {
    /// Check the values a batch cannot run without
    pub fn validate(&self) -> ConfigResult<()> {
        if self.api.api_key.trim().is_empty() {
            return Err(ConfigError::MissingCredential);
        }
        if self.paths.save_path.trim().is_empty() {
            return Err(ConfigError::MissingOutputDirectory);
        }
        let threads = self.generation.thread_count;
        if !(MIN_CONCURRENCY..=MAX_CONCURRENCY).contains(&threads) {
            return Err(ConfigError::InvalidThreadCount(threads));
        }
        Ok(())
    }

    pub fn api_client_config(&self) -> ApiClientConfig {
        ApiClientConfig {
            platform: self.api.platform,
            model: self.api.model,
            api_key: self.api.api_key.trim().to_string(),
            retry_count: self.generation.retry_count,
            allow_insecure_ssl: self.api.allow_insecure_ssl,
            timeout_seconds: GENERATION_TIMEOUT_SECS,
            endpoint_override: self
                .api
                .endpoint_override
                .clone()
                .filter(|url| !url.trim().is_empty()),
            reference_root: PathBuf::from(&self.paths.reference_root),
        }
    }

    pub fn download_config(&self) -> DownloadConfig {
        DownloadConfig {
            timeout_seconds: DOWNLOAD_TIMEOUT_SECS,
            allow_insecure_ssl: self.api.allow_insecure_ssl,
        }
    }

    /// Style applied to outgoing prompts; only custom style text is appended
    pub fn prompt_style(&self) -> PromptStyle {
        PromptStyle::new(
            self.generation.custom_style_content.trim(),
            self.generation.image_ratio.trim(),
        )
    }

    /// Values recorded with each saved batch
    pub fn snapshot(&self) -> ConfigSnapshot {
        ConfigSnapshot {
            api_platform: self.api.platform.to_string(),
            model_type: self.api.model.to_string(),
            thread_count: self.generation.thread_count,
            retry_count: self.generation.retry_count,
            image_ratio: self.generation.image_ratio.clone(),
            current_style: self.generation.current_style.clone(),
            custom_style_content: self.generation.custom_style_content.clone(),
        }
    }
}

/// Something that happened while loading the config, before logging was installed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigNotice {
    pub level: Level,
    pub message: String,
}

impl ConfigNotice {
    fn new(level: Level, message: impl Into<String>) -> Self {
        Self {
            level,
            message: message.into(),
        }
    }
}

// Config manager to handle config.toml
pub struct ConfigManager {
    app_config: RwLock<AppConfig>,
    config_dir: PathBuf,
    notices: Vec<ConfigNotice>,
}

impl ConfigManager {
    // Create a new ConfigManager instance
    pub fn new(config_dir: impl AsRef<Path>) -> ConfigResult<Self> {
        let config_dir = config_dir.as_ref().to_path_buf();
        let mut notices = Vec::new();

        // Create the directory if it doesn't exist
        if !config_dir.exists() {
            notices.push(ConfigNotice::new(
                Level::INFO,
                format!("Creating config directory: {}", config_dir.display()),
            ));
            fs::create_dir_all(&config_dir)?;
        }

        let app_config = Self::load_app_config(&config_dir, &mut notices)?;

        let mut manager = Self {
            app_config: RwLock::new(app_config),
            config_dir,
            notices,
        };

        manager.create_default_config()?;

        Ok(manager)
    }

    pub fn config_path(&self) -> PathBuf {
        self.config_dir.join(CONFIG_FILE)
    }

    /// Emit the loading notices through the installed subscriber
    pub fn log_notices(&self) {
        let config_path = self.config_path();
        for notice in &self.notices {
            if notice.level == Level::ERROR {
                error!(config = %config_path.display(), "{}", notice.message);
            } else if notice.level == Level::WARN {
                warn!(config = %config_path.display(), "{}", notice.message);
            } else {
                info!(config = %config_path.display(), "{}", notice.message);
            }
        }
    }

    // Load app config from config.toml
    fn load_app_config(config_dir: &Path, notices: &mut Vec<ConfigNotice>) -> ConfigResult<AppConfig> {
        let config_path = config_dir.join(CONFIG_FILE);

        if !config_path.exists() {
            notices.push(ConfigNotice::new(
                Level::WARN,
                format!("Config file not found: {}", config_path.display()),
            ));
            return Ok(AppConfig::default());
        }

        let content = fs::read_to_string(&config_path)?;
        match toml::from_str(&content) {
            Ok(config) => Ok(config),
            Err(e) => {
                notices.push(ConfigNotice::new(
                    Level::ERROR,
                    format!("Failed to parse {}: {}", CONFIG_FILE, e),
                ));

                // Backup the old config file
                let backup_path = config_path.with_extension("toml.backup");
                match fs::rename(&config_path, &backup_path) {
                    Ok(()) => notices.push(ConfigNotice::new(
                        Level::WARN,
                        format!("Backed up old config to {}", backup_path.display()),
                    )),
                    Err(backup_err) => notices.push(ConfigNotice::new(
                        Level::WARN,
                        format!("Failed to backup old config: {}", backup_err),
                    )),
                }

                // The default file is written by create_default_config
                Ok(AppConfig::default())
            }
        }
    }

    // Get app config
    pub fn get_app_config(&self) -> AppConfig {
        self.app_config.read().clone()
    }

    // Save app config to file
    pub fn save_app_config(&self, config: &AppConfig) -> ConfigResult<()> {
        let toml_string = toml::to_string_pretty(config).map_err(|e| ConfigError::TomlSer(e.to_string()))?;
        fs::write(self.config_path(), toml_string)?;

        // Update the in-memory config
        *self.app_config.write() = config.clone();

        Ok(())
    }

    // Create config.toml if it doesn't exist
    fn create_default_config(&mut self) -> ConfigResult<()> {
        let config_path = self.config_path();
        if !config_path.exists() {
            self.save_app_config(&AppConfig::default())?;
            self.notices.push(ConfigNotice::new(
                Level::INFO,
                format!("Created default config at {}", config_path.display()),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_config_is_created() {
        let dir = tempdir().unwrap();
        let manager = ConfigManager::new(dir.path().join("conf")).unwrap();

        assert!(manager.config_path().exists());
        let config = manager.get_app_config();
        assert_eq!(config, AppConfig::default());
        assert_eq!(config.generation.thread_count, 5);
        assert_eq!(config.api.platform, Platform::ApiYi);
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempdir().unwrap();
        let manager = ConfigManager::new(dir.path()).unwrap();

        let mut config = manager.get_app_config();
        config.api.api_key = "sk-test".to_string();
        config.api.platform = Platform::Yunwu;
        config.api.model = ModelVariant::NanoBanana;
        config.generation.image_ratio = "2:3".to_string();
        manager.save_app_config(&config).unwrap();

        let reloaded = ConfigManager::new(dir.path()).unwrap().get_app_config();
        assert_eq!(reloaded, config);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join(CONFIG_FILE),
            "[api]\nplatform = \"云雾\"\napi_key = \"k\"\n\n[generation]\nthread_count = 50\n",
        )
        .unwrap();

        let config = ConfigManager::new(dir.path()).unwrap().get_app_config();
        assert_eq!(config.api.platform, Platform::Yunwu);
        assert_eq!(config.generation.thread_count, 50);
        assert_eq!(config.generation.retry_count, 3);
        assert_eq!(config.paths.history_directory, "./history");
    }

    #[test]
    fn test_corrupt_file_is_backed_up() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join(CONFIG_FILE), "this is = = not toml").unwrap();

        let config = ConfigManager::new(dir.path()).unwrap().get_app_config();
        assert_eq!(config, AppConfig::default());
        assert!(dir.path().join("config.toml.backup").exists());
    }

    #[test]
    fn test_loading_notices_are_kept_for_later_logging() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join(CONFIG_FILE), "this is = = not toml").unwrap();

        let manager = ConfigManager::new(dir.path()).unwrap();
        let levels: Vec<Level> = manager.notices.iter().map(|n| n.level).collect();
        assert_eq!(levels, vec![Level::ERROR, Level::WARN, Level::INFO]);
        assert!(manager.notices[1].message.contains("config.toml.backup"));
        assert!(manager.notices[2].message.starts_with("Created default config"));

        let fresh = ConfigManager::new(dir.path()).unwrap();
        assert!(fresh.notices.is_empty());
        fresh.log_notices();
    }

    #[test]
    fn test_validation() {
        let mut config = AppConfig::default();
        assert!(matches!(config.validate(), Err(ConfigError::MissingCredential)));

        config.api.api_key = "k".to_string();
        assert!(config.validate().is_ok());

        config.generation.thread_count = 2001;
        assert!(matches!(config.validate(), Err(ConfigError::InvalidThreadCount(2001))));

        config.generation.thread_count = 1;
        config.paths.save_path = " ".to_string();
        assert!(matches!(config.validate(), Err(ConfigError::MissingOutputDirectory)));
    }

    #[test]
    fn test_component_slices() {
        let mut config = AppConfig::default();
        config.generation.custom_style_content = "水彩".to_string();
        config.api.endpoint_override = Some("  ".to_string());

        assert_eq!(config.prompt_style(), PromptStyle::new("水彩", "3:2"));
        assert!(config.api_client_config().endpoint_override.is_none());
        assert_eq!(config.snapshot().api_platform, "apiyi");
        assert_eq!(config.snapshot().model_type, "sora_image");
    }
}
