//! Batch image generator
//! Turns a list of prompts into downloaded images through a chat-completion image API

pub mod api_client;
pub mod config_loader;
pub mod download_manager;
pub mod history_store;
pub mod logger;
pub mod prompt_styler;
pub mod reference_matcher;
pub mod response_parser;
pub mod scheduler;
pub mod task;

// Re-export commonly used types for convenience
pub use config_loader::{AppConfig, ConfigManager};

pub use logger::Logger;

pub use task::{Task, TaskStatus};

pub use reference_matcher::ReferenceLibrary;

pub use api_client::ApiClient;

pub use download_manager::DownloadManager;

pub use history_store::HistoryStore;

pub use scheduler::{
    BatchEvent, BatchSummary, HistoryBinding, RequestScheduler, SchedulerConfig, reset_all, reset_for_regeneration,
};
