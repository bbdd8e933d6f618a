use std::env::consts::{ARCH, FAMILY, OS};
use std::env::current_dir;
use std::fs::read_to_string;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Error, anyhow, bail};
use console::{Term, style, user_attended};
use dialoguer::Confirm;
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use tracing::{error, info, trace, warn};

use crate::generator::task::DEFAULT_ERROR_DISPLAY_CHARS;
use crate::generator::{
    ApiClient, AppConfig, BatchEvent, BatchSummary, ConfigManager, DownloadManager, HistoryBinding, HistoryStore,
    Logger, ReferenceLibrary, RequestScheduler, SchedulerConfig, Task, TaskStatus, reset_all, reset_for_regeneration,
};

/// The name of the cargo package.
const NAME: &str = env!("CARGO_PKG_NAME");

/// The version of the cargo package.
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// The authors who created the package.
const AUTHORS: &str = env!("CARGO_PKG_AUTHORS");

const DEFAULT_CONFIG_DIR: &str = "config";

const PROGRESS_TEMPLATE: &str = "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}";

const USAGE: &str = "usage:
  sora_batch_generator <prompts.txt> [config_dir]
  sora_batch_generator resume <history.json> [config_dir]
  sora_batch_generator history [config_dir]
  sora_batch_generator history delete <history.json> [config_dir]";

/// What the user asked the program to do.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Command {
    /// Generate every prompt in a text file.
    Generate(PathBuf),
    /// Re-run the unfinished prompts of a saved batch.
    Resume(PathBuf),
    /// Print the saved batches.
    History,
    /// Remove a saved batch.
    DeleteHistory(PathBuf),
}

/// Parse a prompt file: one prompt per non-empty line, optionally prefixed
/// with `N|` to give an explicit numeric key. Otherwise the line number is the key.
fn parse_prompts(content: &str) -> Vec<Task> {
    content
        .lines()
        .enumerate()
        .filter_map(|(index, line)| {
            let line = line.trim();
            if line.is_empty() {
                return None;
            }
            let explicit = line
                .split_once('|')
                .and_then(|(number, prompt)| Some((number.trim().parse::<u64>().ok()?, prompt.trim())));
            match explicit {
                Some((_, prompt)) if prompt.is_empty() => None,
                Some((number, prompt)) => Some(Task::new(number, prompt)),
                None => Some(Task::new(index + 1, line)),
            }
        })
        .collect()
}

fn progress_bar(len: u64) -> ProgressBar {
    let progress_style = ProgressStyle::default_bar()
        .template(PROGRESS_TEMPLATE)
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=>-");

    let progress_bar = ProgressBar::new(len);
    progress_bar.set_style(progress_style);
    progress_bar.set_draw_target(ProgressDrawTarget::stderr_with_hz(5));
    progress_bar.enable_steady_tick(Duration::from_millis(200));
    progress_bar
}

/// A program class that handles the flow of the generator user experience and steps of execution.
pub(crate) struct Program {
    command: Command,
    config_dir: PathBuf,
}

impl Program {
    /// Builds the program from command line arguments (without the binary name).
    pub(crate) fn from_args(args: Vec<String>) -> Result<Self, Error> {
        let mut args = args.into_iter().peekable();
        let first = args.next().ok_or_else(|| anyhow!("{}", USAGE))?;

        let command = match first.as_str() {
            "history" if args.next_if_eq("delete").is_some() => {
                Command::DeleteHistory(PathBuf::from(args.next().ok_or_else(|| anyhow!("{}", USAGE))?))
            }
            "history" => Command::History,
            "resume" => Command::Resume(PathBuf::from(args.next().ok_or_else(|| anyhow!("{}", USAGE))?)),
            "-h" | "--help" => bail!("{}", USAGE),
            _ => Command::Generate(PathBuf::from(first)),
        };
        let config_dir = args
            .next()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_DIR));

        Ok(Self { command, config_dir })
    }

    /// Runs the generator program.
    pub(crate) async fn run(&self) -> Result<(), Error> {
        Term::stdout().set_title("Sora batch generator");

        let config_manager = ConfigManager::new(&self.config_dir).context("Failed to load configuration")?;
        let config = config_manager.get_app_config();
        let logger = Logger::new(&config).context("Failed to initialize logging")?;
        config_manager.log_notices();

        trace!("Starting {}...", NAME);
        trace!("Program Version: {}", VERSION);
        trace!("Program Authors: {}", AUTHORS);
        trace!("ARCH: \"{}\", FAMILY: \"{}\", OS: \"{}\"", ARCH, FAMILY, OS);
        let working_dir = current_dir().context("Failed to get working directory")?;
        trace!("Program Working Directory: {}", working_dir.display());
        trace!("Log Directory: {}", logger.log_dir().display());
        logger.log_system_event("startup", &format!("{} {}", NAME, VERSION));

        let history = HistoryStore::new(&config.paths.history_directory);

        match &self.command {
            Command::History => self.print_history(&history),
            Command::DeleteHistory(path) => {
                // A bare file name refers to the history directory
                let path = if path.exists() { path.clone() } else { history.dir().join(path) };
                history
                    .delete(&path)
                    .with_context(|| format!("Failed to delete history record {}", path.display()))?;
                println!("Deleted {}", path.display());
                Ok(())
            }
            Command::Generate(path) => {
                let content = read_to_string(path)
                    .with_context(|| format!("Failed to read prompt file {}", path.display()))?;
                let tasks = parse_prompts(&content);
                info!("Loaded {} prompts from {}", tasks.len(), path.display());
                self.generate(&config, &logger, history, tasks).await
            }
            Command::Resume(path) => {
                let record = HistoryStore::load(path)
                    .with_context(|| format!("Failed to load history record {}", path.display()))?;
                let mut tasks = record.tasks();
                let waiting = tasks.iter().filter(|t| t.status == TaskStatus::Waiting).count();
                info!("Resuming {}: {} of {} prompts unfinished", path.display(), waiting, tasks.len());

                if waiting == 0 {
                    let regenerate = !tasks.is_empty()
                        && user_attended()
                        && Confirm::new()
                            .with_prompt(format!("All {} prompts are finished. Regenerate all?", tasks.len()))
                            .default(false)
                            .interact()
                            .unwrap_or(false);
                    if !regenerate {
                        println!("Nothing to resume in {}", path.display());
                        return Ok(());
                    }
                    let reset = reset_all(&mut tasks);
                    info!("Regenerating all {} prompts", reset);
                }
                self.generate(&config, &logger, history, tasks).await
            }
        }
    }

    fn print_history(&self, history: &HistoryStore) -> Result<(), Error> {
        let records = history.list()?;
        if records.is_empty() {
            println!("No saved batches in {}", history.dir().display());
        }
        for record in records {
            println!(
                "{}  {}  {} prompts, {} {}, {} {}",
                style(&record.modified_time).dim(),
                style(&record.name).bold(),
                record.total_prompts,
                record.success_count,
                style("succeeded").green(),
                record.failed_count,
                style("failed").red(),
            );
        }
        Ok(())
    }

    async fn generate(
        &self,
        config: &AppConfig,
        logger: &Logger,
        history: HistoryStore,
        mut tasks: Vec<Task>,
    ) -> Result<(), Error> {
        if let Err(e) = config.validate() {
            logger.log_error("config", &e.to_string());
            bail!("{} (edit {})", e, self.config_dir.join("config.toml").display());
        }

        let library = ReferenceLibrary::load(Path::new(&config.paths.reference_library))
            .context("Failed to load the reference library")?;
        if library.is_empty() {
            warn!("Reference library is empty; prompts are sent without reference images");
        } else {
            info!("Reference library holds {} images", library.len());
        }

        let scheduler = RequestScheduler::new(
            Arc::new(ApiClient::new(config.api_client_config())?),
            Arc::new(DownloadManager::new(config.download_config())?),
            Arc::new(library),
            SchedulerConfig {
                concurrency_limit: config.generation.thread_count,
                prompt_style: config.prompt_style(),
                output_dir: PathBuf::from(&config.paths.save_path),
                history: Some(HistoryBinding {
                    store: history,
                    snapshot: config.snapshot(),
                }),
            },
        )?;

        loop {
            let (finished, summary) = self.run_batch(&scheduler, logger, tasks).await?;
            tasks = finished;
            self.print_summary(&summary, &tasks);

            let failed: Vec<usize> = tasks
                .iter()
                .enumerate()
                .filter(|(_, task)| task.status == TaskStatus::Failed)
                .map(|(key, _)| key)
                .collect();

            if failed.is_empty() || summary.cancelled || !user_attended() {
                break;
            }

            let retry = Confirm::new()
                .with_prompt(format!("Retry {} failed prompts?", failed.len()))
                .default(false)
                .interact()
                .unwrap_or(false);
            if !retry {
                break;
            }
            let reset = reset_for_regeneration(&mut tasks, &failed);
            info!("Retrying {} failed prompts", reset);
        }

        Ok(())
    }

    /// Submits one batch and renders its events until it finishes.
    async fn run_batch(
        &self,
        scheduler: &RequestScheduler,
        logger: &Logger,
        tasks: Vec<Task>,
    ) -> Result<(Vec<Task>, BatchSummary), Error> {
        let pending = tasks.iter().filter(|t| t.status == TaskStatus::Waiting).count();
        let mut handle = scheduler.submit(tasks)?;
        let batch_id = handle.batch_id();
        let progress_bar = progress_bar(pending as u64);

        let mut summary = None;
        let mut interrupted = false;
        loop {
            tokio::select! {
                event = handle.next_event() => match event {
                    Some(BatchEvent::State { change, progress }) => {
                        logger.log_task_change(batch_id, &change);
                        if change.to.is_terminal() {
                            progress_bar.inc(1);
                        }
                        progress_bar.set_message(format!(
                            "{} waiting, {} active, {} ok, {} failed",
                            progress.waiting, progress.active, progress.succeeded, progress.failed
                        ));
                    }
                    Some(BatchEvent::Finished(finished)) => {
                        logger.log_batch_summary(&finished);
                        summary = Some(finished);
                    }
                    None => break,
                },
                _ = tokio::signal::ctrl_c(), if !interrupted => {
                    warn!("Interrupted; waiting for in-flight prompts to finish");
                    progress_bar.println("Stopping after the prompts already in flight...");
                    handle.cancel();
                    interrupted = true;
                }
            }
        }
        progress_bar.finish_and_clear();

        let tasks = handle.join().await?;
        let summary = summary.ok_or_else(|| {
            error!("Batch {} ended without a summary", batch_id);
            anyhow!("batch {} ended without a summary", batch_id)
        })?;
        Ok((tasks, summary))
    }

    fn print_summary(&self, summary: &BatchSummary, tasks: &[Task]) {
        println!(
            "{} {} succeeded, {} failed, {} total in {:.1}s (avg {:.1}s)",
            style("Done:").bold(),
            style(summary.succeeded).green(),
            style(summary.failed).red(),
            summary.total,
            summary.elapsed.as_secs_f64(),
            summary.average_per_task.as_secs_f64(),
        );
        for task in tasks.iter().filter(|t| t.status == TaskStatus::Failed) {
            println!(
                "  #{} {}",
                task.number,
                task.display_error(DEFAULT_ERROR_DISPLAY_CHARS).unwrap_or_default()
            );
        }
        if let Some(path) = &summary.history_path {
            println!("History saved to {}", path.display());
        }
    }
}
