//! Batch scheduler
//!
//! This module runs a batch of tasks through generation and download:
//! 1. Every waiting task is dispatched once a concurrency permit is free
//! 2. The permit is held for the whole generate → download pipeline, so the
//!    number of tasks in flight never exceeds the configured limit
//! 3. Each state change is published as a [`BatchEvent`] keyed by the task's
//!    stable slot index
//! 4. When nothing is left in flight the batch is saved to history and a
//!    single `Finished` event closes the stream

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Local;
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{Instrument, debug, error, info, warn};
use uuid::Uuid;

use crate::generator::api_client::{AttemptNotice, GenerationRequest, ImageGenerator};
use crate::generator::download_manager::ArtifactStore;
use crate::generator::history_store::{ConfigSnapshot, HistoryStore};
use crate::generator::prompt_styler::PromptStyle;
use crate::generator::reference_matcher::ReferenceLibrary;
use crate::generator::task::{
    DOWNLOAD_FAILED_PREFIX, GENERATION_FAILED_PREFIX, Task, TaskStateChange, TaskStatus, TransitionError,
};

/// Smallest accepted concurrency limit
pub const MIN_CONCURRENCY: usize = 1;

/// Largest accepted concurrency limit
pub const MAX_CONCURRENCY: usize = 2000;

/// Error types for the scheduler
#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("Concurrency limit {0} is outside 1..=2000")]
    InvalidConcurrency(usize),

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error("Unknown task slot: {0}")]
    UnknownTask(usize),

    #[error("Task join error: {0}")]
    Join(String),
}

/// Result type for scheduler operations
pub type SchedulerResult<T> = Result<T, SchedulerError>;

/// Where finished batches are recorded
#[derive(Debug, Clone)]
pub struct HistoryBinding {
    pub store: HistoryStore,
    pub snapshot: ConfigSnapshot,
}

/// Scheduler configuration
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub concurrency_limit: usize,
    pub prompt_style: PromptStyle,
    pub output_dir: PathBuf,
    /// Auto-save target; `None` disables history
    pub history: Option<HistoryBinding>,
}

/// Counts of tasks per state at one moment
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchProgress {
    pub waiting: usize,
    pub active: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub total: usize,
}

impl BatchProgress {
    fn of(board: &DashMap<usize, Task>) -> Self {
        let mut progress = BatchProgress::default();
        for entry in board.iter() {
            progress.total += 1;
            match entry.status {
                TaskStatus::Waiting => progress.waiting += 1,
                TaskStatus::Succeeded => progress.succeeded += 1,
                TaskStatus::Failed => progress.failed += 1,
                _ => progress.active += 1,
            }
        }
        progress
    }
}

/// Outcome of a whole batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchSummary {
    pub batch_id: Uuid,
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Set when the batch was cancelled before every task was dispatched
    pub cancelled: bool,
    pub elapsed: Duration,
    pub average_per_task: Duration,
    pub history_path: Option<PathBuf>,
}

/// Event published while a batch runs
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchEvent {
    State {
        change: TaskStateChange,
        progress: BatchProgress,
    },
    Finished(BatchSummary),
}

/// State shared by the dispatcher and every pipeline of one batch
struct BatchContext {
    board: Arc<DashMap<usize, Task>>,
    events: mpsc::UnboundedSender<BatchEvent>,
    generator: Arc<dyn ImageGenerator>,
    store: Arc<dyn ArtifactStore>,
    output_dir: PathBuf,
}

impl BatchContext {
    /// Apply a lifecycle edge to one task and publish it
    fn transition<F>(&self, key: usize, next: TaskStatus, detail: Option<String>, apply: F) -> SchedulerResult<()>
    where
        F: FnOnce(&mut Task),
    {
        // The entry guard must be released before the board is scanned for progress
        let change = {
            let mut task = self.board.get_mut(&key).ok_or(SchedulerError::UnknownTask(key))?;
            let from = task.transition(key, next)?;
            apply(task.value_mut());
            TaskStateChange {
                key,
                number: task.number.clone(),
                from,
                to: next,
                detail,
            }
        };

        let progress = BatchProgress::of(&self.board);
        // A dropped receiver only means nobody is listening
        let _ = self.events.send(BatchEvent::State { change, progress });
        Ok(())
    }

    fn fail(&self, key: usize, prefix: &str, cause: impl std::fmt::Display) -> SchedulerResult<()> {
        let message = format!("{}: {}", prefix, cause);
        warn!("Task {} failed: {}", key, message);
        self.transition(key, TaskStatus::Failed, Some(message.clone()), |task| {
            task.error_detail = Some(message);
        })
    }

    fn on_attempt(&self, key: usize, notice: AttemptNotice) {
        let result = match notice {
            AttemptNotice::Retrying { retry, limit, error } => self.transition(
                key,
                TaskStatus::Retrying { attempt: retry, limit },
                Some(error),
                |_| {},
            ),
            AttemptNotice::Resumed { .. } => self.transition(key, TaskStatus::Generating, None, |_| {}),
        };
        if let Err(e) = result {
            warn!("Ignoring attempt notice for task {}: {}", key, e);
        }
    }

    /// Generate then download one task. The permit is released on return.
    async fn run_pipeline(
        self: Arc<Self>,
        key: usize,
        number: String,
        request: GenerationRequest,
        _permit: OwnedSemaphorePermit,
    ) -> SchedulerResult<()> {
        let observer = |notice: AttemptNotice| self.on_attempt(key, notice);

        let locator = match self.generator.generate(&request, &observer).await {
            Ok(locator) => locator,
            Err(e) => return self.fail(key, GENERATION_FAILED_PREFIX, e),
        };

        let stored_locator = locator.clone();
        self.transition(key, TaskStatus::Downloading, None, |task| {
            task.result_locator = Some(stored_locator);
        })?;

        match self.store.fetch_and_store(&locator, &number, &self.output_dir).await {
            Ok(filename) => {
                info!("Task {} saved as {}", key, filename);
                self.transition(key, TaskStatus::Succeeded, None, |task| {
                    task.local_filename = Some(filename);
                    task.error_detail = None;
                })
            }
            Err(e) => self.fail(key, DOWNLOAD_FAILED_PREFIX, e),
        }
    }
}

/// Handle to a running batch
pub struct BatchHandle {
    batch_id: Uuid,
    events: mpsc::UnboundedReceiver<BatchEvent>,
    cancel: watch::Sender<bool>,
    driver: JoinHandle<Vec<Task>>,
}

impl BatchHandle {
    pub fn batch_id(&self) -> Uuid {
        self.batch_id
    }

    /// Next event; `None` once the batch has finished and all events were read
    pub async fn next_event(&mut self) -> Option<BatchEvent> {
        self.events.recv().await
    }

    /// Stop dispatching. Tasks already in flight run to completion; the rest stay Waiting.
    pub fn cancel(&self) {
        let _ = self.cancel.send(true);
    }

    /// Wait for the batch and return every task in slot order
    pub async fn join(self) -> SchedulerResult<Vec<Task>> {
        self.driver.await.map_err(|e| SchedulerError::Join(e.to_string()))
    }
}

/// Dispatches batches of tasks to a generator and an artifact store
pub struct RequestScheduler {
    generator: Arc<dyn ImageGenerator>,
    store: Arc<dyn ArtifactStore>,
    library: Arc<ReferenceLibrary>,
    config: SchedulerConfig,
}

impl RequestScheduler {
    pub fn new(
        generator: Arc<dyn ImageGenerator>,
        store: Arc<dyn ArtifactStore>,
        library: Arc<ReferenceLibrary>,
        config: SchedulerConfig,
    ) -> SchedulerResult<Self> {
        validate_concurrency(config.concurrency_limit)?;
        Ok(Self {
            generator,
            store,
            library,
            config,
        })
    }

    /// Request sent for a task: decorated prompt plus the references it mentions
    fn build_request(&self, task: &Task) -> GenerationRequest {
        let prompt = self.config.prompt_style.decorate(&task.prompt);
        let reference_images = if task.reference_images.is_empty() {
            self.library.resolve(&prompt)
        } else {
            task.reference_images.clone()
        };
        GenerationRequest {
            prompt,
            reference_images,
        }
    }

    /// Start a batch. Tasks that are not Waiting are carried through untouched.
    pub fn submit(&self, tasks: Vec<Task>) -> SchedulerResult<BatchHandle> {
        self.submit_with_limit(tasks, self.config.concurrency_limit)
    }

    pub fn submit_with_limit(&self, tasks: Vec<Task>, concurrency_limit: usize) -> SchedulerResult<BatchHandle> {
        validate_concurrency(concurrency_limit)?;

        let batch_id = Uuid::new_v4();
        let board: Arc<DashMap<usize, Task>> = Arc::new(tasks.into_iter().enumerate().collect());
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (cancel_tx, cancel_rx) = watch::channel(false);

        // Requests are built up front so the dispatcher does not borrow the scheduler
        let mut dispatch: Vec<(usize, String, GenerationRequest)> = board
            .iter()
            .filter(|entry| entry.status == TaskStatus::Waiting)
            .map(|entry| (*entry.key(), entry.number.clone(), self.build_request(entry.value())))
            .collect();
        dispatch.sort_by_key(|(key, _, _)| *key);

        info!(
            "Submitting batch {}: {} tasks, {} to dispatch, concurrency {}",
            batch_id,
            board.len(),
            dispatch.len(),
            concurrency_limit
        );

        let context = Arc::new(BatchContext {
            board,
            events: events_tx,
            generator: self.generator.clone(),
            store: self.store.clone(),
            output_dir: self.config.output_dir.clone(),
        });

        let driver = tokio::spawn(
            drive_batch(
                batch_id,
                context,
                dispatch,
                concurrency_limit,
                cancel_rx,
                self.config.history.clone(),
            )
            .instrument(tracing::info_span!("batch", id = %batch_id)),
        );

        Ok(BatchHandle {
            batch_id,
            events: events_rx,
            cancel: cancel_tx,
            driver,
        })
    }
}

fn validate_concurrency(limit: usize) -> SchedulerResult<()> {
    if (MIN_CONCURRENCY..=MAX_CONCURRENCY).contains(&limit) {
        Ok(())
    } else {
        Err(SchedulerError::InvalidConcurrency(limit))
    }
}

async fn drive_batch(
    batch_id: Uuid,
    context: Arc<BatchContext>,
    dispatch: Vec<(usize, String, GenerationRequest)>,
    concurrency_limit: usize,
    mut cancel_rx: watch::Receiver<bool>,
    history: Option<HistoryBinding>,
) -> Vec<Task> {
    let started = Instant::now();
    let semaphore = Arc::new(Semaphore::new(concurrency_limit));
    let mut join_set = JoinSet::new();
    let mut dispatched = 0usize;
    let mut cancelled = false;

    for (key, number, request) in dispatch {
        if *cancel_rx.borrow() {
            cancelled = true;
            break;
        }

        let permit = tokio::select! {
            permit = semaphore.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
            _ = cancel_requested(&mut cancel_rx) => {
                cancelled = true;
                break;
            }
        };

        if let Err(e) = context.transition(key, TaskStatus::Generating, None, |_| {}) {
            error!("Failed to dispatch task {}: {}", key, e);
            continue;
        }
        dispatched += 1;

        let span = tracing::info_span!("task", key, number = %number);
        join_set.spawn(context.clone().run_pipeline(key, number, request, permit).instrument(span));
    }

    if cancelled {
        info!("Batch {} cancelled after dispatching {} tasks", batch_id, dispatched);
    }

    while let Some(result) = join_set.join_next().await {
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("Task error: {}", e),
            Err(e) => error!("Join error: {}", e),
        }
    }

    // A pipeline that panicked leaves its task mid-flight; close it out
    let stranded: Vec<usize> = context
        .board
        .iter()
        .filter(|entry| entry.status.is_active())
        .map(|entry| *entry.key())
        .collect();
    for key in stranded {
        if let Err(e) = context.fail(key, GENERATION_FAILED_PREFIX, "worker stopped unexpectedly") {
            error!("Failed to close out task {}: {}", key, e);
        }
    }

    let mut tasks: Vec<(usize, Task)> = context
        .board
        .iter()
        .map(|entry| (*entry.key(), entry.value().clone()))
        .collect();
    tasks.sort_by_key(|(key, _)| *key);
    let tasks: Vec<Task> = tasks.into_iter().map(|(_, task)| task).collect();

    let history_path = match history {
        Some(binding) if !tasks.is_empty() => save_history(binding, tasks.clone()).await,
        _ => None,
    };

    let progress = BatchProgress::of(&context.board);
    let elapsed = started.elapsed();
    let summary = BatchSummary {
        batch_id,
        total: progress.total,
        succeeded: progress.succeeded,
        failed: progress.failed,
        cancelled,
        elapsed,
        average_per_task: if dispatched > 0 {
            elapsed / dispatched as u32
        } else {
            Duration::ZERO
        },
        history_path,
    };

    info!(
        "Batch {} finished: {} succeeded, {} failed, {} total in {:.1}s",
        batch_id,
        summary.succeeded,
        summary.failed,
        summary.total,
        summary.elapsed.as_secs_f64()
    );
    let _ = context.events.send(BatchEvent::Finished(summary));

    tasks
}

/// Resolves once cancellation is requested; never if the handle is dropped
async fn cancel_requested(rx: &mut watch::Receiver<bool>) {
    if rx.wait_for(|cancelled| *cancelled).await.is_err() {
        std::future::pending::<()>().await;
    }
}

async fn save_history(binding: HistoryBinding, tasks: Vec<Task>) -> Option<PathBuf> {
    let name = format!("auto_save_{}", Local::now().format("%Y%m%d_%H%M%S"));
    let save = move || binding.store.save(&tasks, &binding.snapshot, Some(name.as_str()));
    let saved = tokio::task::spawn_blocking(save).await;

    match saved {
        Ok(Ok(path)) => Some(path),
        Ok(Err(e)) => {
            warn!("Failed to auto-save history: {}", e);
            None
        }
        Err(e) => {
            warn!("History save task failed: {}", e);
            None
        }
    }
}

/// Move the given terminal tasks back to Waiting. Returns how many were reset.
pub fn reset_for_regeneration(tasks: &mut [Task], keys: &[usize]) -> usize {
    let mut reset = 0;
    for &key in keys {
        match tasks.get_mut(key).map(|task| task.reset(key)) {
            Some(Ok(_)) => reset += 1,
            Some(Err(e)) => debug!("Not resetting: {}", e),
            None => debug!("Not resetting unknown slot {}", key),
        }
    }
    reset
}

/// Move every terminal task back to Waiting. Returns how many were reset.
pub fn reset_all(tasks: &mut [Task]) -> usize {
    let keys: Vec<usize> = tasks
        .iter()
        .enumerate()
        .filter(|(_, task)| task.status.is_terminal())
        .map(|(key, _)| key)
        .collect();
    reset_for_regeneration(tasks, &keys)
}
