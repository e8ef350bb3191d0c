//! Download manager: task queue, bounded execution and completion routing

use crate::adblock::spawn_flush_task;
use crate::config::Config;
use crate::context::{EngineContext, Resolver};
use crate::error::{Error, Result};
use crate::scheduler::Scheduler;
use crate::task::{TaskDownloader, TaskStatus};
use crate::types::{
    DownloadTask, Event, RunningTask, Severity, StatusSnapshot, TaskId, TaskRequest,
};
use std::collections::{BTreeMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Capacity of the event channel; slow subscribers lag rather than block
const EVENT_CHANNEL_CAPACITY: usize = 1000;

struct Queues {
    pending: VecDeque<DownloadTask>,
    running: BTreeMap<TaskId, (DownloadTask, TaskStatus)>,
}

struct Inner {
    ctx: EngineContext,
    scheduler: Scheduler,
    next_id: AtomicU64,
    queues: Mutex<Queues>,
    event_tx: broadcast::Sender<Event>,
    flush_cancel: CancellationToken,
    flush_task: Mutex<Option<JoinHandle<()>>>,
}

/// Accepts download requests and runs them with bounded concurrency
///
/// Cloning is cheap; all clones share the same queues.
///
/// # Example
///
/// ```no_run
/// use media_dl::{Config, DirectResolver, DownloadManager, TaskRequest};
/// use std::sync::Arc;
///
/// # async fn example() -> media_dl::Result<()> {
/// let manager = DownloadManager::new(Config::default(), Arc::new(DirectResolver)).await?;
/// manager.submit(TaskRequest::new(
///     "direct",
///     "https://cdn.example.com/show/e01.m3u8",
///     "/media/show/e01.mp4",
/// ))?;
/// manager.join().await;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct DownloadManager {
    inner: Arc<Inner>,
}

impl DownloadManager {
    /// Manager with tools discovered and the blacklist loaded from `config`
    ///
    /// See [`EngineContext::from_config`].
    pub async fn new(config: Config, resolver: Arc<dyn Resolver>) -> Result<Self> {
        Ok(Self::with_context(
            EngineContext::from_config(config, resolver).await?,
        ))
    }

    /// Manager over a prepared context
    ///
    /// An attached blacklist is flushed every `ad_block.flush_interval` and once
    /// more by [`stop`](Self::stop) or [`join`](Self::join). The periodic flush
    /// needs a Tokio runtime; without one the blacklist is only flushed on demand.
    pub fn with_context(ctx: EngineContext) -> Self {
        let (event_tx, _rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let scheduler = Scheduler::new(ctx.config.download.concurrent);
        let flush_cancel = CancellationToken::new();
        let flush_task = match (&ctx.blacklist, tokio::runtime::Handle::try_current()) {
            (Some(blacklist), Ok(_)) => Some(spawn_flush_task(
                Arc::clone(blacklist),
                ctx.config.ad_block.flush_interval,
                flush_cancel.clone(),
            )),
            (Some(_), Err(_)) => {
                tracing::warn!("No Tokio runtime, ad blacklist will not be flushed periodically");
                None
            }
            (None, _) => None,
        };
        Self {
            inner: Arc::new(Inner {
                ctx,
                scheduler,
                next_id: AtomicU64::new(1),
                queues: Mutex::new(Queues {
                    pending: VecDeque::new(),
                    running: BTreeMap::new(),
                }),
                event_tx,
                flush_cancel,
                flush_task: Mutex::new(flush_task),
            }),
        }
    }

    /// Engine context shared by every task
    pub fn context(&self) -> &EngineContext {
        &self.inner.ctx
    }

    /// Subscribe to manager events
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.inner.event_tx.subscribe()
    }

    /// Queue a request; it starts as soon as a slot is free
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// [`Error::SchedulerClosed`] after [`join`](Self::join) or [`stop`](Self::stop).
    pub fn submit(&self, request: TaskRequest) -> Result<TaskId> {
        let id = TaskId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let task = DownloadTask::from_request(id, request, &self.inner.ctx.config.download);

        self.inner.queues().pending.push_back(task.clone());
        let manager = self.clone();
        let submitted = self
            .inner
            .scheduler
            .submit(move |cancel| async move { manager.process(task, cancel).await });
        if let Err(e) = submitted {
            self.inner.queues().pending.retain(|t| t.id != id);
            return Err(e);
        }

        tracing::debug!(task = %id, "Task queued");
        self.inner.emit(Event::Queued { id });
        Ok(id)
    }

    /// Run one task to its terminal state and route the outcome
    ///
    /// Called by the scheduler for every submitted task. Success calls
    /// `on_finished`; an exhausted retry budget reports to the error sink and calls
    /// `on_error`. Cancellation calls neither.
    pub async fn process(&self, task: DownloadTask, cancel: CancellationToken) {
        let downloader = TaskDownloader::new(self.inner.ctx.clone(), task.clone())
            .with_events(self.inner.event_tx.clone());
        let _active = ActiveGuard::register(&self.inner, &task, downloader.status());
        tracing::info!(
            task = %task.id,
            source = %task.source_key,
            url = %task.url,
            "Task started"
        );
        self.inner.emit(Event::Started { id: task.id });

        match downloader.run(&cancel).await {
            Ok(()) => {
                tracing::info!(task = %task.id, dst = %task.dst.display(), "Task finished");
                self.inner.emit(Event::Finished { id: task.id });
                if let Some(callbacks) = &task.callbacks {
                    let outcome = guarded(|| callbacks.on_finished(&task));
                    self.inner.report_callback(&task, "on_finished", outcome);
                }
            }
            Err(Error::Cancelled) => {
                tracing::info!(task = %task.id, "Task cancelled");
            }
            Err(e) => {
                let detail = e.to_string();
                self.inner.ctx.error_sink.report(
                    Severity::Critical,
                    &format!("download failed: {} {}", task.source_key, task.url),
                    &detail,
                );
                self.inner.emit(Event::Failed {
                    id: task.id,
                    error: detail.clone(),
                });
                if let Some(callbacks) = &task.callbacks {
                    let outcome = guarded(|| callbacks.on_error(&task, &detail));
                    self.inner.report_callback(&task, "on_error", outcome);
                }
            }
        }
    }

    /// Non-blocking snapshot of pending and running tasks
    pub fn get_status(&self) -> StatusSnapshot {
        let queues = self.inner.queues();
        StatusSnapshot {
            pending: queues.pending.iter().cloned().collect(),
            running: queues
                .running
                .values()
                .map(|(task, status)| RunningTask {
                    task: task.clone(),
                    status: status.human_readable_status(),
                })
                .collect(),
        }
    }

    /// Drop pending tasks, cancel running ones and wait for them to wind down
    ///
    /// Ends with a final blacklist flush.
    pub async fn stop(&self) {
        tracing::info!("Stopping download manager");
        self.inner.queues().pending.clear();
        self.inner.scheduler.cancel().await;
        self.inner.finish_flushing().await;
        self.inner.emit(Event::Stopped);
    }

    /// Stop accepting tasks and wait until every queued task has finished
    ///
    /// Ends with a final blacklist flush.
    pub async fn join(&self) {
        self.inner.scheduler.join().await;
        self.inner.finish_flushing().await;
    }
}

impl Inner {
    fn queues(&self) -> MutexGuard<'_, Queues> {
        self.queues.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn finish_flushing(&self) {
        self.flush_cancel.cancel();
        let task = self
            .flush_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Blacklist flush task failed");
            }
        }
    }

    fn emit(&self, event: Event) {
        // No subscribers is fine
        self.event_tx.send(event).ok();
    }

    fn report_callback(&self, task: &DownloadTask, hook: &str, outcome: Result<()>) {
        if let Err(e) = outcome {
            tracing::warn!(task = %task.id, hook, error = %e, "Task callback failed");
            self.ctx.error_sink.report(
                Severity::Warning,
                &format!("{} callback failed: {} {}", hook, task.source_key, task.url),
                &e.to_string(),
            );
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        // The flush task writes once more on its own
        self.flush_cancel.cancel();
    }
}

/// Moves a task from pending to running for as long as it is alive
struct ActiveGuard {
    inner: Arc<Inner>,
    id: TaskId,
}

impl ActiveGuard {
    fn register(inner: &Arc<Inner>, task: &DownloadTask, status: TaskStatus) -> Self {
        let mut queues = inner.queues();
        queues.pending.retain(|t| t.id != task.id);
        queues.running.insert(task.id, (task.clone(), status));
        Self {
            inner: Arc::clone(inner),
            id: task.id,
        }
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.inner.queues().running.remove(&self.id);
    }
}

/// Run a user callback, turning a panic into an error
fn guarded(callback: impl FnOnce() -> Result<()>) -> Result<()> {
    match std::panic::catch_unwind(AssertUnwindSafe(callback)) {
        Ok(result) => result,
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            Err(Error::Callback(format!("panicked: {}", message)))
        }
    }
}
