//! Per-task orchestration: resolve, pick a format, download, retry
//!
//! State machine of one task:
//!
//! ```text
//! Preparing -> Searching -> Downloading -> Done
//!                  ^             |
//!                  |             v (attempt failed, budget left)
//!                  +------- WaitingRetry
//!                                | (budget exhausted)
//!                                v
//!                              Failed
//! ```

use crate::context::EngineContext;
use crate::error::{Error, Result};
use crate::formats::{FormatDownloader, FormatStatus};
use crate::retry::{RetryPolicy, run_with_retry};
use crate::types::{DownloadTask, Event};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

/// Lifecycle state of a task
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskState {
    /// Not started
    Preparing,
    /// Resolving the seed url
    Searching,
    /// A format downloader is running
    Downloading,
    /// Sleeping before the next attempt
    WaitingRetry {
        /// Attempts still available
        retry_left: u32,
    },
    /// Destination published
    Done,
    /// Every attempt failed
    Failed,
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskState::Preparing => f.write_str("preparing"),
            TaskState::Searching => f.write_str("searching"),
            TaskState::Downloading => f.write_str("downloading"),
            TaskState::WaitingRetry { retry_left } => {
                write!(f, "waiting retry, retry left: {}", retry_left)
            }
            TaskState::Done => f.write_str("done"),
            TaskState::Failed => f.write_str("failed"),
        }
    }
}

#[derive(Debug)]
struct StatusInner {
    state: TaskState,
    format: Option<FormatStatus>,
}

/// Shared view of a running task's state
#[derive(Clone, Debug)]
pub struct TaskStatus(Arc<Mutex<StatusInner>>);

impl TaskStatus {
    fn new() -> Self {
        Self(Arc::new(Mutex::new(StatusInner {
            state: TaskState::Preparing,
            format: None,
        })))
    }

    fn lock(&self) -> MutexGuard<'_, StatusInner> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set(&self, state: TaskState) {
        self.lock().state = state;
    }

    fn start_format(&self, format: FormatStatus) {
        let mut inner = self.lock();
        inner.format = Some(format);
        inner.state = TaskState::Downloading;
    }

    /// Current state
    pub fn state(&self) -> TaskState {
        self.lock().state
    }

    /// The format downloader's status while downloading, else the state name
    pub fn human_readable_status(&self) -> String {
        let (state, format) = {
            let inner = self.lock();
            (inner.state, inner.format.clone())
        };
        match (state, format) {
            (TaskState::Downloading, Some(format)) => format.human_readable_status(),
            (state, _) => state.to_string(),
        }
    }
}

/// Runs one task through its attempts
#[derive(Debug)]
pub struct TaskDownloader {
    ctx: EngineContext,
    task: DownloadTask,
    status: TaskStatus,
    events: Option<broadcast::Sender<Event>>,
}

impl TaskDownloader {
    /// Downloader for `task`
    pub fn new(ctx: EngineContext, task: DownloadTask) -> Self {
        Self {
            ctx,
            task,
            status: TaskStatus::new(),
            events: None,
        }
    }

    /// Publish [`Event::Retrying`] on `events`
    pub fn with_events(mut self, events: broadcast::Sender<Event>) -> Self {
        self.events = Some(events);
        self
    }

    /// The task being run
    pub fn task(&self) -> &DownloadTask {
        &self.task
    }

    /// Status handle, readable while [`run`](Self::run) is in progress
    pub fn status(&self) -> TaskStatus {
        self.status.clone()
    }

    /// See [`TaskStatus::human_readable_status`]
    pub fn human_readable_status(&self) -> String {
        self.status.human_readable_status()
    }

    /// Run attempts until one succeeds or the retry budget is exhausted
    ///
    /// Each attempt (resolve + download) is bounded by the task's timeout. The
    /// returned error is the last attempt's failure, or [`Error::Cancelled`].
    pub async fn run(&self, cancel: &CancellationToken) -> Result<()> {
        let policy = RetryPolicy {
            attempts: self.task.retry,
            interval: self.task.retry_interval,
            timeout: self.task.timeout,
        };

        let result = run_with_retry(
            &policy,
            cancel,
            |retry_left, err| {
                self.status.set(TaskState::WaitingRetry { retry_left });
                if let Some(events) = &self.events {
                    events
                        .send(Event::Retrying {
                            id: self.task.id,
                            retry_left,
                            error: err.to_string(),
                        })
                        .ok();
                }
            },
            |attempt| self.attempt(attempt, cancel),
        )
        .await;

        match &result {
            Ok(()) => self.status.set(TaskState::Done),
            Err(Error::Cancelled) => {}
            Err(_) => self.status.set(TaskState::Failed),
        }
        result
    }

    async fn attempt(&self, attempt: u32, cancel: &CancellationToken) -> Result<()> {
        self.status.set(TaskState::Searching);
        tracing::info!(
            task = %self.task.id,
            source = %self.task.source_key,
            url = %self.task.url,
            attempt,
            "Starting attempt"
        );

        let resource = self
            .ctx
            .resolver
            .resolve(&self.task.source_key, &self.task.url)
            .await?;
        let downloader = FormatDownloader::for_resource(&resource, &self.ctx)?;

        self.status.start_format(downloader.status());
        downloader.download(&self.task.dst, cancel).await
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::context::Resolver;
    use crate::types::{Resource, ResourceKind, TaskId, TaskRequest};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;
    use tempfile::TempDir;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    /// Resolver failing a fixed number of times before returning `resource`
    struct FlakyResolver {
        failures: u32,
        calls: AtomicU32,
        resource: Resource,
    }

    #[async_trait]
    impl Resolver for FlakyResolver {
        async fn resolve(&self, source_key: &str, url: &str) -> Result<Resource> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                return Err(Error::Resolution {
                    source_key: source_key.to_string(),
                    url: url.to_string(),
                    reason: "not found yet".to_string(),
                });
            }
            Ok(self.resource.clone())
        }
    }

    fn setup(temp: &TempDir, resolver: Arc<dyn Resolver>, retry: u32) -> TaskDownloader {
        let mut config = Config::default();
        config.tools.search_path = false;
        config.download.tmp_dir = temp.path().join("scratch");
        let ctx = EngineContext::new(config, resolver).unwrap();

        let mut request = TaskRequest::new("site", "seed", temp.path().join("out.mp4"));
        request.retry = Some(retry);
        request.retry_interval = Some(Duration::from_millis(5));
        request.timeout = Some(Duration::from_secs(10));
        let task = DownloadTask::from_request(TaskId(1), request, &ctx.config.download);
        TaskDownloader::new(ctx, task)
    }

    #[test]
    fn state_names() {
        assert_eq!(TaskState::Preparing.to_string(), "preparing");
        assert_eq!(
            TaskState::WaitingRetry { retry_left: 2 }.to_string(),
            "waiting retry, retry left: 2"
        );
        assert_eq!(TaskState::Failed.to_string(), "failed");
    }

    #[tokio::test]
    async fn resolution_failures_are_retried_until_success() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/a.mp4"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"payload".to_vec()))
            .mount(&server)
            .await;

        let temp = TempDir::new().unwrap();
        let resolver = Arc::new(FlakyResolver {
            failures: 2,
            calls: AtomicU32::new(0),
            resource: Resource::new(format!("{}/a.mp4", server.uri()), ResourceKind::Auto),
        });
        let (tx, mut rx) = broadcast::channel(16);
        let downloader = setup(&temp, resolver.clone(), 5).with_events(tx);

        downloader.run(&CancellationToken::new()).await.unwrap();

        assert_eq!(resolver.calls.load(Ordering::SeqCst), 3);
        assert_eq!(downloader.status().state(), TaskState::Done);
        assert_eq!(std::fs::read(temp.path().join("out.mp4")).unwrap(), b"payload");

        let mut retry_left = Vec::new();
        while let Ok(Event::Retrying { retry_left: left, .. }) = rx.try_recv() {
            retry_left.push(left);
        }
        assert_eq!(retry_left, vec![4, 3]);
    }

    #[tokio::test]
    async fn unknown_format_consumes_the_retry_budget() {
        let temp = TempDir::new().unwrap();
        let resolver = Arc::new(FlakyResolver {
            failures: 0,
            calls: AtomicU32::new(0),
            resource: Resource::new("https://cdn.example.com/video.flv", ResourceKind::Auto),
        });
        let downloader = setup(&temp, resolver.clone(), 3);

        let err = downloader.run(&CancellationToken::new()).await.unwrap_err();

        assert!(matches!(err, Error::UnknownFormat { .. }));
        assert_eq!(resolver.calls.load(Ordering::SeqCst), 3);
        assert_eq!(downloader.status().state(), TaskState::Failed);
        assert_eq!(downloader.human_readable_status(), "failed");
    }

    #[tokio::test]
    async fn cancelled_run_leaves_state_and_destination_alone() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/slow.mp4"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_bytes(b"late".to_vec())
                    .set_delay(Duration::from_secs(30)),
            )
            .mount(&server)
            .await;

        let temp = TempDir::new().unwrap();
        let resolver = Arc::new(FlakyResolver {
            failures: 0,
            calls: AtomicU32::new(0),
            resource: Resource::new(format!("{}/slow.mp4", server.uri()), ResourceKind::Mp4),
        });
        let downloader = setup(&temp, resolver, 3);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let err = downloader.run(&cancel).await.unwrap_err();
        assert!(err.is_cancelled());
        assert!(!temp.path().join("out.mp4").exists());
        assert_ne!(downloader.status().state(), TaskState::Failed);
    }
}
