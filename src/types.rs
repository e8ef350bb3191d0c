//! Core types for media-dl

use crate::config::DownloadConfig;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Unique identifier for a submitted task
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub u64);

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Completion hooks for a task
///
/// Exactly one of the two methods is called once the task reaches a terminal state.
/// Neither is called when the task is cancelled by a stop request. A returned error
/// (or a panic) is reported to the error sink and never affects other tasks.
pub trait TaskCallbacks: Send + Sync {
    /// The destination file has been published
    fn on_finished(&self, task: &DownloadTask) -> Result<()>;

    /// Every attempt failed; `detail` describes the last failure
    fn on_error(&self, task: &DownloadTask, detail: &str) -> Result<()>;
}

/// A download request as handed to [`DownloadManager::submit`](crate::DownloadManager::submit)
///
/// `timeout`, `retry` and `retry_interval` fall back to the configured defaults
/// when left as `None`.
#[derive(Clone, Default)]
pub struct TaskRequest {
    /// Which resolver/site the url belongs to
    pub source_key: String,
    /// Seed url handed to the resolver
    pub url: String,
    /// Final location of the media file
    pub dst: PathBuf,
    /// Time budget for one attempt
    pub timeout: Option<Duration>,
    /// Attempts including the first one
    pub retry: Option<u32>,
    /// Delay between attempts
    pub retry_interval: Option<Duration>,
    /// Opaque caller data carried along with the task
    pub metadata: serde_json::Value,
    /// Completion hooks
    pub callbacks: Option<Arc<dyn TaskCallbacks>>,
}

impl TaskRequest {
    /// Request with the required fields; everything else defaulted
    pub fn new(
        source_key: impl Into<String>,
        url: impl Into<String>,
        dst: impl Into<PathBuf>,
    ) -> Self {
        Self {
            source_key: source_key.into(),
            url: url.into(),
            dst: dst.into(),
            ..Default::default()
        }
    }

    /// Attach completion hooks
    pub fn with_callbacks(mut self, callbacks: Arc<dyn TaskCallbacks>) -> Self {
        self.callbacks = Some(callbacks);
        self
    }
}

/// A submitted task with every policy field filled in; immutable once created
#[derive(Clone)]
pub struct DownloadTask {
    /// Identifier assigned at submission
    pub id: TaskId,
    /// Which resolver/site the url belongs to
    pub source_key: String,
    /// Seed url handed to the resolver
    pub url: String,
    /// Final location of the media file
    pub dst: PathBuf,
    /// Time budget for one attempt
    pub timeout: Duration,
    /// Attempts including the first one (at least 1)
    pub retry: u32,
    /// Delay between attempts
    pub retry_interval: Duration,
    /// Opaque caller data
    pub metadata: serde_json::Value,
    /// Completion hooks
    pub callbacks: Option<Arc<dyn TaskCallbacks>>,
}

impl DownloadTask {
    /// Fill defaulted fields of `request` from `defaults`
    pub fn from_request(id: TaskId, request: TaskRequest, defaults: &DownloadConfig) -> Self {
        Self {
            id,
            source_key: request.source_key,
            url: request.url,
            dst: request.dst,
            timeout: request.timeout.unwrap_or(defaults.timeout),
            retry: request.retry.unwrap_or(defaults.retry).max(1),
            retry_interval: request.retry_interval.unwrap_or(defaults.retry_interval),
            metadata: request.metadata,
            callbacks: request.callbacks,
        }
    }
}

impl std::fmt::Debug for DownloadTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadTask")
            .field("id", &self.id)
            .field("source_key", &self.source_key)
            .field("url", &self.url)
            .field("dst", &self.dst)
            .field("timeout", &self.timeout)
            .field("retry", &self.retry)
            .field("retry_interval", &self.retry_interval)
            .field("metadata", &self.metadata)
            .field("has_callbacks", &self.callbacks.is_some())
            .finish()
    }
}

/// Declared type of a resolved resource
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    /// Single progressive file
    Mp4,
    /// HLS manifest
    M3u8,
    /// Infer from the url suffix
    #[default]
    Auto,
}

impl std::str::FromStr for ResourceKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "mp4" => Ok(ResourceKind::Mp4),
            "m3u8" => Ok(ResourceKind::M3u8),
            "auto" => Ok(ResourceKind::Auto),
            other => Err(Error::config(
                "resource.type",
                format!("unsupported resource type `{other}`"),
            )),
        }
    }
}

/// Concrete download strategy for a resource
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MediaFormat {
    /// Single fetch, then publish
    Mp4,
    /// Manifest + fragments, remuxed into one file
    M3u8,
}

/// Resource locator produced by a resolver; consumed once per attempt
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    /// Direct media or manifest url
    pub url: String,
    /// Declared type
    #[serde(rename = "type", default)]
    pub kind: ResourceKind,
}

impl Resource {
    /// Locator with an explicit type
    pub fn new(url: impl Into<String>, kind: ResourceKind) -> Self {
        Self {
            url: url.into(),
            kind,
        }
    }

    /// Pick the download strategy: explicit type wins, `Auto` looks at the url path suffix
    pub fn format(&self) -> Result<MediaFormat> {
        match self.kind {
            ResourceKind::Mp4 => Ok(MediaFormat::Mp4),
            ResourceKind::M3u8 => Ok(MediaFormat::M3u8),
            ResourceKind::Auto => infer_format(&self.url).ok_or_else(|| Error::UnknownFormat {
                url: self.url.clone(),
            }),
        }
    }
}

/// Infer the format from the url path, ignoring query and fragment
pub(crate) fn infer_format(raw: &str) -> Option<MediaFormat> {
    let path = match url::Url::parse(raw) {
        Ok(u) => u.path().to_ascii_lowercase(),
        Err(_) => raw
            .split(['?', '#'])
            .next()
            .unwrap_or_default()
            .to_ascii_lowercase(),
    };
    if path.ends_with(".mp4") {
        Some(MediaFormat::Mp4)
    } else if path.ends_with(".m3u8") {
        Some(MediaFormat::M3u8)
    } else {
        None
    }
}

/// Severity attached to reports sent to an [`ErrorSink`](crate::ErrorSink)
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Informational
    Info,
    /// Recoverable problem (e.g. a failing callback)
    Warning,
    /// Operation failed
    Error,
    /// A task failed for good
    Critical,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
            Severity::Critical => "critical",
        };
        f.write_str(s)
    }
}

/// A running task together with its human-readable status
#[derive(Clone, Debug)]
pub struct RunningTask {
    /// The task
    pub task: DownloadTask,
    /// Status line, e.g. `downloading: Speed: 1.00 MB/s ...`
    pub status: String,
}

/// Non-blocking snapshot of the manager's queues
#[derive(Clone, Debug, Default)]
pub struct StatusSnapshot {
    /// Submitted but not yet started, in submission order
    pub pending: Vec<DownloadTask>,
    /// Currently running
    pub running: Vec<RunningTask>,
}

/// Events broadcast by the download manager
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    /// Task accepted into the pending queue
    Queued {
        /// Task id
        id: TaskId,
    },
    /// Task left the pending queue and started its first attempt
    Started {
        /// Task id
        id: TaskId,
    },
    /// An attempt failed and another one will follow after the retry interval
    Retrying {
        /// Task id
        id: TaskId,
        /// Attempts still available
        retry_left: u32,
        /// Failure of the attempt that just ended
        error: String,
    },
    /// Destination file published
    Finished {
        /// Task id
        id: TaskId,
    },
    /// Retry budget exhausted
    Failed {
        /// Task id
        id: TaskId,
        /// Last failure
        error: String,
    },
    /// The manager was stopped
    Stopped,
}
