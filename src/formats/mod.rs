//! Format downloaders: single-file and fragmented-manifest
//!
//! Both write into a per-attempt scratch directory and publish to the destination
//! only once the complete file exists. A failed or cancelled attempt leaves the
//! destination untouched.

mod m3u8;
mod mp4;
pub mod playlist;

pub use m3u8::M3u8Downloader;
pub use mp4::Mp4Downloader;

use crate::context::EngineContext;
use crate::error::Result;
use crate::progress::SharedTracker;
use crate::types::{MediaFormat, Resource};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio_util::sync::CancellationToken;

/// Where a format downloader currently is
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    /// Allocating scratch space
    Preparing,
    /// Fetching (and following) the manifest
    DownloadingManifest,
    /// Fetching media bytes
    Downloading,
    /// Fingerprinting fragments
    FilteringAds,
    /// Running the remux tool
    Remuxing,
    /// Moving the result into place
    Publishing,
    /// Destination published
    Done,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Phase::Preparing => "preparing",
            Phase::DownloadingManifest => "downloading manifest",
            Phase::Downloading => "downloading",
            Phase::FilteringAds => "filtering ads",
            Phase::Remuxing => "remuxing",
            Phase::Publishing => "publishing",
            Phase::Done => "done",
        };
        f.write_str(s)
    }
}

#[derive(Debug)]
struct StatusState {
    phase: Phase,
    tracker: Option<SharedTracker>,
}

/// Shared, readable-from-anywhere status of one format downloader
#[derive(Clone, Debug)]
pub struct FormatStatus(Arc<Mutex<StatusState>>);

impl Default for FormatStatus {
    fn default() -> Self {
        Self(Arc::new(Mutex::new(StatusState {
            phase: Phase::Preparing,
            tracker: None,
        })))
    }
}

impl FormatStatus {
    fn lock(&self) -> MutexGuard<'_, StatusState> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current phase
    pub fn phase(&self) -> Phase {
        self.lock().phase
    }

    pub(crate) fn set_phase(&self, phase: Phase) {
        self.lock().phase = phase;
    }

    pub(crate) fn start_downloading(&self, tracker: SharedTracker) {
        let mut state = self.lock();
        state.tracker = Some(tracker);
        state.phase = Phase::Downloading;
    }

    /// Phase name, or `downloading: <progress>` while bytes are flowing
    pub fn human_readable_status(&self) -> String {
        let (phase, tracker) = {
            let state = self.lock();
            (state.phase, state.tracker.clone())
        };
        match (phase, tracker) {
            (Phase::Downloading, Some(tracker)) => {
                format!("{}: {}", phase, tracker.human_readable_status())
            }
            (phase, _) => phase.to_string(),
        }
    }
}

/// Downloader chosen for one resolved resource
#[derive(Debug)]
pub enum FormatDownloader {
    /// Single progressive file
    Mp4(Mp4Downloader),
    /// HLS manifest
    M3u8(M3u8Downloader),
}

impl FormatDownloader {
    /// Pick the downloader for `resource`
    ///
    /// # Errors
    ///
    /// [`Error::UnknownFormat`](crate::Error::UnknownFormat) when the type is
    /// `auto` and the url suffix is neither `.mp4` nor `.m3u8`.
    pub fn for_resource(resource: &Resource, ctx: &EngineContext) -> Result<Self> {
        Ok(match resource.format()? {
            MediaFormat::Mp4 => Self::Mp4(Mp4Downloader::new(ctx.clone(), resource.url.clone())),
            MediaFormat::M3u8 => {
                Self::M3u8(M3u8Downloader::new(ctx.clone(), resource.url.clone()))
            }
        })
    }

    /// Download into `dst`
    pub async fn download(&self, dst: &Path, cancel: &CancellationToken) -> Result<()> {
        match self {
            Self::Mp4(d) => d.download(dst, cancel).await,
            Self::M3u8(d) => d.download(dst, cancel).await,
        }
    }

    /// Status handle, valid after the downloader is dropped
    pub fn status(&self) -> FormatStatus {
        match self {
            Self::Mp4(d) => d.status(),
            Self::M3u8(d) => d.status(),
        }
    }

    /// See [`FormatStatus::human_readable_status`]
    pub fn human_readable_status(&self) -> String {
        self.status().human_readable_status()
    }
}
