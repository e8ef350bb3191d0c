//! Single-file downloads

use super::{FormatStatus, Phase};
use crate::context::EngineContext;
use crate::error::{Error, Result};
use crate::progress::SharedTracker;
use crate::scratch::ScratchDir;
use crate::utils::atomic_publish;
use std::path::Path;
use tokio_util::sync::CancellationToken;

/// Fetches one resource and publishes it unchanged
#[derive(Debug)]
pub struct Mp4Downloader {
    ctx: EngineContext,
    url: String,
    status: FormatStatus,
}

impl Mp4Downloader {
    /// Downloader for `url`
    pub fn new(ctx: EngineContext, url: String) -> Self {
        Self {
            ctx,
            url,
            status: FormatStatus::default(),
        }
    }

    /// Status handle
    pub fn status(&self) -> FormatStatus {
        self.status.clone()
    }

    /// Fetch into scratch, then publish to `dst`
    pub async fn download(&self, dst: &Path, cancel: &CancellationToken) -> Result<()> {
        self.status.set_phase(Phase::Preparing);
        let scratch = ScratchDir::new_in(&self.ctx.config.download.tmp_dir)?;
        let file = scratch.allocate_file("media");

        let tracker = SharedTracker::new(1);
        self.status.start_downloading(tracker.clone());
        self.ctx
            .fetcher()
            .fetch_to_file(&self.url, &file, &tracker, cancel)
            .await?;

        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        self.status.set_phase(Phase::Publishing);
        atomic_publish(&file, dst).await?;

        self.status.set_phase(Phase::Done);
        tracing::info!(url = %self.url, dst = %dst.display(), "Single-file download complete");
        Ok(())
    }
}
