//! Fragmented-manifest (HLS) downloads

use super::playlist::{self, MediaPlaylist, Playlist};
use super::{FormatStatus, Phase};
use crate::context::EngineContext;
use crate::error::{Error, Result};
use crate::progress::SharedTracker;
use crate::scratch::ScratchDir;
use crate::utils::atomic_publish;
use std::path::Path;
use tokio_util::sync::CancellationToken;
use url::Url;

/// Master manifests nested deeper than this are rejected
const MAX_VARIANT_DEPTH: usize = 5;

/// Downloads every fragment of an HLS manifest and remuxes them into one file
#[derive(Debug)]
pub struct M3u8Downloader {
    ctx: EngineContext,
    url: String,
    status: FormatStatus,
}

impl M3u8Downloader {
    /// Downloader for the manifest at `url`
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

    /// Follow master manifests down to a media manifest
    ///
    /// Returns the media manifest together with the url it was fetched from, which
    /// is the base for its fragment references.
    async fn fetch_media_playlist(
        &self,
        cancel: &CancellationToken,
    ) -> Result<(Url, MediaPlaylist)> {
        let fetcher = self.ctx.fetcher();
        let mut url = Url::parse(&self.url).map_err(|e| {
            Error::ManifestParse(format!("bad manifest url `{}`: {}", self.url, e))
        })?;

        for _ in 0..=MAX_VARIANT_DEPTH {
            let text = fetcher.fetch_text(url.as_str(), cancel).await?;
            match playlist::parse(&text)? {
                Playlist::Media(media) => return Ok((url, media)),
                Playlist::Master(variants) => {
                    let variant = playlist::select_variant(&variants).ok_or_else(|| {
                        Error::ManifestParse(format!("master manifest {} has no variants", url))
                    })?;
                    tracing::debug!(
                        variant = %variant.uri,
                        resolution = ?variant.resolution,
                        "Selected manifest variant"
                    );
                    url = playlist::join(&url, &variant.uri)?;
                }
            }
        }
        Err(Error::ManifestParse(format!(
            "master manifests nested deeper than {} levels",
            MAX_VARIANT_DEPTH
        )))
    }

    /// Fetch, filter, remux and publish to `dst`
    pub async fn download(&self, dst: &Path, cancel: &CancellationToken) -> Result<()> {
        self.status.set_phase(Phase::Preparing);
        let scratch = ScratchDir::new_in(&self.ctx.config.download.tmp_dir)?;

        self.status.set_phase(Phase::DownloadingManifest);
        let (base, media) = self.fetch_media_playlist(cancel).await?;
        let urls = media.fragment_urls(&base)?;

        let tracker = SharedTracker::new(urls.len());
        self.status.start_downloading(tracker.clone());
        let fetcher = self.ctx.fetcher();
        let mut local = Vec::with_capacity(urls.len());
        // One fragment at a time, in manifest order
        for (i, url) in urls.iter().enumerate() {
            let path = scratch.allocate_file(&format!("{:05}.ts", i));
            fetcher
                .fetch_to_file(url.as_str(), &path, &tracker, cancel)
                .await?;
            local.push(path.to_string_lossy().into_owned());
        }

        let mut lines = media.rewrite(&local)?;
        if let Some(filter) = self.ctx.ad_filter() {
            self.status.set_phase(Phase::FilteringAds);
            lines = filter.filter_lines(&lines, cancel).await?.lines;
        }

        let manifest = scratch.allocate_file("local.m3u8");
        let mut text = lines.join("\n");
        text.push('\n');
        tokio::fs::write(&manifest, text)
            .await
            .map_err(|e| Error::scratch(&manifest, e))?;

        self.status.set_phase(Phase::Remuxing);
        let extension = dst.extension().and_then(|e| e.to_str()).unwrap_or("mp4");
        let output = scratch.allocate_file(&format!("output.{}", extension));
        self.ctx.remuxer.remux(&manifest, &output, cancel).await?;

        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        self.status.set_phase(Phase::Publishing);
        atomic_publish(&output, dst).await?;

        self.status.set_phase(Phase::Done);
        tracing::info!(
            url = %self.url,
            fragments = urls.len(),
            dst = %dst.display(),
            "Manifest download complete"
        );
        Ok(())
    }
}
