//! Stream-copy remux of a local manifest into one media file

use crate::error::{Error, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

/// Repackages the fragments referenced by a local manifest into one file
///
/// Implementations must not re-encode. A failed remux fails the attempt.
#[async_trait]
pub trait Remuxer: Send + Sync {
    /// Remux `manifest` into `output`
    async fn remux(
        &self,
        manifest: &Path,
        output: &Path,
        cancel: &CancellationToken,
    ) -> Result<()>;

    /// Name used in logs
    fn name(&self) -> &'static str;
}

/// Remuxer backed by the external `ffmpeg` binary
///
/// # Examples
///
/// ```no_run
/// use media_dl::remux::{FfmpegRemuxer, Remuxer};
/// use std::path::Path;
/// use tokio_util::sync::CancellationToken;
///
/// # async fn example() -> media_dl::Result<()> {
/// let remuxer = FfmpegRemuxer::from_path().expect("ffmpeg not found in PATH");
/// remuxer
///     .remux(Path::new("local.m3u8"), Path::new("out.mp4"), &CancellationToken::new())
///     .await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct FfmpegRemuxer {
    binary_path: PathBuf,
}

impl FfmpegRemuxer {
    /// Remuxer using an explicit binary path
    pub fn new(binary_path: PathBuf) -> Self {
        Self { binary_path }
    }

    /// Look for `ffmpeg` in PATH
    pub fn from_path() -> Option<Self> {
        which::which("ffmpeg").ok().map(Self::new)
    }

    /// Binary this remuxer runs
    pub fn binary_path(&self) -> &Path {
        &self.binary_path
    }

    fn command(&self, manifest: &Path, output: &Path) -> Command {
        let mut cmd = Command::new(&self.binary_path);
        cmd.arg("-y")
            .args(["-allowed_extensions", "ALL"])
            .arg("-i")
            .arg(manifest)
            .args(["-acodec", "copy", "-vcodec", "copy"])
            .args(["-bsf:a", "aac_adtstoasc"])
            .arg(output)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl Remuxer for FfmpegRemuxer {
    async fn remux(
        &self,
        manifest: &Path,
        output: &Path,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut child = self
            .command(manifest, output)
            .spawn()
            .map_err(|e| Error::ExternalTool(format!("Failed to execute ffmpeg: {}", e)))?;

        let status = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                if let Err(e) = child.kill().await {
                    tracing::warn!(error = %e, "Failed to kill ffmpeg after cancellation");
                }
                return Err(Error::Cancelled);
            }
            status = child.wait() => status?,
        };

        if !status.success() {
            return Err(Error::Remux(format!(
                "ffmpeg exited with {} for {}",
                status,
                manifest.display()
            )));
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "ffmpeg"
    }
}

/// Remuxer used when no ffmpeg binary is configured or found
///
/// Single-file downloads keep working; every manifest download fails its attempts
/// with [`Error::ExternalTool`].
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpRemuxer;

#[async_trait]
impl Remuxer for NoOpRemuxer {
    async fn remux(
        &self,
        _manifest: &Path,
        _output: &Path,
        _cancel: &CancellationToken,
    ) -> Result<()> {
        Err(Error::ExternalTool(
            "remuxing requires an external ffmpeg binary. \
             Configure tools.ffmpeg_path or ensure ffmpeg is in PATH."
                .into(),
        ))
    }

    fn name(&self) -> &'static str {
        "noop"
    }
}
