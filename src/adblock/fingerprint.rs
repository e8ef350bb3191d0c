//! Fragment fingerprints and the probe that produces them

use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tokio::process::Command;

/// Structural signature of a fragment's first video packet
///
/// Two fragments from the same program normally share all four values; injected
/// clips tend to differ in at least one of them.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FingerprintTuple {
    /// Ticks per second of the stream time base (e.g. 90000)
    pub time_base: u64,
    /// First packet duration in time-base ticks
    pub duration: i64,
    /// Frame width
    pub width: u32,
    /// Frame height
    pub height: u32,
}

/// Probe result for one fragment
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Fingerprint {
    /// MD5 hex digest of the whole file
    pub hash: String,
    /// Structural signature; `None` when the fragment could not be demuxed
    pub tuple: Option<FingerprintTuple>,
}

impl Fingerprint {
    /// Whether the probe failed to read a video packet
    pub fn parse_error(&self) -> bool {
        self.tuple.is_none()
    }
}

/// Reads fingerprints from fetched fragment files
///
/// Probing decodes media headers and hashes whole files; implementations must keep
/// that work off the async executor threads.
#[async_trait]
pub trait FragmentProber: Send + Sync {
    /// Probe one fragment
    ///
    /// A fragment that cannot be demuxed is not an error: it yields a fingerprint
    /// with `tuple: None`. Errors are reserved for I/O failures on the file itself.
    async fn probe(&self, path: &Path) -> Result<Fingerprint>;
}

/// Hash a file's content as lowercase MD5 hex, on the blocking pool
pub async fn content_hash(path: &Path) -> Result<String> {
    let path = path.to_path_buf();
    let digest = tokio::task::spawn_blocking(move || -> Result<String> {
        let bytes = std::fs::read(&path)?;
        Ok(format!("{:x}", md5::compute(bytes)))
    })
    .await
    .map_err(|e| Error::FingerprintParse(format!("hash worker failed: {}", e)))??;
    Ok(digest)
}

/// Prober backed by the external `ffprobe` binary
#[derive(Debug, Clone)]
pub struct FfprobeProber {
    binary_path: PathBuf,
}

#[derive(Debug, Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
    #[serde(default)]
    packets: Vec<ProbePacket>,
}

#[derive(Debug, Deserialize)]
struct ProbeStream {
    width: Option<u32>,
    height: Option<u32>,
    time_base: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProbePacket {
    duration: Option<i64>,
    dts: Option<i64>,
}

impl FfprobeProber {
    /// Prober using an explicit binary path
    pub fn new(binary_path: PathBuf) -> Self {
        Self { binary_path }
    }

    /// Look for `ffprobe` in PATH
    pub fn from_path() -> Option<Self> {
        which::which("ffprobe").ok().map(Self::new)
    }

    fn command(&self, path: &Path) -> Command {
        let mut cmd = Command::new(&self.binary_path);
        cmd.args(["-v", "error", "-select_streams", "v:0"])
            .args(["-show_entries", "stream=width,height,time_base"])
            .args(["-show_entries", "packet=duration,dts"])
            .args(["-read_intervals", "%+#5"])
            .args(["-of", "json"])
            .arg(path)
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl FragmentProber for FfprobeProber {
    async fn probe(&self, path: &Path) -> Result<Fingerprint> {
        let hash = content_hash(path).await?;

        let output = self
            .command(path)
            .output()
            .await
            .map_err(|e| Error::ExternalTool(format!("Failed to execute ffprobe: {}", e)))?;

        let tuple = if output.status.success() {
            parse_probe_output(&output.stdout)
        } else {
            None
        };
        if tuple.is_none() {
            tracing::debug!(path = %path.display(), "Fragment has no readable video packet");
        }
        Ok(Fingerprint { hash, tuple })
    }
}

/// Ticks per second from an ffprobe time base such as `1/90000`
fn ticks_per_second(time_base: &str) -> Option<u64> {
    let (num, den) = time_base.split_once('/')?;
    let num: u64 = num.trim().parse().ok()?;
    let den: u64 = den.trim().parse().ok()?;
    if num == 0 {
        return None;
    }
    Some(den / num)
}

/// Extract the first video packet that carries a dts, with the stream geometry
fn parse_probe_output(stdout: &[u8]) -> Option<FingerprintTuple> {
    let parsed: ProbeOutput = serde_json::from_slice(stdout).ok()?;
    let stream = parsed.streams.first()?;
    let packet = parsed.packets.iter().find(|p| p.dts.is_some())?;
    Some(FingerprintTuple {
        time_base: ticks_per_second(stream.time_base.as_deref()?)?,
        duration: packet.duration?,
        width: stream.width?,
        height: stream.height?,
    })
}
