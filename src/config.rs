//! Configuration types for media-dl

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::{path::Path, path::PathBuf, time::Duration};

/// Download behavior configuration (concurrency, retry policy, scratch space)
///
/// The retry and timeout values are the defaults applied to tasks submitted
/// without their own values.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DownloadConfig {
    /// Maximum concurrently running tasks (default: 5)
    #[serde(default = "default_concurrent")]
    pub concurrent: usize,

    /// Attempts per task, including the first one (default: 5)
    #[serde(default = "default_retry")]
    pub retry: u32,

    /// Delay between attempts (default: 60 seconds)
    #[serde(default = "default_retry_interval", with = "duration_serde")]
    pub retry_interval: Duration,

    /// Time budget for one attempt, resolve + download (default: 1 hour)
    #[serde(default = "default_timeout", with = "duration_serde")]
    pub timeout: Duration,

    /// Root under which per-attempt scratch directories are created
    #[serde(default = "default_tmp_dir")]
    pub tmp_dir: PathBuf,

    /// User agent sent with every request
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            concurrent: default_concurrent(),
            retry: default_retry(),
            retry_interval: default_retry_interval(),
            timeout: default_timeout(),
            tmp_dir: default_tmp_dir(),
            user_agent: default_user_agent(),
        }
    }
}

/// External tool paths (ffmpeg, ffprobe)
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolsConfig {
    /// Path to ffmpeg executable (auto-detected if None)
    #[serde(default)]
    pub ffmpeg_path: Option<PathBuf>,

    /// Path to ffprobe executable (auto-detected if None)
    #[serde(default)]
    pub ffprobe_path: Option<PathBuf>,

    /// Whether to search PATH for external binaries if explicit paths not set (default: true)
    #[serde(default = "default_true")]
    pub search_path: bool,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: None,
            ffprobe_path: None,
            search_path: true,
        }
    }
}

/// Ad-segment filtering for fragmented manifests
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AdBlockConfig {
    /// Run the filter over every media manifest (default: true)
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// JSON file holding known-ad fragment hashes (None = live fingerprinting only)
    #[serde(default)]
    pub blacklist_path: Option<PathBuf>,

    /// How often a dirty blacklist is flushed to disk (default: 60 seconds)
    #[serde(default = "default_flush_interval", with = "duration_serde")]
    pub flush_interval: Duration,

    /// Fragments probed in parallel during one pass (default: available parallelism)
    #[serde(default = "default_probe_workers")]
    pub probe_workers: usize,
}

impl Default for AdBlockConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            blacklist_path: None,
            flush_interval: default_flush_interval(),
            probe_workers: default_probe_workers(),
        }
    }
}

/// Error log retention
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ErrorLogConfig {
    /// Maximum retained error entries, oldest evicted first (default: 1000)
    #[serde(default = "default_max_error_count")]
    pub max_error_count: usize,
}

impl Default for ErrorLogConfig {
    fn default() -> Self {
        Self {
            max_error_count: default_max_error_count(),
        }
    }
}

/// Main configuration for the download engine
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    /// Concurrency, retry policy and scratch space
    #[serde(default)]
    pub download: DownloadConfig,

    /// External binaries
    #[serde(default)]
    pub tools: ToolsConfig,

    /// Ad-segment filtering
    #[serde(default)]
    pub ad_block: AdBlockConfig,

    /// Error log retention
    #[serde(default)]
    pub errors: ErrorLogConfig,
}

impl Config {
    /// Parse a JSON document, filling every missing field with its default
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Config = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a JSON configuration file
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config {
                message: format!("failed to read '{}': {}", path.display(), e),
                key: None,
            }
        })?;
        Self::from_json_str(&content)
    }

    /// Reject values the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.download.concurrent == 0 {
            return Err(Error::config("download.concurrent", "must be at least 1"));
        }
        if self.download.retry == 0 {
            return Err(Error::config("download.retry", "must be at least 1"));
        }
        if self.ad_block.flush_interval.is_zero() {
            return Err(Error::config("ad_block.flush_interval", "must be at least 1 second"));
        }
        if self.ad_block.probe_workers == 0 {
            return Err(Error::config("ad_block.probe_workers", "must be at least 1"));
        }
        Ok(())
    }
}

// Default value functions
fn default_concurrent() -> usize {
    5
}

fn default_retry() -> u32 {
    5
}

fn default_retry_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_timeout() -> Duration {
    Duration::from_secs(60 * 60)
}

fn default_tmp_dir() -> PathBuf {
    std::env::temp_dir().join("media-dl")
}

fn default_user_agent() -> String {
    concat!("media-dl/", env!("CARGO_PKG_VERSION")).to_string()
}

fn default_true() -> bool {
    true
}

fn default_flush_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_probe_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

fn default_max_error_count() -> usize {
    1000
}

// Duration serialization helper
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}
