//! Known-ad fragment hashes shared across manifests and runs

use crate::error::Result;
use crate::utils::atomic_write;
use async_trait::async_trait;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Set of keys identifying known ad fragments
///
/// Shared between concurrent filter passes; implementations serialize writes.
#[async_trait]
pub trait AdBlacklist: Send + Sync {
    /// Whether `key` is known
    fn contains(&self, key: &str) -> bool;

    /// Remember `key`; marks the set dirty when it was new
    fn add(&self, key: &str);

    /// Whether there are additions not yet flushed
    fn is_dirty(&self) -> bool;

    /// Persist pending additions; a no-op when clean
    async fn flush(&self) -> Result<()>;
}

/// In-memory blacklist for embedders that persist elsewhere (or not at all)
#[derive(Debug, Default)]
pub struct MemoryBlacklist {
    keys: Mutex<HashSet<String>>,
    dirty: AtomicBool,
}

impl MemoryBlacklist {
    /// Empty blacklist
    pub fn new() -> Self {
        Self::default()
    }

    /// Blacklist pre-populated with `keys`
    pub fn with_keys<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            keys: Mutex::new(keys.into_iter().map(Into::into).collect()),
            dirty: AtomicBool::new(false),
        }
    }

    /// Number of known keys
    pub fn len(&self) -> usize {
        lock(&self.keys).len()
    }

    /// Whether no keys are known
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl AdBlacklist for MemoryBlacklist {
    fn contains(&self, key: &str) -> bool {
        lock(&self.keys).contains(key)
    }

    fn add(&self, key: &str) {
        if lock(&self.keys).insert(key.to_string()) {
            self.dirty.store(true, Ordering::SeqCst);
        }
    }

    fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }

    async fn flush(&self) -> Result<()> {
        self.dirty.store(false, Ordering::SeqCst);
        Ok(())
    }
}

/// Blacklist persisted as a JSON array of keys
///
/// ```json
/// ["5d41402abc4b2a76b9719d911017c592", "7d793037a0760186574b0282f2f435e7"]
/// ```
#[derive(Debug)]
pub struct JsonBlacklist {
    path: PathBuf,
    keys: Mutex<HashSet<String>>,
    dirty: AtomicBool,
}

impl JsonBlacklist {
    /// Load `path`; a missing file starts an empty blacklist
    pub async fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let keys: HashSet<String> = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice::<Vec<String>>(&bytes)?
                .into_iter()
                .collect(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashSet::new(),
            Err(e) => return Err(e.into()),
        };
        tracing::info!(path = %path.display(), keys = keys.len(), "Loaded ad blacklist");
        Ok(Self {
            path,
            keys: Mutex::new(keys),
            dirty: AtomicBool::new(false),
        })
    }

    /// Backing file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of known keys
    pub fn len(&self) -> usize {
        lock(&self.keys).len()
    }

    /// Whether no keys are known
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl AdBlacklist for JsonBlacklist {
    fn contains(&self, key: &str) -> bool {
        lock(&self.keys).contains(key)
    }

    fn add(&self, key: &str) {
        if lock(&self.keys).insert(key.to_string()) {
            self.dirty.store(true, Ordering::SeqCst);
        }
    }

    fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }

    async fn flush(&self) -> Result<()> {
        // Clear first so additions racing with the write mark the set dirty again
        if !self.dirty.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        let mut keys: Vec<String> = lock(&self.keys).iter().cloned().collect();
        keys.sort();
        let json = serde_json::to_vec(&keys)?;

        if let Err(e) = atomic_write(&self.path, &json).await {
            self.dirty.store(true, Ordering::SeqCst);
            return Err(e);
        }
        tracing::debug!(path = %self.path.display(), keys = keys.len(), "Flushed ad blacklist");
        Ok(())
    }
}

fn lock(keys: &Mutex<HashSet<String>>) -> MutexGuard<'_, HashSet<String>> {
    keys.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Flush `blacklist` every `interval` while dirty, and once more when `cancel` fires
pub fn spawn_flush_task(
    blacklist: Arc<dyn AdBlacklist>,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if blacklist.is_dirty() {
                        if let Err(e) = blacklist.flush().await {
                            tracing::warn!(error = %e, "Failed to flush ad blacklist");
                        }
                    }
                }
            }
        }

        if let Err(e) = blacklist.flush().await {
            tracing::warn!(error = %e, "Failed to flush ad blacklist on shutdown");
        }
    })
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn missing_file_loads_empty() {
        let temp = TempDir::new().unwrap();
        let blacklist = JsonBlacklist::load(temp.path().join("ads.json")).await.unwrap();
        assert!(blacklist.is_empty());
        assert!(!blacklist.is_dirty());
    }

    #[tokio::test]
    async fn additions_survive_flush_and_reload() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("ads.json");

        let blacklist = JsonBlacklist::load(&path).await.unwrap();
        blacklist.add("bbb");
        blacklist.add("aaa");
        blacklist.add("aaa");
        assert!(blacklist.is_dirty());
        blacklist.flush().await.unwrap();
        assert!(!blacklist.is_dirty());

        let on_disk: Vec<String> =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(on_disk, vec!["aaa", "bbb"]);

        let reloaded = JsonBlacklist::load(&path).await.unwrap();
        assert!(reloaded.contains("aaa"));
        assert!(reloaded.contains("bbb"));
        assert_eq!(reloaded.len(), 2);
    }

    #[tokio::test]
    async fn clean_flush_does_not_touch_disk() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("ads.json");
        let blacklist = JsonBlacklist::load(&path).await.unwrap();

        blacklist.flush().await.unwrap();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn corrupt_file_is_a_serialization_error() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("ads.json");
        std::fs::write(&path, b"{not json").unwrap();

        let err = JsonBlacklist::load(&path).await.unwrap_err();
        assert!(matches!(err, crate::Error::Serialization(_)));
    }

    #[test]
    fn memory_blacklist_tracks_dirtiness() {
        let blacklist = MemoryBlacklist::with_keys(["known"]);
        assert!(blacklist.contains("known"));
        assert!(!blacklist.is_dirty());

        blacklist.add("known");
        assert!(!blacklist.is_dirty(), "re-adding a known key is not a change");
        blacklist.add("new");
        assert!(blacklist.is_dirty());
        assert_eq!(blacklist.len(), 2);
    }

    #[tokio::test]
    async fn flush_task_writes_on_cancel() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("ads.json");
        let blacklist = Arc::new(JsonBlacklist::load(&path).await.unwrap());
        blacklist.add("abc");

        let cancel = CancellationToken::new();
        let handle = spawn_flush_task(blacklist.clone(), Duration::from_secs(3600), cancel.clone());
        cancel.cancel();
        handle.await.unwrap();

        assert!(!blacklist.is_dirty());
        let on_disk: Vec<String> =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(on_disk, vec!["abc"]);
    }
}
