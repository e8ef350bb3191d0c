//! File publishing helpers
//!
//! A destination path either does not exist or holds a complete file: content is
//! staged next to the destination under a `.tmp` suffix and renamed into place.

use crate::error::Result;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Staging path used while publishing to `dst` (`<dst>.tmp`)
#[must_use]
pub fn staging_path(dst: &Path) -> PathBuf {
    let mut name: OsString = dst.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

/// Copy `src` to `dst` so that `dst` never appears partially written
///
/// The parent directory of `dst` is created if needed. The content is copied to
/// [`staging_path`] first and then renamed. The staging file is removed when the
/// copy fails or the returned future is dropped before completion.
///
/// # Examples
///
/// ```no_run
/// use media_dl::utils::atomic_publish;
/// use std::path::Path;
///
/// # async fn example() -> media_dl::Result<()> {
/// atomic_publish(Path::new("/tmp/scratch/out.mp4"), Path::new("/media/show/e01.mp4")).await?;
/// # Ok(())
/// # }
/// ```
pub async fn atomic_publish(src: &Path, dst: &Path) -> Result<()> {
    create_parent(dst).await?;

    let staging = Staging::new(staging_path(dst));
    let src_owned = src.to_path_buf();
    staging
        .fill(move |path| std::fs::copy(&src_owned, path).map(|_| ()))
        .await?;
    staging.commit(dst).await?;

    tracing::debug!(src = %src.display(), dst = %dst.display(), "Published file");
    Ok(())
}

/// Write `contents` to `path` through a staging file and rename
pub async fn atomic_write(path: &Path, contents: &[u8]) -> Result<()> {
    create_parent(path).await?;

    let staging = Staging::new(staging_path(path));
    let contents = contents.to_vec();
    staging
        .fill(move |staged| std::fs::write(staged, contents))
        .await?;
    staging.commit(path).await
}

async fn create_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    Ok(())
}

/// A staging file that is removed unless renamed into place
///
/// Dropping the guard uncommitted (an error or a dropped future) removes the file.
/// A blocking write still running at that point removes it again once it returns.
struct Staging {
    path: PathBuf,
    abandoned: Arc<AtomicBool>,
    committed: bool,
}

impl Staging {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            abandoned: Arc::new(AtomicBool::new(false)),
            committed: false,
        }
    }

    /// Run a blocking write into the staging file on the blocking pool
    async fn fill<F>(&self, write: F) -> Result<()>
    where
        F: FnOnce(&Path) -> std::io::Result<()> + Send + 'static,
    {
        let path = self.path.clone();
        let abandoned = Arc::clone(&self.abandoned);
        tokio::task::spawn_blocking(move || {
            let result = write(&path);
            if abandoned.load(Ordering::SeqCst) {
                remove_quietly(&path);
            }
            result
        })
        .await
        .map_err(std::io::Error::other)??;
        Ok(())
    }

    async fn commit(mut self, dst: &Path) -> Result<()> {
        tokio::fs::rename(&self.path, dst).await?;
        self.committed = true;
        Ok(())
    }
}

impl Drop for Staging {
    fn drop(&mut self) {
        if !self.committed {
            self.abandoned.store(true, Ordering::SeqCst);
            remove_quietly(&self.path);
        }
    }
}

fn remove_quietly(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Failed to remove staging file");
        }
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    #[test]
    fn staging_path_appends_suffix() {
        assert_eq!(
            staging_path(Path::new("/media/show/e01.mp4")),
            PathBuf::from("/media/show/e01.mp4.tmp")
        );
    }

    #[tokio::test]
    async fn publish_creates_parent_and_leaves_no_staging_file() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("out.mp4");
        tokio::fs::write(&src, b"media bytes").await.unwrap();
        let dst = temp.path().join("library/show/e01.mp4");

        atomic_publish(&src, &dst).await.unwrap();

        assert_eq!(tokio::fs::read(&dst).await.unwrap(), b"media bytes");
        assert!(!staging_path(&dst).exists());
        // Source is copied, not moved
        assert!(src.exists());
    }

    #[tokio::test]
    async fn publish_replaces_existing_destination() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("new.mp4");
        let dst = temp.path().join("e01.mp4");
        tokio::fs::write(&src, b"new").await.unwrap();
        tokio::fs::write(&dst, b"old").await.unwrap();

        atomic_publish(&src, &dst).await.unwrap();
        assert_eq!(tokio::fs::read(&dst).await.unwrap(), b"new");
    }

    #[tokio::test]
    async fn failed_publish_leaves_destination_absent() {
        let temp = TempDir::new().unwrap();
        let dst = temp.path().join("e01.mp4");

        let result = atomic_publish(&temp.path().join("missing.mp4"), &dst).await;
        assert!(result.is_err());
        assert!(!dst.exists());
        assert!(!staging_path(&dst).exists());
    }

    #[tokio::test]
    async fn atomic_write_overwrites_whole_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("state/blacklist.json");

        atomic_write(&path, b"[\"a\",\"b\"]").await.unwrap();
        atomic_write(&path, b"[]").await.unwrap();

        assert_eq!(tokio::fs::read(&path).await.unwrap(), b"[]");
        assert!(!staging_path(&path).exists());
    }

    #[tokio::test]
    async fn dropped_publish_removes_staging_file() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("big.mp4");
        let len = 32 * 1024 * 1024;
        tokio::fs::write(&src, vec![7u8; len]).await.unwrap();
        let dst = temp.path().join("e01.mp4");
        let staging = staging_path(&dst);

        let outcome =
            tokio::time::timeout(Duration::from_millis(1), atomic_publish(&src, &dst)).await;
        if outcome.is_ok() {
            // The copy won the race; the usual guarantees still hold
            assert_eq!(std::fs::metadata(&dst).unwrap().len(), len as u64);
        }

        // A copy still running on the blocking pool cleans up when it returns
        let deadline = std::time::Instant::now() + Duration::from_secs(10);
        while staging.exists() && std::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(!staging.exists());
        if let Ok(meta) = std::fs::metadata(&dst) {
            assert_eq!(meta.len(), len as u64);
        }
    }
}
