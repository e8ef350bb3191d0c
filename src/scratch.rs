//! Per-attempt scratch directories
//!
//! Every download attempt works inside its own directory under `download.tmp_dir`.
//! The directory is removed when the [`ScratchDir`] is dropped, which covers success,
//! failure, timeout and cancellation alike.

use crate::error::{Error, Result};
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Ephemeral working area for one attempt
#[derive(Debug)]
pub struct ScratchDir {
    dir: TempDir,
}

impl ScratchDir {
    /// Create a fresh directory under `root`, creating `root` if needed
    pub fn new_in(root: &Path) -> Result<Self> {
        std::fs::create_dir_all(root).map_err(|e| Error::scratch(root, e))?;
        let dir = tempfile::Builder::new()
            .prefix("attempt-")
            .tempdir_in(root)
            .map_err(|e| Error::scratch(root, e))?;
        tracing::debug!(path = %dir.path().display(), "Allocated scratch directory");
        Ok(Self { dir })
    }

    /// Directory path
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Path for a file named `name` inside the directory (the file is not created)
    pub fn allocate_file(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }
}
