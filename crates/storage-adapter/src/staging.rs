//! Staging directories
//!
//! A staging directory shuttles one artifact between the durable store and a
//! processing step. It is created right before use and removed when the
//! guard is released or dropped, on every exit path including errors and
//! panics. Staging content is never authoritative.

use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::{debug, warn};

use common::error::{Error, Result};

/// Ephemeral local directory removed on release
#[derive(Debug)]
pub struct StagingDir {
    /// Backing temporary directory
    dir: Option<TempDir>,

    /// Path of the directory (kept after release for logging)
    path: PathBuf,
}

impl StagingDir {
    /// Acquires a fresh, empty staging directory
    ///
    /// Created under `parent` when given, else under the system temp dir.
    pub fn acquire(parent: Option<&Path>, label: &str) -> Result<Self> {
        let mut builder = tempfile::Builder::new();
        let prefix = format!("lora-flow-{}-", label);
        builder.prefix(&prefix);

        let dir = match parent {
            Some(parent) => {
                std::fs::create_dir_all(parent)?;
                builder.tempdir_in(parent)
            }
            None => builder.tempdir(),
        }
        .map_err(|e| Error::Transfer(format!("failed to create staging directory: {}", e)))?;

        let path = dir.path().to_path_buf();
        debug!("Acquired staging directory {:?}", path);

        Ok(Self {
            dir: Some(dir),
            path,
        })
    }

    /// Path of the staging directory
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path of a sub-directory inside the staging directory
    pub fn join(&self, name: &str) -> PathBuf {
        self.path.join(name)
    }

    /// Removes the directory, reporting failures
    pub fn release(mut self) -> Result<()> {
        match self.dir.take() {
            Some(dir) => {
                dir.close().map_err(|e| {
                    Error::Transfer(format!(
                        "failed to remove staging directory {}: {}",
                        self.path.display(),
                        e
                    ))
                })?;
                debug!("Released staging directory {:?}", self.path);
                Ok(())
            }
            None => Ok(()),
        }
    }
}

impl Drop for StagingDir {
    fn drop(&mut self) {
        if let Some(dir) = self.dir.take() {
            if let Err(e) = dir.close() {
                warn!("Failed to remove staging directory {:?}: {}", self.path, e);
            } else {
                debug!("Released staging directory {:?} on drop", self.path);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_release_removes_directory() {
        let parent = tempfile::tempdir().unwrap();
        let staging = StagingDir::acquire(Some(parent.path()), "prepare").unwrap();
        let path = staging.path().to_path_buf();

        std::fs::write(staging.join("weights.bin"), b"x").unwrap();
        assert!(path.is_dir());
        assert!(path
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("lora-flow-prepare-"));

        staging.release().unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn test_drop_removes_directory_on_error_path() {
        let parent = tempfile::tempdir().unwrap();

        let result: Result<PathBuf> = (|| {
            let staging = StagingDir::acquire(Some(parent.path()), "train")?;
            std::fs::create_dir_all(staging.join("nested/deep"))?;
            let path = staging.path().to_path_buf();
            Err(Error::Transfer(format!("simulated failure in {}", path.display())))
        })();

        assert!(result.is_err());
        assert_eq!(std::fs::read_dir(parent.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_staging_dirs_are_private() {
        let a = StagingDir::acquire(None, "publish").unwrap();
        let b = StagingDir::acquire(None, "publish").unwrap();
        assert_ne!(a.path(), b.path());
    }
}
