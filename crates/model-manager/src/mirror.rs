//! Local directory hub mirror
//!
//! Serves models from `{mirror_dir}/{model_id}`, for air-gapped clusters that
//! pre-seed a shared volume instead of reaching the public hub.

use std::path::{Path, PathBuf};
use async_trait::async_trait;
use tracing::info;

use common::error::{Error, Result};
use common::types::ArtifactKey;
use storage_adapter::tree;

use crate::hub::ModelHub;

/// Hub backed by a local directory
#[derive(Debug, Clone)]
pub struct DirectoryHub {
    /// Mirror root
    mirror_dir: PathBuf,
}

impl DirectoryHub {
    /// Creates a hub over `mirror_dir`
    pub fn new(mirror_dir: impl Into<PathBuf>) -> Self {
        Self {
            mirror_dir: mirror_dir.into(),
        }
    }

    /// Directory holding `model_id`
    pub fn model_dir(&self, model_id: &str) -> Result<PathBuf> {
        // Reuse key validation so ids cannot escape the mirror
        let key = ArtifactKey::new(model_id)?;
        Ok(key
            .segments()
            .fold(self.mirror_dir.clone(), |path, segment| path.join(segment)))
    }
}

#[async_trait]
impl ModelHub for DirectoryHub {
    async fn pull(&self, model_id: &str, destination: &Path) -> Result<()> {
        let source = self.model_dir(model_id)?;
        if !source.is_dir() {
            return Err(Error::ExternalService(format!(
                "model '{}' not found in mirror {}",
                model_id,
                self.mirror_dir.display()
            )));
        }

        info!("Pulling {} from mirror {:?}", model_id, self.mirror_dir);

        let destination = destination.to_path_buf();
        tokio::task::spawn_blocking(move || tree::copy_tree(&source, &destination))
            .await
            .map_err(|e| Error::ExternalService(format!("mirror pull failed: {}", e)))??;

        Ok(())
    }

    async fn push(&self, model_id: &str, source: &Path) -> Result<()> {
        let target = self.model_dir(model_id)?;

        info!("Pushing {} to mirror {:?}", model_id, self.mirror_dir);

        let source = source.to_path_buf();
        tokio::task::spawn_blocking(move || -> Result<()> {
            if target.exists() {
                std::fs::remove_dir_all(&target)?;
            }
            tree::copy_tree(&source, &target)?;
            Ok(())
        })
        .await
        .map_err(|e| Error::ExternalService(format!("mirror push failed: {}", e)))??;

        Ok(())
    }
}
