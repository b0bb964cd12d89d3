//! Store resolution
//!
//! Maps a store-root URI to the backend serving it.

use std::sync::Arc;
use tracing::debug;

use common::error::{Error, Result};
use common::types::StoreRoot;

use crate::filesystem::FilesystemArtifactStore;
use crate::memory::MemoryNamespace;
use crate::store::ArtifactStore;

/// Opens [`ArtifactStore`]s for store roots
///
/// `memory://` roots opened through the same resolver share one namespace.
#[derive(Debug, Clone, Default)]
pub struct StoreResolver {
    /// Namespace backing `memory://` roots
    memory: MemoryNamespace,
}

impl StoreResolver {
    /// Creates a resolver with a fresh memory namespace
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a resolver over an existing memory namespace
    pub fn with_memory(memory: MemoryNamespace) -> Self {
        Self { memory }
    }

    /// Namespace backing `memory://` roots
    pub fn memory(&self) -> &MemoryNamespace {
        &self.memory
    }

    /// Checks that a root can be served without opening it
    pub fn check(root: &StoreRoot) -> Result<()> {
        match root.scheme() {
            None | Some("file") | Some("memory") => Ok(()),
            Some("s3") if cfg!(feature = "s3") => Ok(()),
            Some("s3") => Err(Error::Config(format!(
                "store root '{}' needs the `s3` feature",
                root
            ))),
            Some(other) => Err(Error::Config(format!(
                "unsupported store root scheme '{}://' in '{}'",
                other, root
            ))),
        }
    }

    /// Opens the store serving `root`
    pub fn open(&self, root: &StoreRoot) -> Result<Arc<dyn ArtifactStore>> {
        Self::check(root)?;
        debug!("Opening artifact store for {}", root);

        match root.scheme() {
            Some("memory") => Ok(Arc::new(self.memory.store(root.clone()))),
            #[cfg(feature = "s3")]
            Some("s3") => Ok(Arc::new(crate::object::ObjectStoreArtifactStore::from_root(
                root.clone(),
            )?)),
            _ => Ok(Arc::new(FilesystemArtifactStore::new(root.clone())?)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::types::ArtifactKey;

    #[tokio::test]
    async fn test_memory_roots_share_namespace() {
        let resolver = StoreResolver::new();
        let root = StoreRoot::new("memory://bucket/huggingface-models").unwrap();

        let writer = resolver.open(&root).unwrap();
        let reader = resolver.open(&root).unwrap();

        let source = tempfile::tempdir().unwrap();
        std::fs::write(source.path().join("w.bin"), b"w").unwrap();
        let key = ArtifactKey::new("llama-base").unwrap();

        writer.upload(source.path(), &key).await.unwrap();
        assert!(reader.exists(&key).await.unwrap());
        assert_eq!(resolver.memory().total_uploads(), 1);
    }

    #[test]
    fn test_rejects_unknown_schemes() {
        let err = StoreResolver::new()
            .open(&StoreRoot::new("ftp://host/models").unwrap())
            .err()
            .unwrap();
        assert!(err.is_config());

        assert!(StoreResolver::check(&StoreRoot::new("/srv/models").unwrap()).is_ok());
        assert!(StoreResolver::check(&StoreRoot::new("file:///srv/models").unwrap()).is_ok());
    }
}
