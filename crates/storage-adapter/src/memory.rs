//! In-memory artifact store
//!
//! A [`MemoryNamespace`] plays the role of the durable blob namespace;
//! several [`InMemoryArtifactStore`]s scoped to different roots can share
//! one namespace, just like several roots share one bucket. Used for
//! `memory://` roots and in tests.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tracing::{debug, info};

use common::error::{Error, Result};
use common::types::{ArtifactKey, StoreRoot};

use crate::store::ArtifactStore;
use crate::tree::{self, ArtifactSummary, TreeHasher};

/// An immutable stored tree (relative path -> content)
pub type StoredTree = BTreeMap<String, Bytes>;

/// Shared in-memory blob namespace
#[derive(Debug, Clone, Default)]
pub struct MemoryNamespace {
    /// Full location -> tree
    objects: Arc<DashMap<String, Arc<StoredTree>>>,

    /// Full location -> number of completed uploads
    uploads: Arc<DashMap<String, usize>>,
}

impl MemoryNamespace {
    /// Creates an empty namespace
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a store scoped to `root` inside this namespace
    pub fn store(&self, root: StoreRoot) -> InMemoryArtifactStore {
        InMemoryArtifactStore {
            root,
            namespace: self.clone(),
        }
    }

    /// Number of uploads completed for a full location
    pub fn upload_count(&self, location: &str) -> usize {
        self.uploads.get(location).map(|count| *count).unwrap_or(0)
    }

    /// Total uploads completed across the namespace
    pub fn total_uploads(&self) -> usize {
        self.uploads.iter().map(|entry| *entry.value()).sum()
    }

    /// Returns the tree stored at a full location
    pub fn tree(&self, location: &str) -> Option<Arc<StoredTree>> {
        self.objects.get(location).map(|tree| tree.clone())
    }

    /// Lists every stored location
    pub fn locations(&self) -> Vec<String> {
        let mut locations: Vec<String> = self.objects.iter().map(|e| e.key().clone()).collect();
        locations.sort();
        locations
    }
}

/// Artifact store over a [`MemoryNamespace`]
#[derive(Debug, Clone)]
pub struct InMemoryArtifactStore {
    /// Store root URI
    root: StoreRoot,

    /// Backing namespace
    namespace: MemoryNamespace,
}

impl InMemoryArtifactStore {
    /// Creates a store with its own private namespace
    pub fn new(root: StoreRoot) -> Self {
        MemoryNamespace::new().store(root)
    }

    /// Backing namespace
    pub fn namespace(&self) -> &MemoryNamespace {
        &self.namespace
    }
}

#[async_trait]
impl ArtifactStore for InMemoryArtifactStore {
    fn root(&self) -> &StoreRoot {
        &self.root
    }

    async fn exists(&self, key: &ArtifactKey) -> Result<bool> {
        Ok(self.namespace.objects.contains_key(&self.root.location_of(key)))
    }

    async fn upload(&self, local_dir: &Path, key: &ArtifactKey) -> Result<ArtifactSummary> {
        if !local_dir.is_dir() {
            return Err(Error::InvalidArgument(format!(
                "upload source {} is not a directory",
                local_dir.display()
            )));
        }

        let source = local_dir.to_path_buf();
        let files = tokio::task::spawn_blocking(move || tree::read_tree(&source))
            .await
            .map_err(|e| Error::Transfer(format!("upload task failed: {}", e)))??;

        if files.is_empty() {
            return Err(Error::InvalidArgument(format!(
                "refusing to upload empty artifact tree from {}",
                local_dir.display()
            )));
        }

        let mut hasher = TreeHasher::new();
        let mut stored = StoredTree::new();
        for (relative, content) in files {
            hasher.add_bytes(&relative, &content);
            stored.insert(relative, Bytes::from(content));
        }
        let summary = hasher.finish();

        // The whole tree becomes visible in one insert
        let location = self.root.location_of(key);
        self.namespace.objects.insert(location.clone(), Arc::new(stored));
        *self.namespace.uploads.entry(location.clone()).or_insert(0) += 1;

        info!("Uploaded {} ({} files)", location, summary.file_count);

        Ok(summary)
    }

    async fn download(&self, key: &ArtifactKey, local_dir: &Path) -> Result<ArtifactSummary> {
        let location = self.root.location_of(key);
        let stored = self
            .namespace
            .tree(&location)
            .ok_or_else(|| Error::NotFound(format!("artifact '{}' not found under {}", key, self.root)))?;

        let destination = local_dir.to_path_buf();
        let snapshot = stored.clone();
        tokio::task::spawn_blocking(move || {
            tree::prepare_destination(&destination)?;
            tree::write_tree(
                &destination,
                snapshot.iter().map(|(path, content)| (path.as_str(), &content[..])),
            )
        })
        .await
        .map_err(|e| Error::Transfer(format!("download task failed: {}", e)))??;

        let mut hasher = TreeHasher::new();
        for (relative, content) in stored.iter() {
            hasher.add_bytes(relative, content);
        }

        debug!("Downloaded {} to {:?}", location, local_dir);

        Ok(hasher.finish())
    }
}
