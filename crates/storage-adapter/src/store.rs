//! Artifact store abstraction
//!
//! An [`ArtifactStore`] maps `(store root, key)` to a durable, possibly
//! absent artifact tree and moves that tree to and from local staging.

use std::path::Path;
use async_trait::async_trait;

use common::error::Result;
use common::types::{ArtifactKey, StoreRoot};

use crate::tree::ArtifactSummary;

/// Keyed, path-addressed cache over a durable blob namespace
///
/// Implementations must uphold:
/// - `exists` reflects the durable state at call time; no negative caching.
/// - `upload` either publishes the complete tree or leaves the previous
///   content for the key untouched. Re-uploading a key overwrites it.
/// - `download` of an absent key fails with `Error::NotFound`; it never
///   produces an empty tree.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Root this store is scoped to
    fn root(&self) -> &StoreRoot;

    /// Returns true if `key` currently exists under this root
    async fn exists(&self, key: &ArtifactKey) -> Result<bool>;

    /// Uploads the complete tree under `local_dir` as `key`
    ///
    /// `local_dir` must hold the final, non-empty artifact tree.
    async fn upload(&self, local_dir: &Path, key: &ArtifactKey) -> Result<ArtifactSummary>;

    /// Materializes `key` into `local_dir`
    ///
    /// `local_dir` must be empty or absent (it is created).
    async fn download(&self, key: &ArtifactKey, local_dir: &Path) -> Result<ArtifactSummary>;
}
