//! Object-store artifact store (`s3://` roots)
//!
//! Object stores have no directory rename, so uploads are committed with a
//! marker object instead:
//!
//! ```text
//! {prefix}/{key}/.versions/{version}/{relative path}   file contents
//! {prefix}/{key}/.current                              {"version": .., "summary": ..}
//! ```
//!
//! Files are written under a fresh version first; the single `PUT` of
//! `.current` publishes them. `exists` only looks at the marker, so a crash
//! mid-upload leaves the previous version in place. A failed upload deletes
//! the objects it already wrote; a crash leaves them unreferenced under
//! `.versions`.

use std::path::Path;
use std::sync::Arc;
use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use object_store::aws::AmazonS3Builder;
use object_store::buf::BufWriter;
use object_store::path::Path as ObjectPath;
use object_store::{ObjectStore, PutPayload};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info, warn};
use uuid::Uuid;

use common::error::{Error, Result};
use common::types::{ArtifactKey, StoreRoot};
use common::utils::format_bytes;

use crate::store::ArtifactStore;
use crate::tree::{self, ArtifactSummary, TreeEntry, TreeHasher};

/// Marker object naming the committed version of a key
const CURRENT_MARKER: &str = ".current";

/// Prefix holding every uploaded version of a key
const VERSIONS_DIR: &str = ".versions";

/// Read buffer for streaming uploads
const UPLOAD_CHUNK_SIZE: usize = 8 * 1024 * 1024;

/// Content of the `.current` marker
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CommitMarker {
    version: String,
    summary: ArtifactSummary,
}

/// Artifact store over an [`ObjectStore`]
pub struct ObjectStoreArtifactStore {
    /// Store root URI
    root: StoreRoot,

    /// Object store client
    store: Arc<dyn ObjectStore>,

    /// Prefix of the root inside the bucket
    prefix: ObjectPath,
}

impl ObjectStoreArtifactStore {
    /// Opens an `s3://bucket/prefix` root, taking credentials from the environment
    pub fn from_root(root: StoreRoot) -> Result<Self> {
        if root.scheme() != Some("s3") {
            return Err(Error::Config(format!("'{}' is not an s3:// root", root)));
        }

        let without_scheme = &root.as_str()["s3://".len()..];
        let (bucket, prefix) = without_scheme.split_once('/').unwrap_or((without_scheme, ""));
        if bucket.is_empty() {
            return Err(Error::Config(format!("store root '{}' has no bucket", root)));
        }

        let store = AmazonS3Builder::from_env()
            .with_bucket_name(bucket)
            .build()
            .map_err(|e| Error::Config(format!("failed to configure S3 client: {}", e)))?;

        Ok(Self::with_store(root.clone(), Arc::new(store), prefix))
    }

    /// Wraps an existing object store client
    pub fn with_store(root: StoreRoot, store: Arc<dyn ObjectStore>, prefix: &str) -> Self {
        Self {
            root,
            store,
            prefix: ObjectPath::from(prefix),
        }
    }

    fn key_path(&self, key: &ArtifactKey) -> ObjectPath {
        key.segments()
            .fold(self.prefix.clone(), |path, segment| path.child(segment))
    }

    fn marker_path(&self, key: &ArtifactKey) -> ObjectPath {
        self.key_path(key).child(CURRENT_MARKER)
    }

    fn version_path(&self, key: &ArtifactKey, version: &str) -> ObjectPath {
        self.key_path(key).child(VERSIONS_DIR).child(version)
    }

    async fn read_marker(&self, key: &ArtifactKey) -> Result<Option<CommitMarker>> {
        match self.store.get(&self.marker_path(key)).await {
            Ok(result) => {
                let bytes = result.bytes().await.map_err(transfer)?;
                Ok(Some(serde_json::from_slice(&bytes)?))
            }
            Err(object_store::Error::NotFound { .. }) => Ok(None),
            Err(e) => Err(transfer(e)),
        }
    }

    /// Streams one local file into the object store, returning its digest and size
    async fn put_file(&self, local: &Path, location: ObjectPath) -> Result<(Vec<u8>, u64)> {
        let mut file = tokio::fs::File::open(local)
            .await
            .map_err(|e| tree::transfer_error("open", local, e))?;
        let mut writer = BufWriter::new(self.store.clone(), location);
        let mut hasher = Sha256::new();
        let mut buffer = vec![0u8; UPLOAD_CHUNK_SIZE];
        let mut size = 0u64;

        loop {
            let n = file
                .read(&mut buffer)
                .await
                .map_err(|e| tree::transfer_error("read", local, e))?;
            if n == 0 {
                break;
            }
            hasher.update(&buffer[..n]);
            writer
                .write_all(&buffer[..n])
                .await
                .map_err(|e| Error::Transfer(format!("failed to upload {}: {}", local.display(), e)))?;
            size += n as u64;
        }

        writer
            .shutdown()
            .await
            .map_err(|e| Error::Transfer(format!("failed to upload {}: {}", local.display(), e)))?;

        Ok((hasher.finalize().to_vec(), size))
    }

    /// Writes every file of a tree under an uncommitted version prefix
    async fn write_version(&self, entries: &[TreeEntry], version_path: &ObjectPath) -> Result<ArtifactSummary> {
        let mut hasher = TreeHasher::new();
        for entry in entries {
            let location = entry
                .relative
                .split('/')
                .fold(version_path.clone(), |path, part| path.child(part));
            let (file_digest, size) = self.put_file(&entry.absolute, location).await?;
            debug!("Uploaded {} ({} bytes)", entry.relative, size);
            hasher.add_file(&entry.relative, &file_digest, size);
        }
        Ok(hasher.finish())
    }

    async fn delete_prefix(&self, prefix: &ObjectPath) {
        let locations = self
            .store
            .list(Some(prefix))
            .map_ok(|meta| meta.location)
            .boxed();

        let deleted = self.store.delete_stream(locations).collect::<Vec<_>>().await;
        for result in deleted {
            if let Err(e) = result {
                warn!("Failed to delete superseded object under {}: {}", prefix, e);
            }
        }
    }
}

#[async_trait]
impl ArtifactStore for ObjectStoreArtifactStore {
    fn root(&self) -> &StoreRoot {
        &self.root
    }

    async fn exists(&self, key: &ArtifactKey) -> Result<bool> {
        match self.store.head(&self.marker_path(key)).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(e) => Err(transfer(e)),
        }
    }

    async fn upload(&self, local_dir: &Path, key: &ArtifactKey) -> Result<ArtifactSummary> {
        let source = local_dir.to_path_buf();
        let entries = tokio::task::spawn_blocking(move || tree::list_files(&source))
            .await
            .map_err(|e| Error::Transfer(format!("upload task failed: {}", e)))??;

        if entries.is_empty() {
            return Err(Error::InvalidArgument(format!(
                "refusing to upload empty artifact tree from {}",
                local_dir.display()
            )));
        }

        info!("Uploading {:?} to {}", local_dir, self.root.location_of(key));

        let previous = self.read_marker(key).await?;
        let version = Uuid::new_v4().simple().to_string();
        let version_path = self.version_path(key, &version);

        let summary = match self.write_version(&entries, &version_path).await {
            Ok(summary) => summary,
            Err(e) => {
                self.delete_prefix(&version_path).await;
                return Err(e);
            }
        };

        // Publishing the marker commits the version
        let marker = CommitMarker {
            version: version.clone(),
            summary: summary.clone(),
        };
        let published = self
            .store
            .put(&self.marker_path(key), PutPayload::from(serde_json::to_vec(&marker)?))
            .await;
        if let Err(e) = published {
            self.delete_prefix(&version_path).await;
            return Err(transfer(e));
        }

        if let Some(previous) = previous.filter(|p| p.version != version) {
            self.delete_prefix(&self.version_path(key, &previous.version)).await;
        }

        info!(
            "Uploaded {} ({} files, {})",
            self.root.location_of(key),
            summary.file_count,
            format_bytes(summary.total_bytes)
        );

        Ok(summary)
    }

    async fn download(&self, key: &ArtifactKey, local_dir: &Path) -> Result<ArtifactSummary> {
        let marker = self.read_marker(key).await?.ok_or_else(|| {
            Error::NotFound(format!("artifact '{}' not found under {}", key, self.root))
        })?;

        tree::prepare_destination(local_dir)?;

        info!("Downloading {} to {:?}", self.root.location_of(key), local_dir);

        let version_path = self.version_path(key, &marker.version);
        let mut objects: Vec<_> = self
            .store
            .list(Some(&version_path))
            .try_collect()
            .await
            .map_err(transfer)?;
        objects.sort_by(|a, b| a.location.cmp(&b.location));

        let mut files = Vec::with_capacity(objects.len());
        for meta in objects {
            let relative = meta
                .location
                .prefix_match(&version_path)
                .map(|parts| parts.map(|p| p.as_ref().to_string()).collect::<Vec<_>>().join("/"))
                .ok_or_else(|| Error::Transfer(format!("{} escaped {}", meta.location, version_path)))?;

            let target = local_dir.join(&relative);
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| tree::transfer_error("create", parent, e))?;
            }

            let mut file = tokio::fs::File::create(&target)
                .await
                .map_err(|e| tree::transfer_error("create", &target, e))?;
            let mut stream = self.store.get(&meta.location).await.map_err(transfer)?.into_stream();
            let mut content_hasher = Sha256::new();
            let mut size = 0u64;
            while let Some(chunk) = stream.next().await {
                let chunk = chunk.map_err(transfer)?;
                content_hasher.update(&chunk);
                file.write_all(&chunk)
                    .await
                    .map_err(|e| tree::transfer_error("write", &target, e))?;
                size += chunk.len() as u64;
            }
            file.flush().await.map_err(|e| tree::transfer_error("flush", &target, e))?;

            files.push((relative, content_hasher.finalize().to_vec(), size));
        }

        // Object listing order is by encoded path; the digest needs raw path order
        files.sort_by(|a, b| a.0.cmp(&b.0));
        let mut hasher = TreeHasher::new();
        for (relative, file_digest, size) in &files {
            hasher.add_file(relative, file_digest, *size);
        }
        let summary = hasher.finish();

        if summary != marker.summary {
            return Err(Error::Transfer(format!(
                "downloaded tree for '{}' does not match committed digest {}",
                key, marker.summary.digest
            )));
        }

        Ok(summary)
    }
}

fn transfer(error: object_store::Error) -> Error {
    Error::Transfer(error.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use object_store::memory::InMemory;
    use crate::tree::write_tree;

    fn store() -> ObjectStoreArtifactStore {
        ObjectStoreArtifactStore::with_store(
            StoreRoot::new("s3://bucket/models").unwrap(),
            Arc::new(InMemory::new()),
            "models",
        )
    }

    #[tokio::test]
    async fn test_marker_commit_round_trip() {
        let store = store();
        let source = tempfile::tempdir().unwrap();
        let target = tempfile::tempdir().unwrap();
        write_tree(
            source.path(),
            [("config.json", b"{}".as_slice()), ("weights/shard-1.bin", b"abc".as_slice())],
        )
        .unwrap();

        let key = ArtifactKey::new("org/model").unwrap();
        assert!(!store.exists(&key).await.unwrap());

        let uploaded = store.upload(source.path(), &key).await.unwrap();
        assert!(store.exists(&key).await.unwrap());

        let downloaded = store.download(&key, target.path()).await.unwrap();
        assert_eq!(uploaded, downloaded);
        assert_eq!(std::fs::read(target.path().join("weights/shard-1.bin")).unwrap(), b"abc");
    }

    #[tokio::test]
    async fn test_overwrite_drops_previous_version() {
        let store = store();
        let first = tempfile::tempdir().unwrap();
        let second = tempfile::tempdir().unwrap();
        write_tree(first.path(), [("old.bin", b"1".as_slice())]).unwrap();
        write_tree(second.path(), [("new.bin", b"2".as_slice())]).unwrap();

        let key = ArtifactKey::new("llama-base").unwrap();
        store.upload(first.path(), &key).await.unwrap();
        store.upload(second.path(), &key).await.unwrap();

        let target = tempfile::tempdir().unwrap();
        store.download(&key, target.path()).await.unwrap();
        assert!(!target.path().join("old.bin").exists());
        assert!(target.path().join("new.bin").exists());

        let versions: Vec<_> = store
            .store
            .list(Some(&store.key_path(&key).child(VERSIONS_DIR)))
            .try_collect()
            .await
            .unwrap();
        assert_eq!(versions.len(), 1);
    }

    #[tokio::test]
    async fn test_failed_upload_keeps_current_version() {
        let store = store();
        let first = tempfile::tempdir().unwrap();
        let second = tempfile::tempdir().unwrap();
        write_tree(first.path(), [("weights.bin", b"v1".as_slice())]).unwrap();

        let key = ArtifactKey::new("llama-base").unwrap();
        let committed = store.upload(first.path(), &key).await.unwrap();
        let before = store.read_marker(&key).await.unwrap().unwrap();

        // `a.bin` is written before the unreadable file fails the upload
        write_tree(second.path(), [("a.bin", b"v2".as_slice())]).unwrap();
        std::os::unix::fs::symlink("/proc/self/mem", second.path().join("z.bin")).unwrap();
        assert!(store.upload(second.path(), &key).await.is_err());

        let after = store.read_marker(&key).await.unwrap().unwrap();
        assert_eq!(after.version, before.version);
        assert_eq!(after.summary, committed);

        // Only the committed version's objects remain
        let objects: Vec<_> = store
            .store
            .list(Some(&store.key_path(&key).child(VERSIONS_DIR)))
            .try_collect()
            .await
            .unwrap();
        assert_eq!(objects.len(), 1);
        assert_eq!(
            objects[0].location,
            store.version_path(&key, &before.version).child("weights.bin")
        );

        let target = tempfile::tempdir().unwrap();
        store.download(&key, target.path()).await.unwrap();
        assert_eq!(std::fs::read(target.path().join("weights.bin")).unwrap(), b"v1");
        assert!(!target.path().join("a.bin").exists());
    }

    #[tokio::test]
    async fn test_prefix_keys_are_independent() {
        let store = store();
        let nested = tempfile::tempdir().unwrap();
        let parent = tempfile::tempdir().unwrap();
        write_tree(nested.path(), [("config.json", b"nested".as_slice())]).unwrap();
        write_tree(parent.path(), [("config.json", b"parent".as_slice())]).unwrap();

        let org = ArtifactKey::new("org").unwrap();
        let model = ArtifactKey::new("org/model").unwrap();

        store.upload(nested.path(), &model).await.unwrap();
        assert!(!store.exists(&org).await.unwrap());

        store.upload(parent.path(), &org).await.unwrap();
        store.upload(parent.path(), &org).await.unwrap();
        assert!(store.exists(&model).await.unwrap());

        let target = tempfile::tempdir().unwrap();
        store.download(&model, target.path()).await.unwrap();
        assert_eq!(std::fs::read(target.path().join("config.json")).unwrap(), b"nested");
    }

    #[tokio::test]
    async fn test_missing_key_is_not_found() {
        let store = store();
        let target = tempfile::tempdir().unwrap();
        let key = ArtifactKey::new("llama-base").unwrap();

        assert!(store.download(&key, target.path()).await.unwrap_err().is_not_found());
    }
}
