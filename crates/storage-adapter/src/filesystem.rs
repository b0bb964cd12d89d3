//! Filesystem artifact store
//!
//! Stores each artifact as the directory `{base_dir}/{key}/.tree`. Keeping the
//! tree under a reserved child lets a key be a prefix of another (`org` and
//! `org/model`) without either seeing or replacing the other's files.
//!
//! Uploads are copied into `{base_dir}/.uploads/<id>` first and then renamed
//! into place, so readers only ever observe complete trees. Overwriting an
//! existing key moves the old tree to `{base_dir}/.trash/<id>` before the
//! rename and restores it if the rename fails. Concurrent writers of one key
//! all succeed and the last rename wins.
//!
//! A crashed process can leave its private upload directory behind. Each
//! upload first removes `.uploads` entries older than a day.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use async_trait::async_trait;
use tracing::{debug, info, warn};
use uuid::Uuid;

use common::error::{Error, Result};
use common::types::{ArtifactKey, StoreRoot};
use common::utils::format_bytes;

use crate::store::ArtifactStore;
use crate::tree::{self, transfer_error, ArtifactSummary};

/// Directory holding uploads that are still being copied
const UPLOADS_DIR: &str = ".uploads";

/// Directory holding replaced trees until they are deleted
const TRASH_DIR: &str = ".trash";

/// Child of a key directory holding the committed tree
const TREE_DIR: &str = ".tree";

/// Age after which an upload directory is considered abandoned
pub const STALE_UPLOAD_AGE: Duration = Duration::from_secs(24 * 60 * 60);

/// Publish attempts before giving up on a key other writers keep replacing
const PUBLISH_ATTEMPTS: usize = 16;

/// Artifact store backed by a local (or mounted) filesystem
#[derive(Debug, Clone)]
pub struct FilesystemArtifactStore {
    /// Store root URI
    root: StoreRoot,

    /// Directory the root maps to
    base_dir: PathBuf,
}

impl FilesystemArtifactStore {
    /// Creates a store for a `file://` URI or a plain path
    pub fn new(root: StoreRoot) -> Result<Self> {
        let base_dir = match root.scheme() {
            None => PathBuf::from(root.as_str()),
            Some("file") => PathBuf::from(&root.as_str()["file://".len()..]),
            Some(other) => {
                return Err(Error::Config(format!(
                    "filesystem store cannot serve '{}://' roots",
                    other
                )))
            }
        };

        if base_dir.as_os_str().is_empty() {
            return Err(Error::Config(format!("store root '{}' has no path", root)));
        }

        Ok(Self { root, base_dir })
    }

    /// Directory the store root maps to
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Directory namespace of `key`; may hold nested keys besides the tree
    pub fn key_dir(&self, key: &ArtifactKey) -> PathBuf {
        key.segments()
            .fold(self.base_dir.clone(), |path, segment| path.join(segment))
    }

    /// Directory holding the committed tree for `key`
    pub fn tree_dir(&self, key: &ArtifactKey) -> PathBuf {
        self.key_dir(key).join(TREE_DIR)
    }

    /// Removes upload directories left behind for longer than `older_than`
    ///
    /// Returns how many were removed.
    pub fn sweep_stale_uploads(&self, older_than: Duration) -> Result<usize> {
        Self::sweep_uploads(&self.base_dir, older_than)
    }

    fn sweep_uploads(base_dir: &Path, older_than: Duration) -> Result<usize> {
        let uploads = base_dir.join(UPLOADS_DIR);
        let entries = match fs::read_dir(&uploads) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(transfer_error("list", &uploads, e)),
        };

        let mut removed = 0;
        for entry in entries {
            let entry = entry.map_err(|e| transfer_error("list", &uploads, e))?;
            let stale = entry
                .metadata()
                .and_then(|metadata| metadata.modified())
                .ok()
                .and_then(|modified| modified.elapsed().ok())
                .map_or(false, |age| age >= older_than);

            if stale {
                debug!("Removing abandoned upload {:?}", entry.path());
                Self::remove_quietly(&entry.path());
                removed += 1;
            }
        }

        Ok(removed)
    }

    /// Copies the tree into a private upload directory and renames it into place
    fn upload_blocking(base_dir: &Path, local_dir: &Path, target: &Path) -> Result<ArtifactSummary> {
        match Self::sweep_uploads(base_dir, STALE_UPLOAD_AGE) {
            Ok(0) => {}
            Ok(removed) => info!("Removed {} abandoned uploads under {:?}", removed, base_dir),
            Err(e) => warn!("Failed to sweep abandoned uploads under {:?}: {}", base_dir, e),
        }

        let upload_dir = base_dir.join(UPLOADS_DIR).join(Uuid::new_v4().simple().to_string());

        let summary = match tree::copy_tree(local_dir, &upload_dir) {
            Ok(summary) => summary,
            Err(e) => {
                Self::remove_quietly(&upload_dir);
                return Err(e);
            }
        };

        if summary.file_count == 0 {
            Self::remove_quietly(&upload_dir);
            return Err(Error::InvalidArgument(format!(
                "refusing to upload empty artifact tree from {}",
                local_dir.display()
            )));
        }

        if let Err(e) = Self::commit(base_dir, &upload_dir, target) {
            Self::remove_quietly(&upload_dir);
            return Err(e);
        }

        Ok(summary)
    }

    /// Publishes a fully written upload directory as `target`
    fn commit(base_dir: &Path, upload_dir: &Path, target: &Path) -> Result<()> {
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(|e| transfer_error("create", parent, e))?;
        }

        for _ in 0..PUBLISH_ATTEMPTS {
            // Vacant key: a single rename publishes it
            match fs::rename(upload_dir, target) {
                Ok(()) => return Ok(()),
                Err(e) if !is_occupied(&e, target) => {
                    return Err(transfer_error("publish", target, e))
                }
                Err(_) => {}
            }

            if Self::replace(base_dir, upload_dir, target)? {
                return Ok(());
            }
            debug!("Concurrent writer replaced {:?}, retrying", target);
        }

        Err(Error::Transfer(format!(
            "failed to publish {}: replaced by other writers {} times",
            target.display(),
            PUBLISH_ATTEMPTS
        )))
    }

    /// Swaps an occupied `target` for `upload_dir`
    ///
    /// Returns `false` when another writer moved `target` in the meantime.
    fn replace(base_dir: &Path, upload_dir: &Path, target: &Path) -> Result<bool> {
        let trash_root = base_dir.join(TRASH_DIR);
        fs::create_dir_all(&trash_root).map_err(|e| transfer_error("create", &trash_root, e))?;
        let trash_dir = trash_root.join(Uuid::new_v4().simple().to_string());

        match fs::rename(target, &trash_dir) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(transfer_error("retire", target, e)),
        }

        match fs::rename(upload_dir, target) {
            Ok(()) => {
                debug!("Replaced existing tree at {:?}", target);
                Self::remove_quietly(&trash_dir);
                Ok(true)
            }
            // Another writer published in between; its tree supersedes the retired one
            Err(e) if is_occupied(&e, target) => {
                Self::remove_quietly(&trash_dir);
                Ok(false)
            }
            Err(e) => {
                // Put the previous content back
                if let Err(restore) = fs::rename(&trash_dir, target) {
                    warn!(
                        "Failed to restore previous tree {:?} from {:?}: {}",
                        target, trash_dir, restore
                    );
                }
                Err(transfer_error("publish", target, e))
            }
        }
    }

    fn remove_quietly(dir: &Path) {
        if dir.exists() {
            if let Err(e) = fs::remove_dir_all(dir) {
                warn!("Failed to remove {:?}: {}", dir, e);
            }
        }
    }
}

/// Whether a failed rename onto `target` hit an existing tree
fn is_occupied(error: &std::io::Error, target: &Path) -> bool {
    matches!(error.kind(), ErrorKind::AlreadyExists | ErrorKind::DirectoryNotEmpty) || target.exists()
}

#[async_trait]
impl ArtifactStore for FilesystemArtifactStore {
    fn root(&self) -> &StoreRoot {
        &self.root
    }

    async fn exists(&self, key: &ArtifactKey) -> Result<bool> {
        let dir = self.tree_dir(key);
        match tokio::fs::metadata(&dir).await {
            Ok(metadata) => Ok(metadata.is_dir()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(transfer_error("stat", &dir, e)),
        }
    }

    async fn upload(&self, local_dir: &Path, key: &ArtifactKey) -> Result<ArtifactSummary> {
        if !local_dir.is_dir() {
            return Err(Error::InvalidArgument(format!(
                "upload source {} is not a directory",
                local_dir.display()
            )));
        }

        info!("Uploading {:?} to {}", local_dir, self.root.location_of(key));

        let base_dir = self.base_dir.clone();
        let source = local_dir.to_path_buf();
        let target = self.tree_dir(key);

        let summary = tokio::task::spawn_blocking(move || {
            Self::upload_blocking(&base_dir, &source, &target)
        })
        .await
        .map_err(|e| Error::Transfer(format!("upload task failed: {}", e)))??;

        info!(
            "Uploaded {} ({} files, {})",
            self.root.location_of(key),
            summary.file_count,
            format_bytes(summary.total_bytes)
        );

        Ok(summary)
    }

    async fn download(&self, key: &ArtifactKey, local_dir: &Path) -> Result<ArtifactSummary> {
        if !self.exists(key).await? {
            return Err(Error::NotFound(format!(
                "artifact '{}' not found under {}",
                key, self.root
            )));
        }

        info!("Downloading {} to {:?}", self.root.location_of(key), local_dir);

        let source = self.tree_dir(key);
        let destination = local_dir.to_path_buf();

        let summary = tokio::task::spawn_blocking(move || {
            tree::prepare_destination(&destination)?;
            tree::copy_tree(&source, &destination)
        })
        .await
        .map_err(|e| Error::Transfer(format!("download task failed: {}", e)))??;

        info!(
            "Downloaded {} ({} files, {})",
            self.root.location_of(key),
            summary.file_count,
            format_bytes(summary.total_bytes)
        );

        Ok(summary)
    }
}
