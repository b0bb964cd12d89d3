//! Artifact tree helpers
//!
//! An artifact tree is the set of regular files under a directory, addressed
//! by `/`-separated relative paths. Empty directories are not part of a tree.
//! Symlinks are followed and stored as the content they point to.

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, trace};
use walkdir::WalkDir;

use common::error::{Error, Result};

/// Buffer size used when streaming file contents
const COPY_BUFFER_SIZE: usize = 1024 * 1024;

/// Summary of an artifact tree moved in or out of a store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactSummary {
    /// Number of files in the tree
    pub file_count: usize,
    /// Total size of all files in bytes
    pub total_bytes: u64,
    /// SHA-256 over sorted `(relative path, file digest)` pairs, hex encoded
    pub digest: String,
}

/// A file inside a local tree
#[derive(Debug, Clone)]
pub struct TreeEntry {
    /// `/`-separated path relative to the tree root
    pub relative: String,
    /// Absolute path on disk
    pub absolute: PathBuf,
}

/// Incrementally computes the tree digest
///
/// Files must be fed in ascending order of their relative path.
pub struct TreeHasher {
    tree: Sha256,
    file_count: usize,
    total_bytes: u64,
}

impl TreeHasher {
    /// Creates an empty tree hasher
    pub fn new() -> Self {
        Self {
            tree: Sha256::new(),
            file_count: 0,
            total_bytes: 0,
        }
    }

    /// Records one file given its content digest and size
    pub fn add_file(&mut self, relative: &str, file_digest: &[u8], size: u64) {
        self.tree.update(relative.as_bytes());
        self.tree.update([0u8]);
        self.tree.update(file_digest);
        self.file_count += 1;
        self.total_bytes += size;
    }

    /// Records one file from its full content
    pub fn add_bytes(&mut self, relative: &str, content: &[u8]) {
        let file_digest = Sha256::digest(content);
        self.add_file(relative, &file_digest, content.len() as u64);
    }

    /// Finishes the digest
    pub fn finish(self) -> ArtifactSummary {
        ArtifactSummary {
            file_count: self.file_count,
            total_bytes: self.total_bytes,
            digest: hex::encode(self.tree.finalize()),
        }
    }
}

impl Default for TreeHasher {
    fn default() -> Self {
        Self::new()
    }
}

/// Lists the files of a tree sorted by relative path
pub fn list_files(root: &Path) -> Result<Vec<TreeEntry>> {
    if !root.is_dir() {
        return Err(Error::InvalidArgument(format!(
            "{} is not a directory",
            root.display()
        )));
    }

    let mut entries = Vec::new();

    for entry in WalkDir::new(root).follow_links(true) {
        let entry = entry.map_err(|e| {
            Error::Transfer(format!("failed to walk {}: {}", root.display(), e))
        })?;

        if !entry.file_type().is_file() {
            continue;
        }

        let relative = entry
            .path()
            .strip_prefix(root)
            .map_err(|_| Error::Transfer(format!("{} escaped tree root", entry.path().display())))?;

        let relative = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join("/");

        entries.push(TreeEntry {
            relative,
            absolute: entry.path().to_path_buf(),
        });
    }

    entries.sort_by(|a, b| a.relative.cmp(&b.relative));

    Ok(entries)
}

/// Computes the summary of a local tree without copying it
pub fn digest_tree(root: &Path) -> Result<ArtifactSummary> {
    let mut hasher = TreeHasher::new();

    for entry in list_files(root)? {
        let (file_digest, size) = stream_file(&entry.absolute, None)?;
        hasher.add_file(&entry.relative, &file_digest, size);
    }

    Ok(hasher.finish())
}

/// Copies a tree into `dst`, returning the summary of what was written
///
/// `dst` is created if missing. Every file is flushed to disk before
/// returning so that a following rename publishes complete content.
pub fn copy_tree(src: &Path, dst: &Path) -> Result<ArtifactSummary> {
    let entries = list_files(src)?;
    fs::create_dir_all(dst).map_err(|e| transfer_error("create", dst, e))?;

    let mut hasher = TreeHasher::new();

    for entry in &entries {
        let target = dst.join(&entry.relative);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(|e| transfer_error("create", parent, e))?;
        }

        let mut writer = File::create(&target).map_err(|e| transfer_error("create", &target, e))?;
        let (file_digest, size) = stream_file(&entry.absolute, Some(&mut writer))?;
        writer.sync_all().map_err(|e| transfer_error("sync", &target, e))?;

        trace!("Copied {} ({} bytes)", entry.relative, size);
        hasher.add_file(&entry.relative, &file_digest, size);
    }

    let summary = hasher.finish();
    debug!(
        "Copied tree {:?} -> {:?}: {} files, {} bytes",
        src, dst, summary.file_count, summary.total_bytes
    );

    Ok(summary)
}

/// Reads every file of a tree into memory, sorted by relative path
pub fn read_tree(root: &Path) -> Result<Vec<(String, Vec<u8>)>> {
    list_files(root)?
        .into_iter()
        .map(|entry| {
            let content = fs::read(&entry.absolute)
                .map_err(|e| transfer_error("read", &entry.absolute, e))?;
            Ok((entry.relative, content))
        })
        .collect()
}

/// Writes in-memory files under `root`
pub fn write_tree<'a, I>(root: &Path, files: I) -> Result<()>
where
    I: IntoIterator<Item = (&'a str, &'a [u8])>,
{
    for (relative, content) in files {
        let target = root.join(relative);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(|e| transfer_error("create", parent, e))?;
        }
        fs::write(&target, content).map_err(|e| transfer_error("write", &target, e))?;
    }
    Ok(())
}

/// Makes sure a download destination exists and is empty
pub fn prepare_destination(dir: &Path) -> Result<()> {
    if dir.exists() {
        if !dir.is_dir() {
            return Err(Error::InvalidArgument(format!(
                "download destination {} is not a directory",
                dir.display()
            )));
        }
        let mut entries = fs::read_dir(dir)?;
        if entries.next().is_some() {
            return Err(Error::InvalidArgument(format!(
                "download destination {} is not empty",
                dir.display()
            )));
        }
        Ok(())
    } else {
        fs::create_dir_all(dir)?;
        Ok(())
    }
}

/// Streams one file through SHA-256, optionally copying it
fn stream_file(path: &Path, mut sink: Option<&mut File>) -> Result<(Vec<u8>, u64)> {
    let mut reader = File::open(path).map_err(|e| transfer_error("open", path, e))?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; COPY_BUFFER_SIZE];
    let mut size = 0u64;

    loop {
        let n = reader.read(&mut buffer).map_err(|e| transfer_error("read", path, e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
        if let Some(writer) = sink.as_mut() {
            writer
                .write_all(&buffer[..n])
                .map_err(|e| transfer_error("write", path, e))?;
        }
        size += n as u64;
    }

    Ok((hasher.finalize().to_vec(), size))
}

/// Maps an I/O failure while moving a tree to a transfer error
pub(crate) fn transfer_error(action: &str, path: &Path, error: std::io::Error) -> Error {
    Error::Transfer(format!("failed to {} {}: {}", action, path.display(), error))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tree(root: &Path) {
        write_tree(
            root,
            [
                ("config.json", b"{\"hidden\": 4096}".as_slice()),
                ("a.txt", b"alpha".as_slice()),
                ("a/b.bin", b"\x00\x01\x02".as_slice()),
                ("weights/model-00001.safetensors", b"weights".as_slice()),
            ],
        )
        .unwrap();
    }

    #[test]
    fn test_list_files_sorted_by_relative_path() {
        let dir = tempfile::tempdir().unwrap();
        sample_tree(dir.path());
        std::fs::create_dir_all(dir.path().join("empty")).unwrap();

        let names: Vec<_> = list_files(dir.path())
            .unwrap()
            .into_iter()
            .map(|e| e.relative)
            .collect();

        assert_eq!(
            names,
            vec!["a.txt", "a/b.bin", "config.json", "weights/model-00001.safetensors"]
        );
    }

    #[test]
    fn test_copy_tree_preserves_content_and_digest() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        sample_tree(src.path());

        let copied = copy_tree(src.path(), &dst.path().join("out")).unwrap();
        let original = digest_tree(src.path()).unwrap();

        assert_eq!(copied, original);
        assert_eq!(copied.file_count, 4);
        assert_eq!(copied.total_bytes, 16 + 5 + 3 + 7);
        assert_eq!(
            std::fs::read(dst.path().join("out/a/b.bin")).unwrap(),
            b"\x00\x01\x02"
        );
    }

    #[test]
    fn test_digest_matches_in_memory_hasher() {
        let dir = tempfile::tempdir().unwrap();
        sample_tree(dir.path());

        let mut hasher = TreeHasher::new();
        for (relative, content) in read_tree(dir.path()).unwrap() {
            hasher.add_bytes(&relative, &content);
        }

        assert_eq!(hasher.finish(), digest_tree(dir.path()).unwrap());
    }

    #[test]
    fn test_digest_detects_renames() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        write_tree(a.path(), [("x", b"same".as_slice())]).unwrap();
        write_tree(b.path(), [("y", b"same".as_slice())]).unwrap();

        assert_ne!(
            digest_tree(a.path()).unwrap().digest,
            digest_tree(b.path()).unwrap().digest
        );
    }

    #[test]
    fn test_prepare_destination() {
        let dir = tempfile::tempdir().unwrap();

        let fresh = dir.path().join("fresh");
        prepare_destination(&fresh).unwrap();
        assert!(fresh.is_dir());

        // Existing empty directory is accepted
        prepare_destination(&fresh).unwrap();

        std::fs::write(fresh.join("leftover"), b"x").unwrap();
        assert!(prepare_destination(&fresh).is_err());
    }

    #[test]
    fn test_list_files_requires_directory() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing");
        assert!(list_files(&missing).is_err());
    }
}
