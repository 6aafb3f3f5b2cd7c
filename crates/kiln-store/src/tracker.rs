//! Memoized physical-file hashing.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use dashmap::DashMap;
use tokio::fs;
use tokio::io::AsyncReadExt as _;

use kiln_core::{Error, ObjectId, ObjectIdHasher, Result};

#[derive(Debug, Clone, Copy)]
struct FileVersion {
    modified: SystemTime,
    len: u64,
    hash: ObjectId,
}

/// Hashes physical files, memoized by modification time and length.
///
/// Command hashing consults this once per declared file input; within a
/// run the same source file is typically an input of many commands, so
/// the memoization keeps hashing cost proportional to the number of
/// distinct files rather than the number of steps.
#[derive(Debug, Default)]
pub struct FileVersionTracker {
    cache: DashMap<PathBuf, FileVersion>,
}

impl FileVersionTracker {
    /// Creates an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Hash of the file's current content.
    ///
    /// # Errors
    /// Returns a hashing error if the file cannot be read; a missing
    /// input is a build failure for the step that declared it.
    pub async fn file_hash(&self, path: &Path) -> Result<ObjectId> {
        let metadata = fs::metadata(path)
            .await
            .map_err(|error| Error::Hashing(format!("cannot stat {}: {error}", path.display())))?;
        let modified = metadata
            .modified()
            .map_err(|error| Error::Hashing(format!("no mtime for {}: {error}", path.display())))?;
        let len = metadata.len();

        if let Some(cached) = self.cache.get(path) {
            if cached.modified == modified && cached.len == len {
                return Ok(cached.hash);
            }
        }

        let hash = Self::hash_file(path)
            .await
            .map_err(|error| Error::Hashing(format!("cannot read {}: {error}", path.display())))?;
        self.cache.insert(
            path.to_path_buf(),
            FileVersion {
                modified,
                len,
                hash,
            },
        );
        Ok(hash)
    }

    /// Streams the file through the digest so large sources are hashed
    /// without loading them whole.
    async fn hash_file(path: &Path) -> std::io::Result<ObjectId> {
        let mut file = fs::File::open(path).await?;
        let mut hasher = ObjectIdHasher::new();
        let mut buffer = vec![0_u8; 64 * 1024];
        loop {
            let read = file.read(&mut buffer).await?;
            if read == 0 {
                break;
            }
            hasher.update(&buffer[..read]);
        }
        Ok(hasher.finish())
    }

    /// Drops every memoized version.
    pub fn clear(&self) {
        self.cache.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_tracker_hashes_and_detects_changes() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("source.png");
        tokio::fs::write(&path, b"first").await?;

        let tracker = FileVersionTracker::new();
        let first = tracker.file_hash(&path).await?;
        assert_eq!(first, ObjectId::digest(b"first"));
        assert_eq!(tracker.file_hash(&path).await?, first);

        tokio::fs::write(&path, b"second!").await?;
        let second = tracker.file_hash(&path).await?;
        assert_eq!(second, ObjectId::digest(b"second!"));
        assert_ne!(first, second);
        Ok(())
    }

    #[tokio::test]
    async fn test_tracker_missing_file_is_hashing_error() {
        let tracker = FileVersionTracker::new();
        let result = tracker.file_hash(Path::new("/definitely/not/here.png")).await;
        assert!(matches!(result, Err(Error::Hashing(_))));
    }
}
