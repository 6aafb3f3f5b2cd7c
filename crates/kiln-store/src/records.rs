//! Append-only command result record stores.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::fs;
use tokio::io::AsyncWriteExt as _;
use tokio::sync::Mutex;
use tracing::warn;

use kiln_core::{CommandResultEntry, Error, ObjectId, Result};

/// Append-only list of [`CommandResultEntry`] records per command hash.
///
/// The engine appends one record per successful command execution and
/// scans the list newest-first when probing the cache.
#[async_trait]
pub trait ResultRecordStore: Send + Sync {
    /// Lists every record stored under `key`, oldest first.
    ///
    /// # Errors
    /// Returns an error if the record log cannot be read.
    async fn enumerate(&self, key: ObjectId) -> Result<Vec<CommandResultEntry>>;

    /// Appends a record under `key`.
    ///
    /// # Errors
    /// Returns an error if the record cannot be persisted.
    async fn append(&self, key: ObjectId, entry: &CommandResultEntry) -> Result<()>;

    /// Drops every record stored under `key`.
    ///
    /// # Errors
    /// Returns an error if the record log cannot be removed.
    async fn clear(&self, key: ObjectId) -> Result<()>;
}

/// In-memory record store.
#[derive(Debug, Default)]
pub struct MemoryRecordStore {
    records: DashMap<ObjectId, Vec<CommandResultEntry>>,
}

impl MemoryRecordStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ResultRecordStore for MemoryRecordStore {
    async fn enumerate(&self, key: ObjectId) -> Result<Vec<CommandResultEntry>> {
        Ok(self
            .records
            .get(&key)
            .map(|entries| entries.clone())
            .unwrap_or_default())
    }

    async fn append(&self, key: ObjectId, entry: &CommandResultEntry) -> Result<()> {
        self.records.entry(key).or_default().push(entry.clone());
        Ok(())
    }

    async fn clear(&self, key: ObjectId) -> Result<()> {
        self.records.remove(&key);
        Ok(())
    }
}

/// Filesystem record store, one JSON-lines file per command hash.
///
/// Appends to the same key are serialized through a per-key mutex so
/// concurrent writers cannot interleave partial lines.
#[derive(Debug)]
pub struct FsRecordStore {
    root: PathBuf,
    append_locks: DashMap<ObjectId, Arc<Mutex<()>>>,
}

impl FsRecordStore {
    /// Opens a record store rooted at `root`.
    ///
    /// # Errors
    /// Returns an error if the directory cannot be created.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).await?;
        Ok(Self {
            root,
            append_locks: DashMap::new(),
        })
    }

    fn record_path(&self, key: ObjectId) -> PathBuf {
        self.root.join(format!("{key}.jsonl"))
    }

    fn append_lock(&self, key: ObjectId) -> Arc<Mutex<()>> {
        Arc::clone(
            &self
                .append_locks
                .entry(key)
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        )
    }
}

#[async_trait]
impl ResultRecordStore for FsRecordStore {
    async fn enumerate(&self, key: ObjectId) -> Result<Vec<CommandResultEntry>> {
        let text = match fs::read_to_string(self.record_path(key)).await {
            Ok(text) => text,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(error) => return Err(error.into()),
        };

        let mut entries = Vec::new();
        for line in text.lines().filter(|line| !line.trim().is_empty()) {
            match serde_json::from_str(line) {
                Ok(entry) => entries.push(entry),
                // A torn trailing line from an interrupted append is not
                // worth failing the build over; the entry is simply lost.
                Err(error) => warn!(key = %key, %error, "skipping corrupt cache record"),
            }
        }
        Ok(entries)
    }

    async fn append(&self, key: ObjectId, entry: &CommandResultEntry) -> Result<()> {
        let lock = self.append_lock(key);
        let _guard = lock.lock().await;

        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.record_path(key))
            .await
            .map_err(|error| Error::Storage(format!("cannot open record log {key}: {error}")))?;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }

    async fn clear(&self, key: ObjectId) -> Result<()> {
        match fs::remove_file(self.record_path(key)).await {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(error) => Err(error.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_core::{LogLevel, LogMessage, ObjectUrl};
    use tempfile::TempDir;

    fn sample_entry(tag: &str) -> CommandResultEntry {
        let mut entry = CommandResultEntry::new();
        entry
            .output_objects
            .insert(ObjectUrl::content(tag), ObjectId::digest(tag.as_bytes()));
        entry
            .log_messages
            .push(LogMessage::new(LogLevel::Info, format!("built {tag}")));
        entry
    }

    #[tokio::test]
    async fn test_memory_records_append_and_enumerate() -> Result<()> {
        let store = MemoryRecordStore::new();
        let key = ObjectId::digest(b"command");

        assert!(store.enumerate(key).await?.is_empty());
        store.append(key, &sample_entry("a")).await?;
        store.append(key, &sample_entry("b")).await?;

        let entries = store.enumerate(key).await?;
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0], sample_entry("a"));

        store.clear(key).await?;
        assert!(store.enumerate(key).await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_fs_records_persist_across_opens() -> Result<()> {
        let dir = TempDir::new()?;
        let key = ObjectId::digest(b"command");

        {
            let store = FsRecordStore::open(dir.path()).await?;
            store.append(key, &sample_entry("a")).await?;
            store.append(key, &sample_entry("b")).await?;
        }

        let store = FsRecordStore::open(dir.path()).await?;
        let entries = store.enumerate(key).await?;
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1], sample_entry("b"));

        store.clear(key).await?;
        assert!(store.enumerate(key).await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_fs_records_skip_corrupt_lines() -> Result<()> {
        let dir = TempDir::new()?;
        let key = ObjectId::digest(b"command");

        let store = FsRecordStore::open(dir.path()).await?;
        store.append(key, &sample_entry("a")).await?;

        let path = dir.path().join(format!("{key}.jsonl"));
        let mut text = tokio::fs::read_to_string(&path).await?;
        text.push_str("{truncated");
        tokio::fs::write(&path, text).await?;

        assert_eq!(store.enumerate(key).await?.len(), 1);
        Ok(())
    }
}
