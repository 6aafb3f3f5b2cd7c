//! Content-addressed blob stores.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::fs;
use tracing::info;

use kiln_core::{Error, ObjectId, Result};

/// Version of the on-disk store layout. A store created by a different
/// version is erased on open rather than migrated.
pub const STORE_FORMAT_VERSION: u32 = 1;

/// Content-addressed blob storage.
///
/// Objects are immutable and keyed by the digest of their bytes; `put` of
/// identical content is idempotent.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Reads an object.
    ///
    /// # Errors
    /// Returns an error if the object does not exist or cannot be read.
    async fn get(&self, id: ObjectId) -> Result<Vec<u8>>;

    /// Writes an object, returning its id.
    ///
    /// # Errors
    /// Returns an error if the object cannot be persisted.
    async fn put(&self, data: &[u8]) -> Result<ObjectId>;

    /// Deletes an object. Deleting a missing object is not an error.
    ///
    /// # Errors
    /// Returns an error if the underlying storage fails.
    async fn delete(&self, id: ObjectId) -> Result<()>;

    /// Whether an object exists.
    async fn exists(&self, id: ObjectId) -> bool;
}

/// In-memory object store used by tests and single-run builds.
#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    blobs: DashMap<ObjectId, Vec<u8>>,
}

impl MemoryObjectStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored objects.
    pub fn len(&self) -> usize {
        self.blobs.len()
    }

    /// Whether the store holds no objects.
    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn get(&self, id: ObjectId) -> Result<Vec<u8>> {
        self.blobs
            .get(&id)
            .map(|blob| blob.clone())
            .ok_or_else(|| Error::Storage(format!("object {id} not found")))
    }

    async fn put(&self, data: &[u8]) -> Result<ObjectId> {
        let id = ObjectId::digest(data);
        self.blobs.entry(id).or_insert_with(|| data.to_vec());
        Ok(id)
    }

    async fn delete(&self, id: ObjectId) -> Result<()> {
        self.blobs.remove(&id);
        Ok(())
    }

    async fn exists(&self, id: ObjectId) -> bool {
        self.blobs.contains_key(&id)
    }
}

/// Filesystem object store with a two-level fan-out layout.
///
/// Objects live at `<root>/objects/<hex[0..2]>/<hex>`. A `version` file at
/// the root guards the layout; opening a store written by a different
/// version erases its objects first.
#[derive(Debug)]
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    /// Opens (and if needed initializes) a store rooted at `root`.
    ///
    /// # Errors
    /// Returns an error if the directory layout cannot be created or the
    /// version file cannot be read or written.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(root.join("objects")).await?;

        let version_file = root.join("version");
        let current = match fs::read_to_string(&version_file).await {
            Ok(text) => text.trim().parse::<u32>().unwrap_or(0),
            Err(_) => 0,
        };

        if current != STORE_FORMAT_VERSION {
            if current != 0 {
                info!(
                    from = current,
                    to = STORE_FORMAT_VERSION,
                    "store layout version changed, erasing objects"
                );
            }
            let objects = root.join("objects");
            fs::remove_dir_all(&objects).await?;
            fs::create_dir_all(&objects).await?;
            fs::write(&version_file, STORE_FORMAT_VERSION.to_string()).await?;
        }

        Ok(Self { root })
    }

    fn object_path(&self, id: ObjectId) -> PathBuf {
        let hex = id.to_string();
        self.root.join("objects").join(&hex[..2]).join(hex)
    }

    /// Root directory of the store.
    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn get(&self, id: ObjectId) -> Result<Vec<u8>> {
        fs::read(self.object_path(id))
            .await
            .map_err(|error| Error::Storage(format!("object {id} not readable: {error}")))
    }

    async fn put(&self, data: &[u8]) -> Result<ObjectId> {
        let id = ObjectId::digest(data);
        let path = self.object_path(id);
        if fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(id);
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        // Write-then-rename so concurrent writers of the same object never
        // expose a partially written blob.
        let tmp = path.with_extension(format!("tmp-{}", std::process::id()));
        fs::write(&tmp, data).await?;
        fs::rename(&tmp, &path).await?;
        Ok(id)
    }

    async fn delete(&self, id: ObjectId) -> Result<()> {
        match fs::remove_file(self.object_path(id)).await {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(error) => Err(error.into()),
        }
    }

    async fn exists(&self, id: ObjectId) -> bool {
        fs::try_exists(self.object_path(id)).await.unwrap_or(false)
    }
}
