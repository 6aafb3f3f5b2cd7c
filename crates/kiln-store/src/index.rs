//! Logical content path to object id index.

use std::collections::BTreeMap;
use std::path::Path;

use dashmap::DashMap;
use tokio::fs;

use kiln_core::{ObjectId, Result};

/// Mapping from logical content paths to the object currently backing
/// them.
///
/// This is the persistent tail of the url resolution chain: a transaction
/// resolves a content url against its own writes and its ancestors'
/// merged outputs first, and falls back to this index for content built
/// by earlier runs. The builder rewrites the index from the root's output
/// map after a successful build.
#[derive(Debug, Default)]
pub struct ContentIndex {
    entries: DashMap<String, ObjectId>,
}

impl ContentIndex {
    /// Creates an empty index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads an index from a JSON file. A missing file yields an empty
    /// index.
    ///
    /// # Errors
    /// Returns an error if the file exists but cannot be read or parsed.
    pub async fn load(path: &Path) -> Result<Self> {
        let text = match fs::read_to_string(path).await {
            Ok(text) => text,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Self::new());
            }
            Err(error) => return Err(error.into()),
        };

        let parsed: BTreeMap<String, ObjectId> = serde_json::from_str(&text)?;
        let index = Self::new();
        for (location, id) in parsed {
            index.entries.insert(location, id);
        }
        Ok(index)
    }

    /// Saves the index as a JSON file with deterministically ordered keys.
    ///
    /// # Errors
    /// Returns an error if the file cannot be written.
    pub async fn save(&self, path: &Path) -> Result<()> {
        let snapshot: BTreeMap<String, ObjectId> = self
            .entries
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect();
        let text = serde_json::to_string_pretty(&snapshot)?;
        fs::write(path, text).await?;
        Ok(())
    }

    /// Object currently backing `location`, if any.
    pub fn get(&self, location: &str) -> Option<ObjectId> {
        self.entries.get(location).map(|entry| *entry.value())
    }

    /// Points `location` at `id`.
    pub fn set(&self, location: impl Into<String>, id: ObjectId) {
        self.entries.insert(location.into(), id);
    }

    /// Merges a batch of locations into the index, overwriting existing
    /// entries.
    pub fn merge(&self, values: impl IntoIterator<Item = (String, ObjectId)>) {
        for (location, id) in values {
            self.entries.insert(location, id);
        }
    }

    /// Drops every entry.
    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Number of indexed locations.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the index is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
