//! Logical object urls.

use core::fmt;
use core::str::FromStr;

use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Kind of location an [`ObjectUrl`] points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum UrlKind {
    /// A physical file on disk, hashed through the file version tracker.
    File,
    /// A logical content location resolved through the build transaction
    /// and the content index.
    Content,
}

/// Logical identifier of a build input or output.
///
/// Urls serialize as `file://<path>` or `content://<path>` strings so they
/// can be used as JSON map keys in persisted cache records.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectUrl {
    /// Location kind.
    pub kind: UrlKind,
    /// Location path, interpreted per [`UrlKind`].
    pub path: String,
}

impl ObjectUrl {
    /// Creates a file url.
    pub fn file(path: impl Into<String>) -> Self {
        Self {
            kind: UrlKind::File,
            path: path.into(),
        }
    }

    /// Creates a content url.
    pub fn content(path: impl Into<String>) -> Self {
        Self {
            kind: UrlKind::Content,
            path: path.into(),
        }
    }

    /// Whether this is a content url.
    pub fn is_content(&self) -> bool {
        self.kind == UrlKind::Content
    }
}

impl fmt::Display for ObjectUrl {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = match self.kind {
            UrlKind::File => "file",
            UrlKind::Content => "content",
        };
        write!(formatter, "{scheme}://{}", self.path)
    }
}

/// Error returned when parsing an [`ObjectUrl`] from text fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParseObjectUrlError;

impl fmt::Display for ParseObjectUrlError {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str("object url must start with file:// or content://")
    }
}

impl core::error::Error for ParseObjectUrlError {}

impl FromStr for ObjectUrl {
    type Err = ParseObjectUrlError;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        if let Some(path) = text.strip_prefix("file://") {
            Ok(Self::file(path))
        } else if let Some(path) = text.strip_prefix("content://") {
            Ok(Self::content(path))
        } else {
            Err(ParseObjectUrlError)
        }
    }
}

impl Serialize for ObjectUrl {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ObjectUrl {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(DeError::custom)
    }
}
