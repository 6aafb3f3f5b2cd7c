//! Content-addressed object identities.

use core::fmt;

use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest as _, Sha256};

/// Content hash identifying an object in the store.
///
/// An id is the SHA-256 digest of the object's bytes. The all-zero
/// [`ObjectId::EMPTY`] sentinel means "could not be computed" and never
/// refers to a stored object.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId([u8; 32]);

impl ObjectId {
    /// Sentinel id for values that could not be hashed.
    pub const EMPTY: Self = Self([0; 32]);

    /// Computes the id of a byte slice.
    pub fn digest(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        Self(hasher.finalize().into())
    }

    /// Computes the id of a JSON value.
    ///
    /// `serde_json` maps keep their keys sorted, so serializing a value is
    /// canonical and two structurally equal values hash identically.
    pub fn of_json(value: &serde_json::Value) -> Self {
        match serde_json::to_vec(value) {
            Ok(bytes) => Self::digest(&bytes),
            Err(_) => Self::EMPTY,
        }
    }

    /// Whether this is the [`ObjectId::EMPTY`] sentinel.
    pub fn is_empty(&self) -> bool {
        *self == Self::EMPTY
    }

    /// Parses an id from its lowercase hex representation.
    ///
    /// # Errors
    /// Returns an error if the input is not exactly 64 hex digits.
    pub fn from_hex(text: &str) -> Result<Self, ParseObjectIdError> {
        let bytes = text.as_bytes();
        if bytes.len() != 64 {
            return Err(ParseObjectIdError);
        }

        let mut out = [0_u8; 32];
        for (index, chunk) in bytes.chunks_exact(2).enumerate() {
            let high = hex_digit(chunk[0]).ok_or(ParseObjectIdError)?;
            let low = hex_digit(chunk[1]).ok_or(ParseObjectIdError)?;
            out[index] = (high << 4) | low;
        }
        Ok(Self(out))
    }

    /// Raw digest bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

fn hex_digit(byte: u8) -> Option<u8> {
    match byte {
        b'0'..=b'9' => Some(byte - b'0'),
        b'a'..=b'f' => Some(byte - b'a' + 10),
        b'A'..=b'F' => Some(byte - b'A' + 10),
        _ => None,
    }
}

/// Error returned when parsing an [`ObjectId`] from text fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParseObjectIdError;

impl fmt::Display for ParseObjectIdError {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str("object id must be 64 hex digits")
    }
}

impl core::error::Error for ParseObjectIdError {}

impl fmt::Display for ObjectId {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(formatter, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "ObjectId({self})")
    }
}

impl Serialize for ObjectId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ObjectId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        Self::from_hex(&text).map_err(DeError::custom)
    }
}

/// Incremental hasher producing an [`ObjectId`], for streamed content.
#[derive(Default)]
pub struct ObjectIdHasher {
    inner: Sha256,
}

impl ObjectIdHasher {
    /// Creates an empty hasher.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds bytes into the digest.
    pub fn update(&mut self, data: &[u8]) {
        self.inner.update(data);
    }

    /// Finalizes the digest.
    pub fn finish(self) -> ObjectId {
        ObjectId(self.inner.finalize().into())
    }
}
