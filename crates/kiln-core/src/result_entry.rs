//! Persisted command result records.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::log::LogMessage;
use crate::object::ObjectId;
use crate::url::ObjectUrl;

/// Persisted outcome of one successful command execution.
///
/// Entries are appended to the record store under the command hash that
/// produced them. An entry is only ever written for a fully successful
/// run; failed and cancelled executions leave no record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResultEntry {
    /// Hash of each declared input at the time the command ran.
    pub input_dependency_versions: BTreeMap<ObjectUrl, ObjectId>,
    /// Object backing each output location the command produced.
    pub output_objects: BTreeMap<ObjectUrl, ObjectId>,
    /// Log messages to replay when the entry satisfies a later run.
    pub log_messages: Vec<LogMessage>,
    /// Symbolic tags attached to output locations.
    pub tag_symbols: Vec<(ObjectUrl, String)>,
}

impl CommandResultEntry {
    /// Creates an empty entry.
    pub fn new() -> Self {
        Self::default()
    }
}
