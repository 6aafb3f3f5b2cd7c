//! Output transactions and composite output map merging.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use kiln_core::{
    ConflictKind, Error, IgnoreLock as _, MergeConflictReport, ObjectId, ObjectUrl, Result,
    UrlConflict,
};
use kiln_store::ContentIndex;

use crate::step::{OutputObject, StepId, StepRef};

/// One recorded input in a composite's merged input map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputRecord {
    /// Object version the reader observed.
    pub id: ObjectId,
    /// Step that read the location.
    pub reader: StepId,
    /// Merge generation the read was merged in.
    pub generation: u64,
}

/// Merged input and output maps of a composite step.
///
/// Children are merged one at a time as they finish; each merge advances
/// the generation counter. An output carrying a generation lower than a
/// child's start generation was settled before that child began and is
/// safe for it to have read; equal or higher generations mean the write
/// and the read overlapped in time.
#[derive(Debug, Default)]
pub struct MergedMaps {
    inputs: HashMap<ObjectUrl, InputRecord>,
    outputs: HashMap<ObjectUrl, OutputObject>,
    generation: u64,
    failure: Option<MergeConflictReport>,
}

impl MergedMaps {
    /// Current merge generation.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Merged output map.
    pub fn outputs(&self) -> &HashMap<ObjectUrl, OutputObject> {
        &self.outputs
    }

    /// Merged input map, reduced to the observed object versions.
    pub fn input_versions(&self) -> HashMap<ObjectUrl, ObjectId> {
        self.inputs
            .iter()
            .map(|(url, record)| (url.clone(), record.id))
            .collect()
    }

    /// First rejected merge, if any. A composite with a recorded failure
    /// reports `Failed` regardless of its children's statuses.
    pub fn failure(&self) -> Option<&MergeConflictReport> {
        self.failure.as_ref()
    }

    /// Merges one finished child into the maps.
    ///
    /// The merge is checked before it is applied: a hazard between the
    /// child and an overlapping sibling rejects the whole merge and leaves
    /// the maps untouched. Reads through an explicit prerequisite edge are
    /// ordered by construction and never conflict.
    ///
    /// # Errors
    /// Returns [`Error::MergeConflict`] when the check rejects the merge.
    /// The failure is also recorded on the maps for the owning composite.
    pub fn merge_child(
        &mut self,
        child: StepId,
        start_generation: u64,
        prerequisites: &HashSet<StepId>,
        inputs: &HashMap<ObjectUrl, ObjectId>,
        outputs: &HashMap<ObjectUrl, OutputObject>,
    ) -> Result<()> {
        let mut conflicts = Vec::new();

        for url in inputs.keys() {
            let Some(existing) = self.outputs.get(url) else {
                continue;
            };
            let concurrent = existing.generation >= start_generation;
            let ordered = existing.producer == child || prerequisites.contains(&existing.producer);
            if concurrent && !ordered {
                let kind = if outputs.contains_key(url) {
                    ConflictKind::WriteWrite
                } else {
                    ConflictKind::ReadWrite
                };
                conflicts.push(UrlConflict {
                    url: url.clone(),
                    kind,
                    existing_producer: existing.producer.as_uuid(),
                    incoming_producer: child.as_uuid(),
                });
            }
        }

        for (url, output) in outputs {
            // A sibling that read this location while we were producing it
            // observed an unordered version.
            if let Some(read) = self.inputs.get(url) {
                let concurrent = read.generation >= start_generation;
                if concurrent && read.reader != child && !prerequisites.contains(&read.reader) {
                    conflicts.push(UrlConflict {
                        url: url.clone(),
                        kind: ConflictKind::ReadWrite,
                        existing_producer: read.reader.as_uuid(),
                        incoming_producer: child.as_uuid(),
                    });
                    continue;
                }
            }
            if let Some(existing) = self.outputs.get(url) {
                let concurrent = existing.generation >= start_generation;
                let ordered =
                    existing.producer == child || prerequisites.contains(&existing.producer);
                // Identical objects are allowed to collide; the location
                // ends up with the same content either way.
                if concurrent && !ordered && existing.id != output.id {
                    conflicts.push(UrlConflict {
                        url: url.clone(),
                        kind: ConflictKind::WriteWrite,
                        existing_producer: existing.producer.as_uuid(),
                        incoming_producer: child.as_uuid(),
                    });
                }
            }
        }

        if !conflicts.is_empty() {
            let report = MergeConflictReport { conflicts };
            if self.failure.is_none() {
                self.failure = Some(report.clone());
            }
            return Err(Error::MergeConflict(report));
        }

        for (url, id) in inputs {
            self.inputs.insert(
                url.clone(),
                InputRecord {
                    id: *id,
                    reader: child,
                    generation: self.generation,
                },
            );
        }
        for (url, output) in outputs {
            let mut output = output.clone();
            output.generation = self.generation;
            self.outputs.insert(url.clone(), output);
        }
        self.generation += 1;
        Ok(())
    }
}

/// Resolution scope for one step execution.
///
/// Urls resolve against, in priority order: the step's own pending writes,
/// the settled outputs of its prerequisites, the merged output maps of its
/// ancestor composites, and finally the persistent content index.
/// Resolutions are memoized so a step observes one consistent version per
/// url for its whole execution.
pub struct BuildTransaction {
    pending: Mutex<HashMap<ObjectUrl, ObjectId>>,
    resolved: Mutex<HashMap<ObjectUrl, ObjectId>>,
    prerequisites: Vec<StepRef>,
    groups: Vec<Arc<Mutex<MergedMaps>>>,
    index: Arc<ContentIndex>,
}

impl BuildTransaction {
    /// Builds the transaction for `step`: its prerequisites plus the
    /// merged maps of every ancestor composite, outermost last.
    pub(crate) fn for_step(step: &StepRef, index: Arc<ContentIndex>) -> Self {
        let mut groups = Vec::new();
        let mut current = step.core().parent();
        while let Some(ancestor) = current {
            if let Some(handle) = ancestor.merged_handle() {
                groups.push(handle);
            }
            current = ancestor.core().parent();
        }
        Self::new(step.core().prerequisites(), groups, index)
    }

    /// Builds a transaction over explicit scopes.
    pub fn new(
        prerequisites: Vec<StepRef>,
        groups: Vec<Arc<Mutex<MergedMaps>>>,
        index: Arc<ContentIndex>,
    ) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            resolved: Mutex::new(HashMap::new()),
            prerequisites,
            groups,
            index,
        }
    }

    /// Resolves a url to the object backing it in this scope, if any.
    pub fn resolve(&self, url: &ObjectUrl) -> Option<ObjectId> {
        if let Some(id) = self.pending.lock_ignore_poison().get(url) {
            return Some(*id);
        }
        if let Some(id) = self.resolved.lock_ignore_poison().get(url) {
            return Some(*id);
        }

        let found = self
            .prerequisites
            .iter()
            .find_map(|step| step.output_objects().get(url).map(|output| output.id))
            .or_else(|| {
                self.groups.iter().find_map(|group| {
                    group
                        .lock_ignore_poison()
                        .outputs
                        .get(url)
                        .map(|output| output.id)
                })
            })
            .or_else(|| {
                url.is_content()
                    .then(|| self.index.get(&url.path))
                    .flatten()
            });

        if let Some(id) = found {
            self.resolved.lock_ignore_poison().insert(url.clone(), id);
        }
        found
    }

    /// Records a write local to this transaction. Later resolutions of the
    /// url within the same step observe the new object.
    pub fn write(&self, url: ObjectUrl, id: ObjectId) {
        self.pending.lock_ignore_poison().insert(url, id);
    }
}
