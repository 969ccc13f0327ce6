use std::collections::HashSet;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::MessageRecord;
use crate::error::{CaptureError, CaptureResult};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub(crate) enum DedupPolicy {
    /// A post is a repeat only if its id is known.
    #[default]
    Id,
    /// Also treat identical text under a new id as a repeat.
    IdAndContent,
}

/// Known ids (and hashes) of a collection. Always rebuilt from the
/// collection, never stored on its own.
#[derive(Debug, Clone, Default)]
pub(crate) struct DedupIndex {
    policy: DedupPolicy,
    ids: HashSet<i64>,
    hashes: HashSet<String>,
}

impl DedupIndex {
    pub(crate) fn rebuild(records: &[MessageRecord], policy: DedupPolicy) -> Self {
        let mut index = Self {
            policy,
            ids: HashSet::with_capacity(records.len()),
            hashes: HashSet::new(),
        };
        for record in records {
            index.ids.insert(record.id);
            if policy == DedupPolicy::IdAndContent {
                index.hashes.insert(record.content_hash.clone());
            }
        }
        index
    }

    pub(crate) fn contains(&self, record: &MessageRecord) -> bool {
        if self.ids.contains(&record.id) {
            return true;
        }
        self.policy == DedupPolicy::IdAndContent && self.hashes.contains(&record.content_hash)
    }

    pub(crate) fn insert(&mut self, record: &MessageRecord) -> CaptureResult<()> {
        if !self.ids.insert(record.id) {
            return Err(CaptureError::InvariantViolation(format!(
                "message {} is already in the collection",
                record.id
            )));
        }
        if self.policy == DedupPolicy::IdAndContent {
            self.hashes.insert(record.content_hash.clone());
        }
        Ok(())
    }
}
