use std::collections::HashSet;

use tracing::{debug, warn};

use crate::dedup::{DedupIndex, DedupPolicy};
use crate::error::CaptureResult;
use crate::MessageRecord;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) enum MergeMode {
    /// The batch is a delta: only appends.
    #[default]
    Incremental,
    /// The batch is everything the source still has. Stored posts missing
    /// from it are dropped before appending.
    Snapshot,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct MergeOutcome {
    pub(crate) messages: Vec<MessageRecord>,
    pub(crate) added: usize,
    pub(crate) removed: usize,
}

impl MergeOutcome {
    pub(crate) fn changed(&self) -> bool {
        self.added > 0 || self.removed > 0
    }
}

/// Appends every unseen record of `incoming` to `collection`, in source
/// order. The first record with a given id wins; later ones are dropped
/// even when their text differs.
pub(crate) fn merge(
    collection: Vec<MessageRecord>,
    incoming: &[MessageRecord],
    mode: MergeMode,
    policy: DedupPolicy,
) -> CaptureResult<MergeOutcome> {
    let before = collection.len();
    let mut messages = match mode {
        MergeMode::Incremental => collection,
        MergeMode::Snapshot => reconcile(collection, incoming, policy),
    };
    let removed = before - messages.len();

    let mut index = DedupIndex::rebuild(&messages, policy);
    let mut added = 0usize;
    for record in incoming {
        if index.contains(record) {
            debug!(id = record.id, "skipping known message");
            continue;
        }
        index.insert(record)?;
        messages.push(record.clone());
        added += 1;
    }

    Ok(MergeOutcome {
        messages,
        added,
        removed,
    })
}

fn reconcile(
    collection: Vec<MessageRecord>,
    snapshot: &[MessageRecord],
    policy: DedupPolicy,
) -> Vec<MessageRecord> {
    let ids: HashSet<i64> = snapshot.iter().map(|r| r.id).collect();
    let hashes: HashSet<&str> = match policy {
        DedupPolicy::IdAndContent => snapshot.iter().map(|r| r.content_hash.as_str()).collect(),
        DedupPolicy::Id => HashSet::new(),
    };
    collection
        .into_iter()
        .filter(|record| {
            let keep = ids.contains(&record.id) || hashes.contains(record.content_hash.as_str());
            if !keep {
                warn!(id = record.id, "dropping message missing from snapshot");
            }
            keep
        })
        .collect()
}

/// Drops later records whose id repeats an earlier one. Only a blob written
/// by something else can contain such repeats.
pub(crate) fn dedupe_in_place(messages: &mut Vec<MessageRecord>) -> usize {
    let mut seen = HashSet::with_capacity(messages.len());
    let before = messages.len();
    messages.retain(|record| seen.insert(record.id));
    before - messages.len()
}
