use serde::{Deserialize, Serialize};

use crate::blake3_hash;

/// One archived channel post. Identity is `id`; `content_hash` is derived
/// from `text` and only used as a secondary fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct MessageRecord {
    pub(crate) id: i64,
    pub(crate) text: String,
    #[serde(default)]
    pub(crate) timestamp: i64,
    #[serde(default)]
    pub(crate) content_hash: String,
}

impl MessageRecord {
    pub(crate) fn new(id: i64, text: impl Into<String>, timestamp: i64) -> Self {
        let text = text.into();
        let content_hash = content_hash(&text);
        Self {
            id,
            text,
            timestamp,
            content_hash,
        }
    }
}

pub(crate) fn content_hash(text: &str) -> String {
    blake3_hash(text.as_bytes()).to_hex().to_string()
}

/// The persisted document: cursor plus every post in first-seen order.
/// Decoding is strict: an object that is not an archive must not load as an
/// empty one, or the next save would overwrite it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct Archive {
    #[serde(default)]
    pub(crate) cursor: i64,
    pub(crate) messages: Vec<MessageRecord>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum StoredDocument {
    // Earlier deployments kept a bare array of post texts, with null for
    // posts that had no text.
    Legacy(Vec<Option<String>>),
    Records(Vec<MessageRecord>),
    Archive(Archive),
}

impl Archive {
    /// Decodes any of the accepted blob shapes. Bare arrays carry no cursor,
    /// so it comes back as 0.
    pub(crate) fn from_json(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        let doc: StoredDocument = serde_json::from_slice(bytes)?;
        let mut archive = match doc {
            StoredDocument::Legacy(posts) => Self::from_legacy(posts),
            StoredDocument::Records(messages) => Archive {
                cursor: 0,
                messages,
            },
            StoredDocument::Archive(archive) => archive,
        };
        archive.fill_missing_hashes();
        Ok(archive)
    }

    pub(crate) fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec_pretty(self)
    }

    /// Legacy posts get ids -1, -2, ... so they never collide with the
    /// positive ids assigned by the source. A null entry is dropped but keeps
    /// its slot, so the ids of the others do not shift.
    fn from_legacy(posts: Vec<Option<String>>) -> Self {
        let messages = posts
            .into_iter()
            .enumerate()
            .filter_map(|(idx, text)| Some(MessageRecord::new(-(idx as i64) - 1, text?, 0)))
            .collect();
        Archive {
            cursor: 0,
            messages,
        }
    }

    fn fill_missing_hashes(&mut self) {
        for record in &mut self.messages {
            if record.content_hash.is_empty() {
                record.content_hash = content_hash(&record.text);
            }
        }
    }
}

pub(crate) fn records_to_json(messages: &[MessageRecord]) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec_pretty(messages)
}
