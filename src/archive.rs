use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{CaptureError, CaptureResult};
use crate::merge::dedupe_in_place;
use crate::store::{RemoteStore, StoreError};
use crate::{records_to_json, Archive, MessageRecord};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub(crate) enum Layout {
    /// Cursor and messages in one document, written in a single put.
    #[default]
    Combined,
    /// Messages at `key`, cursor at `key.cursor`. Messages are written first.
    Split,
}

/// What a [`ArchiveRepo::persist`] call actually wrote.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Written {
    pub(crate) collection: bool,
    pub(crate) cursor: bool,
}

pub(crate) struct ArchiveRepo<S> {
    store: S,
    key: String,
    layout: Layout,
}

impl<S: RemoteStore> ArchiveRepo<S> {
    pub(crate) fn new(store: S, key: impl Into<String>, layout: Layout) -> Self {
        Self {
            store,
            key: key.into(),
            layout,
        }
    }

    pub(crate) fn key(&self) -> &str {
        &self.key
    }

    pub(crate) fn cursor_key(&self) -> String {
        format!("{}.cursor", self.key)
    }

    /// Missing blobs load as an empty archive with cursor 0.
    pub(crate) fn load(&self) -> CaptureResult<Archive> {
        let mut archive = match self.store.fetch(&self.key)? {
            Some(bytes) => Archive::from_json(&bytes).map_err(|source| CaptureError::CorruptArchive {
                key: self.key.clone(),
                source,
            })?,
            None => {
                info!(key = %self.key, "no archive stored yet, starting empty");
                Archive::default()
            }
        };
        if self.layout == Layout::Split {
            archive.cursor = self.load_cursor()?;
        }
        let dropped = dedupe_in_place(&mut archive.messages);
        if dropped > 0 {
            warn!(key = %self.key, dropped, "stored archive repeated message ids");
        }
        Ok(archive)
    }

    pub(crate) fn load_cursor(&self) -> CaptureResult<i64> {
        match self.layout {
            Layout::Combined => Ok(self
                .store
                .fetch(&self.key)?
                .map(|bytes| Archive::from_json(&bytes))
                .transpose()
                .map_err(|source| CaptureError::CorruptArchive {
                    key: self.key.clone(),
                    source,
                })?
                .map(|archive| archive.cursor)
                .unwrap_or(0)),
            Layout::Split => {
                let key = self.cursor_key();
                let Some(bytes) = self.store.fetch(&key)? else {
                    return Ok(0);
                };
                let text = String::from_utf8_lossy(&bytes);
                text.trim().parse::<i64>().map_err(|err| {
                    CaptureError::InvariantViolation(format!("cursor blob {key} holds {text:?}: {err}"))
                })
            }
        }
    }

    /// Writes the collection (when changed) strictly before the cursor. A
    /// failure after the collection write leaves the old cursor in place, so
    /// the next cycle re-reads the same updates and dedups them away.
    pub(crate) fn persist(
        &self,
        messages: &[MessageRecord],
        cursor: i64,
        collection_changed: bool,
        cursor_changed: bool,
    ) -> CaptureResult<Written> {
        let mut written = Written::default();
        match self.layout {
            Layout::Combined => {
                if !collection_changed && !cursor_changed {
                    return Ok(written);
                }
                let archive = Archive {
                    cursor,
                    messages: messages.to_vec(),
                };
                let bytes = archive.to_json().map_err(|err| {
                    CaptureError::InvariantViolation(format!("archive does not serialize: {err}"))
                })?;
                self.store.store(&self.key, &bytes)?;
                written.collection = collection_changed;
                written.cursor = cursor_changed;
            }
            Layout::Split => {
                if collection_changed {
                    let bytes = records_to_json(messages).map_err(|err| {
                        CaptureError::InvariantViolation(format!("archive does not serialize: {err}"))
                    })?;
                    self.store.store(&self.key, &bytes)?;
                    written.collection = true;
                }
                if cursor_changed {
                    self.store
                        .store(&self.cursor_key(), cursor.to_string().as_bytes())
                        .map_err(|err: StoreError| {
                            if written.collection {
                                warn!(key = %self.key, "collection stored but cursor write failed");
                            }
                            err
                        })?;
                    written.cursor = true;
                }
            }
        }
        Ok(written)
    }
}
