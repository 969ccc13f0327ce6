//! Telegram Desktop channel exports (`result.json`).

use std::path::Path;

use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::error::{CaptureError, CaptureResult};
use crate::MessageRecord;

#[derive(Debug, Deserialize)]
struct Export {
    #[serde(default)]
    messages: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct ExportMessage {
    id: i64,
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    date_unixtime: Option<Value>,
    #[serde(default)]
    text: Value,
}

pub(crate) fn load_export(path: &Path) -> CaptureResult<Vec<MessageRecord>> {
    let data = std::fs::read(path)
        .map_err(|err| CaptureError::Config(format!("{}: {err}", path.display())))?;
    parse_export(&data)
}

/// Service entries and messages without text are left out; a single
/// unreadable entry is skipped rather than failing the file.
pub(crate) fn parse_export(bytes: &[u8]) -> CaptureResult<Vec<MessageRecord>> {
    let export: Export = serde_json::from_slice(bytes)
        .map_err(|err| CaptureError::MalformedPayload(format!("export: {err}")))?;
    let mut records = Vec::with_capacity(export.messages.len());
    for raw in export.messages {
        let message: ExportMessage = match serde_json::from_value(raw) {
            Ok(message) => message,
            Err(err) => {
                debug!(error = %err, "skipping unreadable export entry");
                continue;
            }
        };
        if message.kind != "message" {
            continue;
        }
        let text = flatten_text(&message.text);
        if text.trim().is_empty() {
            continue;
        }
        let timestamp = message.date_unixtime.as_ref().and_then(unix_time).unwrap_or(0);
        records.push(MessageRecord::new(message.id, text, timestamp));
    }
    Ok(records)
}

/// Exports keep formatted text as an array of plain strings and entity
/// objects (`{"type": "bold", "text": "..."}`).
fn flatten_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Array(parts) => parts
            .iter()
            .filter_map(|part| match part {
                Value::String(text) => Some(text.as_str()),
                Value::Object(entity) => entity.get("text").and_then(Value::as_str),
                _ => None,
            })
            .collect(),
        _ => String::new(),
    }
}

fn unix_time(value: &Value) -> Option<i64> {
    match value {
        Value::String(s) => s.parse().ok(),
        Value::Number(n) => n.as_i64(),
        _ => None,
    }
}
