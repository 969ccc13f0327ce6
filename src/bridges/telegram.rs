use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::bridges::{Notifier, SourceError, UpdateSource};
use crate::error::CaptureError;
use crate::MessageRecord;

const DEFAULT_API_BASE: &str = "https://api.telegram.org";
const ALLOWED_UPDATES: [&str; 2] = ["channel_post", "message"];

#[derive(Debug, Deserialize)]
pub(crate) struct TelegramResponse {
    pub(crate) ok: bool,
    #[serde(default)]
    pub(crate) result: Option<Value>,
    #[serde(default)]
    pub(crate) description: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct TelegramUpdate {
    pub(crate) update_id: i64,
    #[serde(default)]
    pub(crate) message: Option<TelegramMessage>,
    #[serde(default)]
    pub(crate) edited_message: Option<TelegramMessage>,
    #[serde(default)]
    pub(crate) channel_post: Option<TelegramMessage>,
    #[serde(default)]
    pub(crate) edited_channel_post: Option<TelegramMessage>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct TelegramMessage {
    pub(crate) message_id: i64,
    pub(crate) chat: TelegramChat,
    #[serde(default)]
    pub(crate) date: i64,
    #[serde(default)]
    pub(crate) text: Option<String>,
    #[serde(default)]
    pub(crate) caption: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct TelegramChat {
    pub(crate) id: i64,
    #[serde(default)]
    pub(crate) username: Option<String>,
}

/// Which channel's posts get archived.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ChannelFilter {
    Any,
    Username(String),
    ChatId(i64),
}

impl ChannelFilter {
    /// Accepts `@name`, `name` or a numeric chat id such as `-1001234567890`.
    pub(crate) fn parse(raw: Option<&str>) -> Self {
        let Some(raw) = raw.map(str::trim).filter(|s| !s.is_empty()) else {
            return ChannelFilter::Any;
        };
        if let Ok(id) = raw.parse::<i64>() {
            return ChannelFilter::ChatId(id);
        }
        ChannelFilter::Username(raw.trim_start_matches('@').to_ascii_lowercase())
    }

    pub(crate) fn matches(&self, chat: &TelegramChat) -> bool {
        match self {
            ChannelFilter::Any => true,
            ChannelFilter::ChatId(id) => chat.id == *id,
            ChannelFilter::Username(name) => chat
                .username
                .as_deref()
                .is_some_and(|u| u.eq_ignore_ascii_case(name)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Inbound {
    Post(MessageRecord),
    /// Someone asked for an immediate save; the summary goes back to `chat_id`.
    Trigger { chat_id: i64 },
    Ignored(&'static str),
}

fn is_command(text: &str, command: &str) -> bool {
    let Some(first) = text.split_whitespace().next() else {
        return false;
    };
    let name = first.split('@').next().unwrap_or(first);
    !command.is_empty() && name.eq_ignore_ascii_case(command)
}

pub(crate) fn classify(update: &TelegramUpdate, filter: &ChannelFilter, trigger_command: &str) -> Inbound {
    if update.edited_channel_post.is_some() || update.edited_message.is_some() {
        return Inbound::Ignored("edits are not archived");
    }
    let (msg, is_channel) = match (&update.channel_post, &update.message) {
        (Some(post), _) => (post, true),
        (None, Some(message)) => (message, false),
        (None, None) => return Inbound::Ignored("no message payload"),
    };
    let text = msg
        .text
        .as_deref()
        .or(msg.caption.as_deref())
        .unwrap_or_default();
    if is_command(text, trigger_command) {
        return Inbound::Trigger {
            chat_id: msg.chat.id,
        };
    }
    if !is_channel {
        return Inbound::Ignored("not a channel post");
    }
    if !filter.matches(&msg.chat) {
        return Inbound::Ignored("post from another channel");
    }
    if text.trim().is_empty() {
        return Inbound::Ignored("post has no text");
    }
    Inbound::Post(MessageRecord::new(msg.message_id, text, msg.date))
}

/// Result of turning one raw batch into records.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct DecodedBatch {
    pub(crate) records: Vec<MessageRecord>,
    pub(crate) triggers: Vec<i64>,
    pub(crate) max_update_id: Option<i64>,
    pub(crate) fetched: usize,
    pub(crate) skipped: usize,
}

/// Decodes updates one by one so a single bad payload only costs itself.
/// Any update that carries an `update_id` moves the cursor, decodable or not,
/// otherwise a poisoned update would be fetched forever.
pub(crate) fn decode_updates(raw: &[Value], filter: &ChannelFilter, trigger_command: &str) -> DecodedBatch {
    let mut batch = DecodedBatch {
        fetched: raw.len(),
        ..DecodedBatch::default()
    };
    for value in raw {
        if let Some(update_id) = value.get("update_id").and_then(Value::as_i64) {
            batch.max_update_id = Some(batch.max_update_id.map_or(update_id, |m| m.max(update_id)));
        }
        let update = match TelegramUpdate::deserialize(value) {
            Ok(update) => update,
            Err(err) => {
                let err = CaptureError::MalformedPayload(err.to_string());
                warn!(error = %err, payload = %value, "skipping update");
                batch.skipped += 1;
                continue;
            }
        };
        match classify(&update, filter, trigger_command) {
            Inbound::Post(record) => batch.records.push(record),
            Inbound::Trigger { chat_id } => batch.triggers.push(chat_id),
            Inbound::Ignored(reason) => {
                debug!(update_id = update.update_id, reason, "ignoring update");
                batch.skipped += 1;
            }
        }
    }
    batch
}

/// Checks the shape the webhook endpoint requires before enqueueing.
pub(crate) fn validate_update_shape(payload: &Value) -> Result<i64, CaptureError> {
    if !payload.is_object() {
        return Err(CaptureError::MalformedPayload("update is not a JSON object".to_string()));
    }
    payload
        .get("update_id")
        .and_then(Value::as_i64)
        .ok_or_else(|| CaptureError::MalformedPayload("update_id missing or not an integer".to_string()))
}

/// Bot API client. The base URL embeds the bot token, so it is never logged.
pub(crate) struct TelegramClient {
    agent: ureq::Agent,
    base_url: String,
    poll_limit: usize,
}

impl TelegramClient {
    /// `request_timeout` bounds every call; long polls additionally get
    /// `poll_timeout_secs` of read time.
    pub(crate) fn new(
        token: &str,
        api_base: Option<&str>,
        request_timeout: Duration,
        poll_timeout_secs: u64,
        poll_limit: usize,
    ) -> Self {
        let api_base = api_base.unwrap_or(DEFAULT_API_BASE).trim_end_matches('/');
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(request_timeout)
            .timeout_write(request_timeout)
            .timeout_read(request_timeout + Duration::from_secs(poll_timeout_secs))
            .build();
        Self {
            agent,
            base_url: format!("{api_base}/bot{token}"),
            poll_limit: poll_limit.clamp(1, 100),
        }
    }

    fn call(&self, method: &str, payload: Value) -> Result<Value, SourceError> {
        let url = format!("{}/{method}", self.base_url);
        let response = self
            .agent
            .post(&url)
            .set("content-type", "application/json")
            .send_json(payload);
        let body: TelegramResponse = match response {
            Ok(resp) => resp
                .into_json()
                .map_err(|err| SourceError::Decode(format!("{method}: {err}")))?,
            Err(ureq::Error::Status(status, resp)) => {
                let description = resp
                    .into_json::<TelegramResponse>()
                    .ok()
                    .and_then(|r| r.description)
                    .unwrap_or_default();
                return Err(SourceError::Rejected {
                    method: method.to_string(),
                    status,
                    description,
                });
            }
            Err(ureq::Error::Transport(err)) => {
                return Err(SourceError::Transport(format!("{method}: {}", err.kind())));
            }
        };
        if !body.ok {
            return Err(SourceError::Rejected {
                method: method.to_string(),
                status: 200,
                description: body.description.unwrap_or_default(),
            });
        }
        Ok(body.result.unwrap_or(Value::Null))
    }

    pub(crate) fn set_webhook(&self, url: &str) -> Result<(), SourceError> {
        self.call(
            "setWebhook",
            serde_json::json!({ "url": url, "allowed_updates": ALLOWED_UPDATES }),
        )?;
        Ok(())
    }

    /// Long polling is refused while a webhook is registered.
    pub(crate) fn delete_webhook(&self) -> Result<(), SourceError> {
        self.call("deleteWebhook", serde_json::json!({}))?;
        Ok(())
    }

    pub(crate) fn send_message(&self, chat_id: i64, text: &str) -> Result<(), SourceError> {
        self.call(
            "sendMessage",
            serde_json::json!({ "chat_id": chat_id, "text": text }),
        )?;
        Ok(())
    }
}

impl UpdateSource for TelegramClient {
    fn get_updates(&self, offset: i64, timeout_secs: u64) -> Result<Vec<Value>, SourceError> {
        let mut payload = serde_json::json!({
            "timeout": timeout_secs,
            "limit": self.poll_limit,
            "allowed_updates": ALLOWED_UPDATES,
        });
        if offset > 0 {
            payload["offset"] = serde_json::json!(offset);
        }
        match self.call("getUpdates", payload)? {
            Value::Array(items) => Ok(items),
            other => Err(SourceError::Decode(format!("getUpdates returned {other}"))),
        }
    }
}

impl Notifier for TelegramClient {
    fn notify(&self, chat_id: i64, text: &str) {
        if let Err(err) = self.send_message(chat_id, text) {
            warn!(chat_id, error = %err, "failed to send reply");
        }
    }
}
