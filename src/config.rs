//! Settings, layered: built-in defaults, then the JSON config file, then
//! environment variables, then command-line flags.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::archive::{ArchiveRepo, Layout};
use crate::bridges::{ChannelFilter, TelegramClient};
use crate::capture::{CaptureOptions, RetryPolicy};
use crate::cli::{SourceArgs, StoreArgs};
use crate::dedup::DedupPolicy;
use crate::error::{CaptureError, CaptureResult};
use crate::store::{open_store, RemoteStore};
use crate::env_optional;

pub(crate) const DEFAULT_CONFIG_FILE: &str = "postvault.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub(crate) struct Settings {
    pub(crate) telegram_token: Option<String>,
    pub(crate) telegram_api_base: Option<String>,
    pub(crate) channel: Option<String>,
    pub(crate) trigger_command: String,
    pub(crate) store_url: String,
    pub(crate) store_auth: Option<String>,
    pub(crate) store_key: String,
    pub(crate) layout: Layout,
    pub(crate) dedup: DedupPolicy,
    pub(crate) poll_timeout_secs: u64,
    pub(crate) poll_limit: usize,
    pub(crate) min_interval_ms: u64,
    pub(crate) request_timeout_secs: u64,
    pub(crate) backoff_base_ms: u64,
    pub(crate) backoff_max_ms: u64,
    pub(crate) bind: String,
    pub(crate) port: u16,
    pub(crate) webhook_url: Option<String>,
    pub(crate) sync_wait_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            telegram_token: None,
            telegram_api_base: None,
            channel: None,
            trigger_command: "/safe".to_string(),
            store_url: "./data".to_string(),
            store_auth: None,
            store_key: "telegram_posts.json".to_string(),
            layout: Layout::Combined,
            dedup: DedupPolicy::Id,
            poll_timeout_secs: 25,
            poll_limit: 100,
            min_interval_ms: 1_000,
            request_timeout_secs: 30,
            backoff_base_ms: 2_000,
            backoff_max_ms: 300_000,
            bind: "0.0.0.0".to_string(),
            port: 8443,
            webhook_url: None,
            sync_wait_secs: 120,
        }
    }
}

pub(crate) fn config_file_path(cli: Option<&Path>) -> (PathBuf, bool) {
    if let Some(path) = cli {
        return (path.to_path_buf(), true);
    }
    if let Some(value) = env_optional("POSTVAULT_CONFIG") {
        return (PathBuf::from(value), true);
    }
    (PathBuf::from(DEFAULT_CONFIG_FILE), false)
}

/// A missing default file means defaults; a missing file that was asked
/// for, or one that does not parse, is an error.
pub(crate) fn load_file_config(path: &Path, required: bool) -> CaptureResult<Settings> {
    match std::fs::read_to_string(path) {
        Ok(data) => serde_json::from_str(&data)
            .map_err(|err| CaptureError::Config(format!("{}: {err}", path.display()))),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound && !required => Ok(Settings::default()),
        Err(err) => Err(CaptureError::Config(format!("{}: {err}", path.display()))),
    }
}

pub(crate) fn load_settings(cli_config: Option<&Path>) -> CaptureResult<Settings> {
    let (path, required) = config_file_path(cli_config);
    let mut settings = load_file_config(&path, required)?;
    settings.apply_env()?;
    Ok(settings)
}

fn parse_env<T: std::str::FromStr>(name: &str, value: &str) -> CaptureResult<T> {
    value
        .trim()
        .parse::<T>()
        .map_err(|_| CaptureError::Config(format!("invalid {name}: {value:?}")))
}

impl Settings {
    pub(crate) fn apply_env(&mut self) -> CaptureResult<()> {
        self.apply_env_with(env_optional)
    }

    pub(crate) fn apply_env_with<F>(&mut self, lookup: F) -> CaptureResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("TELEGRAM_BOT_TOKEN") {
            self.telegram_token = Some(v);
        }
        if let Some(v) = lookup("TELEGRAM_API_BASE") {
            self.telegram_api_base = Some(v);
        }
        if let Some(v) = lookup("CHANNEL_USERNAME") {
            self.channel = Some(v);
        }
        if let Some(v) = lookup("POSTVAULT_STORE_URL") {
            self.store_url = v;
        } else if let (Some(endpoint), Some(bucket)) =
            (lookup("POSTVAULT_STORE_ENDPOINT"), lookup("S3_BUCKET_NAME"))
        {
            self.store_url = format!("{}/{}", endpoint.trim_end_matches('/'), bucket.trim_matches('/'));
        }
        if let Some(v) = lookup("POSTVAULT_STORE_AUTH") {
            self.store_auth = Some(v);
        }
        if let Some(v) = lookup("POSTVAULT_STORE_KEY") {
            self.store_key = v;
        }
        if let Some(v) = lookup("PORT") {
            self.port = parse_env("PORT", &v)?;
        }
        if let Some(v) = lookup("POSTVAULT_BIND") {
            self.bind = v;
        }
        if let Some(v) = lookup("WEBHOOK_URL") {
            self.webhook_url = Some(v);
        }
        if let Some(v) = lookup("POSTVAULT_POLL_TIMEOUT") {
            self.poll_timeout_secs = parse_env("POSTVAULT_POLL_TIMEOUT", &v)?;
        }
        Ok(())
    }

    pub(crate) fn apply_store_args(&mut self, args: &StoreArgs) {
        if let Some(v) = &args.store {
            self.store_url = v.clone();
        }
        if let Some(v) = &args.key {
            self.store_key = v.clone();
        }
        if let Some(v) = args.layout {
            self.layout = v;
        }
        if let Some(v) = args.dedup {
            self.dedup = v;
        }
    }

    pub(crate) fn apply_source_args(&mut self, args: &SourceArgs) {
        if let Some(v) = &args.token {
            self.telegram_token = Some(v.clone());
        }
        if let Some(v) = &args.channel {
            self.channel = Some(v.clone());
        }
        if let Some(v) = &args.trigger_command {
            self.trigger_command = v.clone();
        }
    }

    pub(crate) fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }

    pub(crate) fn min_interval(&self) -> Duration {
        Duration::from_millis(self.min_interval_ms)
    }

    pub(crate) fn sync_wait(&self) -> Duration {
        Duration::from_secs(self.sync_wait_secs.max(1))
    }

    pub(crate) fn retry_policy(&self) -> RetryPolicy {
        let base = Duration::from_millis(self.backoff_base_ms.max(1));
        RetryPolicy {
            base,
            max: Duration::from_millis(self.backoff_max_ms).max(base),
        }
    }

    pub(crate) fn capture_options(&self) -> CaptureOptions {
        CaptureOptions {
            filter: ChannelFilter::parse(self.channel.as_deref()),
            policy: self.dedup,
            trigger_command: self.trigger_command.clone(),
        }
    }

    pub(crate) fn open_repo(&self) -> CaptureResult<ArchiveRepo<Box<dyn RemoteStore>>> {
        if self.store_key.trim().is_empty() {
            return Err(CaptureError::Config("store key is empty".to_string()));
        }
        let store = open_store(&self.store_url, self.store_auth.as_deref(), self.request_timeout())?;
        Ok(ArchiveRepo::new(store, self.store_key.trim(), self.layout))
    }

    pub(crate) fn telegram_client(&self) -> CaptureResult<TelegramClient> {
        let token = self
            .telegram_token
            .as_deref()
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| CaptureError::Config("missing TELEGRAM_BOT_TOKEN".to_string()))?;
        Ok(TelegramClient::new(
            token.trim(),
            self.telegram_api_base.as_deref(),
            self.request_timeout(),
            self.poll_timeout_secs,
            self.poll_limit,
        ))
    }
}
