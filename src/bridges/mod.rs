pub(crate) mod telegram;
pub(crate) mod webhook;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;

use serde_json::Value;
use thiserror::Error;
use tracing::{info, warn};

use crate::capture::{run_poll_loop, run_push_worker, Capturer, PollOptions};
use crate::cli::BridgeCommand;
use crate::config::Settings;
use crate::error::CaptureError;

pub(crate) use self::telegram::{ChannelFilter, TelegramClient};
use self::webhook::run_webhook_server;

#[derive(Debug, Error)]
pub(crate) enum SourceError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("{method} rejected (HTTP {status}): {description}")]
    Rejected {
        method: String,
        status: u16,
        description: String,
    },
    #[error("undecodable response: {0}")]
    Decode(String),
}

/// Pull side of the channel feed.
pub(crate) trait UpdateSource {
    /// Updates with `update_id >= offset`, oldest first, as raw JSON so that
    /// one malformed entry does not sink the batch.
    fn get_updates(&self, offset: i64, timeout_secs: u64) -> Result<Vec<Value>, SourceError>;
}

/// Outbound replies for manual save requests.
pub(crate) trait Notifier {
    fn notify(&self, chat_id: i64, text: &str);
}

pub(crate) struct NoopNotifier;

impl Notifier for NoopNotifier {
    fn notify(&self, chat_id: i64, text: &str) {
        info!(chat_id, text, "reply suppressed, no notifier configured");
    }
}

/// SIGINT/SIGTERM set the returned flag; a second signal exits at once.
pub(crate) fn install_shutdown_flag() -> Result<Arc<AtomicBool>, CaptureError> {
    let flag = Arc::new(AtomicBool::new(false));
    for signal in [signal_hook::consts::SIGINT, signal_hook::consts::SIGTERM] {
        signal_hook::flag::register_conditional_shutdown(signal, 1, Arc::clone(&flag))
            .and_then(|_| signal_hook::flag::register(signal, Arc::clone(&flag)))
            .map_err(|err| CaptureError::Config(format!("signal handler: {err}")))?;
    }
    Ok(flag)
}

pub(crate) fn run_bridge(command: BridgeCommand, mut settings: Settings) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        BridgeCommand::Poll {
            store,
            source,
            poll_timeout,
            poll_limit,
            min_interval_ms,
        } => {
            settings.apply_store_args(&store);
            settings.apply_source_args(&source);
            if let Some(v) = poll_timeout {
                settings.poll_timeout_secs = v;
            }
            if let Some(v) = poll_limit {
                settings.poll_limit = v;
            }
            if let Some(v) = min_interval_ms {
                settings.min_interval_ms = v;
            }
            let client = settings.telegram_client()?;
            if let Err(err) = client.delete_webhook() {
                warn!(error = %err, "could not clear webhook before polling");
            }
            let mut capturer = Capturer::new(settings.open_repo()?, settings.capture_options());
            let shutdown = install_shutdown_flag()?;
            info!(
                key = %capturer.repo().key(),
                poll_timeout = settings.poll_timeout_secs,
                "polling for channel posts"
            );
            let options = PollOptions {
                poll_timeout_secs: settings.poll_timeout_secs,
                min_interval: settings.min_interval(),
                retry: settings.retry_policy(),
            };
            run_poll_loop(&mut capturer, &client, &client, options, &shutdown)?;
            Ok(())
        }
        BridgeCommand::Webhook {
            store,
            source,
            bind,
            port,
            register_url,
        } => {
            settings.apply_store_args(&store);
            settings.apply_source_args(&source);
            if let Some(v) = bind {
                settings.bind = v;
            }
            if let Some(v) = port {
                settings.port = v;
            }
            if register_url.is_some() {
                settings.webhook_url = register_url;
            }
            let client = if settings.telegram_token.is_some() {
                Some(settings.telegram_client()?)
            } else {
                None
            };
            if let Some(base) = settings.webhook_url.as_deref() {
                let client = client
                    .as_ref()
                    .ok_or_else(|| CaptureError::Config("registering a webhook needs TELEGRAM_BOT_TOKEN".into()))?;
                let url = format!("{}/webhook", base.trim_end_matches('/'));
                client.set_webhook(&url)?;
                info!(%url, "webhook registered");
            }

            let capturer = Capturer::new(settings.open_repo()?, settings.capture_options());
            let shutdown = install_shutdown_flag()?;
            let (tx, rx) = mpsc::channel();
            let retry = settings.retry_policy();
            let worker_shutdown = Arc::clone(&shutdown);
            let worker = thread::Builder::new()
                .name("capture-worker".into())
                .spawn(move || {
                    let result = match &client {
                        Some(client) => run_push_worker(capturer, rx, client, retry, &worker_shutdown),
                        None => run_push_worker(capturer, rx, &NoopNotifier, retry, &worker_shutdown),
                    };
                    if result.is_err() {
                        worker_shutdown.store(true, Ordering::SeqCst);
                    }
                    result
                })?;

            let served = run_webhook_server(&settings.bind, settings.port, tx, settings.sync_wait(), &shutdown);
            shutdown.store(true, Ordering::SeqCst);
            let worked = worker
                .join()
                .map_err(|_| CaptureError::Config("capture worker panicked".into()))?;
            served?;
            worked?;
            Ok(())
        }
    }
}
