use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::archive::Layout;
use crate::dedup::DedupPolicy;

#[derive(Parser)]
#[command(name = "postvault")]
#[command(about = "Archive a Telegram channel into a deduplicated JSON document in blob storage", long_about = None)]
#[command(version)]
pub(crate) struct Cli {
    /// JSON config file (defaults to POSTVAULT_CONFIG or ./postvault.json)
    #[arg(long, global = true)]
    pub(crate) config: Option<PathBuf>,

    #[command(subcommand)]
    pub(crate) command: Command,
}

#[derive(Subcommand)]
pub(crate) enum Command {
    #[command(flatten)]
    Bridge(BridgeCommand),

    /// Run one capture cycle now and print what was added.
    Sync {
        #[command(flatten)]
        store: StoreArgs,
        #[command(flatten)]
        source: SourceArgs,
        /// Long-poll timeout in seconds (0 returns immediately)
        #[arg(long, default_value_t = 0)]
        poll_timeout: u64,
        /// Output JSON summary
        #[arg(long)]
        json: bool,
    },

    /// Merge a Telegram Desktop channel export (result.json).
    Import {
        #[command(flatten)]
        store: StoreArgs,
        file: PathBuf,
        /// Treat the export as the complete channel and drop stored posts missing from it
        #[arg(long)]
        reconcile: bool,
        /// Output JSON summary
        #[arg(long)]
        json: bool,
    },

    /// Print the stored archive.
    Show {
        #[command(flatten)]
        store: StoreArgs,
        /// Number of most recent posts to list
        #[arg(short = 'n', long, default_value_t = 10)]
        limit: usize,
        /// Output the raw archive as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
pub(crate) enum BridgeCommand {
    /// Long-poll getUpdates and merge every batch.
    Poll {
        #[command(flatten)]
        store: StoreArgs,
        #[command(flatten)]
        source: SourceArgs,
        /// Long-poll timeout in seconds
        #[arg(long)]
        poll_timeout: Option<u64>,
        /// Max updates per poll
        #[arg(long)]
        poll_limit: Option<usize>,
        /// Minimum delay between cycles in milliseconds
        #[arg(long)]
        min_interval_ms: Option<u64>,
    },
    /// Receive pushed updates on POST /webhook; POST /sync forces a cycle.
    Webhook {
        #[command(flatten)]
        store: StoreArgs,
        #[command(flatten)]
        source: SourceArgs,
        /// Bind address
        #[arg(long)]
        bind: Option<String>,
        /// Bind port (env: PORT)
        #[arg(long)]
        port: Option<u16>,
        /// Public base URL to register with setWebhook (env: WEBHOOK_URL)
        #[arg(long)]
        register_url: Option<String>,
    },
}

#[derive(Args, Debug, Clone, Default)]
pub(crate) struct StoreArgs {
    /// Directory, file:// or http(s):// bucket URL (env: POSTVAULT_STORE_URL)
    #[arg(long)]
    pub(crate) store: Option<String>,
    /// Object key of the archive (env: POSTVAULT_STORE_KEY)
    #[arg(long)]
    pub(crate) key: Option<String>,
    /// How cursor and posts are laid out in storage
    #[arg(long, value_enum)]
    pub(crate) layout: Option<Layout>,
    /// What counts as an already archived post
    #[arg(long, value_enum)]
    pub(crate) dedup: Option<DedupPolicy>,
}

#[derive(Args, Debug, Clone, Default)]
pub(crate) struct SourceArgs {
    /// Telegram bot token (env: TELEGRAM_BOT_TOKEN)
    #[arg(long)]
    pub(crate) token: Option<String>,
    /// Channel to archive, @username or chat id (env: CHANNEL_USERNAME)
    #[arg(long)]
    pub(crate) channel: Option<String>,
    /// Command that forces a save when posted (default /safe)
    #[arg(long)]
    pub(crate) trigger_command: Option<String>,
}
