// Module declarations
mod archive;
mod bridges;
mod capture;
mod cli;
mod config;
mod cursor;
mod dedup;
mod error;
mod import;
mod merge;
mod store;
mod types;
mod util;

// Shared record types and helpers are addressed from the crate root.
#[allow(unused_imports)]
pub(crate) use types::*;
#[allow(unused_imports)]
pub(crate) use util::*;

use clap::Parser;
use serde_json::json;
use tracing_subscriber::EnvFilter;

use crate::bridges::{run_bridge, Notifier};
use crate::capture::{reply_to_triggers, Capturer, CycleReport};
use crate::cli::{Cli, Command};
use crate::config::load_settings;
use crate::merge::MergeMode;

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn print_report(report: &CycleReport, json: bool) -> Result<(), Box<dyn std::error::Error>> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
    } else {
        println!("{}", report.summary());
        if report.removed > 0 {
            println!("Dropped {} post(s) missing from the snapshot.", report.removed);
        }
        if report.skipped > 0 {
            println!("Skipped {} update(s) that were not channel posts.", report.skipped);
        }
    }
    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let cli = Cli::parse();
    let mut settings = load_settings(cli.config.as_deref())?;

    match cli.command {
        Command::Bridge(command) => run_bridge(command, settings),

        Command::Sync {
            store,
            source,
            poll_timeout,
            json,
        } => {
            settings.apply_store_args(&store);
            settings.apply_source_args(&source);
            let client = settings.telegram_client()?;
            let mut capturer = Capturer::new(settings.open_repo()?, settings.capture_options());
            let report = capturer.pull_cycle(&client, poll_timeout)?;
            let notifier: &dyn Notifier = &client;
            reply_to_triggers(notifier, &report.triggers, &report.summary());
            print_report(&report, json)
        }

        Command::Import {
            store,
            file,
            reconcile,
            json,
        } => {
            settings.apply_store_args(&store);
            let records = import::load_export(&file)?;
            if records.is_empty() {
                eprintln!("No text posts found in {}", file.display());
            }
            let mode = if reconcile { MergeMode::Snapshot } else { MergeMode::Incremental };
            let mut capturer = Capturer::new(settings.open_repo()?, settings.capture_options());
            let report = capturer.import_cycle(records, mode)?;
            print_report(&report, json)
        }

        Command::Show { store, limit, json } => {
            settings.apply_store_args(&store);
            let repo = settings.open_repo()?;
            let archive = repo.load()?;
            let cursor = archive.cursor;
            if json {
                let payload = json!({
                    "key": repo.key(),
                    "cursor": cursor,
                    "count": archive.messages.len(),
                    "messages": archive.messages,
                });
                println!("{}", serde_json::to_string_pretty(&payload)?);
                return Ok(());
            }
            println!("{}  cursor={}  posts={}", repo.key(), cursor, archive.messages.len());
            let start = archive.messages.len().saturating_sub(limit);
            for record in &archive.messages[start..] {
                println!(
                    "{:>8}  {}  {}",
                    record.id,
                    format_timestamp(record.timestamp),
                    preview(&record.text, 80)
                );
            }
            Ok(())
        }
    }
}
