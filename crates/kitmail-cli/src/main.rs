//! `kitmail` binary: one-shot commands over the mailbox engine. Every
//! state-bearing command loads derived state, runs a sync cycle as the
//! single-writer owner loop, applies the requested operation and flushes.

use std::sync::Arc;

use anyhow::{Result, anyhow};
use chrono::Utc;
use clap::Parser;
use serde_json::{Value as JsonValue, json};

use kitmail_core::{
    Account, FetchBatch, FilterQuery, INBOX_FOLDER, JsonDerivedStateStore, Message, MutationDelta,
    MutationGateway, SmartFolder, ThreadIndex, filter, log_debug,
};
use kitmail_sync::{ImapClient, SyncCommand, SyncEngine, SyncEvent, SyncReport};

mod cli;
mod config;

use cli::{Cli, CliCommand, FoldersCommand, MessageCommand, MessagesCommand, MessagesList};

const CLI_SCHEMA_VERSION: &str = "kitmail.cli.v1";

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match run(cli.command).await {
        Ok(value) => output_ok(value),
        Err(err) => output_error(&err.to_string()),
    }
}

fn output_ok(value: JsonValue) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string(&json!({
            "schema": CLI_SCHEMA_VERSION,
            "ok": true,
            "result": value
        }))?
    );
    Ok(())
}

fn output_error(message: &str) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string(&json!({
            "schema": CLI_SCHEMA_VERSION,
            "ok": false,
            "error": message
        }))?
    );
    Ok(())
}

async fn run(command: CliCommand) -> Result<JsonValue> {
    let accounts = config::load_accounts();
    if accounts.is_empty() {
        return Err(anyhow!("No accounts configured"));
    }
    let mut gateway = MutationGateway::open(Box::new(JsonDerivedStateStore::default())).await?;
    let report = run_sync_cycle(&mut gateway, accounts).await?;
    let result = dispatch(&mut gateway, command, report)?;
    gateway.flush().await?;
    Ok(result)
}

/// The owner loop: sole consumer of sync events, sole caller of the gateway.
/// Batches are buffered for the whole cycle and merged in a fixed order, so
/// uid assignment does not depend on how the account workers interleave.
async fn run_sync_cycle(
    gateway: &mut MutationGateway,
    accounts: Vec<Account>,
) -> Result<SyncReport> {
    let (engine, mut events) = SyncEngine::start(accounts, Arc::new(ImapClient));
    engine.send(SyncCommand::SyncAll)?;
    let mut batches = Vec::new();
    while let Some(event) = events.recv().await {
        match event {
            SyncEvent::Batch(batch) => batches.push(batch),
            SyncEvent::AccountFailed { account_id, error } => {
                log_debug(&format!("account {} failed: {}", account_id, error));
            }
            SyncEvent::AccountState { .. } => {}
            SyncEvent::CycleCompleted(report) => {
                merge_cycle_batches(gateway, batches);
                gateway.maybe_flush().await?;
                return Ok(report);
            }
        }
    }
    Err(anyhow!("sync event channel closed"))
}

/// Merges one cycle's batches sorted by (account, folder). Arrival order
/// across accounts is scheduling-dependent; merging in a fixed order keeps
/// uid assignment identical between invocations against the same server
/// state.
fn merge_cycle_batches(gateway: &mut MutationGateway, mut batches: Vec<FetchBatch>) {
    batches.sort_by(|a, b| {
        a.account_id
            .cmp(&b.account_id)
            .then_with(|| a.folder.cmp(&b.folder))
    });
    for batch in batches {
        if let Err(err) = gateway.merge_batch(batch) {
            log_debug(&format!("merge rejected: {}", err));
        }
    }
}

fn dispatch(
    gateway: &mut MutationGateway,
    command: CliCommand,
    report: SyncReport,
) -> Result<JsonValue> {
    match command {
        CliCommand::Sync => Ok(json!({
            "report": report,
            "folders": folders_json(gateway),
        })),
        CliCommand::Folders(cmd) => match cmd.command {
            FoldersCommand::List => Ok(folders_json(gateway)),
            FoldersCommand::Add(args) => {
                gateway.add_folder(&args.name)?;
                Ok(folders_json(gateway))
            }
            FoldersCommand::Rename(args) => {
                gateway.rename_folder(&args.old, &args.new)?;
                Ok(folders_json(gateway))
            }
            FoldersCommand::Delete(args) => {
                gateway.delete_folder(&args.name)?;
                Ok(folders_json(gateway))
            }
        },
        CliCommand::Messages(cmd) => {
            let MessagesCommand::List(args) = cmd.command;
            list_messages(gateway, &args)
        }
        CliCommand::Message(cmd) => {
            let delta = match cmd.command {
                MessageCommand::Star(args) => gateway.set_star(&args.uid, true)?,
                MessageCommand::Unstar(args) => gateway.set_star(&args.uid, false)?,
                MessageCommand::Tag(args) => gateway.set_tags(&args.uid, args.tag)?,
                MessageCommand::Note(args) => gateway.set_note(&args.uid, args.note)?,
                MessageCommand::Mark(args) => {
                    gateway.set_read(&args.uid, args.read || !args.unread)?
                }
                MessageCommand::Move(args) => gateway.move_message(&args.uid, &args.folder)?,
                MessageCommand::Delete(args) => gateway.delete_message(&args.uid)?,
                MessageCommand::Purge(args) => gateway.purge_message(&args.uid)?,
            };
            Ok(delta_json(&delta))
        }
    }
}

/// Candidates (real folder or smart view) -> filter -> optional thread
/// collapse, in that order.
fn list_messages(gateway: &MutationGateway, args: &MessagesList) -> Result<JsonValue> {
    let store = gateway.store();
    let candidates: Vec<&Message> = match &args.smart {
        Some(raw) => parse_smart(raw)?.evaluate(store, Utc::now()),
        None => {
            let folder = args.folder.as_deref().unwrap_or(INBOX_FOLDER);
            gateway.folder_messages(folder)?
        }
    };
    let query = FilterQuery {
        text: args.text.clone().unwrap_or_default(),
        tag: args.tag.clone(),
        favorites_only: args.starred,
    };
    let filtered = filter::apply(candidates, &query);

    if args.threads {
        let mut index = ThreadIndex::new();
        let mut seen: Vec<String> = Vec::new();
        let mut rows = Vec::new();
        for msg in &filtered {
            let Some(thread_id) = index.thread_of(store, &msg.uid) else {
                continue;
            };
            if seen.contains(&thread_id) {
                continue;
            }
            let count = index.count_of(store, &thread_id);
            if let Some(parent) = index.parent_of(store, &thread_id) {
                rows.push(json!({
                    "thread_id": thread_id,
                    "count": count,
                    "parent": message_json(parent),
                }));
            }
            seen.push(thread_id);
        }
        rows.truncate(args.limit);
        Ok(json!({ "threads": rows }))
    } else {
        let rows: Vec<JsonValue> = filtered
            .iter()
            .take(args.limit)
            .map(|m| message_json(m))
            .collect();
        Ok(json!({ "messages": rows }))
    }
}

fn parse_smart(raw: &str) -> Result<SmartFolder> {
    if let Some(days) = raw.strip_prefix("recent:") {
        let days: i64 = days.parse().map_err(|_| anyhow!("bad day count: {}", raw))?;
        return Ok(SmartFolder::RecentDays(days.max(0)));
    }
    if let Some(bytes) = raw.strip_prefix("larger:") {
        let bytes: u64 = bytes
            .parse()
            .map_err(|_| anyhow!("bad byte count: {}", raw))?;
        return Ok(SmartFolder::LargerThan(bytes));
    }
    match raw {
        "unread" => Ok(SmartFolder::Unread),
        "attachments" => Ok(SmartFolder::WithAttachments),
        "starred" => Ok(SmartFolder::Starred),
        _ => Err(anyhow!("unknown smart folder: {}", raw)),
    }
}

fn folders_json(gateway: &MutationGateway) -> JsonValue {
    let folders: Vec<JsonValue> = gateway
        .catalog()
        .list_folders()
        .iter()
        .map(|f| {
            json!({
                "name": f.name,
                "protected": f.protected,
                "messages": f.uids.len(),
            })
        })
        .collect();
    json!(folders)
}

fn message_json(msg: &Message) -> JsonValue {
    json!({
        "uid": msg.uid,
        "folder": msg.folder,
        "from": if msg.from_display_name.is_empty() {
            msg.from_address.clone()
        } else {
            format!("{} <{}>", msg.from_display_name, msg.from_address)
        },
        "subject": msg.subject,
        "sent_at": msg.sent_at.to_rfc3339(),
        "size_bytes": msg.size_bytes,
        "read": msg.read,
        "starred": msg.starred,
        "tags": msg.tags,
        "note": msg.note,
        "attachments": msg.attachments.len(),
    })
}

fn delta_json(delta: &MutationDelta) -> JsonValue {
    json!({
        "uid": delta.uid,
        "old_folder": delta.old_folder,
        "new_folder": delta.new_folder,
        "old_starred": delta.old_starred,
        "new_starred": delta.new_starred,
    })
}
