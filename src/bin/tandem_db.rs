//! tandem-db: JSON-lines RPC server over the canonical list store.
//!
//! Runs as a co-process for tools that edit lists without linking the crate.
//! Usage: tandem-db serve [db_path]
//!
//! Without a path the database named by the `[storage]` config section is used.

use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;

use serde_json::{json, Value};
use tandem::config::Config;
use tandem::ledger::ChangeRecord;
use tandem::model::{ListId, ListKind, ListOp};
use tandem::storage::{LocalStorage, SyncStorage};
use tandem::store::CanonicalStore;
use tracing_subscriber::EnvFilter;

#[tokio::main(flavor = "current_thread")]
async fn main() {
    // stdout carries responses, so logs go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 || args[1] != "serve" {
        eprintln!("Usage: tandem-db serve [db_path]");
        std::process::exit(1);
    }

    let path = match args.get(2) {
        Some(path) => Ok(PathBuf::from(path)),
        None => Config::load().and_then(|c| c.storage.db_path()),
    };
    let storage = path.and_then(|p| LocalStorage::open(&p)).unwrap_or_else(|e| {
        eprintln!("Failed to open database: {:#}", e);
        std::process::exit(1);
    });
    let store = CanonicalStore::new(Arc::new(storage));

    let stdin = io::stdin();
    let stdout = io::stdout();
    let mut out = io::BufWriter::new(stdout.lock());

    for line in stdin.lock().lines() {
        let line = match line {
            Ok(l) if !l.is_empty() => l,
            Ok(_) => continue,
            Err(_) => break,
        };

        let resp = match serde_json::from_str::<Value>(&line) {
            Ok(cmd) => handle(&store, &cmd).await,
            Err(e) => json!({"error": e.to_string()}),
        };

        let written = serde_json::to_writer(&mut out, &resp)
            .map_err(io::Error::from)
            .and_then(|_| out.write_all(b"\n"))
            .and_then(|_| out.flush());
        if let Err(e) = written {
            tracing::error!("stdout closed: {}", e);
            break;
        }
    }
}

async fn handle(store: &CanonicalStore, cmd: &Value) -> Value {
    let result = match cmd.get("cmd").and_then(|v| v.as_str()) {
        Some("create") => cmd_create(store, cmd).await,
        Some("get") => cmd_get(store, cmd).await,
        Some("apply") => cmd_apply(store, cmd).await,
        Some("rename") => cmd_rename(store, cmd).await,
        Some("delete") => cmd_delete(store, cmd).await,
        Some("history") => cmd_history(store, cmd).await,
        Some("status") => cmd_status(store, cmd).await,
        Some("prune") => cmd_prune(store, cmd).await,
        _ => return json!({"error": "unknown command"}),
    };
    result.unwrap_or_else(|e| json!({"error": format!("{:#}", e)}))
}

fn list_id(cmd: &Value) -> anyhow::Result<ListId> {
    let raw = cmd["list"].as_str().unwrap_or("");
    raw.parse()
        .map_err(|e| anyhow::anyhow!("bad list id {:?}: {}", raw, e))
}

async fn cmd_create(store: &CanonicalStore, cmd: &Value) -> anyhow::Result<Value> {
    let name = cmd["name"].as_str().unwrap_or("");
    let kind: ListKind = cmd["kind"].as_str().unwrap_or("playlist").parse()?;
    let list = store.create_list(name, kind).await?;
    Ok(json!({"list": list.id}))
}

async fn cmd_get(store: &CanonicalStore, cmd: &Value) -> anyhow::Result<Value> {
    let list = store.get_list(list_id(cmd)?).await?;
    Ok(serde_json::to_value(list)?)
}

async fn cmd_apply(store: &CanonicalStore, cmd: &Value) -> anyhow::Result<Value> {
    let ops: Vec<ListOp> = serde_json::from_value(cmd["ops"].clone())?;
    let observed = cmd["observed"].as_u64();
    let list = store.apply_operations(list_id(cmd)?, &ops, observed).await?;
    Ok(json!({"revision": list.revision, "items": list.items()}))
}

async fn cmd_rename(store: &CanonicalStore, cmd: &Value) -> anyhow::Result<Value> {
    let name = cmd["name"].as_str().unwrap_or("");
    let list = store.rename_list(list_id(cmd)?, name).await?;
    Ok(json!({"revision": list.revision}))
}

async fn cmd_delete(store: &CanonicalStore, cmd: &Value) -> anyhow::Result<Value> {
    store.delete_list(list_id(cmd)?).await?;
    Ok(json!({"ok": true}))
}

async fn cmd_history(store: &CanonicalStore, cmd: &Value) -> anyhow::Result<Value> {
    let since = cmd["since"]
        .as_i64()
        .and_then(chrono::DateTime::from_timestamp_millis);
    let ledger = store.ledger(list_id(cmd)?).await?;
    let records: Vec<&ChangeRecord> = ledger.since(since).collect();
    Ok(json!({"records": records}))
}

async fn cmd_status(store: &CanonicalStore, cmd: &Value) -> anyhow::Result<Value> {
    match store.storage().load_status(list_id(cmd)?).await? {
        Some(status) => Ok(serde_json::to_value(status)?),
        None => Ok(json!({"shared": false})),
    }
}

/// Drop ledger records every mirror has already synced past.
async fn cmd_prune(store: &CanonicalStore, cmd: &Value) -> anyhow::Result<Value> {
    let id = list_id(cmd)?;
    let floor = store
        .storage()
        .load_status(id)
        .await?
        .and_then(|s| s.min_checkpoint());
    let pruned = match floor {
        Some(floor) => store.truncate_ledger(id, floor).await?,
        None => 0,
    };
    Ok(json!({"pruned": pruned}))
}
