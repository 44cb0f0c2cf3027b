//! Long-running writer: reads transactions as newline-delimited JSON and
//! keeps the degradation service's timers running while it does.
//!
//! Each line is either a single operation or `{"operations": [...]}`:
//!
//! ```text
//! {"kind": "create", "collection": "accounts", "entity_id": "acct-1", "data": {"name": "Checking"}, "labels": ["Account"]}
//! {"operations": [{"kind": "update", "collection": "accounts", "entity_id": "acct-1", "data": {"name": "Main"}}]}
//! ```

use anyhow::{bail, Context, Result};
use clap::Args;
use colored::Colorize;
use lifeline_core::{Document, Properties, RelationshipSpec, WriteOperation};
use lifeline_sync::TransactionOptions;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use uuid::Uuid;

use crate::app::App;
use crate::output;

#[derive(Args)]
pub struct ApplyArgs {
    /// Read from this file instead of stdin
    #[arg(short, long)]
    pub file: Option<PathBuf>,

    /// Seconds to keep reconciling after input ends
    #[arg(long, default_value = "30")]
    pub drain_timeout: u64,

    /// Print one JSON result per line instead of text
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum OperationRequest {
    Create {
        collection: String,
        /// Generated when absent.
        #[serde(default)]
        entity_id: Option<String>,
        #[serde(default)]
        data: Document,
        #[serde(default)]
        labels: Vec<String>,
        #[serde(default)]
        graph_properties: Properties,
        #[serde(default)]
        relationships: Vec<RelationshipSpec>,
    },
    Update {
        collection: String,
        entity_id: String,
        #[serde(default)]
        data: Document,
        #[serde(default)]
        graph_properties: Properties,
        #[serde(default)]
        relationships: Vec<RelationshipSpec>,
    },
    Delete {
        collection: String,
        entity_id: String,
    },
}

impl From<OperationRequest> for WriteOperation {
    fn from(request: OperationRequest) -> Self {
        match request {
            OperationRequest::Create {
                collection,
                entity_id,
                data,
                labels,
                graph_properties,
                relationships,
            } => {
                let id = entity_id.unwrap_or_else(|| Uuid::new_v4().to_string());
                WriteOperation::create(collection, id, data, labels, graph_properties)
                    .with_relationships(relationships)
            }
            OperationRequest::Update {
                collection,
                entity_id,
                data,
                graph_properties,
                relationships,
            } => WriteOperation::update(collection, entity_id, data, graph_properties)
                .with_relationships(relationships),
            OperationRequest::Delete {
                collection,
                entity_id,
            } => WriteOperation::delete(collection, entity_id),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Line {
    Batch { operations: Vec<OperationRequest> },
    Single(OperationRequest),
}

/// Parse one input line into a batch. Blank lines yield `None`.
fn parse_line(line: &str) -> Result<Option<Vec<WriteOperation>>> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let ops = match serde_json::from_str::<Line>(line)? {
        Line::Batch { operations } => operations,
        Line::Single(op) => vec![op],
    };
    Ok(Some(ops.into_iter().map(WriteOperation::from).collect()))
}

/// Decode one raw input line. Bytes that are not UTF-8 reject the line.
fn decode_line(raw: &[u8]) -> Result<Option<Vec<WriteOperation>>> {
    let line = std::str::from_utf8(raw).context("line is not valid UTF-8")?;
    parse_line(line)
}

#[derive(Debug, Default)]
struct Tally {
    committed: usize,
    degraded: usize,
    failed: usize,
    rejected: usize,
}

pub async fn execute(args: ApplyArgs, app: &App) -> Result<()> {
    let reader: Box<dyn AsyncBufRead + Unpin + Send> = match &args.file {
        Some(path) => {
            let file = tokio::fs::File::open(path)
                .await
                .with_context(|| format!("Failed to open {}", path.display()))?;
            Box::new(BufReader::new(file))
        }
        None => Box::new(BufReader::new(tokio::io::stdin())),
    };

    app.degradation.start();
    let mut segments = reader.split(b'\n');
    let mut tally = Tally::default();
    let mut line_no = 0usize;

    loop {
        let raw = match segments.next_segment().await {
            Ok(Some(raw)) => raw,
            Ok(None) => break,
            Err(e) => {
                // Stop reading but still settle the queue below.
                warn!(line = line_no + 1, error = %e, "Failed to read input");
                tally.rejected += 1;
                break;
            }
        };
        line_no += 1;
        let ops = match decode_line(&raw) {
            Ok(Some(ops)) => ops,
            Ok(None) => continue,
            Err(e) => {
                warn!(line = line_no, error = %e, "Skipping malformed line");
                tally.rejected += 1;
                continue;
            }
        };

        let result = app
            .coordinator
            .execute_transaction(ops, TransactionOptions::new())
            .await;
        match (result.success, result.is_degraded()) {
            (true, false) => tally.committed += 1,
            (true, true) => tally.degraded += 1,
            (false, _) => tally.failed += 1,
        }

        if args.json {
            let error = result.error.as_ref().map(ToString::to_string);
            let body = serde_json::json!({
                "line": line_no,
                "success": result.success,
                "attempts": result.attempts,
                "deferred": result.deferred_graph_operations,
                "error": error,
            });
            println!("{}", body);
        } else {
            print!("{} ", format!("[{}]", line_no).dimmed());
            output::print_result(&result);
        }
    }

    let remaining = app.settle(Duration::from_secs(args.drain_timeout)).await;
    app.degradation.stop();

    info!(
        committed = tally.committed,
        degraded = tally.degraded,
        failed = tally.failed,
        rejected = tally.rejected,
        unsynced = remaining,
        "Input exhausted"
    );

    if !args.json {
        println!();
        println!(
            "{} committed, {} degraded, {} failed, {} rejected",
            tally.committed.to_string().green(),
            tally.degraded.to_string().yellow(),
            tally.failed.to_string().red(),
            tally.rejected
        );
        output::print_stats(&app.degradation.unsynced_stats());
    }

    if tally.failed + tally.rejected > 0 {
        bail!(
            "{} of {} lines were not applied",
            tally.failed + tally.rejected,
            tally.committed + tally.degraded + tally.failed + tally.rejected
        );
    }
    Ok(())
}
