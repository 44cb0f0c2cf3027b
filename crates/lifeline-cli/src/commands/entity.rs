//! Entity commands.

use anyhow::{bail, Context, Result};
use clap::{Args, Subcommand};
use colored::Colorize;
use lifeline_core::{
    Document, DocumentStore, GraphStore, Properties, RelationshipSpec, TransactionResult,
};
use lifeline_sync::{CreateEntity, TransactionOptions, UpdateEntity};
use std::time::Duration;

use crate::app::App;
use crate::output;

#[derive(Subcommand)]
pub enum EntityCommands {
    /// Create an entity in both stores
    Create {
        /// Document collection
        collection: String,
        /// Document body as a JSON object
        #[arg(long, default_value = "{}")]
        data: String,
        /// Graph label (repeatable)
        #[arg(short, long = "label")]
        labels: Vec<String>,
        /// Extra node properties as a JSON object
        #[arg(long)]
        graph_props: Option<String>,
        /// Relationship as TYPE:target_id[:Label,Label] (repeatable)
        #[arg(long = "relate")]
        relationships: Vec<String>,
        #[command(flatten)]
        write: WriteArgs,
    },

    /// Set fields on an entity
    Update {
        collection: String,
        id: String,
        /// Fields to set as a JSON object
        #[arg(long)]
        data: String,
        /// Node properties to set as a JSON object
        #[arg(long)]
        graph_props: Option<String>,
        /// Relationship as TYPE:target_id[:Label,Label] (repeatable)
        #[arg(long = "relate")]
        relationships: Vec<String>,
        #[command(flatten)]
        write: WriteArgs,
    },

    /// Soft-delete an entity in both stores
    Delete {
        collection: String,
        id: String,
        #[command(flatten)]
        write: WriteArgs,
    },

    /// Show an entity as stored in each store
    Show { collection: String, id: String },
}

#[derive(Args)]
pub struct WriteArgs {
    /// Override the configured number of attempts
    #[arg(long)]
    pub retries: Option<u32>,

    /// Fail instead of deferring graph writes when Neo4j is down
    #[arg(long)]
    pub require_graph: bool,

    /// Seconds to wait for deferred graph writes to replay before exiting
    #[arg(long, default_value = "0")]
    pub wait: u64,
}

impl WriteArgs {
    fn options(&self) -> TransactionOptions {
        let mut options = TransactionOptions::new();
        if let Some(retries) = self.retries {
            options = options.retry_attempts(retries);
        }
        if self.require_graph {
            options = options.require_graph_store();
        }
        options
    }
}

pub async fn execute(cmd: EntityCommands, app: &App) -> Result<()> {
    match cmd {
        EntityCommands::Create {
            collection,
            data,
            labels,
            graph_props,
            relationships,
            write,
        } => {
            let mut request = CreateEntity::new(collection, parse_object(&data, "--data")?)
                .labels(labels)
                .graph_properties(parse_optional_object(graph_props.as_deref())?);
            for rel in &relationships {
                request = request.relationship(parse_relationship(rel)?);
            }
            let result = app.coordinator.create_entity(request, write.options()).await;
            finish(app, result, &write).await
        }
        EntityCommands::Update {
            collection,
            id,
            data,
            graph_props,
            relationships,
            write,
        } => {
            let mut request = UpdateEntity::new(collection, id, parse_object(&data, "--data")?)
                .graph_properties(parse_optional_object(graph_props.as_deref())?);
            for rel in &relationships {
                request = request.relationship(parse_relationship(rel)?);
            }
            let result = app.coordinator.update_entity(request, write.options()).await;
            finish(app, result, &write).await
        }
        EntityCommands::Delete {
            collection,
            id,
            write,
        } => {
            let result = app
                .coordinator
                .delete_entity(&collection, &id, write.options())
                .await;
            finish(app, result, &write).await
        }
        EntityCommands::Show { collection, id } => cmd_show(app, &collection, &id).await,
    }
}

async fn finish(app: &App, result: TransactionResult, write: &WriteArgs) -> Result<()> {
    output::print_result(&result);
    if !result.success {
        bail!("write did not commit");
    }

    if result.is_degraded() {
        let remaining = app.settle(Duration::from_secs(write.wait)).await;
        if remaining > 0 {
            println!(
                "{} {} graph operation(s) were not replayed before exit; use {} for a long-running writer",
                "!".yellow().bold(),
                remaining,
                "lifeline apply".cyan()
            );
        } else {
            println!("  graph store reconciled");
        }
    }
    Ok(())
}

async fn cmd_show(app: &App, collection: &str, id: &str) -> Result<()> {
    let document = app
        .document
        .fetch(collection, id)
        .await
        .context("Failed to read document")?;
    let node = match app.graph.fetch_node(id).await {
        Ok(node) => node,
        Err(e) => {
            println!("{} graph store: {}", "!".yellow().bold(), e);
            None
        }
    };

    output::print_entity(id, document.as_ref(), node.as_ref());

    if let (Some(doc), Some(node)) = (&document, &node) {
        let deleted = |props: &Document| props.get("isDeleted").and_then(|v| v.as_bool());
        if deleted(doc) != deleted(&node.properties) {
            println!();
            println!("{}", "Stores disagree on isDeleted".red());
        }
    }
    Ok(())
}

/// Parse a JSON object argument.
pub fn parse_object(raw: &str, flag: &str) -> Result<Document> {
    let value: serde_json::Value =
        serde_json::from_str(raw).with_context(|| format!("{} is not valid JSON", flag))?;
    match value {
        serde_json::Value::Object(map) => Ok(map),
        _ => bail!("{} must be a JSON object", flag),
    }
}

fn parse_optional_object(raw: Option<&str>) -> Result<Properties> {
    raw.map(|r| parse_object(r, "--graph-props"))
        .transpose()
        .map(Option::unwrap_or_default)
}

/// Parse `TYPE:target_id` or `TYPE:target_id:Label,Label`.
pub fn parse_relationship(raw: &str) -> Result<RelationshipSpec> {
    let mut parts = raw.splitn(3, ':');
    let rel_type = parts.next().unwrap_or_default().trim();
    let target = parts.next().unwrap_or_default().trim();
    if rel_type.is_empty() || target.is_empty() {
        bail!("relationship '{}' must look like TYPE:target_id[:Label,...]", raw);
    }

    let mut spec = RelationshipSpec::new(rel_type, target);
    if let Some(labels) = parts.next() {
        spec = spec.with_target_labels(
            labels
                .split(',')
                .map(str::trim)
                .filter(|l| !l.is_empty()),
        );
    }
    Ok(spec)
}
