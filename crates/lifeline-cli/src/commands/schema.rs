//! Graph schema commands.

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::Colorize;
use lifeline_graph::GraphClient;

use crate::config::LifelineConfig;

#[derive(Subcommand)]
pub enum SchemaCommands {
    /// Create the Entity id constraint and indexes (idempotent)
    Init,
}

pub async fn execute(cmd: SchemaCommands, config: &LifelineConfig) -> Result<()> {
    match cmd {
        SchemaCommands::Init => cmd_init(config).await,
    }
}

async fn cmd_init(config: &LifelineConfig) -> Result<()> {
    let client = GraphClient::connect(&config.neo4j)
        .await
        .with_context(|| format!("Neo4j is not reachable at {}", config.neo4j.uri))?;

    let applied = lifeline_graph::initialize_schema(&client).await?;
    println!("{} {} statements applied", "✓".green(), applied);
    Ok(())
}
