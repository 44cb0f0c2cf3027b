//! CLI command definitions and handlers.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

pub mod apply;
pub mod entity;
pub mod schema;
pub mod status;

use crate::app::App;
use crate::config::LifelineConfig;

/// Lifeline - consistent writes across a document store and a graph store
#[derive(Parser)]
#[command(name = "lifeline")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Config file (defaults to ./lifeline.toml when present)
    #[arg(short, long, global = true, env = "LIFELINE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Also append logs to this file
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Probe both stores and show their status
    Status(status::StatusArgs),

    /// Graph schema commands
    #[command(subcommand)]
    Schema(schema::SchemaCommands),

    /// Create, update, delete and inspect entities
    #[command(subcommand)]
    Entity(entity::EntityCommands),

    /// Run newline-delimited JSON transactions with background reconciliation
    Apply(apply::ApplyArgs),
}

impl Cli {
    pub async fn execute(self) -> Result<()> {
        let config = LifelineConfig::load(self.config.as_deref())?;

        match self.command {
            Commands::Schema(cmd) => schema::execute(cmd, &config).await,
            Commands::Status(args) => status::execute(args, &App::connect(config).await?).await,
            Commands::Entity(cmd) => entity::execute(cmd, &App::connect(config).await?).await,
            Commands::Apply(args) => apply::execute(args, &App::connect(config).await?).await,
        }
    }
}
