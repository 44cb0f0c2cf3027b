//! Store status command.

use anyhow::Result;
use clap::Args;
use serde_json::json;

use crate::app::App;
use crate::output;

#[derive(Args)]
pub struct StatusArgs {
    /// Print JSON instead of a table
    #[arg(long)]
    pub json: bool,
}

pub async fn execute(args: StatusArgs, app: &App) -> Result<()> {
    // App::connect has just probed both stores.
    let report = app.degradation.service_status();
    let stats = app.degradation.unsynced_stats();

    if args.json {
        let body = json!({ "status": report, "unsynced": stats });
        println!("{}", serde_json::to_string_pretty(&body)?);
        return Ok(());
    }

    output::print_status(&report);
    println!();
    output::print_stats(&stats);
    Ok(())
}
