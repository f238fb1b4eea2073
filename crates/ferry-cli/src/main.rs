//! 🚀 ferry-cli: the front door. Parses args, sets up logging, loads config, then gets out
//! of the way while the library does the lifting. 🦆

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use comfy_table::{ContentArrangement, Table, presets::UTF8_FULL};
use ferry::{RunOutcome, RunStatus};
use tracing::error;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "ferry", version, about = "⛴️ run a connector pipeline and record the outcome")]
struct Cli {
    /// TOML config file. Env vars (FERRY_*, DATABASE_URL) are read either way.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run one connector end to end.
    Run {
        #[arg(long)]
        connector_id: i64,
        /// Ties this run to whatever triggered it. Generated when omitted.
        #[arg(long)]
        correlation_id: Option<String>,
        /// Print the outcome as JSON instead of a table.
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    // 🔒 a config path that was asked for must exist
    if let Some(config_file) = &cli.config {
        let exists = config_file.try_exists().with_context(|| {
            format!("💀 couldn't check for the configuration file at '{}'", config_file.display())
        })?;
        if !exists {
            anyhow::bail!(
                "💀 configuration file '{}' does not exist. If it's a relative path, try an \
                 absolute one.",
                config_file.display()
            );
        }
    }

    let app_config = ferry::load_config(cli.config.as_deref())
        .context("💀 In ferry-cli, main, we couldn't load the configuration")?;

    match cli.command {
        Command::Run { connector_id, correlation_id, json } => {
            let outcome = match ferry::run(app_config, connector_id, correlation_id).await {
                Ok(outcome) => outcome,
                Err(err) => {
                    report_error(&err);
                    std::process::exit(1);
                }
            };

            if json {
                println!("{}", serde_json::to_string_pretty(&outcome)?);
            } else {
                println!("{}", outcome_table(connector_id, &outcome));
            }

            if !outcome.is_success() {
                std::process::exit(1);
            }
        }
    }
    Ok(())
}

fn outcome_table(connector_id: i64, outcome: &RunOutcome) -> Table {
    let status = match outcome.status {
        RunStatus::Success => "✅ success",
        _ => "❌ failed",
    };
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec!["connector", "run", "status", "rows", "summary"])
        .add_row(vec![
            connector_id.to_string(),
            outcome.run_id.to_string(),
            status.to_string(),
            outcome.rows_ingested.to_string(),
            outcome.log_summary.clone(),
        ]);
    table
}

fn report_error(err: &anyhow::Error) {
    error!("💀 error: {}", err);
    let mut looks_like_a_connection_problem = false;
    for cause in err.chain().skip(1) {
        error!("⚠️  cause: {}", cause);
        let cause_str = cause.to_string().to_ascii_lowercase();
        if cause_str.contains("connection refused")
            || cause_str.contains("tcp connect error")
            || cause_str.contains("timed out")
            || cause_str.contains("dns error")
            || cause_str.contains("error connecting")
        {
            looks_like_a_connection_problem = true;
        }
    }

    if looks_like_a_connection_problem {
        error!(
            "🔧 hint: the connector store database isn't reachable. Check that it's running and \
            that DATABASE_URL points at it. If you're using Docker, `docker ps` will tell you \
            whether it's up."
        );
    }
}
