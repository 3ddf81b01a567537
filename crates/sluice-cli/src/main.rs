use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde::Serialize;
use sluice_core::{QueueCounts, SluiceConfig, Store, SystemClock};
use tracing::error;

mod demo;
mod logging;

type CliResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

#[derive(Debug, Parser)]
#[command(name = "sluice", about = "Durable SQLite ack queues and batch pipelines")]
struct Cli {
    /// TOML config file.
    #[arg(long, short, env = "SLUICE_CONFIG")]
    config: Option<PathBuf>,

    /// Database file; overrides `[store] path`.
    #[arg(long, env = "SLUICE_DB")]
    db: Option<PathBuf>,

    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the two-stage demo pipeline to completion.
    Demo {
        #[arg(long, default_value_t = 25)]
        records: i64,
        #[arg(long, default_value_t = 10)]
        batch_size: usize,
    },
    /// Print per-status record counts of queues.
    Status {
        #[arg(required = true)]
        queues: Vec<String>,
    },
    /// Return stale leases to pending now.
    Recycle {
        #[arg(required = true)]
        queues: Vec<String>,
    },
}

#[derive(Debug, Serialize)]
struct QueueReport {
    queue: String,
    #[serde(flatten)]
    counts: QueueCounts,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    logging::init(&cli.log_level);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "sluice failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> CliResult<()> {
    let mut config = match &cli.config {
        Some(path) => SluiceConfig::load(path)?,
        None => SluiceConfig::default(),
    };
    if let Some(db) = cli.db {
        config.store.path = db;
    }
    let store = Store::open_with(&config.store.path, &config.store.options, Arc::new(SystemClock))?;

    match cli.command {
        Command::Demo {
            records,
            batch_size,
        } => {
            let status = demo::run(&config, &store, records, batch_size).await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Command::Status { queues } => {
            let mut reports = Vec::with_capacity(queues.len());
            for name in queues {
                let queue = store.queue(&name, config.queue.clone())?;
                reports.push(QueueReport {
                    queue: name,
                    counts: queue.counts()?,
                });
            }
            println!("{}", serde_json::to_string_pretty(&reports)?);
        }
        Command::Recycle { queues } => {
            for name in queues {
                let queue = store.queue(&name, config.queue.clone())?;
                // store は同期 API なので blocking thread で実行
                let recycled = tokio::task::spawn_blocking(move || queue.recycle_stale_leases()).await??;
                println!("{name}: {recycled} recycled");
            }
        }
    }
    Ok(())
}
