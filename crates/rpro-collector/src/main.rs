//! RPRO collector - Main entry point

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rpro_common::logging::{init_logging, LogConfig, LogLevel};
use std::sync::Arc;
use tokio::signal;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, info, warn};

use rpro_collector::{
    config::{AppConfig, DatabaseConfig},
    db::{InMemoryRecordStore, PgRecordStore, RecordStore},
    ingest::{Collector, CollectorEvent, ProcessResult},
    CollectorError,
};

#[derive(Parser)]
#[command(name = "rpro-collector", version, about = "Collects IHM CSV exports into the RPRO database")]
struct Cli {
    /// Keep records in memory instead of PostgreSQL
    #[arg(long, global = true, env = "RPRO_MEMORY_STORE")]
    memory: bool,

    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Poll the IHMs until interrupted
    Run {
        /// Print collector events to stdout as JSON lines
        #[arg(long)]
        json: bool,
    },
    /// Run a single collection cycle
    Once {
        /// Print the file results to stdout as JSON
        #[arg(long)]
        json: bool,
    },
    /// Check that every configured IHM is reachable
    TestConnection,
    /// Create the record tables
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_config = LogConfig::builder()
        .level(if cli.verbose { LogLevel::Debug } else { LogLevel::Info })
        .log_file_prefix("rpro-collector")
        .filter_directives("sqlx=warn,suppaftp=info")
        .build()
        .merge_env()?;
    let _guard = init_logging(&log_config)?;

    let config = AppConfig::load()?;
    info!(line = %config.collector.line, "Starting RPRO collector");

    match cli.command {
        Command::Migrate => {
            let store = PgRecordStore::connect(&config.database).await?;
            store.migrate().await?;
        },
        Command::TestConnection => {
            let collector = Collector::with_ftp(config.collector, Arc::new(InMemoryRecordStore::new()));
            let checks = collector.test_connections().await;
            let failed = checks.iter().filter(|(_, check)| !check.ok).count();
            for (ihm, check) in &checks {
                println!("{:<6} {} {}", ihm, if check.ok { "OK  " } else { "FAIL" }, check.message);
            }
            if failed > 0 {
                anyhow::bail!("{} of {} IHM endpoints unreachable", failed, checks.len());
            }
        },
        Command::Once { json } => {
            let store = open_store(cli.memory, &config.database).await?;
            let collector = Collector::with_ftp(config.collector, store);
            match collector.run_once().await {
                Ok(results) => report_results(&results, json)?,
                Err(CollectorError::StoreUnavailable { message, results }) => {
                    report_results(&results, json)?;
                    anyhow::bail!("Record store unavailable: {}", message);
                },
                Err(e) => return Err(e.into()),
            }
        },
        Command::Run { json } => {
            let store = open_store(cli.memory, &config.database).await?;
            let collector = Collector::with_ftp(config.collector, store);
            tokio::spawn(log_events(collector.subscribe(), json));

            collector.start_recurring();
            signal::ctrl_c().await.context("Failed to listen for shutdown signal")?;
            info!("Shutdown signal received");

            if !collector.stop().await {
                warn!("Exiting with a collection cycle still in flight");
            }
        },
    }

    Ok(())
}

fn report_results(results: &[ProcessResult], json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(results)?);
    }
    for result in results {
        info!(
            file = %result.file_name,
            ihm = %result.source,
            success = result.success,
            rows = result.rows_processed,
            saved = result.rows_saved,
            duplicated = result.rows_duplicated,
            errors = result.rows_errored,
            "{}",
            result.error_message.as_deref().unwrap_or("ok")
        );
    }
    info!(files = results.len(), "Collection finished");
    Ok(())
}

async fn open_store(memory: bool, database: &DatabaseConfig) -> Result<Arc<dyn RecordStore>> {
    if memory {
        info!("Using in-memory record store");
        return Ok(Arc::new(InMemoryRecordStore::new()));
    }

    let store = PgRecordStore::connect(database).await?;
    store.migrate().await?;
    Ok(Arc::new(store))
}

async fn log_events(mut events: broadcast::Receiver<CollectorEvent>, json: bool) {
    loop {
        let event = events.recv().await;
        if json {
            if let Ok(event) = &event {
                match serde_json::to_string(event) {
                    Ok(line) => println!("{}", line),
                    Err(e) => warn!("Failed to serialize event: {}", e),
                }
            }
        }

        match event {
            Ok(CollectorEvent::FileProcessed(result)) => {
                debug!(file = %result.file_name, success = result.success, "File processed event");
            },
            Ok(CollectorEvent::StatusChanged(status)) => {
                debug!(
                    running = status.is_running,
                    files = status.files_processed,
                    rows = status.total_rows_saved,
                    "Status changed"
                );
            },
            Ok(CollectorEvent::Error(message)) => warn!("Collector error: {}", message),
            Err(RecvError::Lagged(skipped)) => debug!(skipped, "Event listener lagged"),
            Err(RecvError::Closed) => break,
        }
    }
}
