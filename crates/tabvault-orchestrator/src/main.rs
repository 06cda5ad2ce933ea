//! Tabvault - table backup and disaster-recovery runner

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tabvault_common::logging::{init_logging, LogConfig, LogLevel};
use tabvault_orchestrator::{
    config::Config,
    handler::{InvocationRequest, InvocationResponse, Orchestrator},
    storage::{ObjectStore, S3Storage},
    table::{dynamo, DynamoTables},
};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "tabvault")]
#[command(author, version, about = "Table backup and disaster-recovery orchestration")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Export every configured table and mirror the result offsite
    Backup {
        /// Backup date (YYYY-MM-DD); defaults to today (UTC)
        #[arg(long)]
        date: Option<String>,
    },

    /// Restore tables from a backup
    Restore {
        /// Read the invocation input from a JSON file instead of flags
        #[arg(long, conflicts_with_all = ["backup_date", "tables", "dry_run", "clear_existing_data", "max_workers", "no_wait", "enable_backup_policy"])]
        event: Option<PathBuf>,

        /// Backup date (YYYY-MM-DD) or "latest"
        #[arg(long, default_value = "latest")]
        backup_date: String,

        /// Tables to restore; all configured tables when omitted
        #[arg(long, value_delimiter = ',')]
        tables: Vec<String>,

        /// Validate without writing anything
        #[arg(long)]
        dry_run: bool,

        /// Delete existing items before writing
        #[arg(long)]
        clear_existing_data: bool,

        /// Parallel batch-write workers
        #[arg(long)]
        max_workers: Option<usize>,

        /// Return once imports are started instead of waiting for them
        #[arg(long)]
        no_wait: bool,

        /// Enable continuous backups on tables created by bulk import
        #[arg(long)]
        enable_backup_policy: bool,
    },
}

fn restore_request(command: Command) -> Result<InvocationRequest> {
    let Command::Restore {
        event,
        backup_date,
        tables,
        dry_run,
        clear_existing_data,
        max_workers,
        no_wait,
        enable_backup_policy,
    } = command
    else {
        anyhow::bail!("not a restore command");
    };

    if let Some(path) = event {
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read event file {}", path.display()))?;
        return serde_json::from_str(&raw)
            .with_context(|| format!("Invalid invocation JSON in {}", path.display()));
    }

    Ok(InvocationRequest {
        backup_date,
        tables,
        dry_run,
        clear_existing_data,
        max_workers,
        wait_for_completion: !no_wait,
        enable_backup_policy,
    })
}

async fn build_orchestrator(config: Config) -> Result<Orchestrator> {
    let shared = aws_config::load_from_env().await;
    let account = dynamo::resolve_account(&shared).await?;

    let primary = S3Storage::new(&shared, config.primary.clone())?;
    let offsite: Option<Arc<dyn ObjectStore>> = match &config.offsite {
        Some(offsite) => Some(Arc::new(S3Storage::new(&shared, offsite.clone())?)),
        None => None,
    };

    let orchestrator = Orchestrator::new(
        config,
        Arc::new(DynamoTables::new(&shared)),
        Arc::new(primary),
        account,
    );

    Ok(match offsite {
        Some(store) => orchestrator.with_offsite(store),
        None => orchestrator,
    })
}

async fn run(command: Command) -> Result<InvocationResponse> {
    let config = Config::load()?;
    info!(environment = %config.environment, tables = ?config.tables, "Configuration loaded");

    let orchestrator = build_orchestrator(config).await?;
    Ok(match command {
        Command::Backup { date } => orchestrator.run_backup(date).await,
        restore @ Command::Restore { .. } => {
            orchestrator.run_restore(restore_request(restore)?).await
        },
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    dotenvy::dotenv().ok();

    let log_level = if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };

    let (run_name, run_type) = match &cli.command {
        Command::Backup { .. } => ("backup", "DYNAMODB_NATIVE_EXPORT"),
        Command::Restore { .. } => ("restore", "RESTORE"),
    };

    // Environment variables take precedence
    let log_config = LogConfig::builder()
        .level(log_level)
        .for_run(run_name)
        .build()
        .merge_env()?;
    let guard = init_logging(&log_config)?;
    let started = std::time::Instant::now();

    let response = match run(cli.command).await {
        Ok(response) => response,
        Err(e) => {
            error!(error = %e, "Run aborted");
            let environment = std::env::var("ENVIRONMENT").unwrap_or_else(|_| "unknown".to_string());
            InvocationResponse::error(
                format!("{:#}", e),
                run_type,
                &environment,
                started.elapsed(),
            )
        },
    };

    println!("{}", serde_json::to_string_pretty(&response)?);
    info!(status_code = response.status_code, "Run finished");

    if response.status_code >= 500 {
        drop(guard);
        std::process::exit(1);
    }
    Ok(())
}
