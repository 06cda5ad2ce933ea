//! Invocation handling: one backup or restore run to a response record

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as Json};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::backups::LATEST;
use crate::config::{Config, RestoreStrategyKind};
use crate::discovery::DataFileResolver;
use crate::export::{BackupSummary, ExportManager};
use crate::offsite::{CopyOutcome, OffsiteMirror};
use crate::restore::{
    batch::DEFAULT_FILE_PAUSE, BatchWriteRestore, BulkImportRestore, RestoreManager,
    RestoreOptions, RestoreRequest, RestoreStrategy, DEFAULT_TABLE_PAUSE,
};
use crate::storage::ObjectStore;
use crate::table::{AccountContext, TableService};

fn default_backup_date() -> String {
    LATEST.to_string()
}

fn default_true() -> bool {
    true
}

/// Restore invocation input. Every field has a default.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvocationRequest {
    #[serde(default = "default_backup_date")]
    pub backup_date: String,
    #[serde(default)]
    pub tables: Vec<String>,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default)]
    pub clear_existing_data: bool,
    /// Falls back to the configured worker width
    #[serde(default)]
    pub max_workers: Option<usize>,
    #[serde(default = "default_true")]
    pub wait_for_completion: bool,
    #[serde(default)]
    pub enable_backup_policy: bool,
}

impl Default for InvocationRequest {
    fn default() -> Self {
        Self {
            backup_date: default_backup_date(),
            tables: Vec::new(),
            dry_run: false,
            clear_existing_data: false,
            max_workers: None,
            wait_for_completion: true,
            enable_backup_policy: false,
        }
    }
}

/// Status code plus JSON body
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InvocationResponse {
    pub status_code: u16,
    pub body: Json,
}

impl InvocationResponse {
    fn from_body<T: Serialize>(status_code: u16, body: &T) -> Self {
        match serde_json::to_value(body) {
            Ok(body) => Self { status_code, body },
            Err(e) => Self {
                status_code: 500,
                body: json!({ "error": format!("Failed to serialize response: {}", e) }),
            },
        }
    }

    /// Body for a run aborted before producing results.
    pub fn error(
        error: impl std::fmt::Display,
        run_type: &str,
        environment: &str,
        duration: Duration,
    ) -> Self {
        let failed_at: DateTime<Utc> = Utc::now();
        Self {
            status_code: 500,
            body: json!({
                "error": error.to_string(),
                "restore_type": run_type,
                "environment": environment,
                "duration_seconds": duration.as_secs(),
                "failed_at": failed_at,
            }),
        }
    }
}

#[derive(Debug, Serialize)]
struct BackupResponse {
    #[serde(flatten)]
    summary: BackupSummary,
    offsite_copy: CopyOutcome,
}

/// Wires configuration and remote services into backup and restore runs.
pub struct Orchestrator {
    config: Config,
    tables: Arc<dyn TableService>,
    store: Arc<dyn ObjectStore>,
    offsite: Option<Arc<dyn ObjectStore>>,
    account: AccountContext,
    file_pause: Duration,
    table_pause: Duration,
}

impl Orchestrator {
    pub fn new(
        config: Config,
        tables: Arc<dyn TableService>,
        store: Arc<dyn ObjectStore>,
        account: AccountContext,
    ) -> Self {
        Self {
            config,
            tables,
            store,
            offsite: None,
            account,
            file_pause: DEFAULT_FILE_PAUSE,
            table_pause: DEFAULT_TABLE_PAUSE,
        }
    }

    pub fn with_offsite(mut self, offsite: Arc<dyn ObjectStore>) -> Self {
        self.offsite = Some(offsite);
        self
    }

    /// Override the pauses between data files and between tables.
    pub fn with_pauses(mut self, file_pause: Duration, table_pause: Duration) -> Self {
        self.file_pause = file_pause;
        self.table_pause = table_pause;
        self
    }

    /// Export every configured table for `backup_date` (today when `None`),
    /// then mirror the date offsite.
    pub async fn run_backup(&self, backup_date: Option<String>) -> InvocationResponse {
        let backup_date =
            backup_date.unwrap_or_else(|| Utc::now().format("%Y-%m-%d").to_string());
        info!(
            environment = %self.config.environment,
            bucket = %self.store.bucket(),
            backup_date = %backup_date,
            "Starting backup"
        );

        let exports = ExportManager::new(
            self.tables.clone(),
            self.store.clone(),
            self.account.clone(),
            self.config.exports_root.as_str(),
            self.config.environment.as_str(),
        )
        .with_schedule(self.config.polling.export_schedule());

        let (manifest, manifest_key) = exports.run(&self.config.tables, &backup_date).await;
        let summary = BackupSummary::from_manifest(&manifest, manifest_key);

        let offsite_copy = match (&self.offsite, summary.successful_exports) {
            (_, 0) => CopyOutcome::skipped(&backup_date, "no successful exports"),
            (None, _) => CopyOutcome::skipped(&backup_date, "offsite copy disabled"),
            (Some(destination), _) => {
                OffsiteMirror::new(
                    self.store.clone(),
                    destination.clone(),
                    self.config.environment.as_str(),
                    self.config.exports_root.as_str(),
                )
                .mirror(&backup_date)
                .await
            },
        };

        let status_code = summary.status_code();
        info!(
            successful = summary.successful_exports,
            failed = summary.failed_exports,
            status_code,
            "Backup run finished"
        );

        InvocationResponse::from_body(status_code, &BackupResponse { summary, offsite_copy })
    }

    fn restore_strategy(&self) -> Box<dyn RestoreStrategy> {
        let resolver = DataFileResolver::new(self.store.clone());
        match self.config.restore.strategy {
            RestoreStrategyKind::BatchWrite => Box::new(
                BatchWriteRestore::new(self.tables.clone(), self.store.clone(), resolver)
                    .with_file_pause(self.file_pause),
            ),
            RestoreStrategyKind::BulkImport => Box::new(
                BulkImportRestore::new(
                    self.tables.clone(),
                    resolver,
                    self.store.bucket(),
                    self.config.restore.table_suffix.as_str(),
                )
                .with_schedule(self.config.polling.import_schedule()),
            ),
        }
    }

    pub async fn run_restore(&self, request: InvocationRequest) -> InvocationResponse {
        let started = Instant::now();
        let manager = RestoreManager::new(
            self.store.clone(),
            &self.config.exports_root,
            self.config.environment.as_str(),
            self.config.tables.clone(),
            self.restore_strategy(),
        )
        .with_table_pause(self.table_pause);

        let restore_request = RestoreRequest {
            backup_date: request.backup_date,
            tables: request.tables,
            dry_run: request.dry_run,
            options: RestoreOptions {
                clear_existing_data: request.clear_existing_data,
                max_workers: request
                    .max_workers
                    .filter(|w| *w > 0)
                    .unwrap_or(self.config.restore.max_workers),
                wait_for_completion: request.wait_for_completion,
                enable_backup_policy: request.enable_backup_policy,
            },
        };

        match manager.run(&restore_request).await {
            Ok(report) => {
                let status_code = report.status_code();
                if status_code >= 500 {
                    warn!(status_code, "Restore run finished with failures");
                }
                InvocationResponse::from_body(status_code, &report)
            },
            Err(e) => {
                error!(error = %e, elapsed_secs = started.elapsed().as_secs(), "Restore aborted");
                InvocationResponse::error(
                    e,
                    manager.restore_type(),
                    &self.config.environment,
                    started.elapsed(),
                )
            },
        }
    }
}
