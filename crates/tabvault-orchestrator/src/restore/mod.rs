//! Restore lifecycle
//!
//! [`RestoreManager`] resolves the requested tables and backup date, loads
//! the manifest and hands each table with a valid export to the configured
//! [`RestoreStrategy`], one table at a time. Dry runs stop after
//! validating that each export's data files can be found.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tabvault_common::{Result, VaultError};
use tokio::time::{sleep, Instant};
use tracing::{info, warn};

use crate::backups::{select_exports, BackupCatalog};
use crate::discovery::DataFileResolver;
use crate::export::{bytes_to_mb, ExportJob};
use crate::storage::ObjectStore;
use crate::writer::{success_rate, DEFAULT_WRITE_WORKERS};

pub mod batch;
pub mod import;

pub use batch::BatchWriteRestore;
pub use import::{BulkImportRestore, ImportJob};

/// Pause between tables
pub const DEFAULT_TABLE_PAUSE: Duration = Duration::from_secs(2);

/// Files sized by HEAD for a dry-run estimate
const DRY_RUN_SIZE_SAMPLE: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RestoreStatus {
    Completed,
    PartialSuccess,
    Failed,
    Skipped,
    /// Import started but not yet finished
    InProgress,
}

/// Continuous-backup switch applied to a restored table
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackupPolicyOutcome {
    pub continuous_backups_enabled: bool,
    /// Always `"OPERATIONAL_SETTING"`: the policy is applied going forward
    /// and is not part of the backup payload.
    pub source: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl BackupPolicyOutcome {
    const SOURCE: &'static str = "OPERATIONAL_SETTING";

    pub fn applied() -> Self {
        Self {
            continuous_backups_enabled: true,
            source: Self::SOURCE,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            continuous_backups_enabled: false,
            source: Self::SOURCE,
            error: Some(error.into()),
        }
    }
}

/// A data file that could not be downloaded, decompressed or read
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedFile {
    pub key: String,
    pub error: String,
}

/// Per-table restore outcome.
///
/// `items_written + items_failed <= items_processed`, with equality once a
/// batch-write restore finishes. Files discovered for the table are either
/// counted in `total_files_processed` or listed in `failed_files`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RestoreResult {
    pub table_name: String,
    pub restore_type: &'static str,
    pub status: RestoreStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_table_name: Option<String>,
    pub total_files_processed: usize,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub failed_files: Vec<FailedFile>,
    pub items_cleared: usize,
    pub items_processed: usize,
    pub items_written: usize,
    pub items_failed: usize,
    /// Records in readable files that could not be decoded
    pub records_skipped: usize,
    pub success_rate: String,
    pub expected_items: u64,
    pub export_arn: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub import_job: Option<ImportJob>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backup_policy: Option<BackupPolicyOutcome>,
}

impl RestoreResult {
    pub fn new(table_name: &str, restore_type: &'static str, export: &ExportJob) -> Self {
        Self {
            table_name: table_name.to_string(),
            restore_type,
            status: RestoreStatus::InProgress,
            target_table_name: None,
            total_files_processed: 0,
            failed_files: Vec::new(),
            items_cleared: 0,
            items_processed: 0,
            items_written: 0,
            items_failed: 0,
            records_skipped: 0,
            success_rate: success_rate(0, 0),
            expected_items: export.item_count,
            export_arn: export
                .job_handle
                .clone()
                .unwrap_or_else(|| "unknown".to_string()),
            warning: None,
            error: None,
            import_job: None,
            backup_policy: None,
        }
    }

    fn skipped(table_name: &str, restore_type: &'static str) -> Self {
        let mut result = Self::new(table_name, restore_type, &ExportJob::new(table_name, ""));
        result.status = RestoreStatus::Skipped;
        result.error = Some("No valid export found for this table".to_string());
        result
    }

    pub fn failed(mut self, error: impl Into<String>) -> Self {
        let error = error.into();
        warn!(table = %self.table_name, error = %error, "Restore failed");
        self.status = RestoreStatus::Failed;
        self.error = Some(error);
        self
    }

    pub fn refresh_success_rate(&mut self) {
        self.success_rate = success_rate(self.items_written, self.items_processed);
    }
}

/// Options echoed into every restore summary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RestoreOptions {
    pub clear_existing_data: bool,
    pub max_workers: usize,
    pub wait_for_completion: bool,
    pub enable_backup_policy: bool,
}

impl Default for RestoreOptions {
    fn default() -> Self {
        Self {
            clear_existing_data: false,
            max_workers: DEFAULT_WRITE_WORKERS,
            wait_for_completion: true,
            enable_backup_policy: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreRequest {
    /// `"latest"` or `YYYY-MM-DD`
    pub backup_date: String,
    /// Empty restores every configured table
    pub tables: Vec<String>,
    pub dry_run: bool,
    pub options: RestoreOptions,
}

/// How one table's export is brought back.
#[async_trait]
pub trait RestoreStrategy: Send + Sync {
    /// Label on each per-table result
    fn restore_type(&self) -> &'static str;

    /// Label on the run summary
    fn summary_type(&self) -> &'static str;

    fn dry_run_warnings(&self) -> Vec<String>;

    /// Restore one table. Failures are reported in the result.
    async fn restore(
        &self,
        table_name: &str,
        export: &ExportJob,
        backup_date: &str,
        options: &RestoreOptions,
    ) -> RestoreResult;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ValidationStatus {
    Ready,
    Error,
    NoExport,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TableValidation {
    pub table_name: String,
    pub status: ValidationStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub export_arn: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected_items: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_files_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_size_mb: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub restore_options: Option<RestoreOptions>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TableValidation {
    fn problem(table_name: &str, status: ValidationStatus, error: impl Into<String>) -> Self {
        Self {
            table_name: table_name.to_string(),
            status,
            export_arn: None,
            expected_items: None,
            data_files_count: None,
            estimated_size_mb: None,
            restore_options: None,
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DryRunSummary {
    pub dry_run: bool,
    pub backup_date: String,
    pub environment: String,
    pub restore_type: &'static str,
    pub tables_requested: usize,
    pub validation_results: Vec<TableValidation>,
    pub configuration: RestoreOptions,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RestoreSummary {
    pub backup_date: String,
    pub environment: String,
    pub restore_type: &'static str,
    pub duration_seconds: u64,
    pub tables_requested: usize,
    pub successful_restores: usize,
    pub partial_restores: usize,
    pub failed_restores: usize,
    pub skipped_restores: usize,
    pub in_progress_restores: usize,
    pub total_items_written: usize,
    pub total_items_processed: usize,
    pub configuration: RestoreOptions,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    pub restore_results: Vec<RestoreResult>,
    pub completed_at: DateTime<Utc>,
}

impl RestoreSummary {
    /// 500 when something failed and nothing completed, 207 for any failure
    /// or partial restore, 202 while imports are still running, else 200.
    pub fn status_code(&self) -> u16 {
        if self.failed_restores > 0 && self.successful_restores == 0 {
            500
        } else if self.failed_restores > 0 || self.partial_restores > 0 {
            207
        } else if self.in_progress_restores > 0 {
            202
        } else {
            200
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum RestoreReport {
    DryRun(DryRunSummary),
    Restore(RestoreSummary),
}

impl RestoreReport {
    pub fn status_code(&self) -> u16 {
        match self {
            RestoreReport::DryRun(_) => 200,
            RestoreReport::Restore(summary) => summary.status_code(),
        }
    }
}

pub struct RestoreManager {
    catalog: BackupCatalog,
    resolver: DataFileResolver,
    store: Arc<dyn ObjectStore>,
    strategy: Box<dyn RestoreStrategy>,
    environment: String,
    restorable_tables: Vec<String>,
    table_pause: Duration,
}

impl RestoreManager {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        exports_root: &str,
        environment: impl Into<String>,
        restorable_tables: Vec<String>,
        strategy: Box<dyn RestoreStrategy>,
    ) -> Self {
        Self {
            catalog: BackupCatalog::new(store.clone(), exports_root),
            resolver: DataFileResolver::new(store.clone()),
            store,
            strategy,
            environment: environment.into(),
            restorable_tables,
            table_pause: DEFAULT_TABLE_PAUSE,
        }
    }

    pub fn with_table_pause(mut self, pause: Duration) -> Self {
        self.table_pause = pause;
        self
    }

    pub fn restore_type(&self) -> &'static str {
        self.strategy.restore_type()
    }

    /// Requested tables within the configured set; all of them when none
    /// are requested.
    pub fn tables_to_restore(&self, requested: &[String]) -> Result<Vec<String>> {
        if requested.is_empty() {
            return Ok(self.restorable_tables.clone());
        }

        let (valid, invalid): (Vec<String>, Vec<String>) = requested
            .iter()
            .cloned()
            .partition(|t| self.restorable_tables.contains(t));

        if !invalid.is_empty() {
            warn!(invalid = ?invalid, "Invalid tables requested");
        }
        if valid.is_empty() {
            return Err(VaultError::NotFound(format!(
                "None of the specified tables are available. Available: {:?}",
                self.restorable_tables
            )));
        }
        Ok(valid)
    }

    pub async fn run(&self, request: &RestoreRequest) -> Result<RestoreReport> {
        let started = Instant::now();
        let options = request.options;

        info!(
            environment = %self.environment,
            bucket = %self.store.bucket(),
            backup_date = %request.backup_date,
            dry_run = request.dry_run,
            clear_existing_data = options.clear_existing_data,
            max_workers = options.max_workers,
            "Starting restore"
        );
        if options.clear_existing_data {
            warn!("clear_existing_data=true will delete all existing data before restore");
        }

        let tables = self.tables_to_restore(&request.tables)?;
        let backup_date = self.catalog.resolve_date(&request.backup_date).await?;
        let manifest = self.catalog.load_manifest(&backup_date).await?;
        let (exports, invalid) = select_exports(&manifest, &tables);

        let missing: Vec<&String> = tables.iter().filter(|t| !exports.contains_key(*t)).collect();
        if !missing.is_empty() {
            warn!(tables = ?missing, "No valid exports found for tables");
        }

        if request.dry_run {
            let mut validation_results = Vec::with_capacity(tables.len());
            for table_name in &tables {
                validation_results.push(match exports.get(table_name) {
                    Some(export) => self.validate(table_name, export, &options).await,
                    None => TableValidation::problem(
                        table_name,
                        ValidationStatus::NoExport,
                        "No valid export found for this table",
                    ),
                });
            }

            return Ok(RestoreReport::DryRun(DryRunSummary {
                dry_run: true,
                backup_date,
                environment: self.environment.clone(),
                restore_type: self.strategy.summary_type(),
                tables_requested: tables.len(),
                validation_results,
                configuration: options,
                warnings: self.strategy.dry_run_warnings(),
            }));
        }

        if exports.is_empty() {
            return Err(VaultError::NotFound(
                "No valid exports found for any requested tables".to_string(),
            ));
        }

        let mut results = Vec::with_capacity(tables.len());
        let mut restored = 0;
        for table_name in &tables {
            let Some(export) = exports.get(table_name) else {
                warn!(table = %table_name, "Skipping table without a valid export");
                results.push(RestoreResult::skipped(table_name, self.strategy.restore_type()));
                continue;
            };

            if restored > 0 {
                sleep(self.table_pause).await;
            }
            restored += 1;

            info!(table = %table_name, "Starting table restore");
            results.push(
                self.strategy
                    .restore(table_name, export, &backup_date, &options)
                    .await,
            );
        }

        let count = |status: RestoreStatus| results.iter().filter(|r| r.status == status).count();
        let summary = RestoreSummary {
            backup_date,
            environment: self.environment.clone(),
            restore_type: self.strategy.summary_type(),
            duration_seconds: started.elapsed().as_secs(),
            tables_requested: tables.len(),
            successful_restores: count(RestoreStatus::Completed),
            partial_restores: count(RestoreStatus::PartialSuccess),
            failed_restores: count(RestoreStatus::Failed),
            skipped_restores: count(RestoreStatus::Skipped),
            in_progress_restores: count(RestoreStatus::InProgress),
            total_items_written: results.iter().map(|r| r.items_written).sum(),
            total_items_processed: results.iter().map(|r| r.items_processed).sum(),
            configuration: options,
            warnings: invalid,
            restore_results: results,
            completed_at: Utc::now(),
        };

        info!(
            completed = summary.successful_restores,
            partial = summary.partial_restores,
            failed = summary.failed_restores,
            skipped = summary.skipped_restores,
            written = summary.total_items_written,
            processed = summary.total_items_processed,
            duration_seconds = summary.duration_seconds,
            "Restore completed"
        );

        Ok(RestoreReport::Restore(summary))
    }

    async fn validate(
        &self,
        table_name: &str,
        export: &ExportJob,
        options: &RestoreOptions,
    ) -> TableValidation {
        let data_files = match self.resolver.locate(&export.target_storage_prefix).await {
            Ok(files) => files,
            Err(e) => return TableValidation::problem(table_name, ValidationStatus::Error, e.to_string()),
        };

        let mut sampled_bytes = 0u64;
        for key in data_files.iter().take(DRY_RUN_SIZE_SAMPLE) {
            if let Ok(metadata) = self.store.head_object(key).await {
                sampled_bytes += metadata.size.max(0) as u64;
            }
        }

        TableValidation {
            table_name: table_name.to_string(),
            status: ValidationStatus::Ready,
            export_arn: Some(
                export
                    .job_handle
                    .clone()
                    .unwrap_or_else(|| "unknown".to_string()),
            ),
            expected_items: Some(export.item_count),
            data_files_count: Some(data_files.len()),
            estimated_size_mb: Some(bytes_to_mb(sampled_bytes)),
            restore_options: Some(*options),
            error: None,
        }
    }
}
