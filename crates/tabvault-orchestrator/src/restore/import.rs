//! Bulk-import restore into a new table

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use tabvault_common::{Result, VaultError};
use tracing::{error, info, warn};

use super::{BackupPolicyOutcome, RestoreOptions, RestoreResult, RestoreStatus, RestoreStrategy};
use crate::discovery::DataFileResolver;
use crate::export::ExportJob;
use crate::jobs::{self, JobStatus, PollSchedule, PollableJob};
use crate::table::{
    ImportCompression, ImportRequest, ImportStatusRecord, TableSchema, TableService,
};

pub const RESTORE_TYPE: &str = "BULK_IMPORT_FROM_S3";
pub const SUMMARY_TYPE: &str = "BULK_IMPORT_FROM_S3_TO_NEW_TABLES";

/// One table's import job
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImportJob {
    pub table_name: String,
    pub target_table_name: String,
    #[serde(rename = "import_arn", skip_serializing_if = "Option::is_none")]
    pub job_handle: Option<String>,
    #[serde(rename = "s3_key_prefix")]
    pub source_prefix: String,
    pub status: JobStatus,
    pub processed_item_count: u64,
    pub imported_item_count: u64,
    pub error_count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_message: Option<String>,
    pub timed_out: bool,
}

impl ImportJob {
    pub fn new(
        table_name: impl Into<String>,
        target_table_name: impl Into<String>,
        source_prefix: impl Into<String>,
    ) -> Self {
        Self {
            table_name: table_name.into(),
            target_table_name: target_table_name.into(),
            job_handle: None,
            source_prefix: source_prefix.into(),
            status: JobStatus::Starting,
            processed_item_count: 0,
            imported_item_count: 0,
            error_count: 0,
            start_time: None,
            end_time: None,
            failure_message: None,
            timed_out: false,
        }
    }

    fn apply(&mut self, record: ImportStatusRecord) {
        let count = |n: i64| n.max(0) as u64;
        if !record.import_arn.is_empty() {
            self.job_handle = Some(record.import_arn);
        }
        self.status = record.status;
        self.processed_item_count = count(record.processed_item_count);
        self.imported_item_count = count(record.imported_item_count);
        self.error_count = count(record.error_count);
        self.start_time = record.start_time.or(self.start_time);
        self.end_time = record.end_time.or(self.end_time);
        if record.failure_message.is_some() {
            self.failure_message = record.failure_message;
        }
    }
}

#[async_trait]
impl PollableJob for ImportJob {
    fn handle(&self) -> Option<&str> {
        self.job_handle.as_deref()
    }

    fn status(&self) -> JobStatus {
        self.status
    }

    fn mark_timed_out(&mut self) {
        self.timed_out = true;
    }

    async fn refresh(&mut self, tables: &dyn TableService) {
        let Some(handle) = self.job_handle.clone() else {
            return;
        };

        match tables.describe_import(&handle).await {
            Ok(record) => self.apply(record),
            Err(e) => {
                error!(import_arn = %handle, error = %e, "Failed to check import status");
                self.status = JobStatus::Unknown;
                self.failure_message = Some(e.to_string());
            },
        }
    }
}

/// Where the schema for a restored table comes from, tried in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaSource {
    /// Captured into the manifest when the export started
    Manifest,
    /// Described from the source table if it still exists
    LiveTable,
}

impl SchemaSource {
    pub const ORDERED: [SchemaSource; 2] = [SchemaSource::Manifest, SchemaSource::LiveTable];
}

/// Key prefix and compression a bulk import reads the data files with.
///
/// An import consumes everything under one prefix, so every data file must
/// sit in the same directory and share one compression type.
pub fn import_source(data_files: &[String]) -> Result<(String, ImportCompression)> {
    let directories: Vec<&str> = data_files
        .iter()
        .map(|key| key.rsplit_once('/').map_or("", |(directory, _)| directory))
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();

    let prefix = match directories.as_slice() {
        [] => return Err(VaultError::NotFound("No data files to import".to_string())),
        [""] => {
            return Err(VaultError::UnsupportedLayout(
                "data files have no common key prefix".to_string(),
            ))
        },
        [directory] => format!("{}/", directory),
        many => {
            return Err(VaultError::UnsupportedLayout(format!(
                "{} data files are spread over {} directories ({}); \
                 a bulk import reads a single key prefix",
                data_files.len(),
                many.len(),
                many.join(", ")
            )))
        },
    };

    let gzipped = data_files.iter().filter(|key| key.ends_with(".gz")).count();
    let compression = if gzipped == data_files.len() {
        ImportCompression::Gzip
    } else if gzipped == 0 {
        ImportCompression::None
    } else {
        return Err(VaultError::UnsupportedLayout(format!(
            "{} of {} data files under {} are gzipped; a bulk import needs one compression type",
            gzipped,
            data_files.len(),
            prefix
        )));
    };

    Ok((prefix, compression))
}

pub struct BulkImportRestore {
    tables: Arc<dyn TableService>,
    resolver: DataFileResolver,
    bucket: String,
    table_suffix: String,
    schedule: PollSchedule,
}

impl BulkImportRestore {
    pub fn new(
        tables: Arc<dyn TableService>,
        resolver: DataFileResolver,
        bucket: impl Into<String>,
        table_suffix: impl Into<String>,
    ) -> Self {
        Self {
            tables,
            resolver,
            bucket: bucket.into(),
            table_suffix: table_suffix.into(),
            schedule: PollSchedule::for_imports(),
        }
    }

    pub fn with_schedule(mut self, schedule: PollSchedule) -> Self {
        self.schedule = schedule;
        self
    }

    /// `<table><suffix>-<date>`
    pub fn target_table_name(&self, table_name: &str, backup_date: &str) -> String {
        format!("{}{}-{}", table_name, self.table_suffix, backup_date)
    }

    async fn resolve_schema(&self, table_name: &str, export: &ExportJob) -> Result<TableSchema> {
        for source in SchemaSource::ORDERED {
            match source {
                SchemaSource::Manifest => {
                    if let Some(schema) = &export.table_schema {
                        return Ok(schema.clone());
                    }
                },
                SchemaSource::LiveTable => match self.tables.describe_table(table_name).await {
                    Ok(description) => {
                        info!(table = %table_name, "Using live table schema for import");
                        return Ok(description.schema);
                    },
                    Err(e) => warn!(table = %table_name, error = %e, "Source table not describable"),
                },
            }
        }

        Err(VaultError::NotFound(format!(
            "No table schema available for {}",
            table_name
        )))
    }

    async fn apply_backup_policy(&self, target: &str) -> BackupPolicyOutcome {
        match self.tables.set_continuous_backups(target, true).await {
            Ok(()) => BackupPolicyOutcome::applied(),
            Err(e) => {
                warn!(table = %target, error = %e, "Failed to enable continuous backups");
                BackupPolicyOutcome::failed(e.to_string())
            },
        }
    }

    async fn start(
        &self,
        job: &mut ImportJob,
        schema: TableSchema,
        compression: ImportCompression,
    ) -> Result<()> {
        let request = ImportRequest {
            s3_bucket: self.bucket.clone(),
            s3_key_prefix: job.source_prefix.clone(),
            compression,
            target_table_name: job.target_table_name.clone(),
            schema,
        };
        let record = self.tables.start_import(&request).await?;
        job.apply(record);
        if !job.status.is_terminal() {
            job.status = JobStatus::InProgress;
        }
        info!(
            table = %job.table_name,
            target = %job.target_table_name,
            import_arn = job.job_handle.as_deref().unwrap_or_default(),
            "Import started"
        );
        Ok(())
    }
}

#[async_trait]
impl RestoreStrategy for BulkImportRestore {
    fn restore_type(&self) -> &'static str {
        RESTORE_TYPE
    }

    fn summary_type(&self) -> &'static str {
        SUMMARY_TYPE
    }

    fn dry_run_warnings(&self) -> Vec<String> {
        vec![
            format!(
                "Each table is imported into a new table named <table>{}-<date>",
                self.table_suffix
            ),
            "Existing tables are not modified".to_string(),
            "Continuous backups are an operational setting and are not restored from the backup"
                .to_string(),
        ]
    }

    async fn restore(
        &self,
        table_name: &str,
        export: &ExportJob,
        backup_date: &str,
        options: &RestoreOptions,
    ) -> RestoreResult {
        let target = self.target_table_name(table_name, backup_date);
        let mut result = RestoreResult::new(table_name, RESTORE_TYPE, export);
        result.target_table_name = Some(target.clone());

        let data_files = match self.resolver.locate(&export.target_storage_prefix).await {
            Ok(files) => files,
            Err(e) => return result.failed(e.to_string()),
        };
        result.total_files_processed = data_files.len();

        let (prefix, compression) = match import_source(&data_files) {
            Ok(source) => source,
            Err(e) => return result.failed(e.to_string()),
        };

        let schema = match self.resolve_schema(table_name, export).await {
            Ok(schema) => schema,
            Err(e) => return result.failed(e.to_string()),
        };

        let mut job = ImportJob::new(table_name, target.as_str(), prefix);
        if let Err(e) = self.start(&mut job, schema, compression).await {
            error!(table = %table_name, error = %e, "Failed to start import");
            return result.failed(e.to_string());
        }

        if options.wait_for_completion {
            job = jobs::monitor(vec![job], self.tables.as_ref(), self.schedule)
                .await
                .pop()
                .unwrap_or_else(|| ImportJob::new(table_name, target.as_str(), ""));
        }

        result.status = match job.status {
            JobStatus::Completed => RestoreStatus::Completed,
            JobStatus::Failed => RestoreStatus::Failed,
            _ => RestoreStatus::InProgress,
        };
        result.items_processed = job.processed_item_count as usize;
        result.items_written = job.imported_item_count as usize;
        result.items_failed = job.error_count as usize;
        result.refresh_success_rate();

        if job.timed_out {
            let timeout = VaultError::Timeout {
                handle: job.handle().unwrap_or_default().to_string(),
                waited_secs: self.schedule.deadline.as_secs(),
            };
            result.warning = Some(format!("{} (last status {})", timeout, job.status));
        }
        if result.status == RestoreStatus::Failed {
            result.error = job.failure_message.clone();
        }

        if result.status == RestoreStatus::Completed && options.enable_backup_policy {
            result.backup_policy = Some(self.apply_backup_policy(&target).await);
        }

        result.import_job = Some(job);
        result
    }
}
