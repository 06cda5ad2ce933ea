//! Export lifecycle: start, monitor, manifest
//!
//! A backup run starts one point-in-time export per table, polls the
//! started ones to a bounded deadline and writes a [`Manifest`] summarising
//! the batch. Per-table failures become FAILED entries; nothing here aborts
//! the batch.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::jobs::{self, JobStatus, PollSchedule, PollableJob};
use crate::storage::ObjectStore;
use crate::table::{AccountContext, ExportRequest, ExportStatusRecord, TableSchema, TableService};

pub mod manifest;

pub use manifest::{manifest_key, Manifest, BACKUP_TYPE};

const CONTENT_TYPE_JSON: &str = "application/json";

/// One table's export, as tracked during a run and stored in the manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportJob {
    #[serde(default)]
    pub table_name: String,
    #[serde(rename = "export_arn", default, skip_serializing_if = "Option::is_none")]
    pub job_handle: Option<String>,
    #[serde(rename = "s3_prefix", default)]
    pub target_storage_prefix: String,
    #[serde(default)]
    pub status: JobStatus,
    #[serde(default)]
    pub item_count: u64,
    #[serde(default)]
    pub billed_size_bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub export_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_message: Option<String>,
    #[serde(default)]
    pub timed_out: bool,
    /// Shape of the source table when the export started
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table_schema: Option<TableSchema>,
}

impl ExportJob {
    pub fn new(table_name: impl Into<String>, prefix: impl Into<String>) -> Self {
        Self {
            table_name: table_name.into(),
            job_handle: None,
            target_storage_prefix: prefix.into(),
            status: JobStatus::Starting,
            item_count: 0,
            billed_size_bytes: 0,
            export_time: None,
            start_time: None,
            end_time: None,
            failure_message: None,
            timed_out: false,
            table_schema: None,
        }
    }

    fn failed(mut self, message: impl Into<String>) -> Self {
        self.status = JobStatus::Failed;
        self.failure_message = Some(message.into());
        self
    }

    fn apply(&mut self, record: ExportStatusRecord) {
        self.job_handle = Some(record.export_arn);
        self.status = record.status;
        self.item_count = record.item_count.unwrap_or(0).max(0) as u64;
        self.billed_size_bytes = record.billed_size_bytes.unwrap_or(0).max(0) as u64;
        self.export_time = record.export_time.or(self.export_time);
        self.start_time = record.start_time.or(self.start_time);
        self.end_time = record.end_time.or(self.end_time);
        if record.failure_message.is_some() {
            self.failure_message = record.failure_message;
        }
    }

    pub fn is_completed(&self) -> bool {
        self.status == JobStatus::Completed
    }
}

#[async_trait]
impl PollableJob for ExportJob {
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

        match tables.describe_export(&handle).await {
            Ok(record) => self.apply(record),
            Err(e) => {
                error!(export_arn = %handle, error = %e, "Failed to check export status");
                self.status = JobStatus::Unknown;
                self.failure_message = Some(e.to_string());
            },
        }
    }
}

/// Result of a backup run
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BackupSummary {
    pub backup_date: String,
    pub environment: String,
    pub backup_type: String,
    pub total_tables_processed: usize,
    pub successful_exports: usize,
    pub failed_exports: usize,
    pub total_items_exported: u64,
    pub total_size_mb: f64,
    pub manifest_s3_key: Option<String>,
    pub s3_bucket: String,
    pub export_results: Vec<ExportJob>,
}

impl BackupSummary {
    pub fn from_manifest(manifest: &Manifest, manifest_s3_key: Option<String>) -> Self {
        Self {
            backup_date: manifest.backup_date.clone(),
            environment: manifest.environment.clone(),
            backup_type: manifest.backup_type.clone(),
            total_tables_processed: manifest.total_exports,
            successful_exports: manifest.successful_exports,
            failed_exports: manifest.failed_exports,
            total_items_exported: manifest.total_items_exported,
            total_size_mb: bytes_to_mb(manifest.total_size_bytes),
            manifest_s3_key,
            s3_bucket: manifest.s3_bucket.clone(),
            export_results: manifest.exports.clone(),
        }
    }

    /// 200 all exports completed, 202 the rest only timed out, 500 none
    /// completed, 207 otherwise.
    pub fn status_code(&self) -> u16 {
        if self.failed_exports == 0 {
            200
        } else if self
            .export_results
            .iter()
            .all(|e| e.is_completed() || e.timed_out)
        {
            202
        } else if self.successful_exports == 0 {
            500
        } else {
            207
        }
    }
}

/// Megabytes rounded to two decimals
pub fn bytes_to_mb(bytes: u64) -> f64 {
    (bytes as f64 / (1024.0 * 1024.0) * 100.0).round() / 100.0
}

pub struct ExportManager {
    tables: Arc<dyn TableService>,
    store: Arc<dyn ObjectStore>,
    account: AccountContext,
    exports_root: String,
    environment: String,
    schedule: PollSchedule,
}

impl ExportManager {
    pub fn new(
        tables: Arc<dyn TableService>,
        store: Arc<dyn ObjectStore>,
        account: AccountContext,
        exports_root: impl Into<String>,
        environment: impl Into<String>,
    ) -> Self {
        Self {
            tables,
            store,
            account,
            exports_root: exports_root.into(),
            environment: environment.into(),
            schedule: PollSchedule::for_exports(),
        }
    }

    pub fn with_schedule(mut self, schedule: PollSchedule) -> Self {
        self.schedule = schedule;
        self
    }

    /// `<exports-root>/<date>/<table>/`
    pub fn export_prefix(&self, backup_date: &str, table_name: &str) -> String {
        format!(
            "{}/{}/{}/",
            self.exports_root.trim_end_matches('/'),
            backup_date,
            table_name
        )
    }

    /// Start one table's export. Failures are returned as a FAILED job
    /// without a handle.
    pub async fn start_export(&self, table_name: &str, backup_date: &str) -> ExportJob {
        let job = ExportJob::new(table_name, self.export_prefix(backup_date, table_name));

        info!(table = %table_name, "Checking table exists");
        let description = match self.tables.describe_table(table_name).await {
            Ok(description) => description,
            Err(e) if e.is_not_found() => {
                let message = format!("Table {} not found", table_name);
                error!(table = %table_name, "{}", message);
                return job.failed(message);
            },
            Err(e) => {
                error!(table = %table_name, error = %e, "Failed to describe table");
                return job.failed(e.to_string());
            },
        };

        let request = ExportRequest {
            table_arn: description
                .table_arn
                .clone()
                .unwrap_or_else(|| self.account.table_arn(table_name)),
            s3_bucket: self.store.bucket().to_string(),
            s3_prefix: job.target_storage_prefix.clone(),
        };

        let mut job = ExportJob {
            table_schema: Some(description.schema),
            ..job
        };

        match self.tables.start_export(&request).await {
            Ok(record) => {
                job.apply(record);
                if !job.status.is_terminal() {
                    job.status = JobStatus::InProgress;
                }
                info!(
                    table = %table_name,
                    export_arn = job.job_handle.as_deref().unwrap_or_default(),
                    "Export started"
                );
                job
            },
            Err(e) => {
                error!(table = %table_name, error = %e, "Failed to start export");
                job.failed(e.to_string())
            },
        }
    }

    pub async fn monitor(&self, jobs: Vec<ExportJob>) -> Vec<ExportJob> {
        if jobs.iter().all(|j| j.job_handle.is_none()) {
            return jobs;
        }
        jobs::monitor(jobs, self.tables.as_ref(), self.schedule).await
    }

    /// Aggregate `jobs` and persist the manifest. A failed write is logged
    /// and yields `None` for the key.
    pub async fn build_manifest(
        &self,
        backup_date: &str,
        jobs: Vec<ExportJob>,
    ) -> (Manifest, Option<String>) {
        let manifest = Manifest::from_jobs(
            backup_date,
            self.environment.as_str(),
            self.store.bucket(),
            jobs,
        );
        let key = manifest_key(&self.exports_root, backup_date);

        let body = match manifest.to_json() {
            Ok(body) => body,
            Err(e) => {
                error!(error = %e, "Failed to serialize export manifest");
                return (manifest, None);
            },
        };

        match self
            .store
            .put_object(&key, body, Some(CONTENT_TYPE_JSON), &manifest.object_metadata())
            .await
        {
            Ok(()) => {
                info!(bucket = %self.store.bucket(), key = %key, "Export manifest created");
                (manifest, Some(key))
            },
            Err(e) => {
                error!(key = %key, error = %e, "Failed to create export manifest");
                (manifest, None)
            },
        }
    }

    /// Export every table in `table_names` for `backup_date`.
    pub async fn run(&self, table_names: &[String], backup_date: &str) -> (Manifest, Option<String>) {
        info!(
            tables = table_names.len(),
            backup_date = %backup_date,
            environment = %self.environment,
            "Starting exports"
        );

        let mut jobs = Vec::with_capacity(table_names.len());
        for table_name in table_names {
            jobs.push(self.start_export(table_name, backup_date).await);
        }

        let jobs = self.monitor(jobs).await;
        let (manifest, key) = self.build_manifest(backup_date, jobs).await;

        if manifest.failed_exports > 0 {
            warn!(
                successful = manifest.successful_exports,
                failed = manifest.failed_exports,
                "Backup completed with failures"
            );
        } else {
            info!(successful = manifest.successful_exports, "Backup completed");
        }

        (manifest, key)
    }
}
