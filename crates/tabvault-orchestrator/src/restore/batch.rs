//! Batch-write restore into an existing table

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tabvault_common::{Result, VaultError};
use tokio::time::sleep;
use tracing::{info, warn};

use super::{FailedFile, RestoreOptions, RestoreResult, RestoreStatus, RestoreStrategy};
use crate::datafile::read_data_file;
use crate::discovery::DataFileResolver;
use crate::export::ExportJob;
use crate::storage::ObjectStore;
use crate::table::TableService;
use crate::writer::{BatchWriter, WriteTotals, DEFAULT_DELETE_WORKERS};

pub const RESTORE_TYPE: &str = "BATCH_WRITE_FROM_S3";
pub const SUMMARY_TYPE: &str = "BATCH_WRITE_FROM_S3_TO_EXISTING_TABLES";

/// Pause between data files of one table
pub const DEFAULT_FILE_PAUSE: Duration = Duration::from_secs(1);

pub struct BatchWriteRestore {
    tables: Arc<dyn TableService>,
    store: Arc<dyn ObjectStore>,
    resolver: DataFileResolver,
    writer: BatchWriter,
    file_pause: Duration,
}

impl BatchWriteRestore {
    pub fn new(
        tables: Arc<dyn TableService>,
        store: Arc<dyn ObjectStore>,
        resolver: DataFileResolver,
    ) -> Self {
        Self {
            writer: BatchWriter::new(tables.clone()),
            tables,
            store,
            resolver,
            file_pause: DEFAULT_FILE_PAUSE,
        }
    }

    pub fn with_writer(mut self, writer: BatchWriter) -> Self {
        self.writer = writer;
        self
    }

    pub fn with_file_pause(mut self, pause: Duration) -> Self {
        self.file_pause = pause;
        self
    }

    /// Delete every item in `table_name`. Returns the number deleted.
    pub async fn clear_table(&self, table_name: &str) -> Result<usize> {
        warn!(table = %table_name, "Clearing all data from table");

        let schema = self.tables.describe_table(table_name).await?.schema;
        if schema.partition_key().is_none() {
            return Err(VaultError::NotFound(format!(
                "No partition key in the key schema of {}",
                table_name
            )));
        }
        info!(
            table = %table_name,
            partition_key = schema.partition_key().unwrap_or_default(),
            sort_key = schema.sort_key().unwrap_or_default(),
            "Table key schema"
        );

        let mut deleted = WriteTotals::default();
        let mut start_key = None;
        loop {
            let page = self.tables.scan(table_name, start_key.take()).await?;
            let keys: Vec<_> = page.items.iter().filter_map(|item| schema.key_of(item)).collect();

            if !keys.is_empty() {
                let totals = self
                    .writer
                    .delete_all(table_name, keys, DEFAULT_DELETE_WORKERS)
                    .await;
                if totals.items_failed > 0 {
                    warn!(table = %table_name, failed = totals.items_failed, "Some deletes failed");
                }
                deleted.merge(&totals);
                info!(table = %table_name, deleted = deleted.items_written, "Deletion progress");
            }

            match page.last_evaluated_key {
                Some(key) => start_key = Some(key),
                None => break,
            }
        }

        info!(table = %table_name, deleted = deleted.items_written, "Cleared table");
        Ok(deleted.items_written)
    }
}

#[async_trait]
impl RestoreStrategy for BatchWriteRestore {
    fn restore_type(&self) -> &'static str {
        RESTORE_TYPE
    }

    fn summary_type(&self) -> &'static str {
        SUMMARY_TYPE
    }

    fn dry_run_warnings(&self) -> Vec<String> {
        vec![
            "This approach writes directly to existing tables with the same names".to_string(),
            "Set clear_existing_data=true to clear existing data first".to_string(),
            "Restore will merge with existing data if clear_existing_data=false".to_string(),
        ]
    }

    async fn restore(
        &self,
        table_name: &str,
        export: &ExportJob,
        _backup_date: &str,
        options: &RestoreOptions,
    ) -> RestoreResult {
        info!(table = %table_name, "Starting batch write restore");
        let mut result = RestoreResult::new(table_name, RESTORE_TYPE, export);

        if options.clear_existing_data {
            match self.clear_table(table_name).await {
                Ok(cleared) => result.items_cleared = cleared,
                Err(e) => {
                    return result.failed(format!("Failed to clear existing table data: {}", e))
                },
            }
        }

        let data_files = match self.resolver.locate(&export.target_storage_prefix).await {
            Ok(files) => files,
            Err(e) => return result.failed(e.to_string()),
        };

        let mut totals = WriteTotals::default();
        for (index, key) in data_files.iter().enumerate() {
            info!(table = %table_name, file = %key, "Processing file {}/{}", index + 1, data_files.len());

            match read_data_file(self.store.as_ref(), key).await {
                Ok(parsed) => {
                    result.total_files_processed += 1;
                    result.records_skipped += parsed.decode_errors;
                    if parsed.items.is_empty() {
                        warn!(file = %key, "No items found in data file");
                    } else {
                        let written = self
                            .writer
                            .write_all(table_name, parsed.items, options.max_workers)
                            .await;
                        totals.merge(&written);
                    }
                },
                Err(e) => {
                    warn!(file = %key, error = %e, "Error reading data file");
                    result.failed_files.push(FailedFile {
                        key: key.clone(),
                        error: e.to_string(),
                    });
                },
            }

            if index + 1 < data_files.len() {
                sleep(self.file_pause).await;
            }
        }

        result.items_processed = totals.items_processed;
        result.items_written = totals.items_written;
        result.items_failed = totals.items_failed;
        result.refresh_success_rate();

        let mut problems = Vec::new();
        if totals.items_failed > 0 {
            problems.push(format!("{} items failed to write", totals.items_failed));
        }
        if !result.failed_files.is_empty() {
            problems.push(format!(
                "{} of {} data files could not be read",
                result.failed_files.len(),
                data_files.len()
            ));
        }
        if result.records_skipped > 0 {
            problems.push(format!("{} records could not be decoded", result.records_skipped));
        }

        result.status = if problems.is_empty() {
            RestoreStatus::Completed
        } else if totals.items_written > 0 {
            RestoreStatus::PartialSuccess
        } else {
            RestoreStatus::Failed
        };
        if !problems.is_empty() {
            result.warning = Some(problems.join("; "));
        }

        info!(
            table = %table_name,
            written = totals.items_written,
            processed = totals.items_processed,
            success_rate = %result.success_rate,
            "Batch write restore completed"
        );
        result
    }
}
