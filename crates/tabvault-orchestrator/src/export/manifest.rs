//! Per-date export manifest
//!
//! Written once per backup date at `<exports-root>/<date>/manifest.json` and
//! read back by restore to find each table's export.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tabvault_common::Result;

use super::ExportJob;
use crate::jobs::JobStatus;

pub const BACKUP_TYPE: &str = "DYNAMODB_NATIVE_EXPORT";
pub const MANIFEST_FILE: &str = "manifest.json";

pub fn manifest_key(exports_root: &str, backup_date: &str) -> String {
    format!("{}/{}/{}", exports_root.trim_end_matches('/'), backup_date, MANIFEST_FILE)
}

fn default_backup_type() -> String {
    BACKUP_TYPE.to_string()
}

/// Summary of one backup date's export batch.
///
/// `successful_exports + failed_exports == total_exports`. Item and byte
/// totals are summed over COMPLETED entries only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    pub backup_date: String,
    #[serde(default)]
    pub environment: String,
    #[serde(default = "default_backup_type")]
    pub backup_type: String,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub total_exports: usize,
    #[serde(default)]
    pub successful_exports: usize,
    #[serde(default)]
    pub failed_exports: usize,
    #[serde(default)]
    pub total_items_exported: u64,
    #[serde(default)]
    pub total_size_bytes: u64,
    #[serde(default)]
    pub s3_bucket: String,
    pub exports: Vec<ExportJob>,
}

impl Manifest {
    pub fn from_jobs(
        backup_date: impl Into<String>,
        environment: impl Into<String>,
        s3_bucket: impl Into<String>,
        exports: Vec<ExportJob>,
    ) -> Self {
        let completed = || exports.iter().filter(|e| e.status == JobStatus::Completed);

        let total_exports = exports.len();
        let successful_exports = completed().count();

        Self {
            backup_date: backup_date.into(),
            environment: environment.into(),
            backup_type: BACKUP_TYPE.to_string(),
            created_at: Some(Utc::now()),
            total_exports,
            successful_exports,
            failed_exports: total_exports - successful_exports,
            total_items_exported: completed().map(|e| e.item_count).sum(),
            total_size_bytes: completed().map(|e| e.billed_size_bytes).sum(),
            s3_bucket: s3_bucket.into(),
            exports,
        }
    }

    /// Object metadata attached to the manifest put.
    pub fn object_metadata(&self) -> HashMap<String, String> {
        HashMap::from([
            ("backup_date".to_string(), self.backup_date.clone()),
            ("environment".to_string(), self.environment.clone()),
            ("backup_type".to_string(), self.backup_type.clone()),
            ("total_exports".to_string(), self.total_exports.to_string()),
            ("successful_exports".to_string(), self.successful_exports.to_string()),
        ])
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    pub fn export_for(&self, table_name: &str) -> Option<&ExportJob> {
        self.exports.iter().find(|e| e.table_name == table_name)
    }
}
