//! Offsite mirror of a backup date
//!
//! Copies every object under `<exports-root>/<date>/` from the primary store
//! to `<environment>/<same key>` in a second provider, verifying each copy by
//! SHA-256, then records the outcome in `copy-manifest.json` beside them.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tabvault_common::checksum::{sha256_hex, verify_sha256};
use tabvault_common::Result;
use tracing::{error, info, warn};

use crate::storage::{ObjectStore, ObjectSummary};

pub const COPY_MANIFEST_FILE: &str = "copy-manifest.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CopyStatus {
    Success,
    PartialSuccess,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CopiedObject {
    pub source_key: String,
    pub destination_key: String,
    pub size_bytes: u64,
    pub sha256: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CopyOutcome {
    pub status: CopyStatus,
    pub backup_date: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub destination_bucket: Option<String>,
    pub files_copied: usize,
    pub total_size_bytes: u64,
    pub errors: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub objects: Vec<CopiedObject>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub copy_manifest_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub completed_at: DateTime<Utc>,
}

impl CopyOutcome {
    pub fn skipped(backup_date: &str, reason: impl Into<String>) -> Self {
        Self {
            status: CopyStatus::Skipped,
            backup_date: backup_date.to_string(),
            destination_bucket: None,
            files_copied: 0,
            total_size_bytes: 0,
            errors: Vec::new(),
            objects: Vec::new(),
            copy_manifest_key: None,
            reason: Some(reason.into()),
            completed_at: Utc::now(),
        }
    }
}

pub struct OffsiteMirror {
    source: Arc<dyn ObjectStore>,
    destination: Arc<dyn ObjectStore>,
    environment: String,
    exports_root: String,
}

impl OffsiteMirror {
    pub fn new(
        source: Arc<dyn ObjectStore>,
        destination: Arc<dyn ObjectStore>,
        environment: impl Into<String>,
        exports_root: impl Into<String>,
    ) -> Self {
        Self {
            source,
            destination,
            environment: environment.into(),
            exports_root: exports_root.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn destination_key(&self, source_key: &str) -> String {
        format!("{}/{}", self.environment, source_key)
    }

    pub fn copy_manifest_key(&self, backup_date: &str) -> String {
        self.destination_key(&format!(
            "{}/{}/{}",
            self.exports_root, backup_date, COPY_MANIFEST_FILE
        ))
    }

    /// Copy one backup date. Per-object failures are collected, never
    /// returned.
    pub async fn mirror(&self, backup_date: &str) -> CopyOutcome {
        let prefix = format!("{}/{}/", self.exports_root, backup_date);
        info!(
            source = %self.source.bucket(),
            destination = %self.destination.bucket(),
            prefix = %prefix,
            "Starting offsite copy"
        );

        let objects = match self.source.list_all_objects(&prefix).await {
            Ok(objects) => objects,
            Err(e) => {
                error!(prefix = %prefix, error = %e, "Failed to list backup objects");
                let mut outcome = CopyOutcome::skipped(backup_date, "listing failed");
                outcome.status = CopyStatus::Failed;
                outcome.errors.push(e.to_string());
                return outcome;
            },
        };

        if objects.is_empty() {
            warn!(prefix = %prefix, "Nothing to copy offsite");
            return CopyOutcome::skipped(backup_date, format!("no objects under {}", prefix));
        }

        let mut copied = Vec::with_capacity(objects.len());
        let mut errors = Vec::new();
        for object in &objects {
            match self.copy_object(object).await {
                Ok(entry) => copied.push(entry),
                Err(e) => {
                    warn!(key = %object.key, error = %e, "Offsite copy failed");
                    errors.push(format!("{}: {}", object.key, e));
                },
            }
        }

        let status = if errors.is_empty() {
            CopyStatus::Success
        } else if !copied.is_empty() {
            CopyStatus::PartialSuccess
        } else {
            CopyStatus::Failed
        };

        let mut outcome = CopyOutcome {
            status,
            backup_date: backup_date.to_string(),
            destination_bucket: Some(self.destination.bucket().to_string()),
            files_copied: copied.len(),
            total_size_bytes: copied.iter().map(|c| c.size_bytes).sum(),
            errors,
            objects: copied,
            copy_manifest_key: None,
            reason: None,
            completed_at: Utc::now(),
        };

        let manifest_key = self.copy_manifest_key(backup_date);
        match self.write_copy_manifest(&manifest_key, &outcome).await {
            Ok(()) => outcome.copy_manifest_key = Some(manifest_key),
            Err(e) => {
                error!(key = %manifest_key, error = %e, "Failed to write copy manifest");
                outcome.errors.push(format!("{}: {}", manifest_key, e));
            },
        }

        info!(
            status = ?outcome.status,
            files = outcome.files_copied,
            bytes = outcome.total_size_bytes,
            "Offsite copy finished"
        );
        outcome
    }

    async fn copy_object(&self, object: &ObjectSummary) -> Result<CopiedObject> {
        let data = self.source.get_object(&object.key).await?;
        let sha256 = sha256_hex(&data);
        let size_bytes = data.len() as u64;
        let destination_key = self.destination_key(&object.key);

        let metadata = HashMap::from([
            ("sha256".to_string(), sha256.clone()),
            ("source-bucket".to_string(), self.source.bucket().to_string()),
        ]);
        self.destination
            .put_object(&destination_key, data, None, &metadata)
            .await?;

        let stored = self.destination.get_object(&destination_key).await?;
        verify_sha256(&stored, &sha256)?;

        Ok(CopiedObject {
            source_key: object.key.clone(),
            destination_key,
            size_bytes,
            sha256,
        })
    }

    async fn write_copy_manifest(&self, key: &str, outcome: &CopyOutcome) -> Result<()> {
        let body = serde_json::to_vec_pretty(outcome)?;
        self.destination
            .put_object(key, body, Some("application/json"), &HashMap::new())
            .await
    }
}
