//! Backup catalog: dated backups and their manifests in the primary store

use regex::Regex;
use serde_json::Value as Json;
use std::collections::HashMap;
use std::sync::Arc;
use tabvault_common::{Result, VaultError};
use tracing::{error, info, warn};

use crate::export::{manifest_key, ExportJob, Manifest};
use crate::jobs::JobStatus;
use crate::storage::{ListRequest, ObjectStore};

/// Selector resolving to the newest backup date
pub const LATEST: &str = "latest";

/// Keys logged when no dated prefix is found
const SAMPLE_LISTING_KEYS: i32 = 10;

/// Backup dates are `YYYY-MM-DD` path components
const DATE_PATTERN: &str = r"^\d{4}-\d{2}-\d{2}$";

fn date_pattern() -> Result<Regex> {
    Regex::new(DATE_PATTERN).map_err(|e| VaultError::Decode(format!("invalid date pattern: {}", e)))
}

/// Check that a manifest entry can drive a restore. The error text names
/// the first problem found.
pub fn validate_export(export: &ExportJob) -> std::result::Result<(), String> {
    if export.table_name.trim().is_empty() {
        return Err("Export info field 'table_name' is empty".to_string());
    }
    if export.target_storage_prefix.trim().is_empty() {
        return Err("Export info field 's3_prefix' is empty".to_string());
    }
    if export.status != JobStatus::Completed {
        return Err(format!(
            "Export status is '{}', expected 'COMPLETED'",
            export.status
        ));
    }
    Ok(())
}

/// Valid exports for the requested tables, keyed by table name, plus one
/// warning per invalid manifest entry.
pub fn select_exports(
    manifest: &Manifest,
    tables: &[String],
) -> (HashMap<String, ExportJob>, Vec<String>) {
    let mut available = HashMap::new();
    let mut invalid = Vec::new();

    for export in &manifest.exports {
        match validate_export(export) {
            Ok(()) if tables.contains(&export.table_name) => {
                available.insert(export.table_name.clone(), export.clone());
            },
            Ok(()) => {},
            Err(reason) => {
                let table = if export.table_name.is_empty() {
                    "unknown"
                } else {
                    export.table_name.as_str()
                };
                invalid.push(format!("{}: {}", table, reason));
            },
        }
    }

    if !invalid.is_empty() {
        warn!(invalid = ?invalid, "Invalid exports found in manifest");
    }

    (available, invalid)
}

#[derive(Clone)]
pub struct BackupCatalog {
    store: Arc<dyn ObjectStore>,
    exports_root: String,
}

impl BackupCatalog {
    pub fn new(store: Arc<dyn ObjectStore>, exports_root: impl Into<String>) -> Self {
        Self {
            store,
            exports_root: exports_root.into().trim_end_matches('/').to_string(),
        }
    }

    /// Backup dates under the exports root, newest first.
    pub async fn list_backup_dates(&self) -> Result<Vec<String>> {
        let root = format!("{}/", self.exports_root);
        info!(bucket = %self.store.bucket(), prefix = %root, "Scanning for backups");

        let date_pattern = date_pattern()?;
        let mut request = ListRequest::delimited(root.as_str());
        let mut dates = Vec::new();
        loop {
            let page = self.store.list_objects(&request).await?;
            dates.extend(page.common_prefixes.iter().filter_map(|prefix| {
                let name = prefix.trim_end_matches('/').rsplit('/').next()?;
                date_pattern.is_match(name).then(|| name.to_string())
            }));
            match page.next_continuation_token {
                Some(token) => request.continuation_token = Some(token),
                None => break,
            }
        }

        if dates.is_empty() {
            warn!("No backup dates found in expected format (YYYY-MM-DD)");
            let sample = ListRequest::prefix(root.as_str()).with_max_keys(SAMPLE_LISTING_KEYS);
            if let Ok(page) = self.store.list_objects(&sample).await {
                for object in page.objects {
                    info!(key = %object.key, "Object under exports root");
                }
            }
        }

        dates.sort_unstable_by(|a, b| b.cmp(a));
        info!(count = dates.len(), newest = ?dates.iter().take(5).collect::<Vec<_>>(), "Found backup dates");
        Ok(dates)
    }

    /// Resolve `"latest"` to the newest date; any other value is returned
    /// as given.
    pub async fn resolve_date(&self, requested: &str) -> Result<String> {
        if requested != LATEST {
            return Ok(requested.to_string());
        }

        let newest = self
            .list_backup_dates()
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| VaultError::NotFound("No backups found in storage".to_string()))?;

        info!(backup_date = %newest, "Using latest backup");
        Ok(newest)
    }

    /// Load and validate the manifest for `backup_date`. Missing or
    /// malformed manifests are [`VaultError::NotFound`].
    pub async fn load_manifest(&self, backup_date: &str) -> Result<Manifest> {
        let key = manifest_key(&self.exports_root, backup_date);
        info!(bucket = %self.store.bucket(), key = %key, "Fetching manifest");

        let body = self.store.get_object(&key).await.map_err(|e| {
            error!(key = %key, error = %e, "Manifest not available");
            match e {
                VaultError::NotFound(_) => VaultError::NotFound(format!(
                    "Could not find backup manifest for {}",
                    backup_date
                )),
                other => other,
            }
        })?;

        let manifest = parse_manifest(&body).map_err(|reason| {
            error!(key = %key, reason = %reason, "Invalid manifest");
            VaultError::NotFound(format!(
                "Could not parse backup manifest for {}: {}",
                backup_date, reason
            ))
        })?;

        info!(exports = manifest.exports.len(), "Found valid manifest");
        Ok(manifest)
    }
}

fn parse_manifest(body: &[u8]) -> std::result::Result<Manifest, String> {
    let raw: Json = serde_json::from_slice(body).map_err(|e| format!("invalid JSON: {}", e))?;

    let object = raw
        .as_object()
        .ok_or_else(|| "Manifest is not a valid JSON object".to_string())?;
    match object.get("exports") {
        None => return Err("Manifest missing 'exports' field".to_string()),
        Some(exports) if !exports.is_array() => {
            return Err("Manifest 'exports' field is not a list".to_string())
        },
        Some(_) => {},
    }

    serde_json::from_value(raw).map_err(|e| e.to_string())
}
