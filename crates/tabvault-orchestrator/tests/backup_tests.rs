//! Backup run tests against in-memory table and object-store fakes
//!
//! Time is paused, so export polling advances instantly while the monitor
//! still observes its interval and deadline.

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use common::{account, config, items, FakeObjectStore, FakeTables, BUCKET, ENVIRONMENT};
use std::sync::Arc;
use std::time::Duration;
use tabvault_common::checksum::sha256_hex;
use tabvault_orchestrator::{
    backups::BackupCatalog,
    export::{BackupSummary, ExportManager},
    handler::Orchestrator,
    jobs::{JobStatus, PollSchedule},
    offsite::COPY_MANIFEST_FILE,
};
use tokio::time::Instant;

const DATE: &str = "2025-01-15";

fn fixtures() -> (Arc<FakeObjectStore>, Arc<FakeTables>) {
    let store = Arc::new(FakeObjectStore::new(BUCKET));
    let tables = Arc::new(FakeTables::new(store.clone()));
    (store, tables)
}

// ============================================================================
// Export manifest
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_backup_with_missing_table_is_partial() {
    let (store, tables) = fixtures();
    tables.seed("users", items(0..500));
    tables.seed("orders", items(0..1200));

    let orchestrator = Orchestrator::new(
        config(&["users", "orders", "ghost"]),
        tables.clone(),
        store.clone(),
        account(),
    );
    let response = orchestrator.run_backup(Some(DATE.to_string())).await;

    assert_eq!(response.status_code, 207);
    let body = &response.body;
    assert_eq!(body["total_tables_processed"], 3);
    assert_eq!(body["successful_exports"], 2);
    assert_eq!(body["failed_exports"], 1);
    assert_eq!(body["total_items_exported"], 1700);
    assert_eq!(body["manifest_s3_key"], "exports/2025-01-15/manifest.json");
    assert_eq!(body["offsite_copy"]["status"], "SKIPPED");

    let ghost = body["export_results"]
        .as_array()
        .unwrap()
        .iter()
        .find(|e| e["table_name"] == "ghost")
        .unwrap();
    assert_eq!(ghost["status"], "FAILED");
    assert_eq!(ghost["failure_message"], "Table ghost not found");
    assert!(ghost.get("export_arn").is_none());

    let stored = store.get("exports/2025-01-15/manifest.json").unwrap();
    assert_eq!(stored.content_type.as_deref(), Some("application/json"));

    let manifest = BackupCatalog::new(store.clone(), "exports")
        .load_manifest(DATE)
        .await
        .unwrap();
    assert_eq!(manifest.total_exports, 3);
    assert_eq!(manifest.successful_exports, 2);
    assert_eq!(manifest.failed_exports, 1);
    assert_eq!(manifest.total_items_exported, 1700);
    assert_eq!(manifest.total_size_bytes, 170_000);
    assert_eq!(manifest.environment, ENVIRONMENT);

    let users = manifest.export_for("users").unwrap();
    assert_eq!(users.status, JobStatus::Completed);
    assert!(users.table_schema.is_some());
    assert!(users.target_storage_prefix.starts_with("exports/2025-01-15/users"));
}

#[tokio::test(start_paused = true)]
async fn test_backup_all_completed_is_ok() {
    let (store, tables) = fixtures();
    tables.seed("users", items(0..10));

    let response = Orchestrator::new(config(&["users"]), tables, store.clone(), account())
        .run_backup(Some(DATE.to_string()))
        .await;

    assert_eq!(response.status_code, 200);
    assert_eq!(response.body["failed_exports"], 0);

    let data_files: Vec<String> = store
        .keys()
        .into_iter()
        .filter(|k| k.ends_with(".json.gz"))
        .collect();
    assert_eq!(data_files.len(), 2);
    assert!(data_files.iter().all(|k| k.contains("/AWSDynamoDB/") && k.contains("/data/")));
}

#[tokio::test(start_paused = true)]
async fn test_backup_with_no_tables_found_is_server_error() {
    let (store, tables) = fixtures();

    let response = Orchestrator::new(config(&["ghost"]), tables, store, account())
        .run_backup(Some(DATE.to_string()))
        .await;

    assert_eq!(response.status_code, 500);
    assert_eq!(response.body["successful_exports"], 0);
    assert_eq!(response.body["offsite_copy"]["reason"], "no successful exports");
}

// ============================================================================
// Monitoring deadline
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_monitor_stops_at_deadline() {
    let (store, tables) = fixtures();
    tables.seed("users", items(0..5));
    tables.seed("orders", items(0..5));
    tables.script_export("users", vec![JobStatus::InProgress]);
    tables.script_export("orders", vec![JobStatus::InProgress]);

    let schedule = PollSchedule::new(Duration::from_secs(30), Duration::from_secs(120));
    let manager = ExportManager::new(tables.clone(), store.clone(), account(), "exports", ENVIRONMENT)
        .with_schedule(schedule);

    let started = Instant::now();
    let (manifest, key) = manager
        .run(&["users".to_string(), "orders".to_string()], DATE)
        .await;
    let elapsed = started.elapsed();

    assert!(elapsed >= schedule.deadline);
    assert!(elapsed <= schedule.deadline + schedule.interval);
    assert!(key.is_some());
    assert!(manifest.exports.iter().all(|e| e.timed_out));
    assert!(manifest.exports.iter().all(|e| e.status == JobStatus::InProgress));
    assert_eq!(manifest.successful_exports, 0);

    // Nothing failed outright; the run only stopped waiting.
    assert_eq!(BackupSummary::from_manifest(&manifest, key).status_code(), 202);
}

#[tokio::test(start_paused = true)]
async fn test_failed_export_is_not_polled_past_terminal() {
    let (store, tables) = fixtures();
    tables.seed("users", items(0..5));
    tables.seed("orders", items(0..5));
    tables.script_export("orders", vec![JobStatus::Failed, JobStatus::Completed]);

    let manager = ExportManager::new(tables, store, account(), "exports", ENVIRONMENT);
    let (manifest, _) = manager
        .run(&["users".to_string(), "orders".to_string()], DATE)
        .await;

    let orders = manifest.export_for("orders").unwrap();
    assert_eq!(orders.status, JobStatus::Failed);
    assert!(!orders.timed_out);
    assert_eq!(manifest.successful_exports, 1);
    assert_eq!(manifest.total_items_exported, 5);
}

// ============================================================================
// Offsite mirror
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_backup_mirrors_date_offsite() {
    let (store, tables) = fixtures();
    tables.seed("users", items(0..40));
    let offsite = Arc::new(FakeObjectStore::new("mirror"));

    let response = Orchestrator::new(config(&["users"]), tables, store.clone(), account())
        .with_offsite(offsite.clone())
        .run_backup(Some(DATE.to_string()))
        .await;

    assert_eq!(response.status_code, 200);
    let copy = &response.body["offsite_copy"];
    assert_eq!(copy["status"], "SUCCESS");
    assert_eq!(copy["destination_bucket"], "mirror");

    let source_keys = store.keys();
    assert_eq!(copy["files_copied"], source_keys.len());

    for key in &source_keys {
        let copied = offsite
            .get(&format!("{}/{}", ENVIRONMENT, key))
            .unwrap_or_else(|| panic!("{} was not mirrored", key));
        let original = store.get(key).unwrap();
        assert_eq!(copied.data, original.data);
        assert_eq!(copied.metadata.get("sha256"), Some(&sha256_hex(&original.data)));
    }

    let copy_manifest_key = format!("{}/exports/{}/{}", ENVIRONMENT, DATE, COPY_MANIFEST_FILE);
    assert_eq!(copy["copy_manifest_key"], copy_manifest_key.as_str());
    let copy_manifest: serde_json::Value =
        serde_json::from_slice(&offsite.get(&copy_manifest_key).unwrap().data).unwrap();
    assert_eq!(copy_manifest["status"], "SUCCESS");
    assert_eq!(copy_manifest["backup_date"], DATE);
}

#[tokio::test(start_paused = true)]
async fn test_offsite_skipped_when_disabled() {
    let (store, tables) = fixtures();
    tables.seed("users", items(0..3));

    let response = Orchestrator::new(config(&["users"]), tables, store, account())
        .run_backup(Some(DATE.to_string()))
        .await;

    assert_eq!(response.body["offsite_copy"]["status"], "SKIPPED");
    assert_eq!(response.body["offsite_copy"]["reason"], "offsite copy disabled");
}
