//! Configuration management

use serde::{Deserialize, Serialize};
use std::env;
use std::str::FromStr;
use std::time::Duration;
use tabvault_common::{Result, VaultError};

use crate::jobs::PollSchedule;
use crate::storage::StorageConfig;

// ============================================================================
// Configuration Constants
// ============================================================================

/// Default key prefix root for exports and manifests.
pub const DEFAULT_EXPORTS_ROOT: &str = "exports";

/// Default seconds between job status polls.
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 30;

/// Default seconds to wait for exports before reporting them timed out.
pub const DEFAULT_EXPORT_MAX_WAIT_SECS: u64 = 840;

/// Default seconds to wait for imports before reporting them timed out.
pub const DEFAULT_IMPORT_MAX_WAIT_SECS: u64 = 720;

/// Default suffix for tables created by bulk import.
pub const DEFAULT_RESTORE_TABLE_SUFFIX: &str = "-restored";

/// Default restore worker width.
pub const DEFAULT_MAX_WORKERS: usize = 5;

/// How restores write data back
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestoreStrategyKind {
    /// Stream records into the existing table
    #[default]
    BatchWrite,
    /// Import into a newly created table
    BulkImport,
}

impl FromStr for RestoreStrategyKind {
    type Err = VaultError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "batch_write" => Ok(RestoreStrategyKind::BatchWrite),
            "bulk_import" => Ok(RestoreStrategyKind::BulkImport),
            other => Err(VaultError::Configuration(format!(
                "RESTORE_STRATEGY must be batch_write or bulk_import, got '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollingConfig {
    pub poll_interval_secs: u64,
    pub export_max_wait_secs: u64,
    pub import_max_wait_secs: u64,
}

impl PollingConfig {
    pub fn export_schedule(&self) -> PollSchedule {
        PollSchedule::new(
            Duration::from_secs(self.poll_interval_secs),
            Duration::from_secs(self.export_max_wait_secs),
        )
    }

    pub fn import_schedule(&self) -> PollSchedule {
        PollSchedule::new(
            Duration::from_secs(self.poll_interval_secs),
            Duration::from_secs(self.import_max_wait_secs),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreConfig {
    pub strategy: RestoreStrategyKind,
    pub table_suffix: String,
    pub max_workers: usize,
}

/// Orchestrator configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    pub environment: String,
    /// Tables to back up; also the set a restore may target
    pub tables: Vec<String>,
    pub exports_root: String,
    pub primary: StorageConfig,
    pub offsite: Option<StorageConfig>,
    pub polling: PollingConfig,
    pub restore: RestoreConfig,
}

fn var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn required(name: &str) -> Result<String> {
    var(name).ok_or_else(|| VaultError::Configuration(format!("{} is required", name)))
}

fn parsed<T: FromStr>(name: &str, default: T) -> Result<T> {
    match var(name) {
        Some(raw) => raw.trim().parse().map_err(|_| {
            VaultError::Configuration(format!("{} has an invalid value '{}'", name, raw))
        }),
        None => Ok(default),
    }
}

/// Parse the `DYNAMODB_TABLES` JSON array.
pub fn parse_table_list(raw: &str) -> Result<Vec<String>> {
    serde_json::from_str(raw).map_err(|e| {
        VaultError::Configuration(format!("Invalid DYNAMODB_TABLES format: {}", e))
    })
}

impl Config {
    /// Load configuration from environment (and `.env`) and defaults
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_env()
    }

    pub fn from_env() -> Result<Self> {
        let backup_bucket = required("BACKUP_BUCKET")?;
        let offsite = if parsed("OFFSITE_ENABLED", false)? {
            Some(StorageConfig::from_env(StorageConfig::OFFSITE_PREFIX, None)?)
        } else {
            None
        };

        let config = Config {
            environment: required("ENVIRONMENT")?,
            tables: parse_table_list(&required("DYNAMODB_TABLES")?)?,
            exports_root: var("EXPORTS_ROOT").unwrap_or_else(|| DEFAULT_EXPORTS_ROOT.to_string()),
            primary: StorageConfig::from_env(StorageConfig::PRIMARY_PREFIX, Some(backup_bucket))?,
            offsite,
            polling: PollingConfig {
                poll_interval_secs: parsed("EXPORT_POLL_INTERVAL_SECS", DEFAULT_POLL_INTERVAL_SECS)?,
                export_max_wait_secs: parsed("EXPORT_MAX_WAIT_SECS", DEFAULT_EXPORT_MAX_WAIT_SECS)?,
                import_max_wait_secs: parsed("IMPORT_MAX_WAIT_SECS", DEFAULT_IMPORT_MAX_WAIT_SECS)?,
            },
            restore: RestoreConfig {
                strategy: parsed("RESTORE_STRATEGY", RestoreStrategyKind::default())?,
                table_suffix: var("RESTORE_TABLE_SUFFIX")
                    .unwrap_or_else(|| DEFAULT_RESTORE_TABLE_SUFFIX.to_string()),
                max_workers: parsed("DEFAULT_MAX_WORKERS", DEFAULT_MAX_WORKERS)?,
            },
        };

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        let invalid = |message: &str| Err(VaultError::Configuration(message.to_string()));

        if self.environment.trim().is_empty() {
            return invalid("ENVIRONMENT cannot be empty");
        }
        if self.tables.is_empty() {
            return invalid("DYNAMODB_TABLES must name at least one table");
        }
        if self.tables.iter().any(|t| t.trim().is_empty()) {
            return invalid("DYNAMODB_TABLES contains an empty table name");
        }
        if self.exports_root.trim_matches('/').is_empty() {
            return invalid("EXPORTS_ROOT cannot be empty");
        }
        if self.polling.poll_interval_secs == 0 {
            return invalid("EXPORT_POLL_INTERVAL_SECS must be greater than 0");
        }
        if self.restore.max_workers == 0 {
            return invalid("DEFAULT_MAX_WORKERS must be greater than 0");
        }

        self.primary.validate()?;
        if let Some(offsite) = &self.offsite {
            offsite.validate()?;
        }

        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serial_test::serial;

    const VARS: &[&str] = &[
        "BACKUP_BUCKET",
        "ENVIRONMENT",
        "DYNAMODB_TABLES",
        "EXPORTS_ROOT",
        "EXPORT_POLL_INTERVAL_SECS",
        "EXPORT_MAX_WAIT_SECS",
        "IMPORT_MAX_WAIT_SECS",
        "RESTORE_STRATEGY",
        "RESTORE_TABLE_SUFFIX",
        "DEFAULT_MAX_WORKERS",
        "OFFSITE_ENABLED",
        "OFFSITE_S3_BUCKET",
        "S3_ENDPOINT",
        "S3_REGION",
        "S3_PATH_STYLE",
    ];

    fn reset() {
        for name in VARS {
            env::remove_var(name);
        }
        env::set_var("BACKUP_BUCKET", "backups");
        env::set_var("ENVIRONMENT", "staging");
        env::set_var("DYNAMODB_TABLES", r#"["users","orders"]"#);
    }

    #[test]
    #[serial]
    fn test_defaults() {
        reset();
        let config = Config::from_env().unwrap();

        assert_eq!(config.primary.bucket, "backups");
        assert_eq!(config.tables, vec!["users", "orders"]);
        assert_eq!(config.exports_root, DEFAULT_EXPORTS_ROOT);
        assert_eq!(config.polling.export_schedule(), PollSchedule::for_exports());
        assert_eq!(config.polling.import_schedule(), PollSchedule::for_imports());
        assert_eq!(config.restore.strategy, RestoreStrategyKind::BatchWrite);
        assert_eq!(config.restore.table_suffix, "-restored");
        assert!(config.offsite.is_none());
    }

    #[test]
    #[serial]
    fn test_missing_required_variable() {
        reset();
        env::remove_var("ENVIRONMENT");
        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, VaultError::Configuration(ref m) if m.contains("ENVIRONMENT")));
    }

    #[test]
    #[serial]
    fn test_invalid_table_list() {
        reset();
        env::set_var("DYNAMODB_TABLES", "users,orders");
        assert!(matches!(Config::from_env(), Err(VaultError::Configuration(_))));

        env::set_var("DYNAMODB_TABLES", "[]");
        assert!(matches!(Config::from_env(), Err(VaultError::Configuration(_))));
    }

    #[test]
    #[serial]
    fn test_offsite_requires_bucket() {
        reset();
        env::set_var("OFFSITE_ENABLED", "true");
        assert!(Config::from_env().is_err());

        env::set_var("OFFSITE_S3_BUCKET", "mirror");
        let config = Config::from_env().unwrap();
        assert_eq!(config.offsite.map(|o| o.bucket), Some("mirror".to_string()));
        env::remove_var("OFFSITE_ENABLED");
        env::remove_var("OFFSITE_S3_BUCKET");
    }

    #[test]
    #[serial]
    fn test_overrides() {
        reset();
        env::set_var("RESTORE_STRATEGY", "bulk_import");
        env::set_var("DEFAULT_MAX_WORKERS", "8");
        env::set_var("EXPORT_MAX_WAIT_SECS", "60");

        let config = Config::from_env().unwrap();
        assert_eq!(config.restore.strategy, RestoreStrategyKind::BulkImport);
        assert_eq!(config.restore.max_workers, 8);
        assert_eq!(config.polling.export_max_wait_secs, 60);

        env::set_var("DEFAULT_MAX_WORKERS", "many");
        assert!(Config::from_env().is_err());
    }
}
