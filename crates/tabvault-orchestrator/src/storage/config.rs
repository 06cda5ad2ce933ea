use serde::{Deserialize, Serialize};
use std::env;
use tabvault_common::{Result, VaultError};

/// Connection settings for one object-storage provider.
///
/// Region, credentials and endpoint fall back to the shared AWS
/// configuration when unset, so the primary store usually needs only a
/// bucket. The offsite provider is typically S3-compatible and sets all of
/// them explicitly.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageConfig {
    pub endpoint: Option<String>,
    pub region: Option<String>,
    pub bucket: String,
    pub access_key: Option<String>,
    #[serde(skip_serializing)]
    pub secret_key: Option<String>,
    pub path_style: bool,
}

impl StorageConfig {
    pub const PRIMARY_PREFIX: &'static str = "S3_";
    pub const OFFSITE_PREFIX: &'static str = "OFFSITE_S3_";

    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            ..Self::default()
        }
    }

    /// Read `<prefix>ENDPOINT`, `<prefix>REGION`, `<prefix>BUCKET`,
    /// `<prefix>ACCESS_KEY`, `<prefix>SECRET_KEY` and `<prefix>PATH_STYLE`.
    /// `bucket` overrides `<prefix>BUCKET` when given.
    pub fn from_env(prefix: &str, bucket: Option<String>) -> Result<Self> {
        let var = |name: &str| {
            env::var(format!("{}{}", prefix, name))
                .ok()
                .filter(|v| !v.trim().is_empty())
        };

        let bucket = bucket.or_else(|| var("BUCKET")).ok_or_else(|| {
            VaultError::Configuration(format!("{}BUCKET must be set", prefix))
        })?;

        let path_style = match var("PATH_STYLE") {
            Some(raw) => raw.parse().map_err(|_| {
                VaultError::Configuration(format!(
                    "{}PATH_STYLE must be true or false, got '{}'",
                    prefix, raw
                ))
            })?,
            None => false,
        };

        Ok(Self {
            endpoint: var("ENDPOINT"),
            region: var("REGION"),
            bucket,
            access_key: var("ACCESS_KEY"),
            secret_key: var("SECRET_KEY"),
            path_style,
        })
    }

    /// Static credentials, when both halves are configured.
    pub fn credentials(&self) -> Option<(&str, &str)> {
        match (&self.access_key, &self.secret_key) {
            (Some(access), Some(secret)) => Some((access.as_str(), secret.as_str())),
            _ => None,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.bucket.trim().is_empty() {
            return Err(VaultError::Configuration(
                "storage bucket must not be empty".to_string(),
            ));
        }
        if self.access_key.is_some() != self.secret_key.is_some() {
            return Err(VaultError::Configuration(format!(
                "bucket {}: access key and secret key must be set together",
                self.bucket
            )));
        }
        Ok(())
    }
}
