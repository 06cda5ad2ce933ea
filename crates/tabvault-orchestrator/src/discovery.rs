//! Locating export data files in object storage
//!
//! The layout an export leaves behind is not fixed, so [`DataFileResolver`]
//! walks an ordered list of [`LayoutStrategy`] values and returns the first
//! non-empty result:
//!
//! 1. `Standard`: `<prefix>/AWSDynamoDB/<latest export id>/data/` or the
//!    export directory itself
//! 2. `Direct`: files immediately under `<prefix>/`
//! 3. `Recursive`: every object under `<prefix>/`
//!
//! A strategy that errors is logged and skipped like an empty one.

use std::sync::Arc;
use tabvault_common::{Result, VaultError};
use tracing::{debug, error, info, warn};

use crate::datafile::is_data_file;
use crate::storage::{ListRequest, ObjectStore, ObjectSummary};

/// Directory the export service writes under the requested prefix
pub const EXPORT_NAMESPACE: &str = "AWSDynamoDB";

/// Objects sampled into the failure diagnostic
const SAMPLE_LISTING_KEYS: i32 = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayoutStrategy {
    Standard,
    Direct,
    Recursive,
}

impl LayoutStrategy {
    pub const ORDERED: [LayoutStrategy; 3] = [
        LayoutStrategy::Standard,
        LayoutStrategy::Direct,
        LayoutStrategy::Recursive,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            LayoutStrategy::Standard => "standard",
            LayoutStrategy::Direct => "direct",
            LayoutStrategy::Recursive => "recursive",
        }
    }
}

/// Export data files exclude the `manifest*` metadata the export service
/// writes beside them.
pub fn is_export_data_object(key: &str) -> bool {
    let name = key.rsplit('/').next().unwrap_or(key);
    is_data_file(key) && !name.starts_with("manifest")
}

fn data_keys(objects: impl IntoIterator<Item = ObjectSummary>) -> Vec<String> {
    let mut keys: Vec<String> = objects
        .into_iter()
        .map(|o| o.key)
        .filter(|k| is_export_data_object(k))
        .collect();
    keys.sort();
    keys
}

#[derive(Clone)]
pub struct DataFileResolver {
    store: Arc<dyn ObjectStore>,
}

impl DataFileResolver {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    /// Data-file keys for the export at `prefix`, non-empty on success.
    pub async fn locate(&self, prefix: &str) -> Result<Vec<String>> {
        let prefix = prefix.trim_end_matches('/');
        info!(prefix = %prefix, "Locating export data files");

        for strategy in LayoutStrategy::ORDERED {
            match self.try_strategy(strategy, prefix).await {
                Ok(keys) if !keys.is_empty() => {
                    info!(
                        prefix = %prefix,
                        strategy = strategy.as_str(),
                        files = keys.len(),
                        "Found export data files"
                    );
                    return Ok(keys);
                },
                Ok(_) => debug!(prefix = %prefix, strategy = strategy.as_str(), "No data files"),
                Err(e) => warn!(
                    prefix = %prefix,
                    strategy = strategy.as_str(),
                    error = %e,
                    "Layout strategy failed"
                ),
            }
        }

        let sample = self.sample_listing(prefix).await;
        error!(prefix = %prefix, sample = ?sample, "No data files found under any layout");

        Err(VaultError::DiscoveryExhausted {
            prefix: prefix.to_string(),
            sample,
        })
    }

    pub async fn try_strategy(&self, strategy: LayoutStrategy, prefix: &str) -> Result<Vec<String>> {
        match strategy {
            LayoutStrategy::Standard => self.standard_layout(prefix).await,
            LayoutStrategy::Direct => self.direct_layout(prefix).await,
            LayoutStrategy::Recursive => {
                let objects = self.store.list_all_objects(&format!("{}/", prefix)).await?;
                Ok(data_keys(objects))
            },
        }
    }

    async fn standard_layout(&self, prefix: &str) -> Result<Vec<String>> {
        let namespace = format!("{}/{}/", prefix, EXPORT_NAMESPACE);
        let mut export_dirs = self.delimited(&namespace).await?.1;

        // Export ids are timestamp-prefixed; the greatest is the newest.
        export_dirs.sort();
        let Some(export_dir) = export_dirs.pop() else {
            return Ok(Vec::new());
        };
        debug!(export_dir = %export_dir, "Found export directory");

        for candidate in [format!("{}data/", export_dir), export_dir] {
            let keys = data_keys(self.store.list_all_objects(&candidate).await?);
            if !keys.is_empty() {
                return Ok(keys);
            }
        }

        Ok(Vec::new())
    }

    async fn direct_layout(&self, prefix: &str) -> Result<Vec<String>> {
        let objects = self.delimited(&format!("{}/", prefix)).await?.0;
        Ok(data_keys(objects))
    }

    /// Immediate children of `prefix`: objects and sub-directory prefixes.
    async fn delimited(&self, prefix: &str) -> Result<(Vec<ObjectSummary>, Vec<String>)> {
        let mut request = ListRequest::delimited(prefix);
        let mut objects = Vec::new();
        let mut directories = Vec::new();

        loop {
            let page = self.store.list_objects(&request).await?;
            objects.extend(page.objects);
            directories.extend(page.common_prefixes);
            match page.next_continuation_token {
                Some(token) => request.continuation_token = Some(token),
                None => break,
            }
        }

        Ok((objects, directories))
    }

    async fn sample_listing(&self, prefix: &str) -> Vec<String> {
        let request = ListRequest::prefix(format!("{}/", prefix)).with_max_keys(SAMPLE_LISTING_KEYS);
        match self.store.list_objects(&request).await {
            Ok(page) => page.objects.into_iter().map(|o| o.key).collect(),
            Err(_) => Vec::new(),
        }
    }
}
