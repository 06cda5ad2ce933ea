//! Key-value store RPC surface
//!
//! [`TableService`] is the fixed set of remote calls the orchestrator makes
//! against the managed table store: table metadata, point-in-time exports,
//! bulk imports, paged scans, batched writes and the continuous-backup
//! switch. [`dynamo::DynamoTables`] is the production implementation; tests
//! substitute in-memory fakes.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tabvault_common::Result;

use crate::codec::Item;
use crate::jobs::JobStatus;

pub mod dynamo;

pub use dynamo::DynamoTables;

/// Maximum number of requests in one batch write.
pub const BATCH_WRITE_LIMIT: usize = 25;

#[async_trait]
pub trait TableService: Send + Sync {
    /// Describe a table; [`tabvault_common::VaultError::NotFound`] when absent.
    async fn describe_table(&self, table_name: &str) -> Result<TableDescription>;

    async fn start_export(&self, request: &ExportRequest) -> Result<ExportStatusRecord>;

    async fn describe_export(&self, export_arn: &str) -> Result<ExportStatusRecord>;

    /// Start a bulk import. The target table is created by the import from
    /// `request.schema`.
    async fn start_import(&self, request: &ImportRequest) -> Result<ImportStatusRecord>;

    async fn describe_import(&self, import_arn: &str) -> Result<ImportStatusRecord>;

    /// Read one page of items, continuing after `start_key` when given.
    async fn scan(&self, table_name: &str, start_key: Option<Item>) -> Result<ScanPage>;

    /// Submit up to [`BATCH_WRITE_LIMIT`] requests. Returns the requests the
    /// service left unprocessed (empty when all were applied).
    async fn batch_write(
        &self,
        table_name: &str,
        requests: &[WriteRequest],
    ) -> Result<Vec<WriteRequest>>;

    async fn set_continuous_backups(&self, table_name: &str, enabled: bool) -> Result<()>;
}

/// Region and account used to build fully-qualified table identifiers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountContext {
    pub region: String,
    pub account_id: String,
}

impl AccountContext {
    pub fn new(region: impl Into<String>, account_id: impl Into<String>) -> Self {
        Self {
            region: region.into(),
            account_id: account_id.into(),
        }
    }

    pub fn table_arn(&self, table_name: &str) -> String {
        format!(
            "arn:aws:dynamodb:{}:{}:table/{}",
            self.region, self.account_id, table_name
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeDefinition {
    pub name: String,
    /// Scalar type: "S", "N" or "B"
    pub attribute_type: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum KeyType {
    Hash,
    Range,
}

impl KeyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyType::Hash => "HASH",
            KeyType::Range => "RANGE",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyElement {
    pub name: String,
    pub key_type: KeyType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Throughput {
    pub read_capacity_units: i64,
    pub write_capacity_units: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecondaryIndex {
    pub index_name: String,
    pub key_schema: Vec<KeyElement>,
    pub projection_type: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub non_key_attributes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provisioned_throughput: Option<Throughput>,
}

/// Table shape captured at export time and replayed by bulk import.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    pub attribute_definitions: Vec<AttributeDefinition>,
    pub key_schema: Vec<KeyElement>,
    pub billing_mode: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provisioned_throughput: Option<Throughput>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub global_secondary_indexes: Vec<SecondaryIndex>,
}

impl TableSchema {
    pub const PAY_PER_REQUEST: &'static str = "PAY_PER_REQUEST";

    fn key_named(&self, key_type: KeyType) -> Option<&str> {
        self.key_schema
            .iter()
            .find(|k| k.key_type == key_type)
            .map(|k| k.name.as_str())
    }

    pub fn partition_key(&self) -> Option<&str> {
        self.key_named(KeyType::Hash)
    }

    pub fn sort_key(&self) -> Option<&str> {
        self.key_named(KeyType::Range)
    }

    /// Project an item down to its primary key attributes. `None` when the
    /// item lacks the partition key.
    pub fn key_of(&self, item: &Item) -> Option<Item> {
        let partition = self.partition_key()?;
        let mut key = Item::new();
        key.insert(partition.to_string(), item.get(partition)?.clone());
        if let Some(sort) = self.sort_key() {
            if let Some(value) = item.get(sort) {
                key.insert(sort.to_string(), value.clone());
            }
        }
        Some(key)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TableDescription {
    pub table_name: String,
    pub table_arn: Option<String>,
    pub item_count: Option<i64>,
    pub schema: TableSchema,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportRequest {
    pub table_arn: String,
    pub s3_bucket: String,
    pub s3_prefix: String,
}

/// Remote view of an export job
#[derive(Debug, Clone, PartialEq)]
pub struct ExportStatusRecord {
    pub export_arn: String,
    pub status: JobStatus,
    pub item_count: Option<i64>,
    pub billed_size_bytes: Option<i64>,
    pub export_time: Option<DateTime<Utc>>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub failure_message: Option<String>,
}

/// Compression of the data files an import reads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ImportCompression {
    Gzip,
    None,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ImportRequest {
    pub s3_bucket: String,
    pub s3_key_prefix: String,
    pub compression: ImportCompression,
    pub target_table_name: String,
    pub schema: TableSchema,
}

/// Remote view of an import job
#[derive(Debug, Clone, PartialEq)]
pub struct ImportStatusRecord {
    pub import_arn: String,
    pub status: JobStatus,
    pub processed_item_count: i64,
    pub imported_item_count: i64,
    pub error_count: i64,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub failure_message: Option<String>,
}

/// One entry of a batch write
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteRequest {
    Put(Item),
    /// Primary key of the item to delete
    Delete(Item),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScanPage {
    pub items: Vec<Item>,
    pub last_evaluated_key: Option<Item>,
}
