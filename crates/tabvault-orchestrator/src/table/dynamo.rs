//! DynamoDB implementation of [`TableService`]

use async_trait::async_trait;
use aws_sdk_dynamodb::{
    error::{DisplayErrorContext, SdkError},
    primitives::{Blob, DateTime as SdkDateTime},
    types::{
        self as ddb, AttributeValue, BillingMode, ExportFormat, ExportStatus, ExportType,
        ImportStatus, InputCompressionType, InputFormat, PointInTimeRecoverySpecification,
        Projection, ProjectionType, ProvisionedThroughput, S3BucketSource, ScalarAttributeType,
        TableCreationParameters,
    },
    Client,
};
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap};
use tabvault_common::{Result, VaultError};
use tracing::{debug, info, instrument};

use super::{
    AccountContext, AttributeDefinition, ExportRequest, ExportStatusRecord, ImportCompression,
    ImportRequest, ImportStatusRecord, KeyElement, KeyType, ScanPage, SecondaryIndex,
    TableDescription, TableSchema, TableService, Throughput, WriteRequest,
};
use crate::codec::{parse_number, Item, Value};
use crate::jobs::JobStatus;

/// Fallback when the SDK configuration carries no region.
pub const DEFAULT_REGION: &str = "us-east-1";

#[derive(Clone)]
pub struct DynamoTables {
    client: Client,
}

impl DynamoTables {
    pub fn new(shared: &aws_config::SdkConfig) -> Self {
        Self {
            client: Client::new(shared),
        }
    }

    pub fn from_client(client: Client) -> Self {
        Self { client }
    }
}

/// Resolve region and account id for the running credentials.
pub async fn resolve_account(shared: &aws_config::SdkConfig) -> Result<AccountContext> {
    let region = shared
        .region()
        .map(|r| r.to_string())
        .unwrap_or_else(|| DEFAULT_REGION.to_string());

    let identity = aws_sdk_sts::Client::new(shared)
        .get_caller_identity()
        .send()
        .await
        .map_err(|e| VaultError::remote("GetCallerIdentity", DisplayErrorContext(&e)))?;

    let account_id = identity
        .account()
        .ok_or_else(|| VaultError::remote("GetCallerIdentity", "response carried no account id"))?;

    info!(region = %region, account_id = %account_id, "Resolved account context");
    Ok(AccountContext::new(region, account_id))
}

fn remote<E, R>(operation: &str, err: SdkError<E, R>) -> VaultError
where
    E: std::error::Error + 'static,
    R: std::fmt::Debug,
{
    VaultError::remote(operation, DisplayErrorContext(&err))
}

fn to_chrono(time: Option<&SdkDateTime>) -> Option<DateTime<Utc>> {
    time.and_then(|t| DateTime::<Utc>::from_timestamp(t.secs(), t.subsec_nanos()))
}

fn build_error(err: impl std::fmt::Display) -> VaultError {
    VaultError::remote("BuildRequest", err)
}

#[async_trait]
impl TableService for DynamoTables {
    #[instrument(skip(self))]
    async fn describe_table(&self, table_name: &str) -> Result<TableDescription> {
        let output = self
            .client
            .describe_table()
            .table_name(table_name)
            .send()
            .await
            .map_err(|e| {
                if e
                    .as_service_error()
                    .is_some_and(|se| se.is_resource_not_found_exception())
                {
                    VaultError::NotFound(format!("Table {} not found", table_name))
                } else {
                    remote("DescribeTable", e)
                }
            })?;

        let table = output
            .table()
            .ok_or_else(|| VaultError::NotFound(format!("Table {} not found", table_name)))?;

        Ok(TableDescription {
            table_name: table.table_name().unwrap_or(table_name).to_string(),
            table_arn: table.table_arn().map(str::to_string),
            item_count: table.item_count(),
            schema: schema_from_description(table),
        })
    }

    #[instrument(skip(self))]
    async fn start_export(&self, request: &ExportRequest) -> Result<ExportStatusRecord> {
        let output = self
            .client
            .export_table_to_point_in_time()
            .table_arn(&request.table_arn)
            .s3_bucket(&request.s3_bucket)
            .s3_prefix(&request.s3_prefix)
            .export_format(ExportFormat::DynamodbJson)
            .export_type(ExportType::FullExport)
            .send()
            .await
            .map_err(|e| remote("ExportTableToPointInTime", e))?;

        let description = output.export_description().ok_or_else(|| {
            VaultError::remote("ExportTableToPointInTime", "response carried no export description")
        })?;

        export_record(description)
    }

    #[instrument(skip(self))]
    async fn describe_export(&self, export_arn: &str) -> Result<ExportStatusRecord> {
        let output = self
            .client
            .describe_export()
            .export_arn(export_arn)
            .send()
            .await
            .map_err(|e| remote("DescribeExport", e))?;

        let description = output.export_description().ok_or_else(|| {
            VaultError::NotFound(format!("Export {} not found", export_arn))
        })?;

        export_record(description)
    }

    #[instrument(skip(self, request), fields(target = %request.target_table_name))]
    async fn start_import(&self, request: &ImportRequest) -> Result<ImportStatusRecord> {
        let source = S3BucketSource::builder()
            .s3_bucket(&request.s3_bucket)
            .s3_key_prefix(&request.s3_key_prefix)
            .build()
            .map_err(build_error)?;

        let output = self
            .client
            .import_table()
            .s3_bucket_source(source)
            .input_format(InputFormat::DynamodbJson)
            .input_compression_type(match request.compression {
                ImportCompression::Gzip => InputCompressionType::Gzip,
                ImportCompression::None => InputCompressionType::None,
            })
            .table_creation_parameters(creation_parameters(
                &request.target_table_name,
                &request.schema,
            )?)
            .send()
            .await
            .map_err(|e| remote("ImportTable", e))?;

        let description = output.import_table_description().ok_or_else(|| {
            VaultError::remote("ImportTable", "response carried no import description")
        })?;

        Ok(import_record(description))
    }

    #[instrument(skip(self))]
    async fn describe_import(&self, import_arn: &str) -> Result<ImportStatusRecord> {
        let output = self
            .client
            .describe_import()
            .import_arn(import_arn)
            .send()
            .await
            .map_err(|e| remote("DescribeImport", e))?;

        let description = output.import_table_description().ok_or_else(|| {
            VaultError::NotFound(format!("Import {} not found", import_arn))
        })?;

        Ok(import_record(description))
    }

    async fn scan(&self, table_name: &str, start_key: Option<Item>) -> Result<ScanPage> {
        let output = self
            .client
            .scan()
            .table_name(table_name)
            .set_exclusive_start_key(start_key.as_ref().map(to_attribute_map))
            .send()
            .await
            .map_err(|e| remote("Scan", e))?;

        let items = output
            .items()
            .iter()
            .map(from_attribute_map)
            .collect::<Result<Vec<_>>>()?;

        let last_evaluated_key = output
            .last_evaluated_key()
            .map(from_attribute_map)
            .transpose()?;

        debug!(table = %table_name, items = items.len(), more = last_evaluated_key.is_some(), "Scanned page");

        Ok(ScanPage {
            items,
            last_evaluated_key,
        })
    }

    async fn batch_write(
        &self,
        table_name: &str,
        requests: &[WriteRequest],
    ) -> Result<Vec<WriteRequest>> {
        let sdk_requests = requests
            .iter()
            .map(to_sdk_write)
            .collect::<Result<Vec<_>>>()?;

        let output = self
            .client
            .batch_write_item()
            .request_items(table_name, sdk_requests)
            .send()
            .await
            .map_err(|e| remote("BatchWriteItem", e))?;

        output
            .unprocessed_items()
            .and_then(|unprocessed| unprocessed.get(table_name))
            .map(|pending| pending.iter().map(from_sdk_write).collect::<Result<Vec<_>>>())
            .transpose()
            .map(Option::unwrap_or_default)
    }

    #[instrument(skip(self))]
    async fn set_continuous_backups(&self, table_name: &str, enabled: bool) -> Result<()> {
        let specification = PointInTimeRecoverySpecification::builder()
            .point_in_time_recovery_enabled(enabled)
            .build()
            .map_err(build_error)?;

        self.client
            .update_continuous_backups()
            .table_name(table_name)
            .point_in_time_recovery_specification(specification)
            .send()
            .await
            .map_err(|e| remote("UpdateContinuousBackups", e))?;

        info!(table = %table_name, enabled, "Continuous backups updated");
        Ok(())
    }
}

fn export_status(status: Option<&ExportStatus>) -> JobStatus {
    match status {
        Some(ExportStatus::Completed) => JobStatus::Completed,
        Some(ExportStatus::Failed) => JobStatus::Failed,
        Some(ExportStatus::InProgress) => JobStatus::InProgress,
        _ => JobStatus::Unknown,
    }
}

fn import_status(status: Option<&ImportStatus>) -> JobStatus {
    match status {
        Some(ImportStatus::Completed) => JobStatus::Completed,
        Some(ImportStatus::Failed) | Some(ImportStatus::Cancelled) => JobStatus::Failed,
        Some(ImportStatus::InProgress) | Some(ImportStatus::Cancelling) => JobStatus::InProgress,
        _ => JobStatus::Unknown,
    }
}

fn export_record(description: &ddb::ExportDescription) -> Result<ExportStatusRecord> {
    let export_arn = description
        .export_arn()
        .ok_or_else(|| VaultError::remote("DescribeExport", "export description has no ARN"))?;

    Ok(ExportStatusRecord {
        export_arn: export_arn.to_string(),
        status: export_status(description.export_status()),
        item_count: description.item_count(),
        billed_size_bytes: description.billed_size_bytes(),
        export_time: to_chrono(description.export_time()),
        start_time: to_chrono(description.start_time()),
        end_time: to_chrono(description.end_time()),
        failure_message: description.failure_message().map(str::to_string),
    })
}

fn import_record(description: &ddb::ImportTableDescription) -> ImportStatusRecord {
    ImportStatusRecord {
        import_arn: description.import_arn().unwrap_or_default().to_string(),
        status: import_status(description.import_status()),
        processed_item_count: description.processed_item_count(),
        imported_item_count: description.imported_item_count(),
        error_count: description.error_count(),
        start_time: to_chrono(description.start_time()),
        end_time: to_chrono(description.end_time()),
        failure_message: description.failure_message().map(str::to_string),
    }
}

fn key_elements(elements: &[ddb::KeySchemaElement]) -> Vec<KeyElement> {
    elements
        .iter()
        .map(|k| KeyElement {
            name: k.attribute_name().to_string(),
            key_type: if k.key_type() == &ddb::KeyType::Range {
                KeyType::Range
            } else {
                KeyType::Hash
            },
        })
        .collect()
}

fn schema_from_description(table: &ddb::TableDescription) -> TableSchema {
    let billing_mode = table
        .billing_mode_summary()
        .and_then(|summary| summary.billing_mode())
        .map(|mode| mode.as_str().to_string())
        .unwrap_or_else(|| BillingMode::Provisioned.as_str().to_string());

    let provisioned = billing_mode != TableSchema::PAY_PER_REQUEST;

    TableSchema {
        attribute_definitions: table
            .attribute_definitions()
            .iter()
            .map(|a| AttributeDefinition {
                name: a.attribute_name().to_string(),
                attribute_type: a.attribute_type().as_str().to_string(),
            })
            .collect(),
        key_schema: key_elements(table.key_schema()),
        provisioned_throughput: table
            .provisioned_throughput()
            .and_then(throughput)
            .filter(|_| provisioned),
        global_secondary_indexes: table
            .global_secondary_indexes()
            .iter()
            .map(|index| SecondaryIndex {
                index_name: index.index_name().unwrap_or_default().to_string(),
                key_schema: key_elements(index.key_schema()),
                projection_type: index
                    .projection()
                    .and_then(|p| p.projection_type())
                    .map(|p| p.as_str().to_string())
                    .unwrap_or_else(|| ProjectionType::All.as_str().to_string()),
                non_key_attributes: index
                    .projection()
                    .map(|p| p.non_key_attributes().to_vec())
                    .unwrap_or_default(),
                provisioned_throughput: index
                    .provisioned_throughput()
                    .and_then(throughput)
                    .filter(|_| provisioned),
            })
            .collect(),
        billing_mode,
    }
}

fn throughput(description: &ddb::ProvisionedThroughputDescription) -> Option<Throughput> {
    Some(Throughput {
        read_capacity_units: description.read_capacity_units()?,
        write_capacity_units: description.write_capacity_units()?,
    })
}

fn sdk_throughput(throughput: &Throughput) -> Result<ProvisionedThroughput> {
    ProvisionedThroughput::builder()
        .read_capacity_units(throughput.read_capacity_units)
        .write_capacity_units(throughput.write_capacity_units)
        .build()
        .map_err(build_error)
}

fn sdk_key_schema(elements: &[KeyElement]) -> Result<Vec<ddb::KeySchemaElement>> {
    elements
        .iter()
        .map(|k| {
            ddb::KeySchemaElement::builder()
                .attribute_name(&k.name)
                .key_type(ddb::KeyType::from(k.key_type.as_str()))
                .build()
                .map_err(build_error)
        })
        .collect()
}

fn creation_parameters(table_name: &str, schema: &TableSchema) -> Result<TableCreationParameters> {
    let attribute_definitions = schema
        .attribute_definitions
        .iter()
        .map(|a| {
            ddb::AttributeDefinition::builder()
                .attribute_name(&a.name)
                .attribute_type(ScalarAttributeType::from(a.attribute_type.as_str()))
                .build()
                .map_err(build_error)
        })
        .collect::<Result<Vec<_>>>()?;

    let indexes = schema
        .global_secondary_indexes
        .iter()
        .map(|index| {
            ddb::GlobalSecondaryIndex::builder()
                .index_name(&index.index_name)
                .set_key_schema(Some(sdk_key_schema(&index.key_schema)?))
                .projection(
                    Projection::builder()
                        .projection_type(ProjectionType::from(index.projection_type.as_str()))
                        .set_non_key_attributes(
                            (!index.non_key_attributes.is_empty())
                                .then(|| index.non_key_attributes.clone()),
                        )
                        .build(),
                )
                .set_provisioned_throughput(
                    index.provisioned_throughput.as_ref().map(sdk_throughput).transpose()?,
                )
                .build()
                .map_err(build_error)
        })
        .collect::<Result<Vec<_>>>()?;

    TableCreationParameters::builder()
        .table_name(table_name)
        .set_attribute_definitions(Some(attribute_definitions))
        .set_key_schema(Some(sdk_key_schema(&schema.key_schema)?))
        .billing_mode(BillingMode::from(schema.billing_mode.as_str()))
        .set_provisioned_throughput(
            schema.provisioned_throughput.as_ref().map(sdk_throughput).transpose()?,
        )
        .set_global_secondary_indexes((!indexes.is_empty()).then_some(indexes))
        .build()
        .map_err(build_error)
}

fn to_sdk_write(request: &WriteRequest) -> Result<ddb::WriteRequest> {
    let builder = ddb::WriteRequest::builder();
    let builder = match request {
        WriteRequest::Put(item) => builder.put_request(
            ddb::PutRequest::builder()
                .set_item(Some(to_attribute_map(item)))
                .build()
                .map_err(build_error)?,
        ),
        WriteRequest::Delete(key) => builder.delete_request(
            ddb::DeleteRequest::builder()
                .set_key(Some(to_attribute_map(key)))
                .build()
                .map_err(build_error)?,
        ),
    };
    Ok(builder.build())
}

fn from_sdk_write(request: &ddb::WriteRequest) -> Result<WriteRequest> {
    if let Some(put) = request.put_request() {
        return Ok(WriteRequest::Put(from_attribute_map(put.item())?));
    }
    if let Some(delete) = request.delete_request() {
        return Ok(WriteRequest::Delete(from_attribute_map(delete.key())?));
    }
    Err(VaultError::Decode(
        "unprocessed write request has neither put nor delete".to_string(),
    ))
}

fn to_attribute_map(item: &Item) -> HashMap<String, AttributeValue> {
    item.iter()
        .map(|(name, value)| (name.clone(), to_attribute(value)))
        .collect()
}

fn from_attribute_map(map: &HashMap<String, AttributeValue>) -> Result<Item> {
    map.iter()
        .map(|(name, attr)| Ok((name.clone(), from_attribute(attr)?)))
        .collect()
}

fn to_attribute(value: &Value) -> AttributeValue {
    match value {
        Value::String(s) => AttributeValue::S(s.clone()),
        Value::Number(n) => AttributeValue::N(n.to_string()),
        Value::Binary(b) => AttributeValue::B(Blob::new(b.clone())),
        Value::Bool(b) => AttributeValue::Bool(*b),
        Value::Null => AttributeValue::Null(true),
        Value::Map(map) => AttributeValue::M(to_attribute_map(map)),
        Value::List(list) => AttributeValue::L(list.iter().map(to_attribute).collect()),
        Value::StringSet(set) => AttributeValue::Ss(set.iter().cloned().collect()),
        Value::NumberSet(set) => AttributeValue::Ns(set.iter().map(|n| n.to_string()).collect()),
        Value::BinarySet(set) => {
            AttributeValue::Bs(set.iter().map(|b| Blob::new(b.clone())).collect())
        },
    }
}

fn from_attribute(attr: &AttributeValue) -> Result<Value> {
    Ok(match attr {
        AttributeValue::S(s) => Value::String(s.clone()),
        AttributeValue::N(n) => Value::Number(parse_number(n)?),
        AttributeValue::B(b) => Value::Binary(b.as_ref().to_vec()),
        AttributeValue::Bool(b) => Value::Bool(*b),
        AttributeValue::Null(_) => Value::Null,
        AttributeValue::M(map) => Value::Map(from_attribute_map(map)?),
        AttributeValue::L(list) => {
            Value::List(list.iter().map(from_attribute).collect::<Result<Vec<_>>>()?)
        },
        AttributeValue::Ss(set) => Value::StringSet(set.iter().cloned().collect()),
        AttributeValue::Ns(set) => Value::NumberSet(
            set.iter()
                .map(|n| parse_number(n))
                .collect::<Result<BTreeSet<_>>>()?,
        ),
        AttributeValue::Bs(set) => {
            Value::BinarySet(set.iter().map(|b| b.as_ref().to_vec()).collect())
        },
        other => {
            return Err(VaultError::Decode(format!(
                "unknown attribute tag in service response: {:?}",
                other
            )))
        },
    })
}
