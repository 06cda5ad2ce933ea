//! In-memory stand-ins for the object store and the table service
//!
//! `FakeObjectStore` keeps objects in a sorted map and implements prefix and
//! delimiter listing with continuation tokens. `FakeTables` keeps items per
//! table and scripts export and import progress; completed exports write
//! gzipped data files into the store the way the managed service does, and
//! completed imports load them back.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use async_trait::async_trait;
use chrono::Utc;
use flate2::{write::GzEncoder, Compression};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::io::Write;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use tabvault_common::{Result, VaultError};
use tabvault_orchestrator::{
    codec::{encode_item, Item, Value},
    config::{
        Config, PollingConfig, RestoreConfig, RestoreStrategyKind, DEFAULT_EXPORTS_ROOT,
        DEFAULT_RESTORE_TABLE_SUFFIX,
    },
    datafile::{is_data_file, read_data_file},
    export::{manifest_key, ExportJob, Manifest},
    jobs::JobStatus,
    storage::{
        ListRequest, ObjectListing, ObjectMetadata, ObjectStore, ObjectSummary, StorageConfig,
    },
    table::{
        AccountContext, AttributeDefinition, ExportRequest, ExportStatusRecord, ImportRequest,
        ImportStatusRecord, KeyElement, KeyType, ScanPage, TableDescription, TableSchema,
        TableService, WriteRequest,
    },
};

pub const BUCKET: &str = "backups";
pub const ENVIRONMENT: &str = "staging";

// ============================================================================
// Object store
// ============================================================================

#[derive(Debug, Clone)]
pub struct StoredObject {
    pub data: Vec<u8>,
    pub content_type: Option<String>,
    pub metadata: HashMap<String, String>,
}

pub struct FakeObjectStore {
    bucket: String,
    page_size: usize,
    objects: Mutex<BTreeMap<String, StoredObject>>,
}

enum Entry {
    Object(ObjectSummary),
    Directory(String),
}

impl FakeObjectStore {
    pub fn new(bucket: &str) -> Self {
        Self {
            bucket: bucket.to_string(),
            page_size: 1000,
            objects: Mutex::new(BTreeMap::new()),
        }
    }

    /// Smaller pages force callers through continuation tokens.
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn insert(&self, key: &str, data: impl Into<Vec<u8>>) {
        self.objects.lock().unwrap().insert(
            key.to_string(),
            StoredObject {
                data: data.into(),
                content_type: None,
                metadata: HashMap::new(),
            },
        );
    }

    pub fn get(&self, key: &str) -> Option<StoredObject> {
        self.objects.lock().unwrap().get(key).cloned()
    }

    pub fn keys(&self) -> Vec<String> {
        self.objects.lock().unwrap().keys().cloned().collect()
    }

    fn entries(&self, request: &ListRequest) -> Vec<Entry> {
        let objects = self.objects.lock().unwrap();
        let mut entries = Vec::new();
        let mut seen = BTreeSet::new();

        for (key, object) in objects.range(request.prefix.clone()..) {
            let Some(rest) = key.strip_prefix(&request.prefix) else {
                break;
            };
            let directory = request
                .delimiter
                .as_deref()
                .and_then(|d| rest.find(d).map(|at| (at, d.len())));
            match directory {
                Some((at, len)) => {
                    let prefix = format!("{}{}", request.prefix, &rest[..at + len]);
                    if seen.insert(prefix.clone()) {
                        entries.push(Entry::Directory(prefix));
                    }
                },
                None => entries.push(Entry::Object(ObjectSummary {
                    key: key.clone(),
                    size: object.data.len() as i64,
                })),
            }
        }
        entries
    }
}

#[async_trait]
impl ObjectStore for FakeObjectStore {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn put_object(
        &self,
        key: &str,
        data: Vec<u8>,
        content_type: Option<&str>,
        metadata: &HashMap<String, String>,
    ) -> Result<()> {
        self.objects.lock().unwrap().insert(
            key.to_string(),
            StoredObject {
                data,
                content_type: content_type.map(str::to_string),
                metadata: metadata.clone(),
            },
        );
        Ok(())
    }

    async fn get_object(&self, key: &str) -> Result<Vec<u8>> {
        self.get(key)
            .map(|o| o.data)
            .ok_or_else(|| VaultError::NotFound(format!("{}/{}", self.bucket, key)))
    }

    async fn list_objects(&self, request: &ListRequest) -> Result<ObjectListing> {
        let entries = self.entries(request);
        let start: usize = request
            .continuation_token
            .as_deref()
            .map(|t| t.parse().unwrap())
            .unwrap_or(0);
        let limit = request
            .max_keys
            .map(|m| m as usize)
            .unwrap_or(self.page_size)
            .min(self.page_size);
        let end = (start + limit).min(entries.len());

        let mut listing = ObjectListing::default();
        for entry in entries.into_iter().skip(start).take(end.saturating_sub(start)) {
            match entry {
                Entry::Object(summary) => listing.objects.push(summary),
                Entry::Directory(prefix) => listing.common_prefixes.push(prefix),
            }
        }
        // A caller-capped listing is a sample; only full pages continue.
        if request.max_keys.is_none() && end < self.entries(request).len() {
            listing.next_continuation_token = Some(end.to_string());
        }
        Ok(listing)
    }

    async fn head_object(&self, key: &str) -> Result<ObjectMetadata> {
        let object = self
            .get(key)
            .ok_or_else(|| VaultError::NotFound(format!("{}/{}", self.bucket, key)))?;
        Ok(ObjectMetadata {
            key: key.to_string(),
            size: object.data.len() as i64,
            content_type: object.content_type,
            last_modified: Some(Utc::now()),
        })
    }
}

// ============================================================================
// Table service
// ============================================================================

struct FakeTable {
    schema: TableSchema,
    items: BTreeMap<String, Item>,
}

impl FakeTable {
    fn new(schema: TableSchema) -> Self {
        Self {
            schema,
            items: BTreeMap::new(),
        }
    }

    fn key_string(&self, item: &Item) -> Option<String> {
        self.schema
            .key_of(item)
            .map(|key| encode_item(&key).to_string())
    }

    fn put(&mut self, item: Item) {
        if let Some(key) = self.key_string(&item) {
            self.items.insert(key, item);
        }
    }
}

struct RemoteJob {
    table_name: String,
    prefix: String,
    script: Vec<JobStatus>,
    polls: usize,
    status: JobStatus,
}

impl RemoteJob {
    /// Advance to the next scripted status; the last one repeats.
    fn advance(&mut self) -> (JobStatus, bool) {
        let next = self
            .script
            .get(self.polls)
            .or(self.script.last())
            .copied()
            .unwrap_or(JobStatus::Completed);
        self.polls += 1;
        let became_complete = next == JobStatus::Completed && self.status != JobStatus::Completed;
        self.status = next;
        (next, became_complete)
    }
}

#[derive(Default)]
struct TablesState {
    tables: BTreeMap<String, FakeTable>,
    export_scripts: HashMap<String, Vec<JobStatus>>,
    import_script: Vec<JobStatus>,
    exports: HashMap<String, RemoteJob>,
    imports: HashMap<String, (RemoteJob, ImportRequest, i64)>,
    throttle_once: Option<usize>,
    failing_calls: HashSet<usize>,
    failing_writes: HashSet<String>,
    batch_calls: usize,
    continuous_backups: Vec<(String, bool)>,
    scan_page_size: usize,
}

pub struct FakeTables {
    state: Mutex<TablesState>,
    store: Arc<FakeObjectStore>,
    account: AccountContext,
}

impl FakeTables {
    /// Tables backed by `store`: exports write there, imports read there.
    pub fn new(store: Arc<FakeObjectStore>) -> Self {
        Self {
            state: Mutex::new(TablesState {
                import_script: vec![JobStatus::InProgress, JobStatus::Completed],
                scan_page_size: 10,
                ..TablesState::default()
            }),
            store,
            account: account(),
        }
    }

    pub fn create_table(&self, table_name: &str) {
        self.create_table_with_schema(table_name, schema());
    }

    pub fn create_table_with_schema(&self, table_name: &str, schema: TableSchema) {
        self.state
            .lock()
            .unwrap()
            .tables
            .insert(table_name.to_string(), FakeTable::new(schema));
    }

    pub fn drop_table(&self, table_name: &str) {
        self.state.lock().unwrap().tables.remove(table_name);
    }

    pub fn seed(&self, table_name: &str, items: Vec<Item>) {
        let mut state = self.state.lock().unwrap();
        let table = state
            .tables
            .entry(table_name.to_string())
            .or_insert_with(|| FakeTable::new(schema()));
        for item in items {
            table.put(item);
        }
    }

    pub fn item_count(&self, table_name: &str) -> Option<usize> {
        self.state
            .lock()
            .unwrap()
            .tables
            .get(table_name)
            .map(|t| t.items.len())
    }

    pub fn has_table(&self, table_name: &str) -> bool {
        self.state.lock().unwrap().tables.contains_key(table_name)
    }

    /// Statuses reported by successive polls of `table_name`'s export.
    pub fn script_export(&self, table_name: &str, statuses: Vec<JobStatus>) {
        self.state
            .lock()
            .unwrap()
            .export_scripts
            .insert(table_name.to_string(), statuses);
    }

    pub fn script_imports(&self, statuses: Vec<JobStatus>) {
        self.state.lock().unwrap().import_script = statuses;
    }

    /// The next batch write with at least `count` requests leaves its last
    /// `count` requests unprocessed.
    pub fn throttle_once(&self, count: usize) {
        self.state.lock().unwrap().throttle_once = Some(count);
    }

    /// The given batch write calls (1-based, counted across all tables)
    /// fail with a transport error before applying anything.
    pub fn fail_batch_calls(&self, calls: &[usize]) {
        self.state.lock().unwrap().failing_calls.extend(calls);
    }

    pub fn fail_writes(&self, table_name: &str) {
        self.state
            .lock()
            .unwrap()
            .failing_writes
            .insert(table_name.to_string());
    }

    pub fn set_scan_page_size(&self, size: usize) {
        self.state.lock().unwrap().scan_page_size = size;
    }

    pub fn batch_calls(&self) -> usize {
        self.state.lock().unwrap().batch_calls
    }

    pub fn import_requests(&self) -> Vec<ImportRequest> {
        self.state
            .lock()
            .unwrap()
            .imports
            .values()
            .map(|(_, request, _)| request.clone())
            .collect()
    }

    pub fn continuous_backups(&self) -> Vec<(String, bool)> {
        self.state.lock().unwrap().continuous_backups.clone()
    }

    fn table_missing(table_name: &str) -> VaultError {
        VaultError::NotFound(format!("Table {} not found", table_name))
    }

    /// Write the table's items as a standard-layout export under `prefix`.
    fn write_export_files(&self, export_id: &str, prefix: &str, items: Vec<Item>) {
        let base = format!("{}AWSDynamoDB/{}", prefix, export_id);
        let half = items.len() / 2;
        for (part, chunk) in [&items[..half], &items[half..]].into_iter().enumerate() {
            let key = format!("{}/data/part-{:04}.json.gz", base, part);
            self.store.insert(&key, gzip_records(chunk));
        }
        self.store
            .insert(&format!("{}/manifest-summary.json", base), "{}");
        self.store.insert(&format!("{}/manifest-files.json", base), "");
    }

    async fn load_import(&self, request: &ImportRequest) -> i64 {
        let mut items = Vec::new();
        for summary in self
            .store
            .list_all_objects(&request.s3_key_prefix)
            .await
            .unwrap()
        {
            if is_data_file(&summary.key) {
                let parsed = read_data_file(self.store.as_ref(), &summary.key).await.unwrap();
                items.extend(parsed.items);
            }
        }
        let count = items.len() as i64;
        self.seed(&request.target_table_name, items);
        count
    }
}

#[async_trait]
impl TableService for FakeTables {
    async fn describe_table(&self, table_name: &str) -> Result<TableDescription> {
        let state = self.state.lock().unwrap();
        let table = state
            .tables
            .get(table_name)
            .ok_or_else(|| Self::table_missing(table_name))?;
        Ok(TableDescription {
            table_name: table_name.to_string(),
            table_arn: Some(self.account.table_arn(table_name)),
            item_count: Some(table.items.len() as i64),
            schema: table.schema.clone(),
        })
    }

    async fn start_export(&self, request: &ExportRequest) -> Result<ExportStatusRecord> {
        let table_name = request
            .table_arn
            .rsplit('/')
            .next()
            .unwrap_or_default()
            .to_string();
        let mut state = self.state.lock().unwrap();
        let script = state
            .export_scripts
            .get(&table_name)
            .cloned()
            .unwrap_or_else(|| vec![JobStatus::InProgress, JobStatus::Completed]);
        let export_arn = format!("{}/export/{:04}", request.table_arn, state.exports.len() + 1);
        state.exports.insert(
            export_arn.clone(),
            RemoteJob {
                table_name,
                prefix: request.s3_prefix.clone(),
                script,
                polls: 0,
                status: JobStatus::InProgress,
            },
        );

        Ok(ExportStatusRecord {
            export_arn,
            status: JobStatus::InProgress,
            item_count: None,
            billed_size_bytes: None,
            export_time: Some(Utc::now()),
            start_time: Some(Utc::now()),
            end_time: None,
            failure_message: None,
        })
    }

    async fn describe_export(&self, export_arn: &str) -> Result<ExportStatusRecord> {
        let (status, became_complete, prefix, items) = {
            let mut state = self.state.lock().unwrap();
            let job = state
                .exports
                .get_mut(export_arn)
                .ok_or_else(|| VaultError::NotFound(export_arn.to_string()))?;
            let (status, became_complete) = job.advance();
            let prefix = job.prefix.clone();
            let table_name = job.table_name.clone();
            let items: Vec<Item> = state
                .tables
                .get(&table_name)
                .map(|t| t.items.values().cloned().collect())
                .unwrap_or_default();
            (status, became_complete, prefix, items)
        };

        let item_count = items.len() as i64;
        if became_complete {
            let export_id = export_arn.rsplit('/').next().unwrap_or_default();
            self.write_export_files(export_id, &prefix, items);
        }

        let completed = status == JobStatus::Completed;
        Ok(ExportStatusRecord {
            export_arn: export_arn.to_string(),
            status,
            item_count: completed.then_some(item_count),
            billed_size_bytes: completed.then_some(item_count * 100),
            export_time: None,
            start_time: None,
            end_time: completed.then(Utc::now),
            failure_message: (status == JobStatus::Failed).then(|| "export failed".to_string()),
        })
    }

    async fn start_import(&self, request: &ImportRequest) -> Result<ImportStatusRecord> {
        let mut state = self.state.lock().unwrap();
        if state.tables.contains_key(&request.target_table_name) {
            return Err(VaultError::remote(
                "ImportTable",
                format!("Table already exists: {}", request.target_table_name),
            ));
        }
        let import_arn = format!(
            "{}/import/{:04}",
            self.account.table_arn(&request.target_table_name),
            state.imports.len() + 1
        );
        let job = RemoteJob {
            table_name: request.target_table_name.clone(),
            prefix: request.s3_key_prefix.clone(),
            script: state.import_script.clone(),
            polls: 0,
            status: JobStatus::InProgress,
        };
        state
            .imports
            .insert(import_arn.clone(), (job, request.clone(), 0));

        Ok(ImportStatusRecord {
            import_arn,
            status: JobStatus::InProgress,
            processed_item_count: 0,
            imported_item_count: 0,
            error_count: 0,
            start_time: Some(Utc::now()),
            end_time: None,
            failure_message: None,
        })
    }

    async fn describe_import(&self, import_arn: &str) -> Result<ImportStatusRecord> {
        let (status, became_complete, request) = {
            let mut state = self.state.lock().unwrap();
            let (job, request, _) = state
                .imports
                .get_mut(import_arn)
                .ok_or_else(|| VaultError::NotFound(import_arn.to_string()))?;
            let (status, became_complete) = job.advance();
            (status, became_complete, request.clone())
        };

        if became_complete {
            {
                let mut state = self.state.lock().unwrap();
                state
                    .tables
                    .insert(request.target_table_name.clone(), FakeTable::new(request.schema.clone()));
            }
            let imported = self.load_import(&request).await;
            if let Some((_, _, count)) = self.state.lock().unwrap().imports.get_mut(import_arn) {
                *count = imported;
            }
        }

        let imported = self
            .state
            .lock()
            .unwrap()
            .imports
            .get(import_arn)
            .map(|(_, _, count)| *count)
            .unwrap_or_default();

        Ok(ImportStatusRecord {
            import_arn: import_arn.to_string(),
            status,
            processed_item_count: imported,
            imported_item_count: imported,
            error_count: 0,
            start_time: None,
            end_time: (status == JobStatus::Completed).then(Utc::now),
            failure_message: (status == JobStatus::Failed).then(|| "import failed".to_string()),
        })
    }

    async fn scan(&self, table_name: &str, start_key: Option<Item>) -> Result<ScanPage> {
        let state = self.state.lock().unwrap();
        let table = state
            .tables
            .get(table_name)
            .ok_or_else(|| Self::table_missing(table_name))?;

        let after = start_key.map(|key| encode_item(&key).to_string());
        let remaining: Vec<&Item> = match &after {
            Some(after) => table
                .items
                .range::<String, _>((
                    std::ops::Bound::Excluded(after),
                    std::ops::Bound::Unbounded,
                ))
                .map(|(_, item)| item)
                .collect(),
            None => table.items.values().collect(),
        };

        let items: Vec<Item> = remaining
            .iter()
            .take(state.scan_page_size)
            .map(|item| (*item).clone())
            .collect();
        let last_evaluated_key = (remaining.len() > items.len())
            .then(|| items.last().and_then(|item| table.schema.key_of(item)))
            .flatten();

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
        let mut state = self.state.lock().unwrap();
        state.batch_calls += 1;

        if state.failing_calls.contains(&state.batch_calls) {
            return Err(VaultError::remote("BatchWriteItem", "connection reset by peer"));
        }
        if state.failing_writes.contains(table_name) {
            return Err(VaultError::remote("BatchWriteItem", "ProvisionedThroughputExceeded"));
        }

        let applied = match state.throttle_once {
            Some(count) if requests.len() >= count => {
                state.throttle_once = None;
                requests.len() - count
            },
            _ => requests.len(),
        };

        let table = state
            .tables
            .get_mut(table_name)
            .ok_or_else(|| Self::table_missing(table_name))?;
        for request in &requests[..applied] {
            match request {
                WriteRequest::Put(item) => table.put(item.clone()),
                WriteRequest::Delete(key) => {
                    if let Some(key) = table.key_string(key) {
                        table.items.remove(&key);
                    }
                },
            }
        }

        Ok(requests[applied..].to_vec())
    }

    async fn set_continuous_backups(&self, table_name: &str, enabled: bool) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if !state.tables.contains_key(table_name) {
            return Err(Self::table_missing(table_name));
        }
        state
            .continuous_backups
            .push((table_name.to_string(), enabled));
        Ok(())
    }
}

// ============================================================================
// Builders
// ============================================================================

pub fn account() -> AccountContext {
    AccountContext::new("us-east-1", "123456789012")
}

/// `id` (string) partition key, no sort key
pub fn schema() -> TableSchema {
    TableSchema {
        attribute_definitions: vec![AttributeDefinition {
            name: "id".to_string(),
            attribute_type: "S".to_string(),
        }],
        key_schema: vec![KeyElement {
            name: "id".to_string(),
            key_type: KeyType::Hash,
        }],
        billing_mode: TableSchema::PAY_PER_REQUEST.to_string(),
        provisioned_throughput: None,
        global_secondary_indexes: vec![],
    }
}

pub fn item(id: usize) -> Item {
    let mut item = Item::new();
    item.insert("id".to_string(), Value::String(format!("item-{:05}", id)));
    item.insert(
        "score".to_string(),
        Value::Number(bigdecimal::BigDecimal::from_str(&format!("{}.5", id)).unwrap()),
    );
    item.insert("active".to_string(), Value::Bool(id % 2 == 0));
    item
}

pub fn items(range: std::ops::Range<usize>) -> Vec<Item> {
    range.map(item).collect()
}

/// Newline-delimited `{"Item": ...}` records, gzipped
pub fn gzip_records(items: &[Item]) -> Vec<u8> {
    gzip_text(&plain_records(items))
}

pub fn gzip_text(text: &str) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(text.as_bytes()).unwrap();
    encoder.finish().unwrap()
}

pub fn plain_records(items: &[Item]) -> String {
    items
        .iter()
        .map(|item| serde_json::json!({ "Item": encode_item(item) }).to_string())
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn config(tables: &[&str]) -> Config {
    Config {
        environment: ENVIRONMENT.to_string(),
        tables: tables.iter().map(|t| t.to_string()).collect(),
        exports_root: DEFAULT_EXPORTS_ROOT.to_string(),
        primary: StorageConfig::new(BUCKET),
        offsite: None,
        polling: PollingConfig {
            poll_interval_secs: 30,
            export_max_wait_secs: 840,
            import_max_wait_secs: 720,
        },
        restore: RestoreConfig {
            strategy: RestoreStrategyKind::BatchWrite,
            table_suffix: DEFAULT_RESTORE_TABLE_SUFFIX.to_string(),
            max_workers: 5,
        },
    }
}

/// Key of the single data file [`seed_backup`] writes for `table_name`.
pub fn seeded_data_key(backup_date: &str, table_name: &str) -> String {
    format!(
        "{}AWSDynamoDB/01700000000000-abcd/data/part-0000.json.gz",
        export_prefix(backup_date, table_name)
    )
}

pub fn export_prefix(backup_date: &str, table_name: &str) -> String {
    format!("{}/{}/{}/", DEFAULT_EXPORTS_ROOT, backup_date, table_name)
}

/// Store a completed backup for `backup_date`: one standard-layout export
/// per table plus the manifest.
pub async fn seed_backup(store: &FakeObjectStore, backup_date: &str, tables: &[(&str, Vec<Item>)]) {
    for (table_name, items) in tables {
        store.insert(&seeded_data_key(backup_date, table_name), gzip_records(items));
    }
    let counts: Vec<(&str, usize)> = tables.iter().map(|(t, items)| (*t, items.len())).collect();
    seed_manifest(store, backup_date, &counts).await;
}

/// Store only the manifest for `backup_date`, listing a completed export of
/// `count` items per table. Data files are left to the caller.
pub async fn seed_manifest(store: &FakeObjectStore, backup_date: &str, tables: &[(&str, usize)]) {
    let mut jobs = Vec::new();
    for (table_name, count) in tables {
        let mut job = ExportJob::new(*table_name, export_prefix(backup_date, table_name));
        job.job_handle = Some(format!("{}/export/seed", account().table_arn(table_name)));
        job.status = JobStatus::Completed;
        job.item_count = *count as u64;
        job.billed_size_bytes = *count as u64 * 100;
        job.table_schema = Some(schema());
        jobs.push(job);
    }

    let manifest = Manifest::from_jobs(backup_date, ENVIRONMENT, BUCKET, jobs);
    store
        .put_object(
            &manifest_key(DEFAULT_EXPORTS_ROOT, backup_date),
            manifest.to_json().unwrap(),
            Some("application/json"),
            &HashMap::new(),
        )
        .await
        .unwrap();
}
