use async_trait::async_trait;
use aws_credential_types::Credentials;
use aws_sdk_s3::{
    config::Region,
    error::{DisplayErrorContext, SdkError},
    primitives::ByteStream,
    Client,
};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tabvault_common::{Result, VaultError};
use tracing::{debug, info, instrument};

pub mod config;

pub use config::StorageConfig;

/// One page request against a bucket listing
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListRequest {
    pub prefix: String,
    /// Group keys at this separator into `common_prefixes`
    pub delimiter: Option<String>,
    pub max_keys: Option<i32>,
    pub continuation_token: Option<String>,
}

impl ListRequest {
    pub fn prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            ..Self::default()
        }
    }

    pub fn delimited(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            delimiter: Some("/".to_string()),
            ..Self::default()
        }
    }

    pub fn with_max_keys(mut self, max_keys: i32) -> Self {
        self.max_keys = Some(max_keys);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectSummary {
    pub key: String,
    pub size: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectListing {
    pub objects: Vec<ObjectSummary>,
    pub common_prefixes: Vec<String>,
    pub next_continuation_token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMetadata {
    pub key: String,
    pub size: i64,
    pub content_type: Option<String>,
    pub last_modified: Option<DateTime<Utc>>,
}

/// Object storage operations used by backup and restore.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    fn bucket(&self) -> &str;

    async fn put_object(
        &self,
        key: &str,
        data: Vec<u8>,
        content_type: Option<&str>,
        metadata: &HashMap<String, String>,
    ) -> Result<()>;

    /// [`VaultError::NotFound`] when the key does not exist.
    async fn get_object(&self, key: &str) -> Result<Vec<u8>>;

    async fn list_objects(&self, request: &ListRequest) -> Result<ObjectListing>;

    async fn head_object(&self, key: &str) -> Result<ObjectMetadata>;

    /// Every object under `prefix`, following continuation tokens.
    async fn list_all_objects(&self, prefix: &str) -> Result<Vec<ObjectSummary>> {
        let mut request = ListRequest::prefix(prefix);
        let mut objects = Vec::new();

        loop {
            let page = self.list_objects(&request).await?;
            objects.extend(page.objects);
            match page.next_continuation_token {
                Some(token) => request.continuation_token = Some(token),
                None => break,
            }
        }

        Ok(objects)
    }
}

#[derive(Clone)]
pub struct S3Storage {
    client: Client,
    bucket: String,
}

impl S3Storage {
    /// Build a client from the shared AWS configuration, overridden by
    /// whatever `config` sets explicitly.
    pub fn new(shared: &aws_config::SdkConfig, config: StorageConfig) -> Result<Self> {
        config.validate()?;
        debug!(bucket = %config.bucket, endpoint = ?config.endpoint, "Initializing object storage");

        let mut builder = aws_sdk_s3::config::Builder::from(shared).force_path_style(config.path_style);

        if let Some(region) = &config.region {
            builder = builder.region(Region::new(region.clone()));
        }
        if let Some((access_key, secret_key)) = config.credentials() {
            builder = builder.credentials_provider(Credentials::new(
                access_key,
                secret_key,
                None,
                None,
                "tabvault-storage",
            ));
        }
        if let Some(endpoint) = &config.endpoint {
            builder = builder.endpoint_url(endpoint);
        }

        info!(bucket = %config.bucket, "Storage client initialized");

        Ok(Self {
            client: Client::from_conf(builder.build()),
            bucket: config.bucket,
        })
    }
}

fn remote<E, R>(operation: &str, err: SdkError<E, R>) -> VaultError
where
    E: std::error::Error + 'static,
    R: std::fmt::Debug,
{
    VaultError::remote(operation, DisplayErrorContext(&err))
}

#[async_trait]
impl ObjectStore for S3Storage {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    #[instrument(skip(self, data, metadata), fields(bucket = %self.bucket))]
    async fn put_object(
        &self,
        key: &str,
        data: Vec<u8>,
        content_type: Option<&str>,
        metadata: &HashMap<String, String>,
    ) -> Result<()> {
        let size = data.len();
        debug!("Uploading {} bytes to s3://{}/{}", size, self.bucket, key);

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(data))
            .set_content_type(content_type.map(str::to_string))
            .set_metadata((!metadata.is_empty()).then(|| metadata.clone()))
            .send()
            .await
            .map_err(|e| remote("PutObject", e))?;

        info!("Uploaded s3://{}/{}", self.bucket, key);
        Ok(())
    }

    #[instrument(skip(self), fields(bucket = %self.bucket))]
    async fn get_object(&self, key: &str) -> Result<Vec<u8>> {
        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                if e.as_service_error().is_some_and(|se| se.is_no_such_key()) {
                    VaultError::NotFound(format!("s3://{}/{}", self.bucket, key))
                } else {
                    remote("GetObject", e)
                }
            })?;

        let data = response
            .body
            .collect()
            .await
            .map_err(|e| VaultError::remote("GetObject", e))?
            .into_bytes()
            .to_vec();

        debug!("Downloaded {} bytes from s3://{}/{}", data.len(), self.bucket, key);
        Ok(data)
    }

    async fn list_objects(&self, request: &ListRequest) -> Result<ObjectListing> {
        let response = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(&request.prefix)
            .set_delimiter(request.delimiter.clone())
            .set_max_keys(request.max_keys)
            .set_continuation_token(request.continuation_token.clone())
            .send()
            .await
            .map_err(|e| remote("ListObjectsV2", e))?;

        let objects = response
            .contents()
            .iter()
            .filter_map(|obj| {
                obj.key().map(|k| ObjectSummary {
                    key: k.to_string(),
                    size: obj.size().unwrap_or(0),
                })
            })
            .collect();

        let common_prefixes = response
            .common_prefixes()
            .iter()
            .filter_map(|p| p.prefix().map(str::to_string))
            .collect();

        let next_continuation_token = if response.is_truncated().unwrap_or(false) {
            response.next_continuation_token().map(str::to_string)
        } else {
            None
        };

        Ok(ObjectListing {
            objects,
            common_prefixes,
            next_continuation_token,
        })
    }

    #[instrument(skip(self), fields(bucket = %self.bucket))]
    async fn head_object(&self, key: &str) -> Result<ObjectMetadata> {
        let response = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                if e.as_service_error().is_some_and(|se| se.is_not_found()) {
                    VaultError::NotFound(format!("s3://{}/{}", self.bucket, key))
                } else {
                    remote("HeadObject", e)
                }
            })?;

        Ok(ObjectMetadata {
            key: key.to_string(),
            size: response.content_length().unwrap_or(0),
            content_type: response.content_type().map(str::to_string),
            last_modified: response
                .last_modified()
                .and_then(|dt| DateTime::<Utc>::from_timestamp(dt.secs(), dt.subsec_nanos())),
        })
    }
}
