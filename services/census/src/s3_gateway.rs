use crate::config::{Environment, S3Config};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::{Builder as S3ConfigBuilder, Credentials};
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client as S3Client;
use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Location of an object this service wrote to S3
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredObject {
    pub bucket: String,
    pub region: String,
    pub key: String,
}

impl StoredObject {
    /// Public virtual-hosted style URL of the object
    pub fn public_url(&self) -> String {
        format!(
            "https://{bucket}.s3.{region}.amazonaws.com/{key}",
            bucket = self.bucket,
            region = self.region,
            key = self.key
        )
    }
}

/// What the provider reported for a successful write
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PutResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub e_tag: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_side_encryption: Option<String>,
}

/// Raw object storage operations
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: Bytes,
        content_type: &str,
    ) -> Result<PutResponse>;

    async fn delete_object(&self, bucket: &str, key: &str) -> Result<()>;
}

/// S3-backed object store
pub struct S3ObjectStore {
    client: S3Client,
    multipart_threshold_bytes: usize,
    part_size_bytes: usize,
}

impl S3ObjectStore {
    /// Create a new S3 client from configuration
    pub async fn new(config: &S3Config) -> Result<Self> {
        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()));

        if let (Some(access_key_id), Some(secret_access_key)) =
            (&config.access_key_id, &config.secret_access_key)
        {
            loader = loader.credentials_provider(Credentials::new(
                access_key_id,
                secret_access_key,
                None,
                None,
                "census-config",
            ));
        }

        let aws_config = loader.load().await;
        let mut s3_config_builder = S3ConfigBuilder::from(&aws_config);

        // Configure custom endpoint for MinIO/LocalStack
        if let Some(ref endpoint_url) = config.endpoint_url {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint_url);
        }

        // Force path-style access for MinIO compatibility
        if config.force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        let client = S3Client::from_conf(s3_config_builder.build());

        info!(
            bucket = %config.bucket,
            region = %config.region,
            "S3 object store initialized"
        );

        Ok(Self {
            client,
            multipart_threshold_bytes: config.multipart_threshold_bytes,
            part_size_bytes: config.part_size_bytes.max(5 * 1024 * 1024),
        })
    }

    /// Simple single-part upload for small files
    async fn simple_upload(
        &self,
        bucket: &str,
        key: &str,
        body: Bytes,
        content_type: &str,
    ) -> Result<PutResponse> {
        let output = self
            .client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(ByteStream::from(body))
            .content_type(content_type)
            .send()
            .await
            .map_err(|e| anyhow!("{}", DisplayErrorContext(e)))
            .context("Failed to upload object to S3")?;

        Ok(PutResponse {
            e_tag: output.e_tag().map(String::from),
            version_id: output.version_id().map(String::from),
            server_side_encryption: output
                .server_side_encryption()
                .map(|s| s.as_str().to_string()),
        })
    }

    /// Multipart upload for large files
    async fn multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        body: Bytes,
        content_type: &str,
    ) -> Result<PutResponse> {
        let create_response = self
            .client
            .create_multipart_upload()
            .bucket(bucket)
            .key(key)
            .content_type(content_type)
            .send()
            .await
            .map_err(|e| anyhow!("{}", DisplayErrorContext(e)))
            .context("Failed to create multipart upload")?;

        let upload_id = create_response
            .upload_id()
            .context("No upload ID in response")?
            .to_string();

        match self.upload_parts(bucket, key, &upload_id, body).await {
            Ok(parts) => {
                let output = self
                    .client
                    .complete_multipart_upload()
                    .bucket(bucket)
                    .key(key)
                    .upload_id(&upload_id)
                    .multipart_upload(
                        CompletedMultipartUpload::builder()
                            .set_parts(Some(parts))
                            .build(),
                    )
                    .send()
                    .await
                    .map_err(|e| anyhow!("{}", DisplayErrorContext(e)))
                    .context("Failed to complete multipart upload")?;

                Ok(PutResponse {
                    e_tag: output.e_tag().map(String::from),
                    version_id: output.version_id().map(String::from),
                    server_side_encryption: output
                        .server_side_encryption()
                        .map(|s| s.as_str().to_string()),
                })
            }
            Err(e) => {
                if let Err(abort_err) = self
                    .client
                    .abort_multipart_upload()
                    .bucket(bucket)
                    .key(key)
                    .upload_id(&upload_id)
                    .send()
                    .await
                {
                    warn!(
                        key = %key,
                        error = %DisplayErrorContext(abort_err),
                        "Failed to abort multipart upload"
                    );
                }
                Err(e)
            }
        }
    }

    async fn upload_parts(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        body: Bytes,
    ) -> Result<Vec<CompletedPart>> {
        let mut completed_parts = Vec::new();

        for (index, chunk) in body.chunks(self.part_size_bytes).enumerate() {
            let part_number = index as i32 + 1;

            let response = self
                .client
                .upload_part()
                .bucket(bucket)
                .key(key)
                .upload_id(upload_id)
                .part_number(part_number)
                .body(ByteStream::from(body.slice_ref(chunk)))
                .send()
                .await
                .map_err(|e| anyhow!("{}", DisplayErrorContext(e)))
                .context("Failed to upload part")?;

            completed_parts.push(
                CompletedPart::builder()
                    .part_number(part_number)
                    .e_tag(response.e_tag().unwrap_or_default())
                    .build(),
            );
        }

        Ok(completed_parts)
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    #[instrument(skip(self, body), fields(size_bytes = body.len()))]
    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: Bytes,
        content_type: &str,
    ) -> Result<PutResponse> {
        if body.len() > self.multipart_threshold_bytes {
            self.multipart_upload(bucket, key, body, content_type).await
        } else {
            self.simple_upload(bucket, key, body, content_type).await
        }
    }

    #[instrument(skip(self))]
    async fn delete_object(&self, bucket: &str, key: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| anyhow!("{}", DisplayErrorContext(e)))
            .context("Failed to delete object from S3")?;

        Ok(())
    }
}

/// Recorded call against a [`MemoryObjectStore`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObjectOp {
    Put { bucket: String, key: String },
    Delete { bucket: String, key: String },
}

/// In-process object store; keeps every object and the order of calls
#[derive(Default)]
pub struct MemoryObjectStore {
    objects: Mutex<HashMap<(String, String), Bytes>>,
    ops: Mutex<Vec<ObjectOp>>,
    fail_puts: AtomicBool,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent puts fail, to exercise provider errors
    pub fn fail_puts(&self, fail: bool) {
        self.fail_puts.store(fail, Ordering::SeqCst);
    }

    pub fn object(&self, bucket: &str, key: &str) -> Option<Bytes> {
        self.objects
            .lock()
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
    }

    pub fn ops(&self) -> Vec<ObjectOp> {
        self.ops.lock().clone()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: Bytes,
        _content_type: &str,
    ) -> Result<PutResponse> {
        if self.fail_puts.load(Ordering::SeqCst) {
            return Err(anyhow!("simulated put failure for {bucket}/{key}"));
        }

        self.ops.lock().push(ObjectOp::Put {
            bucket: bucket.to_string(),
            key: key.to_string(),
        });
        self.objects
            .lock()
            .insert((bucket.to_string(), key.to_string()), body);

        Ok(PutResponse {
            e_tag: Some(format!("\"{}\"", uuid::Uuid::new_v4().simple())),
            ..Default::default()
        })
    }

    async fn delete_object(&self, bucket: &str, key: &str) -> Result<()> {
        self.ops.lock().push(ObjectOp::Delete {
            bucket: bucket.to_string(),
            key: key.to_string(),
        });
        self.objects
            .lock()
            .remove(&(bucket.to_string(), key.to_string()));
        Ok(())
    }
}

/// Result of writing a photo through the gateway
#[derive(Debug, Clone)]
pub struct PutResult {
    pub object: StoredObject,
    pub provider_response: PutResponse,
}

/// Bucket-bound gateway that writes photos and retires the ones they replace
pub struct PhotoGateway {
    store: Arc<dyn ObjectStore>,
    bucket: String,
    region: String,
    /// Bucket the running environment owns, if the table names one
    environment_bucket: Option<String>,
}

impl PhotoGateway {
    pub fn new(store: Arc<dyn ObjectStore>, config: &S3Config, environment: Environment) -> Self {
        let environment_bucket = config.bucket_for(environment).map(String::from);

        if environment_bucket.as_deref() != Some(config.bucket.as_str()) {
            warn!(
                environment = %environment,
                bucket = %config.bucket,
                "Configured bucket does not belong to this environment; superseded photos will not be deleted"
            );
        }

        Self {
            store,
            bucket: config.bucket.clone(),
            region: config.region.clone(),
            environment_bucket,
        }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// The object a write to `key` would produce
    pub fn object_for(&self, key: &str) -> StoredObject {
        StoredObject {
            bucket: self.bucket.clone(),
            region: self.region.clone(),
            key: key.to_string(),
        }
    }

    /// Upload `body` under `key` in the configured bucket
    #[instrument(skip(self, body), fields(bucket = %self.bucket, size_bytes = body.len()))]
    pub async fn put(&self, key: &str, body: Bytes, content_type: &str) -> Result<PutResult> {
        let provider_response = self
            .store
            .put_object(&self.bucket, key, body, content_type)
            .await?;

        debug!(key = %key, "Photo stored");

        Ok(PutResult {
            object: self.object_for(key),
            provider_response,
        })
    }

    /// Whether writing `new_key` should remove `current` first.
    ///
    /// Only an object in this bucket and region, in the bucket owned by the
    /// running environment, and in the very slot being rewritten qualifies.
    pub fn supersedes<'a>(
        &self,
        current: Option<&'a StoredObject>,
        new_key: &str,
    ) -> Option<&'a StoredObject> {
        let current = current?;
        let same_location = current.bucket == self.bucket && current.region == self.region;
        let environment_owns_bucket = self.environment_bucket.as_deref() == Some(self.bucket.as_str());

        (same_location && environment_owns_bucket && current.key == new_key).then_some(current)
    }

    /// Delete `current` if writing `new_key` supersedes it; returns whether a delete ran
    #[instrument(skip(self, current), fields(bucket = %self.bucket))]
    pub async fn delete_if_superseded(
        &self,
        current: Option<&StoredObject>,
        new_key: &str,
    ) -> Result<bool> {
        match self.supersedes(current, new_key) {
            Some(old) => {
                self.store.delete_object(&old.bucket, &old.key).await?;
                debug!(key = %old.key, "Superseded photo deleted");
                metrics::counter!("census.photos.superseded_deleted").increment(1);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
