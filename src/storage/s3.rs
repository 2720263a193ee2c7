use async_trait::async_trait;
use aws_sdk_s3::Client;
use aws_sdk_s3::error::SdkError;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{BucketLocationConstraint, CreateBucketConfiguration};
use std::path::Path;
use std::time::Instant;
use tracing::{debug, error, info};

use crate::aws::classify;
use crate::config::StorageConfig;
use crate::error::{RemoteError, RemoteResult};
use super::{ObjectHead, ObjectStore, ObjectSummary, RemoteObjectRef};

/// S3 backed object store
#[derive(Clone)]
pub struct S3ObjectStore {
    client: Client,
    region: Option<String>,
}

impl S3ObjectStore {
    pub fn new(sdk_config: &aws_config::SdkConfig, storage: &StorageConfig) -> Self {
        let client = match &storage.endpoint_url {
            Some(endpoint) => {
                // S3-compatible providers need path-style addressing
                let config = aws_sdk_s3::config::Builder::from(sdk_config)
                    .endpoint_url(endpoint)
                    .force_path_style(true)
                    .build();
                Client::from_conf(config)
            }
            None => Client::new(sdk_config),
        };

        let region = sdk_config.region().map(|r| r.to_string());
        Self { client, region }
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn head_object(&self, bucket: &str, key: &str) -> RemoteResult<ObjectHead> {
        match self.client.head_object().bucket(bucket).key(key).send().await {
            Ok(output) => Ok(ObjectHead {
                etag: output.e_tag().unwrap_or_default().to_string(),
                size: output.content_length().unwrap_or_default().max(0) as u64,
            }),
            Err(SdkError::ServiceError(e)) if e.err().is_not_found() => {
                Err(RemoteError::NotFound(format!("s3://{}/{}", bucket, key)))
            }
            Err(e) => Err(classify(e)),
        }
    }

    async fn put_object(&self, bucket: &str, key: &str, path: &Path) -> RemoteResult<RemoteObjectRef> {
        let start = Instant::now();
        let body = ByteStream::from_path(path)
            .await
            .map_err(|e| RemoteError::Invalid(format!("cannot stream {}: {}", path.display(), e)))?;

        let output = self
            .client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(body)
            .send()
            .await
            .map_err(|e| {
                let err = classify(e);
                error!(
                    error = %err,
                    bucket = %bucket,
                    key = %key,
                    duration_ms = start.elapsed().as_secs_f64() * 1000.0,
                    "S3 upload failed"
                );
                err
            })?;

        info!(
            bucket = %bucket,
            key = %key,
            duration_ms = start.elapsed().as_secs_f64() * 1000.0,
            "S3 upload successful"
        );

        Ok(RemoteObjectRef {
            bucket: bucket.to_string(),
            key: key.to_string(),
            etag: output.e_tag().unwrap_or_default().trim_matches('"').to_string(),
        })
    }

    async fn get_object(&self, bucket: &str, key: &str) -> RemoteResult<Vec<u8>> {
        let response = match self.client.get_object().bucket(bucket).key(key).send().await {
            Ok(response) => response,
            Err(SdkError::ServiceError(e)) if e.err().is_no_such_key() => {
                return Err(RemoteError::NotFound(format!("s3://{}/{}", bucket, key)));
            }
            Err(e) => return Err(classify(e)),
        };

        let data = response
            .body
            .collect()
            .await
            .map_err(|e| RemoteError::Transient(format!("reading s3://{}/{}: {}", bucket, key, e)))?;

        Ok(data.into_bytes().to_vec())
    }

    async fn head_bucket(&self, bucket: &str) -> RemoteResult<()> {
        match self.client.head_bucket().bucket(bucket).send().await {
            Ok(_) => Ok(()),
            Err(SdkError::ServiceError(e)) if e.err().is_not_found() => {
                Err(RemoteError::NotFound(format!("bucket {}", bucket)))
            }
            Err(e) => Err(classify(e)),
        }
    }

    async fn create_bucket(&self, bucket: &str) -> RemoteResult<()> {
        let mut request = self.client.create_bucket().bucket(bucket);

        // us-east-1 rejects an explicit location constraint
        if let Some(region) = self.region.as_deref().filter(|r| *r != "us-east-1") {
            let configuration = CreateBucketConfiguration::builder()
                .location_constraint(BucketLocationConstraint::from(region))
                .build();
            request = request.create_bucket_configuration(configuration);
        }

        match request.send().await {
            Ok(_) => {
                info!("Bucket '{}' created", bucket);
                Ok(())
            }
            Err(SdkError::ServiceError(e)) if e.err().is_bucket_already_owned_by_you() => {
                Err(RemoteError::Conflict(format!("bucket {}", bucket)))
            }
            Err(e) => Err(classify(e)),
        }
    }

    async fn list_objects(&self, bucket: &str, prefix: &str) -> RemoteResult<Vec<ObjectSummary>> {
        let mut summaries = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let output = self
                .client
                .list_objects_v2()
                .bucket(bucket)
                .prefix(prefix)
                .set_continuation_token(continuation.take())
                .send()
                .await
                .map_err(classify)?;

            for object in output.contents() {
                if let Some(key) = object.key() {
                    summaries.push(ObjectSummary {
                        key: key.to_string(),
                        size: object.size().unwrap_or_default().max(0) as u64,
                        etag: object.e_tag().map(|t| t.trim_matches('"').to_string()),
                    });
                }
            }

            match output.next_continuation_token() {
                Some(token) if output.is_truncated().unwrap_or(false) => continuation = Some(token.to_string()),
                _ => break,
            }
        }

        debug!("Listed {} objects under s3://{}/{}", summaries.len(), bucket, prefix);
        Ok(summaries)
    }

    async fn delete_object(&self, bucket: &str, key: &str) -> RemoteResult<()> {
        self.client
            .delete_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(classify)?;
        debug!("Deleted s3://{}/{}", bucket, key);
        Ok(())
    }
}
