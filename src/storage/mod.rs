// Object store abstraction
//
// - S3: aws-sdk-s3 backed store used by the CLI
// - Memory: in-process store that tags objects the way S3 does, for tests

pub mod memory;
pub mod s3;

use async_trait::async_trait;
use std::path::Path;

pub use memory::MemoryObjectStore;
pub use s3::S3ObjectStore;

use crate::error::RemoteResult;

/// Metadata returned by a HEAD request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectHead {
    pub etag: String,
    pub size: u64,
}

/// Reference to a stored object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteObjectRef {
    pub bucket: String,
    pub key: String,
    pub etag: String,
}

/// Entry of a prefix listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectSummary {
    pub key: String,
    pub size: u64,
    pub etag: Option<String>,
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Metadata of an object; `RemoteError::NotFound` when absent.
    async fn head_object(&self, bucket: &str, key: &str) -> RemoteResult<ObjectHead>;

    /// Upload a local file under `key`.
    async fn put_object(&self, bucket: &str, key: &str, path: &Path) -> RemoteResult<RemoteObjectRef>;

    /// Download an object's content.
    async fn get_object(&self, bucket: &str, key: &str) -> RemoteResult<Vec<u8>>;

    /// `RemoteError::NotFound` when the bucket does not exist.
    async fn head_bucket(&self, bucket: &str) -> RemoteResult<()>;

    /// Create a bucket. `RemoteError::Conflict` when it already exists.
    async fn create_bucket(&self, bucket: &str) -> RemoteResult<()>;

    /// All objects whose key starts with `prefix`.
    async fn list_objects(&self, bucket: &str, prefix: &str) -> RemoteResult<Vec<ObjectSummary>>;

    async fn delete_object(&self, bucket: &str, key: &str) -> RemoteResult<()>;
}

/// Object URI understood by the store: `s3://bucket/key`.
pub fn s3_uri(bucket: &str, key: &str) -> String {
    format!("s3://{}/{}", bucket, key)
}

/// Split an object URI into bucket and key.
///
/// Accepts `s3://bucket/key`, path-style `https://s3.<region>.amazonaws.com/bucket/key`
/// and virtual-hosted `https://bucket.s3.<region>.amazonaws.com/key`.
pub fn parse_object_uri(uri: &str) -> Option<(String, String)> {
    if let Some(rest) = uri.strip_prefix("s3://") {
        let (bucket, key) = rest.split_once('/')?;
        return (!bucket.is_empty() && !key.is_empty()).then(|| (bucket.to_string(), key.to_string()));
    }

    let rest = uri.strip_prefix("https://").or_else(|| uri.strip_prefix("http://"))?;
    let (host, path) = rest.split_once('/')?;
    if host.starts_with("s3.") || host.starts_with("s3-") {
        let (bucket, key) = path.split_once('/')?;
        (!bucket.is_empty() && !key.is_empty()).then(|| (bucket.to_string(), key.to_string()))
    } else {
        let (bucket, _) = host.split_once(".s3")?;
        (!bucket.is_empty() && !path.is_empty()).then(|| (bucket.to_string(), path.to_string()))
    }
}
