use async_trait::async_trait;
use md5::{Digest, Md5};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::error::{RemoteError, RemoteResult};
use crate::etag::{DEFAULT_MULTIPART_PART_SIZE, multipart_etag_of};
use super::{ObjectHead, ObjectStore, ObjectSummary, RemoteObjectRef};

#[derive(Default)]
struct State {
    buckets: HashSet<String>,
    objects: BTreeMap<(String, String), (Vec<u8>, String)>,
}

/// In-process object store.
///
/// Objects at or above the multipart threshold get a multipart ETag built
/// with the configured part size, smaller objects a plain MD5.
pub struct MemoryObjectStore {
    state: Mutex<State>,
    multipart_threshold: u64,
    part_size: u64,
    puts: AtomicUsize,
    bucket_creates: AtomicUsize,
}

impl Default for MemoryObjectStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::with_multipart(DEFAULT_MULTIPART_PART_SIZE, DEFAULT_MULTIPART_PART_SIZE)
    }

    pub fn with_multipart(threshold: u64, part_size: u64) -> Self {
        Self {
            state: Mutex::new(State::default()),
            multipart_threshold: threshold,
            part_size,
            puts: AtomicUsize::new(0),
            bucket_creates: AtomicUsize::new(0),
        }
    }

    /// Number of `put_object` calls served so far.
    pub fn put_count(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }

    /// Number of `create_bucket` calls that created a bucket.
    pub fn bucket_create_count(&self) -> usize {
        self.bucket_creates.load(Ordering::SeqCst)
    }

    /// Store bytes directly, bypassing the put counter.
    pub fn insert(&self, bucket: &str, key: &str, data: Vec<u8>) {
        let etag = self.etag_for(&data);
        let mut state = self.lock();
        state.buckets.insert(bucket.to_string());
        state.objects.insert((bucket.to_string(), key.to_string()), (data, etag));
    }

    pub fn keys(&self, bucket: &str) -> Vec<String> {
        self.lock()
            .objects
            .keys()
            .filter(|(b, _)| b == bucket)
            .map(|(_, k)| k.clone())
            .collect()
    }

    fn etag_for(&self, data: &[u8]) -> String {
        if data.len() as u64 >= self.multipart_threshold {
            multipart_etag_of(data, self.part_size)
        } else {
            hex::encode(Md5::digest(data))
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn require_bucket(state: &State, bucket: &str) -> RemoteResult<()> {
        if state.buckets.contains(bucket) {
            Ok(())
        } else {
            Err(RemoteError::NotFound(format!("bucket {}", bucket)))
        }
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn head_object(&self, bucket: &str, key: &str) -> RemoteResult<ObjectHead> {
        let state = self.lock();
        Self::require_bucket(&state, bucket)?;
        state
            .objects
            .get(&(bucket.to_string(), key.to_string()))
            .map(|(data, etag)| ObjectHead {
                etag: format!("\"{}\"", etag),
                size: data.len() as u64,
            })
            .ok_or_else(|| RemoteError::NotFound(format!("{}/{}", bucket, key)))
    }

    async fn put_object(&self, bucket: &str, key: &str, path: &Path) -> RemoteResult<RemoteObjectRef> {
        let data = tokio::fs::read(path)
            .await
            .map_err(|e| RemoteError::Invalid(format!("cannot read {}: {}", path.display(), e)))?;
        let etag = self.etag_for(&data);

        let mut state = self.lock();
        Self::require_bucket(&state, bucket)?;
        state
            .objects
            .insert((bucket.to_string(), key.to_string()), (data, etag.clone()));
        self.puts.fetch_add(1, Ordering::SeqCst);

        Ok(RemoteObjectRef {
            bucket: bucket.to_string(),
            key: key.to_string(),
            etag,
        })
    }

    async fn get_object(&self, bucket: &str, key: &str) -> RemoteResult<Vec<u8>> {
        let state = self.lock();
        state
            .objects
            .get(&(bucket.to_string(), key.to_string()))
            .map(|(data, _)| data.clone())
            .ok_or_else(|| RemoteError::NotFound(format!("{}/{}", bucket, key)))
    }

    async fn head_bucket(&self, bucket: &str) -> RemoteResult<()> {
        Self::require_bucket(&self.lock(), bucket)
    }

    async fn create_bucket(&self, bucket: &str) -> RemoteResult<()> {
        let mut state = self.lock();
        if !state.buckets.insert(bucket.to_string()) {
            return Err(RemoteError::Conflict(format!("bucket {}", bucket)));
        }
        self.bucket_creates.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn list_objects(&self, bucket: &str, prefix: &str) -> RemoteResult<Vec<ObjectSummary>> {
        let state = self.lock();
        Self::require_bucket(&state, bucket)?;
        Ok(state
            .objects
            .iter()
            .filter(|((b, k), _)| b == bucket && k.starts_with(prefix))
            .map(|((_, k), (data, etag))| ObjectSummary {
                key: k.clone(),
                size: data.len() as u64,
                etag: Some(etag.clone()),
            })
            .collect())
    }

    async fn delete_object(&self, bucket: &str, key: &str) -> RemoteResult<()> {
        self.lock().objects.remove(&(bucket.to_string(), key.to_string()));
        Ok(())
    }
}
