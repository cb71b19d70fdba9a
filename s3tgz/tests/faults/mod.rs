//! A [`s3tgz::Bucket`] wrapper around [`s3tgz::MemoryBucket`] which can be told to misbehave in
//! specific ways, and which records what was asked of it.
use bytes::Bytes;
use s3tgz::{Bucket, MemoryBucket, ObjectDescriptor, PartAck};
use std::ops::Range;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Clone, Debug)]
pub(crate) struct FaultyBucket {
    inner: MemoryBucket,
    state: Arc<FaultState>,
}

#[derive(Debug, Default)]
struct FaultState {
    /// Range reads of this key return one byte less than requested
    short_read_key: Mutex<Option<String>>,

    /// Uploading this part number fails
    failing_part: Mutex<Option<usize>>,

    /// Part uploads never complete
    stalled_parts: AtomicBool,

    range_reads: Mutex<Vec<(String, Range<u64>)>>,
    aborts: AtomicUsize,
    completions: AtomicUsize,
}

impl FaultyBucket {
    pub fn new(inner: MemoryBucket) -> Self {
        Self {
            inner,
            state: Arc::new(FaultState::default()),
        }
    }

    pub fn short_read(&self, key: &str) {
        *self.state.short_read_key.lock().unwrap() = Some(key.to_string());
    }

    pub fn fail_part(&self, part_number: usize) {
        *self.state.failing_part.lock().unwrap() = Some(part_number);
    }

    pub fn inner(&self) -> &MemoryBucket {
        &self.inner
    }

    pub fn stall_parts(&self) {
        self.state.stalled_parts.store(true, Ordering::SeqCst);
    }

    /// Every range read so far, in the order they were issued
    pub fn range_reads(&self) -> Vec<(String, Range<u64>)> {
        self.state.range_reads.lock().unwrap().clone()
    }

    pub fn aborts(&self) -> usize {
        self.state.aborts.load(Ordering::SeqCst)
    }

    pub fn completions(&self) -> usize {
        self.state.completions.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl Bucket for FaultyBucket {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn list_keys(&self, prefix: Option<&str>) -> s3tgz::Result<Vec<String>> {
        self.inner.list_keys(prefix).await
    }

    async fn head_object(&self, key: &str) -> s3tgz::Result<ObjectDescriptor> {
        self.inner.head_object(key).await
    }

    async fn read_object_part(&self, key: &str, byte_range: Range<u64>) -> s3tgz::Result<Bytes> {
        self.state
            .range_reads
            .lock()
            .unwrap()
            .push((key.to_string(), byte_range.clone()));

        let data = self.inner.read_object_part(key, byte_range).await?;

        let short = self.state.short_read_key.lock().unwrap().as_deref() == Some(key);
        if short && !data.is_empty() {
            Ok(data.slice(..data.len() - 1))
        } else {
            Ok(data)
        }
    }

    async fn create_upload(&self, key: &str) -> s3tgz::Result<String> {
        self.inner.create_upload(key).await
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: usize,
        data: Bytes,
    ) -> s3tgz::Result<PartAck> {
        if self.state.stalled_parts.load(Ordering::SeqCst) {
            futures::future::pending::<()>().await;
        }

        if *self.state.failing_part.lock().unwrap() == Some(part_number) {
            return Err(s3tgz::S3TgzError::PartUploadFailed {
                bucket: self.inner.name().to_string(),
                key: key.to_string(),
                part_number,
                reason: "injected failure".to_string(),
            });
        }

        self.inner
            .upload_part(key, upload_id, part_number, data)
            .await
    }

    async fn complete_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: Vec<PartAck>,
    ) -> s3tgz::Result<()> {
        self.state.completions.fetch_add(1, Ordering::SeqCst);
        self.inner.complete_upload(key, upload_id, parts).await
    }

    async fn abort_upload(&self, key: &str, upload_id: &str) -> s3tgz::Result<()> {
        self.state.aborts.fetch_add(1, Ordering::SeqCst);
        self.inner.abort_upload(key, upload_id).await
    }
}
