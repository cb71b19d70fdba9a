//! An implementation of [`Bucket`] which keeps its objects in process memory.
//!
//! Obviously not useful for large data sets, but handy to embed s3tgz in a test harness or to
//! archive data that some other part of a program has produced without a round trip through a
//! real object store.
use super::{Bucket, ObjectDescriptor, PartAck};
use crate::Result;
use bytes::{Bytes, BytesMut};
use std::collections::{BTreeMap, HashMap};
use std::ops::Range;
use std::sync::{Arc, Mutex};
use tracing::debug;

/// A bucket whose objects live in memory.
///
/// Keys are listed in lexicographical order, which is also what S3 does.
#[derive(Clone)]
pub struct MemoryBucket {
    inner: Arc<MemoryBucketInner>,
}

struct MemoryBucketInner {
    name: String,
    state: Mutex<MemoryBucketState>,
}

#[derive(Default)]
struct MemoryBucketState {
    objects: BTreeMap<String, Bytes>,
    uploads: HashMap<String, PendingUpload>,
    next_upload_id: u64,
}

struct PendingUpload {
    key: String,
    parts: BTreeMap<usize, (String, Bytes)>,
}

impl MemoryBucket {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(MemoryBucketInner {
                name: name.into(),
                state: Mutex::new(MemoryBucketState::default()),
            }),
        }
    }

    /// Store an object, replacing any existing object with the same key
    pub fn put_object(&self, key: impl Into<String>, data: impl Into<Bytes>) {
        self.state().objects.insert(key.into(), data.into());
    }

    /// Get the contents of an object, if it exists
    pub fn get_object(&self, key: &str) -> Option<Bytes> {
        self.state().objects.get(key).cloned()
    }

    /// Remove an object, returning `true` if it existed
    pub fn delete_object(&self, key: &str) -> bool {
        self.state().objects.remove(key).is_some()
    }

    /// The number of multi-part uploads which have been started but neither completed nor aborted
    pub fn pending_upload_count(&self) -> usize {
        self.state().uploads.len()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MemoryBucketState> {
        // A panic while holding this lock can't leave the maps in a half-updated state, so a
        // poisoned lock is still safe to use
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn upload_not_found<T>(&self, key: &str, upload_id: &str) -> Result<T> {
        crate::error::UploadSessionNotFoundSnafu {
            bucket: self.inner.name.clone(),
            key: key.to_string(),
            upload_id: upload_id.to_string(),
        }
        .fail()
    }
}

impl std::fmt::Debug for MemoryBucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBucket")
            .field("name", &self.inner.name)
            .finish()
    }
}

#[async_trait::async_trait]
impl Bucket for MemoryBucket {
    fn name(&self) -> &str {
        &self.inner.name
    }

    async fn list_keys(&self, prefix: Option<&str>) -> Result<Vec<String>> {
        let keys = self
            .state()
            .objects
            .keys()
            .filter(|key| prefix.map(|prefix| key.starts_with(prefix)).unwrap_or(true))
            .cloned()
            .collect::<Vec<_>>();

        debug!(bucket = %self.inner.name, ?prefix, count = keys.len(), "Listed in-memory objects");

        Ok(keys)
    }

    async fn head_object(&self, key: &str) -> Result<ObjectDescriptor> {
        match self.state().objects.get(key) {
            Some(data) => Ok(ObjectDescriptor {
                key: key.to_string(),
                size: data.len() as u64,
            }),
            None => crate::error::ObjectNotFoundSnafu {
                bucket: self.inner.name.clone(),
                key: key.to_string(),
            }
            .fail(),
        }
    }

    async fn read_object_part(&self, key: &str, byte_range: Range<u64>) -> Result<Bytes> {
        let data = self.state().objects.get(key).cloned().ok_or_else(|| {
            crate::error::ObjectVanishedSnafu {
                bucket: self.inner.name.clone(),
                key: key.to_string(),
            }
            .build()
        })?;

        // Like a real object store, a range that runs past the end of the object is truncated
        let len = data.len() as u64;
        let start = byte_range.start.min(len) as usize;
        let end = byte_range.end.min(len) as usize;

        Ok(data.slice(start..end.max(start)))
    }

    async fn create_upload(&self, key: &str) -> Result<String> {
        let mut state = self.state();

        state.next_upload_id += 1;
        let upload_id = format!("upload-{}", state.next_upload_id);

        state.uploads.insert(
            upload_id.clone(),
            PendingUpload {
                key: key.to_string(),
                parts: BTreeMap::new(),
            },
        );

        debug!(bucket = %self.inner.name, key, %upload_id, "Started in-memory multi-part upload");

        Ok(upload_id)
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: usize,
        data: Bytes,
    ) -> Result<PartAck> {
        let mut state = self.state();

        let upload = match state.uploads.get_mut(upload_id) {
            Some(upload) if upload.key == key => upload,
            _ => return self.upload_not_found(key, upload_id),
        };

        let size = data.len();
        let e_tag = format!("\"{}-{}-{}\"", upload_id, part_number, size);
        upload.parts.insert(part_number, (e_tag.clone(), data));

        Ok(PartAck {
            part_number,
            e_tag,
            size,
        })
    }

    async fn complete_upload(&self, key: &str, upload_id: &str, parts: Vec<PartAck>) -> Result<()> {
        let mut state = self.state();

        let upload = match state.uploads.remove(upload_id) {
            Some(upload) if upload.key == key => upload,
            Some(upload) => {
                // Wrong key; put it back so the caller can still abort it
                state.uploads.insert(upload_id.to_string(), upload);
                return self.upload_not_found(key, upload_id);
            }
            None => return self.upload_not_found(key, upload_id),
        };

        let mut object = BytesMut::new();

        for (index, ack) in parts.iter().enumerate() {
            let expected_part_number = index + 1;

            let stored = upload
                .parts
                .get(&ack.part_number)
                .filter(|_| ack.part_number == expected_part_number);

            match stored {
                Some((e_tag, data)) if *e_tag == ack.e_tag => object.extend_from_slice(data),
                _ => {
                    // S3 would reject this completion request and keep the upload open
                    state.uploads.insert(upload_id.to_string(), upload);

                    return crate::error::IncompletePartManifestSnafu {
                        key: key.to_string(),
                        missing_part: expected_part_number,
                        total_parts: parts.len(),
                    }
                    .fail();
                }
            }
        }

        debug!(bucket = %self.inner.name, key, upload_id, parts = parts.len(), size = object.len(),
            "Completed in-memory multi-part upload");

        state.objects.insert(key.to_string(), object.freeze());

        Ok(())
    }

    async fn abort_upload(&self, key: &str, upload_id: &str) -> Result<()> {
        let mut state = self.state();

        match state.uploads.get(upload_id) {
            Some(upload) if upload.key == key => {
                state.uploads.remove(upload_id);

                debug!(bucket = %self.inner.name, key, upload_id, "Aborted in-memory multi-part upload");

                Ok(())
            }
            _ => self.upload_not_found(key, upload_id),
        }
    }
}
