//! Abstraction over the object storage systems that archive inputs are read from, and that
//! archives can be uploaded to.
use crate::{Config, Result};
use dyn_clone::DynClone;
use std::{ops::Range, sync::Arc};
use url::Url;

pub mod memory;
mod s3;

/// An object storage system like S3.
///
/// Not all object storage systems expose an S3-compatible API, so to ensure we can add support for
/// those other systems in the future, the object storage implementation is abstracted behind a
/// trait.
///
/// Use [`ObjectStorageFactory`] to create an instance of this trait.
///
/// Note that all implementations are trivially cloneable such that the cost of a clone is the cost
/// of increasing the ref count on an `Arc`
#[async_trait::async_trait]
pub(crate) trait ObjectStorage: DynClone + std::fmt::Debug + Sync + Send + 'static {
    /// Given a URL that contains a bucket (and possibly an object key or glob also), extract the
    /// bucket name, validate it against the underlying object storage system, and if it's valid
    /// then return the bucket to the caller
    async fn extract_bucket_from_url(&self, url: &Url) -> Result<Box<dyn Bucket>>;
}

dyn_clone::clone_trait_object!(ObjectStorage);

/// What a metadata probe reports about one object.
///
/// The size is authoritative: the archive entry for this object is declared with this size before
/// a single byte of the object is read, so reading any other number of bytes is an error.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ObjectDescriptor {
    pub key: String,
    pub size: u64,
}

/// The acknowledgment of one successfully uploaded part of a multi-part upload.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PartAck {
    /// Part number, starting from 1
    pub part_number: usize,

    /// The tag the object store assigned to this part, which must be presented again when the
    /// upload is completed
    pub e_tag: String,

    /// Size of the part in bytes
    pub size: usize,
}

/// A bucket which is like a namespace in which object storage systems store named objects.
///
/// This is the seam through which s3tgz talks to object storage: listing, metadata probes, ranged
/// reads, and multi-part uploads.  Besides the S3 implementation, [`memory::MemoryBucket`] keeps
/// everything in process memory, and callers can supply their own implementation with
/// [`crate::CreateArchiveJobBuilder::source_bucket`] and [`crate::TargetArchive::Bucket`].
///
/// Implementations should be trivially cloneable such that the cost of a clone is the cost of
/// increasing the ref count on an `Arc`
#[async_trait::async_trait]
pub trait Bucket: DynClone + std::fmt::Debug + Sync + Send + 'static {
    fn name(&self) -> &str;

    /// List the keys of all objects in this bucket, optionally only those starting with `prefix`.
    ///
    /// Keys are returned in the order the object store enumerates them.  Pagination, if any, is
    /// handled internally.
    async fn list_keys(&self, prefix: Option<&str>) -> Result<Vec<String>>;

    /// Query the size of the specified object.
    ///
    /// Fails with [`crate::S3TgzError::ObjectNotFound`] if the object doesn't exist (anymore).
    async fn head_object(&self, key: &str) -> Result<ObjectDescriptor>;

    /// Read a part of an object.
    ///
    /// This performs the read as a single network call, which means it's not suited for reading
    /// large (multiple hundreds of MB or more) data.  Large objects should be read with multiple
    /// calls for successive ranges.
    ///
    /// Implementations return the bytes the object store returned; checking that it's the amount
    /// that was asked for is the caller's job.
    async fn read_object_part(&self, key: &str, byte_range: Range<u64>) -> Result<bytes::Bytes>;

    /// Start a new multi-part upload of the object `key`, returning the upload ID.
    ///
    /// Always starts a fresh session, even if an earlier incomplete upload of the same key exists.
    async fn create_upload(&self, key: &str) -> Result<String>;

    /// Upload one part of a multi-part upload.  Part numbers start at 1.
    ///
    /// Parts can be uploaded concurrently and in any order.
    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: usize,
        data: bytes::Bytes,
    ) -> Result<PartAck>;

    /// Complete a multi-part upload, making the object visible.
    ///
    /// `parts` must list every part exactly once, in ascending order of part number.
    async fn complete_upload(&self, key: &str, upload_id: &str, parts: Vec<PartAck>) -> Result<()>;

    /// Abandon a multi-part upload, discarding any parts uploaded so far.
    async fn abort_upload(&self, key: &str, upload_id: &str) -> Result<()>;
}

dyn_clone::clone_trait_object!(Bucket);

/// Type which constructs [`ObjectStorage`] implementations on demand.
#[derive(Debug)]
pub(crate) struct ObjectStorageFactory {
    config: Config,
}

impl ObjectStorageFactory {
    pub fn new(config: Config) -> Arc<Self> {
        Arc::new(Self { config })
    }

    /// Given the URL to an object storage bucket, prefix, or object, determine which
    /// implementation handles that particular object storage technology and return an instance of
    /// it.
    ///
    /// If the URL isn't recognized as being supported by s3tgz, an error is returned
    #[allow(clippy::wrong_self_convention)] // For a factory object I think it's obvious what this means
    pub async fn from_url(&self, url: &Url) -> Result<Box<dyn ObjectStorage>> {
        if url.scheme() == "s3" {
            Ok(self.s3().await)
        } else {
            crate::error::UnsupportedObjectStorageSnafu { url: url.clone() }.fail()
        }
    }

    /// Return a [`ObjectStorage`] implementation for S3 or an S3-compatible API
    pub async fn s3(&self) -> Box<dyn ObjectStorage> {
        // Every call makes a new client.  Each `Client` object in the AWS SDK holds on to some
        // `hyper` resources which are tied to the tokio runtime it was created in, so sharing one
        // process-wide instance breaks as soon as more than one runtime is in play (as in tests).
        Box::new(s3::S3::new(self.config.clone()).await)
    }
}

/// Paths from URLs like `s3://bucket/prefix/object` always start with `/`, but that's not
/// actually part of the object key.  Fix such paths.
pub(crate) fn url_path_to_key(path: &str) -> &str {
    path.strip_prefix('/').unwrap_or(path)
}
