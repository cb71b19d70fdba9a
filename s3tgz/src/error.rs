use aws_sdk_s3::error::SdkError;
use snafu::prelude::*;
use std::path::PathBuf;
use url::Url;

pub type Result<T, E = S3TgzError> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum S3TgzError {
    #[snafu(display("The URL '{url}' doesn't correspond to any supported object storage technology.  Supported URL schemes are: s3"))]
    UnsupportedObjectStorage { url: Url },

    #[snafu(display("The S3 URL '{url}' is missing the bucket name"))]
    MissingBucket { url: Url },

    #[snafu(display("The S3 URL '{url}' must specify the name of the object to write, not just a bucket"))]
    MissingObjectKey { url: Url },

    #[snafu(display("Invalid configuration: {reason}"))]
    InvalidConfig { reason: String },

    #[snafu(display("No source bucket was specified for the archive"))]
    NoSource,

    #[snafu(display("The glob pattern '{pattern}' is invalid"))]
    InvalidGlobPattern {
        pattern: String,
        source: glob::PatternError,
    },

    #[snafu(display(
        "The S3 bucket '{bucket}' either doesn't exist, or your IAM identity is not granted access"
    ))]
    BucketInvalidOrNotAccessible {
        bucket: String,
        source: SdkError<aws_sdk_s3::operation::head_bucket::HeadBucketError>,
    },

    #[snafu(display("The bucket '{bucket}' doesn't exist"))]
    BucketNotFound { bucket: String },

    #[snafu(display("Error listing objects in bucket '{bucket}' with prefix '{prefix}'"))]
    ListObjects {
        bucket: String,
        prefix: String,
        source: SdkError<aws_sdk_s3::operation::list_objects_v2::ListObjectsV2Error>,
    },

    #[snafu(display("Error getting metadata about object '{key}' in bucket '{bucket}'"))]
    HeadObject {
        bucket: String,
        key: String,
        source: SdkError<aws_sdk_s3::operation::head_object::HeadObjectError>,
    },

    #[snafu(display("Object '{key}' in bucket '{bucket}' was listed but no longer exists"))]
    ObjectNotFound { bucket: String, key: String },

    #[snafu(display("Object store did not report a size for object '{key}' in bucket '{bucket}'"))]
    ObjectSizeMissing { bucket: String, key: String },

    #[snafu(display("Error reading object '{key}' in bucket '{bucket}'"))]
    GetObject {
        bucket: String,
        key: String,
        source: SdkError<aws_sdk_s3::operation::get_object::GetObjectError>,
    },

    #[snafu(display("Error reading byte stream for object '{key}' in bucket '{bucket}'"))]
    ReadByteStream {
        bucket: String,
        key: String,
        source: aws_sdk_s3::primitives::ByteStreamError,
    },

    #[snafu(display("Range read of object '{key}' bytes {range_start}..{range_end} returned {actual} bytes instead of {expected}"))]
    ShortRangeRead {
        key: String,
        range_start: u64,
        range_end: u64,
        expected: u64,
        actual: u64,
    },

    #[snafu(display("Object '{key}' in bucket '{bucket}' disappeared while it was being read"))]
    ObjectVanished { bucket: String, key: String },

    #[snafu(display("Archive entry '{name}' declared {declared_size} bytes but {attempted} bytes were written to it"))]
    EntryOverflow {
        name: String,
        declared_size: u64,
        attempted: u64,
    },

    #[snafu(display("Archive entry '{name}' declared {declared_size} bytes but was closed after only {written} bytes"))]
    EntryUnderflow {
        name: String,
        declared_size: u64,
        written: u64,
    },

    #[snafu(display("Cannot add entry '{name}'; the archive has already been finalized"))]
    ArchiveFinalized { name: String },

    #[snafu(display("'{name}' can't be used as an archive entry name: {reason}"))]
    InvalidEntryName { name: String, reason: String },

    #[snafu(display("Error appending entry '{name}' to the tar archive"))]
    TarAppendData {
        name: String,
        source: std::io::Error,
    },

    #[snafu(display("Error compressing the archive"))]
    Compress { source: std::io::Error },

    #[snafu(display("Error creating directory '{}' for the archive", path.display()))]
    CreatingArchiveDir {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("Error writing archive file '{}'", path.display()))]
    WritingArchiveFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("Error writing compressed archive data to its destination"))]
    ArchiveWrite { source: std::io::Error },

    #[snafu(display("Error starting multi-part upload of object '{key}' to bucket '{bucket}'"))]
    CreateMultipartUpload {
        bucket: String,
        key: String,
        source: SdkError<aws_sdk_s3::operation::create_multipart_upload::CreateMultipartUploadError>,
    },

    #[snafu(display("Error uploading part {part_number} of object '{key}' to bucket '{bucket}'"))]
    UploadPart {
        bucket: String,
        key: String,
        part_number: usize,
        source: SdkError<aws_sdk_s3::operation::upload_part::UploadPartError>,
    },

    #[snafu(display(
        "Part {part_number} of object '{key}' in bucket '{bucket}' was rejected: {reason}"
    ))]
    PartUploadFailed {
        bucket: String,
        key: String,
        part_number: usize,
        reason: String,
    },

    #[snafu(display("Upload of part {part_number} of object '{key}' in bucket '{bucket}' didn't return an ETag"))]
    PartETagMissing {
        bucket: String,
        key: String,
        part_number: usize,
    },

    #[snafu(display("Error completing multi-part upload of object '{key}' to bucket '{bucket}'"))]
    CompleteMultipartUpload {
        bucket: String,
        key: String,
        source: SdkError<
            aws_sdk_s3::operation::complete_multipart_upload::CompleteMultipartUploadError,
        >,
    },

    #[snafu(display("Error aborting multi-part upload of object '{key}' to bucket '{bucket}'"))]
    AbortMultipartUpload {
        bucket: String,
        key: String,
        source: SdkError<aws_sdk_s3::operation::abort_multipart_upload::AbortMultipartUploadError>,
    },

    #[snafu(display(
        "Multi-part upload '{upload_id}' of object '{key}' in bucket '{bucket}' doesn't exist"
    ))]
    UploadSessionNotFound {
        bucket: String,
        key: String,
        upload_id: String,
    },

    #[snafu(display("Multi-part upload of '{key}' is missing part {missing_part} of {total_parts}"))]
    IncompletePartManifest {
        key: String,
        missing_part: usize,
        total_parts: usize,
    },

    #[snafu(display("The archive '{key}' needs more than {max_parts} parts; increase the part size"))]
    TooManyParts { key: String, max_parts: usize },

    #[snafu(display("The upload task for '{key}' exited without reporting a result"))]
    UploadAbandoned { key: String },

    #[snafu(display("Error spawning blocking task"))]
    SpawnBlocking { source: tokio::task::JoinError },

    #[snafu(display("Error spawning async task"))]
    Spawn { source: tokio::task::JoinError },

    #[snafu(display("The archive packer stopped accepting data"))]
    PackerStopped,

    #[snafu(display("The operation was aborted"))]
    Aborted,
}

/// Coarse classification of [`S3TgzError`] by the pipeline stage that failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Bad URL, bad config, or nothing to archive
    Config,

    /// The bucket couldn't be accessed or its objects couldn't be listed
    Enumeration,

    /// Fetching the metadata of an object failed
    Probe,

    /// Reading object data failed or returned the wrong amount of data
    Transfer,

    /// An archive entry would have been written with the wrong size or name
    Framing,

    /// The gzip compressor failed
    Compression,

    /// Writing the archive to its destination failed
    Sink,

    /// Task failures, aborts, and other failures not tied to a specific stage
    Internal,
}

impl S3TgzError {
    /// The stage of the archive pipeline this error belongs to
    pub fn kind(&self) -> ErrorKind {
        use S3TgzError::*;

        match self {
            UnsupportedObjectStorage { .. }
            | MissingBucket { .. }
            | MissingObjectKey { .. }
            | InvalidConfig { .. }
            | NoSource => ErrorKind::Config,

            InvalidGlobPattern { .. }
            | BucketInvalidOrNotAccessible { .. }
            | BucketNotFound { .. }
            | ListObjects { .. } => ErrorKind::Enumeration,

            HeadObject { .. } | ObjectNotFound { .. } | ObjectSizeMissing { .. } => {
                ErrorKind::Probe
            }

            GetObject { .. }
            | ReadByteStream { .. }
            | ShortRangeRead { .. }
            | ObjectVanished { .. } => ErrorKind::Transfer,

            EntryOverflow { .. }
            | EntryUnderflow { .. }
            | ArchiveFinalized { .. }
            | InvalidEntryName { .. }
            | TarAppendData { .. } => ErrorKind::Framing,

            Compress { .. } => ErrorKind::Compression,

            CreatingArchiveDir { .. }
            | WritingArchiveFile { .. }
            | ArchiveWrite { .. }
            | CreateMultipartUpload { .. }
            | UploadPart { .. }
            | PartUploadFailed { .. }
            | PartETagMissing { .. }
            | CompleteMultipartUpload { .. }
            | AbortMultipartUpload { .. }
            | UploadSessionNotFound { .. }
            | IncompletePartManifest { .. }
            | TooManyParts { .. }
            | UploadAbandoned { .. } => ErrorKind::Sink,

            SpawnBlocking { .. } | Spawn { .. } | PackerStopped | Aborted => ErrorKind::Internal,
        }
    }

    /// Wrap this error in a [`std::io::Error`] so it can pass through the `Read`/`Write` based
    /// `tar` and `flate2` APIs, and be recovered intact with [`Self::from_io_error`].
    pub(crate) fn into_io_error(self) -> std::io::Error {
        std::io::Error::new(std::io::ErrorKind::Other, self)
    }

    /// If `e` wraps an [`S3TgzError`] (see [`Self::into_io_error`]), unwrap it.  Otherwise give the
    /// I/O error back unchanged.
    pub(crate) fn from_io_error(e: std::io::Error) -> Result<Self, std::io::Error> {
        let wraps_ours = e
            .get_ref()
            .map(|inner| inner.is::<S3TgzError>())
            .unwrap_or(false);

        if wraps_ours {
            let inner = e
                .into_inner()
                .expect("BUG: error was just checked to have an inner error");

            Ok(*inner
                .downcast::<S3TgzError>()
                .expect("BUG: error was just checked to be S3TgzError"))
        } else {
            Err(e)
        }
    }
}
