//! Implementation of the operation which creates a tar archive from inputs stored in object
//! storage.
use crate::archive::ArchivePacker;
use crate::gauge::BufferGauge;
use crate::objstore::{Bucket, ObjectStorageFactory};
use crate::sink::{SinkCompletion, SinkWriter};
use crate::upload::ChunkedUploadSink;
use crate::{reader, Config, ErrorKind, Result, S3TgzError};
use futures::TryStreamExt;
use snafu::prelude::*;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWrite;
use tracing::{debug, info, info_span, instrument, warn, Instrument};
use url::Url;

/// Represents where we will write the target archive
pub enum TargetArchive {
    /// Write the tar archive to object storage at the specified URL.
    ///
    /// The URL must specify a bucket and a complete object name.
    ObjectStorage(Url),

    /// Write the tar archive to the local filesystem
    File(PathBuf),

    /// Write the tar archive to some arbitrary [`tokio::io::AsyncWrite`] impl.
    Writer(Box<dyn AsyncWrite + Send + Unpin>),

    /// Upload the tar archive to the object `key` in some [`Bucket`] implementation.
    Bucket { bucket: Box<dyn Bucket>, key: String },
}

impl std::fmt::Debug for TargetArchive {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ObjectStorage(url) => f.debug_tuple("ObjectStorage").field(url).finish(),
            Self::File(path) => f.debug_tuple("File").field(path).finish(),
            Self::Writer(_) => f
                .debug_tuple("Writer")
                .field(&"dyn AsyncWrite".to_string())
                .finish(),
            Self::Bucket { bucket, key } => f
                .debug_struct("Bucket")
                .field("bucket", &bucket.name())
                .field("key", key)
                .finish(),
        }
    }
}

/// Predicate which decides which of the listed objects go into the archive.
///
/// Filters only ever look at the object key.
#[derive(Clone)]
pub enum KeyFilter {
    /// Every object
    All,

    /// Only the object with exactly this key
    Exact(String),

    /// Objects whose keys start with this prefix
    Prefix(String),

    /// Objects whose keys end with this suffix, ie `.png`
    Suffix(String),

    /// Objects whose keys match a glob expression (using wildcards like `*` or `?`)
    Glob(glob::Pattern),

    /// Objects for which the closure returns `true`
    Custom(Arc<dyn Fn(&str) -> bool + Send + Sync>),
}

impl KeyFilter {
    pub fn glob(pattern: &str) -> Result<Self> {
        let pattern = glob::Pattern::new(pattern)
            .with_context(|_| crate::error::InvalidGlobPatternSnafu { pattern })?;

        Ok(Self::Glob(pattern))
    }

    pub fn custom(filter: impl Fn(&str) -> bool + Send + Sync + 'static) -> Self {
        Self::Custom(Arc::new(filter))
    }

    pub fn matches(&self, key: &str) -> bool {
        match self {
            Self::All => true,
            Self::Exact(exact) => key == exact,
            Self::Prefix(prefix) => key.starts_with(prefix.as_str()),
            Self::Suffix(suffix) => key.ends_with(suffix.as_str()),
            Self::Glob(pattern) => pattern.matches(key),
            Self::Custom(filter) => filter(key),
        }
    }

    /// The prefix every matching key is known to start with, which can be used to narrow down
    /// the listing
    fn listing_prefix(&self) -> Option<String> {
        match self {
            Self::Exact(prefix) | Self::Prefix(prefix) => Some(prefix.clone()),
            Self::Glob(pattern) => {
                let pattern = pattern.as_str();
                let literal = &pattern[..pattern.find(GLOB_CHARS).unwrap_or(pattern.len())];

                (!literal.is_empty()).then(|| literal.to_string())
            }
            Self::All | Self::Suffix(_) | Self::Custom(_) => None,
        }
    }

    /// Given the path part of an input URL, determine what kind of filter it describes.
    ///
    /// The "path" here is everything after the `s3://bucket/` part of the URL.  It could be empty
    /// or contain a prefix or object name or glob.
    fn from_url_path(path: &str) -> Result<Self> {
        let path = crate::objstore::url_path_to_key(path);

        if path.is_empty() {
            // There's nothing here just a bucket
            Ok(Self::All)
        } else if path.contains(GLOB_CHARS) {
            Self::glob(path)
        } else if path.ends_with('/') {
            Ok(Self::Prefix(path.to_string()))
        } else {
            // The only remaining possibility is that it's a single object key
            Ok(Self::Exact(path.to_string()))
        }
    }
}

const GLOB_CHARS: &[char] = &['*', '?', '[', ']'];

impl std::fmt::Debug for KeyFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::All => write!(f, "All"),
            Self::Exact(key) => f.debug_tuple("Exact").field(key).finish(),
            Self::Prefix(prefix) => f.debug_tuple("Prefix").field(prefix).finish(),
            Self::Suffix(suffix) => f.debug_tuple("Suffix").field(suffix).finish(),
            Self::Glob(pattern) => f.debug_tuple("Glob").field(&pattern.as_str()).finish(),
            Self::Custom(_) => f.debug_tuple("Custom").field(&"dyn Fn").finish(),
        }
    }
}

/// Where a run is in its life cycle.  Every transition is logged.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Listing,
    Probing,
    Streaming,
    Finalizing,
    Done,
    Failed,
}

fn transition(state: &mut RunState, next: RunState) {
    debug!(from = ?*state, to = ?next, "Archive job state changed");
    *state = next;
}

/// A trait which callers can implement to get detailed progress updates as archive creation is
/// progressing.
#[allow(unused_variables)]
pub trait CreateProgressCallback: Sync + Send {
    /// The archive destination is ready and `total_objects` objects are about to be archived
    fn archive_initialized(&self, total_objects: usize) {}

    /// The size of an input object has been determined, and its data is about to be read
    fn input_object_download_started(&self, bucket: &str, key: &str, size: u64) {}

    /// Part of the data of one of the input objects was downloaded from object storage, and is
    /// about to be written to the tar archive
    fn input_part_downloaded(&self, bucket: &str, key: &str, part_number: usize, part_size: usize) {
    }

    /// An entire input object was written successfully to a tar archive.
    ///
    /// That doesn't mean the data written has been uploaded to remote object storage yet, it could
    /// still be buffered locally.
    fn input_object_written(&self, bucket: &str, key: &str, size: u64) {}

    /// Compressed archive data was written to the destination.  Note that for object storage
    /// destinations this doesn't mean it's been uploaded yet.
    fn archive_bytes_written(&self, bytes_written: usize) {}

    /// The whole compressed archive has been written to the destination
    fn archive_writes_completed(&self, total_bytes_written: u64) {}

    /// A part of the archive was uploaded to object storage
    fn archive_part_uploaded(&self, part_number: usize, bytes_uploaded: usize) {}

    /// The multi-part upload of the archive was completed
    fn archive_upload_completed(&self, size: u64, duration: Duration) {}
}

/// What a successful run produced
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CreateArchiveSummary {
    /// Number of objects (and thus entries) in the archive
    pub total_objects: usize,

    /// Combined size of all of the objects
    pub total_object_bytes: u64,

    /// Size of the tar archive before compression
    pub archive_bytes: u64,

    /// Size of the compressed archive
    pub compressed_bytes: u64,

    /// How many parts the archive was uploaded in, if it was uploaded to object storage
    pub uploaded_parts: Option<usize>,

    /// The most data held in the pipeline's buffers at any one time
    pub peak_buffered_bytes: u64,
}

#[derive(Debug)]
pub struct CreateArchiveJobBuilder {
    config: Config,
    objstore_factory: Arc<ObjectStorageFactory>,
    target: TargetArchive,
    source: Option<Box<dyn Bucket>>,
    source_filter: KeyFilter,
    filter: KeyFilter,
}

impl CreateArchiveJobBuilder {
    /// Initialize a new create archive job builder, but don't yet start the job.
    pub fn new(config: Config, target: TargetArchive) -> Self {
        Self {
            objstore_factory: ObjectStorageFactory::new(config.clone()),
            config,
            target,
            source: None,
            source_filter: KeyFilter::All,
            filter: KeyFilter::All,
        }
    }

    /// Read the objects to archive from the bucket, prefix, object or glob in this URL.
    ///
    /// The URL will be parsed to extract the bucket name and object key, prefix or glob, then the
    /// object storage API will be queried to verify that the bucket is valid and accessible.
    pub async fn source_url(&mut self, url: &Url) -> Result<()> {
        debug!(%url, "Setting archive source");

        // From the URL determine what object storage provider to use for this particular input
        let objstore = self.objstore_factory.from_url(url).await?;

        // Validate the bucket and extract it from the URL
        let bucket = objstore.extract_bucket_from_url(url).await?;
        debug!(%url, ?bucket, "Confirmed bucket access for archive source");

        self.source_filter = KeyFilter::from_url_path(url.path())?;
        self.source = Some(bucket);

        Ok(())
    }

    /// Read the objects to archive from some [`Bucket`] implementation
    pub fn source_bucket(&mut self, bucket: Box<dyn Bucket>) {
        self.source = Some(bucket);
        self.source_filter = KeyFilter::All;
    }

    /// Only archive the objects whose keys pass this filter, in addition to any restrictions
    /// from the source URL
    pub fn filter(&mut self, filter: KeyFilter) {
        self.filter = filter;
    }

    /// Construct the actual archive creation job (but don't run it yet).
    ///
    /// This lists the source objects, which is a potentially long-running process if the source is
    /// a prefix or an entire bucket with a lot of objects.
    pub async fn build(self) -> Result<CreateArchiveJob> {
        self.config.validate()?;

        let bucket = self.source.context(crate::error::NoSourceSnafu)?;

        let mut state = RunState::Idle;
        transition(&mut state, RunState::Listing);

        let prefix = self.source_filter.listing_prefix();
        debug!(bucket = bucket.name(), ?prefix, source_filter = ?self.source_filter, filter = ?self.filter,
            "Listing objects to archive");

        let keys = bucket
            .list_keys(prefix.as_deref())
            .await?
            .into_iter()
            .filter(|key| self.source_filter.matches(key) && self.filter.matches(key))
            .collect::<Vec<_>>();

        debug!(object_count = keys.len(), "Listed all objects to archive");

        Ok(CreateArchiveJob {
            config: self.config,
            objstore_factory: self.objstore_factory,
            target: self.target,
            bucket,
            keys,
            state,
        })
    }
}

/// A job which will create a new tar archive from object store inputs.
#[derive(Debug)]
pub struct CreateArchiveJob {
    config: Config,
    objstore_factory: Arc<ObjectStorageFactory>,
    target: TargetArchive,
    bucket: Box<dyn Bucket>,
    keys: Vec<String>,
    state: RunState,
}

/// Running totals of the objects written into the archive
#[derive(Default)]
struct EntryTotals {
    objects: usize,
    bytes: u64,
}

impl CreateArchiveJob {
    /// The total number of objects included in this archive
    pub fn total_objects(&self) -> usize {
        self.keys.len()
    }

    /// The keys of the objects that will be archived, in archive order
    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    /// Alternative to [`Self::run`] which doesn't require a [`CreateProgressCallback`]
    /// implementation, for callers that do not care about progress information.
    pub async fn run_without_progress(
        self,
        abort: impl Future<Output = ()>,
    ) -> Result<CreateArchiveSummary> {
        // A dummy impl of CreateProgressCallback that doesn't do anything with any of the progress
        // updates
        struct NoProgress {}
        impl CreateProgressCallback for NoProgress {}

        self.run(abort, NoProgress {}).await
    }

    /// Run the job, returning only when the job has run to completion (or failed)
    ///
    /// Objects are written to the archive one at a time, in listing order.  If anything fails,
    /// the archive is abandoned: a partial local file is removed (on a best effort basis; writing
    /// the file is not atomic), and an object storage upload is aborted.  The first error is
    /// returned.
    ///
    /// If the `abort` future is completed, it's a signal that the job should be aborted.  The job
    /// is abandoned in the same way, and this method returns an abort error.
    pub async fn run<Abort, Progress>(
        self,
        abort: Abort,
        progress: Progress,
    ) -> Result<CreateArchiveSummary>
    where
        Abort: Future<Output = ()>,
        Progress: CreateProgressCallback + 'static,
    {
        let span = info_span!("create_archive", bucket = self.bucket.name(), objects = self.keys.len());

        self.run_instrumented(abort, Arc::new(progress))
            .instrument(span)
            .await
    }

    async fn run_instrumented(
        mut self,
        abort: impl Future<Output = ()>,
        progress: Arc<dyn CreateProgressCallback>,
    ) -> Result<CreateArchiveSummary> {
        info!(target = ?self.target, "Creating archive");

        let gauge = BufferGauge::new();
        let target = std::mem::replace(&mut self.target, TargetArchive::File(PathBuf::new()));

        let (writer, mut completion) =
            match Self::open_target(&self.objstore_factory, &self.config, target, &gauge, &progress)
                .await
            {
                Ok(opened) => opened,
                Err(e) => {
                    transition(&mut self.state, RunState::Failed);
                    return Err(e);
                }
            };

        progress.archive_initialized(self.keys.len());

        let mut packer = ArchivePacker::new(writer, &self.config, gauge.clone(), progress.clone());

        futures::pin_mut!(abort);

        let entries = Self::append_objects(
            &*self.bucket,
            &self.keys,
            &mut packer,
            &self.config,
            &gauge,
            &progress,
            &mut self.state,
        );

        let entries = tokio::select! {
            result = entries => result,
            _ = &mut abort => aborted(),
        };

        let result = match entries {
            Ok(totals) => {
                transition(&mut self.state, RunState::Finalizing);

                // Waiting for the last parts of an upload can take a while, so this can be aborted
                // too
                let finalize = async {
                    let archive = Self::finish_archive(&mut packer, &progress).await?;
                    let uploaded_parts = completion.commit().await?;

                    Ok::<_, S3TgzError>((totals, archive, uploaded_parts))
                };

                tokio::select! {
                    result = finalize => result,
                    _ = &mut abort => aborted(),
                }
            }
            Err(e) => Err(e),
        };

        match result {
            Ok((totals, archive, uploaded_parts)) => {
                transition(&mut self.state, RunState::Done);

                let summary = CreateArchiveSummary {
                    total_objects: totals.objects,
                    total_object_bytes: totals.bytes,
                    archive_bytes: archive.bytes_in,
                    compressed_bytes: archive.bytes_out,
                    uploaded_parts,
                    peak_buffered_bytes: gauge.high_water(),
                };

                info!(?summary, "Archive created");

                Ok(summary)
            }
            Err(e) => {
                transition(&mut self.state, RunState::Failed);

                // Stop the packer first so the destination writer is released before the
                // destination is cleaned up
                let packer_error = packer.abandon().await;
                let sink_error = completion.abort().await;

                Err(first_error(e, packer_error, sink_error))
            }
        }
    }

    /// Resolve the target into the writer the packer will write to, and what to do with it once
    /// the archive is done
    #[instrument(skip(objstore_factory, config, gauge, progress))]
    async fn open_target(
        objstore_factory: &ObjectStorageFactory,
        config: &Config,
        target: TargetArchive,
        gauge: &BufferGauge,
        progress: &Arc<dyn CreateProgressCallback>,
    ) -> Result<(SinkWriter, SinkCompletion)> {
        let (bucket, key) = match target {
            TargetArchive::ObjectStorage(url) => {
                let key = crate::objstore::url_path_to_key(url.path()).to_string();
                ensure!(
                    !key.is_empty() && !key.ends_with('/'),
                    crate::error::MissingObjectKeySnafu { url: url.clone() }
                );

                // Validate the URL and get a Bucket object in the bargain
                let objstore = objstore_factory.from_url(&url).await?;
                let bucket = objstore.extract_bucket_from_url(&url).await?;

                (bucket, key)
            }
            TargetArchive::Bucket { bucket, key } => (bucket, key),
            TargetArchive::File(path) => {
                let writer = SinkWriter::create_file(&path).await?;
                return Ok((writer, SinkCompletion::File { path }));
            }
            TargetArchive::Writer(writer) => {
                return Ok((SinkWriter::Writer(writer), SinkCompletion::Writer));
            }
        };

        let (writer, handle) =
            ChunkedUploadSink::start(bucket, &key, config, gauge.clone(), progress.clone())
                .await?;

        Ok((SinkWriter::Upload(writer), SinkCompletion::Upload(handle)))
    }

    /// Write every object into the archive, one after the other
    async fn append_objects(
        bucket: &dyn Bucket,
        keys: &[String],
        packer: &mut ArchivePacker,
        config: &Config,
        gauge: &BufferGauge,
        progress: &Arc<dyn CreateProgressCallback>,
        state: &mut RunState,
    ) -> Result<EntryTotals> {
        let mut totals = EntryTotals::default();

        for key in keys {
            transition(state, RunState::Probing);

            let descriptor = bucket.head_object(key).await?;
            progress.input_object_download_started(bucket.name(), key, descriptor.size);

            transition(state, RunState::Streaming);
            debug!(%key, size = descriptor.size, "Reading object and writing to tar archive");

            let size = descriptor.size;
            let mut entry = packer.start_entry(key, size).await?;

            let data = reader::ranged_object_stream(
                dyn_clone::clone_box(bucket),
                descriptor,
                config.range_window_bytes(),
                gauge.clone(),
                progress.clone(),
            );
            futures::pin_mut!(data);

            while let Some(bytes) = data.try_next().await? {
                entry.write(bytes).await?;
            }

            entry.close().await?;

            progress.input_object_written(bucket.name(), key, size);

            totals.objects += 1;
            totals.bytes += size;
        }

        debug!(
            objects = totals.objects,
            bytes = totals.bytes,
            "Completed processing of all input objects"
        );

        Ok(totals)
    }

    async fn finish_archive(
        packer: &mut ArchivePacker,
        progress: &Arc<dyn CreateProgressCallback>,
    ) -> Result<crate::compress::CompressionTotals> {
        let packed = packer.finish().await?;
        packed.writer.finish().await?;

        progress.archive_writes_completed(packed.totals.bytes_out);

        Ok(packed.totals)
    }
}

fn aborted<T>() -> Result<T> {
    warn!("Archive job aborted");
    crate::error::AbortedSnafu.fail()
}

/// Decide which of the errors from a failed run to report.
///
/// Normally that's the error that stopped the run.  But when the destination failed on its own,
/// the pipeline only sees that the destination stopped accepting writes, so the destination's own
/// error is the more useful one.
fn first_error(
    pipeline_error: S3TgzError,
    packer_error: Option<S3TgzError>,
    sink_error: Option<S3TgzError>,
) -> S3TgzError {
    let error = match (pipeline_error, packer_error, sink_error) {
        (S3TgzError::PackerStopped, Some(packer_error), _) => packer_error,
        (e @ S3TgzError::ArchiveWrite { .. }, _, Some(sink_error)) => {
            debug!(err = %e, "Archive write failed because the upload failed");
            sink_error
        }
        (e, packer_error, sink_error) => {
            for other in packer_error.iter().chain(sink_error.iter()) {
                debug!(err = %other, "Additional error while abandoning archive");
            }
            e
        }
    };

    if error.kind() != ErrorKind::Internal {
        warn!(err = %error, kind = ?error.kind(), "Archive creation failed");
    }

    error
}
