//! Uploading the compressed archive to object storage as a multi-part upload.
//!
//! The archive is written to the duplex returned by [`ChunkedUploadSink::start`], re-segmented
//! into parts by [`crate::writers::multipart`], and uploaded by a background task with a bounded
//! number of parts in flight.  Parts can be acknowledged in any order; the upload is only
//! completed once the caller commits it through the [`UploadHandle`], and is aborted otherwise.
use crate::create::CreateProgressCallback;
use crate::gauge::BufferGauge;
use crate::objstore::{Bucket, PartAck};
use crate::writers::{self, MultipartChunk};
use crate::{Config, Result, S3TgzError};
use futures::StreamExt;
use snafu::prelude::*;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::DuplexStream;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, instrument, warn};

/// S3 doesn't allow more parts than this in one multi-part upload
pub(crate) const MAX_UPLOAD_PARTS: usize = 10_000;

/// The acknowledged parts of a multi-part upload, by part number.
///
/// Parts complete in whatever order the object store gets to them, but completing the upload
/// requires all of them, in order, without gaps.
#[derive(Debug, Default)]
pub(crate) struct PartManifest {
    parts: BTreeMap<usize, PartAck>,
}

impl PartManifest {
    pub fn record(&mut self, ack: PartAck) {
        self.parts.insert(ack.part_number, ack);
    }

    pub fn len(&self) -> usize {
        self.parts.len()
    }

    /// Total size of all acknowledged parts
    pub fn total_size(&self) -> u64 {
        self.parts.values().map(|ack| ack.size as u64).sum()
    }

    /// The parts in the form needed to complete the upload, as long as they are numbered
    /// `1..=N` with none missing
    pub fn into_completed_parts(self, key: &str) -> Result<Vec<PartAck>> {
        let total_parts = self.parts.keys().next_back().copied().unwrap_or_default();

        for expected_part_number in 1..=total_parts.max(1) {
            ensure!(
                self.parts.contains_key(&expected_part_number),
                crate::error::IncompletePartManifestSnafu {
                    key,
                    missing_part: expected_part_number,
                    total_parts,
                }
            );
        }

        Ok(self.parts.into_values().collect())
    }
}

/// Controls the background upload task of a [`ChunkedUploadSink`].
///
/// Dropping the handle before the upload has completed aborts the upload.
pub(crate) struct UploadHandle {
    commit: Option<oneshot::Sender<()>>,
    cancel: oneshot::Sender<()>,
    result: oneshot::Receiver<Result<usize>>,
    /// Set once the task's result has been received
    finished: bool,
    key: String,
}

impl UploadHandle {
    /// Call once all of the archive has been written and the writer shut down.  Waits for the
    /// remaining parts to be uploaded, completes the upload, and returns the number of parts.
    ///
    /// If this future is dropped before it completes, the upload can still be stopped with
    /// [`Self::abort`].
    pub async fn finish(&mut self) -> Result<usize> {
        if let Some(commit) = self.commit.take() {
            // If the task already stopped, its result explains why
            let _ = commit.send(());
        }

        let result = (&mut self.result).await;
        self.finished = true;

        match result {
            Ok(result) => result,
            Err(_) => crate::error::UploadAbandonedSnafu { key: &self.key }.fail(),
        }
    }

    /// Abort the upload, even if [`Self::finish`] was already started and is waiting for the
    /// remaining parts.
    ///
    /// If the upload had already failed on its own, returns that error.
    pub async fn abort(self) -> Option<S3TgzError> {
        if self.finished {
            // `finish` already reported how the upload ended
            return None;
        }

        let _ = self.cancel.send(());
        drop(self.commit);

        match self.result.await {
            Ok(Err(S3TgzError::UploadAbandoned { .. })) | Ok(Ok(_)) | Err(_) => None,
            Ok(Err(e)) => Some(e),
        }
    }
}

/// The state of the background task uploading one archive.
pub(crate) struct ChunkedUploadSink {
    bucket: Box<dyn Bucket>,
    key: String,
    upload_id: String,
    upload_concurrency: usize,
    gauge: BufferGauge,
    progress: Arc<dyn CreateProgressCallback>,
}

impl ChunkedUploadSink {
    /// Start a new multi-part upload of `key`, returning the writer to write the archive to and the
    /// handle that controls the upload.
    ///
    /// A fresh upload session is always created; any earlier incomplete upload of the same key is
    /// left alone.
    #[instrument(skip(bucket, config, gauge, progress), fields(bucket = bucket.name()))]
    pub async fn start(
        bucket: Box<dyn Bucket>,
        key: &str,
        config: &Config,
        gauge: BufferGauge,
        progress: Arc<dyn CreateProgressCallback>,
    ) -> Result<(DuplexStream, UploadHandle)> {
        let upload_id = bucket.create_upload(key).await?;

        debug!(%upload_id, part_size = config.part_size_bytes(), "Started archive upload");

        let (writer, chunks) = writers::multipart(
            config.part_size_bytes(),
            config.upload_concurrency,
            gauge.clone(),
        );

        let sink = Self {
            bucket,
            key: key.to_string(),
            upload_id,
            upload_concurrency: config.upload_concurrency,
            gauge,
            progress,
        };

        let (commit_sender, commit_receiver) = oneshot::channel();
        let (cancel_sender, cancel_receiver) = oneshot::channel::<()>();
        let (result_sender, result_receiver) = oneshot::channel();

        tokio::spawn(async move {
            let result = tokio::select! {
                biased;

                result = sink.run(chunks, commit_receiver) => result,
                // Either an explicit abort or the handle was dropped
                _ = cancel_receiver => {
                    warn!(key = %sink.key, "Archive upload cancelled");
                    sink.abort().await;

                    crate::error::UploadAbandonedSnafu { key: &sink.key }.fail()
                }
            };

            let _ = result_sender.send(result);
        });

        Ok((
            writer,
            UploadHandle {
                commit: Some(commit_sender),
                cancel: cancel_sender,
                result: result_receiver,
                finished: false,
                key: key.to_string(),
            },
        ))
    }

    async fn run(
        &self,
        chunks: mpsc::Receiver<MultipartChunk>,
        commit: oneshot::Receiver<()>,
    ) -> Result<usize> {
        let started = Instant::now();

        let result = async {
            let manifest = self.upload_parts(chunks, commit).await?;
            let parts = manifest.len();
            let size = manifest.total_size();

            self.bucket
                .complete_upload(
                    &self.key,
                    &self.upload_id,
                    manifest.into_completed_parts(&self.key)?,
                )
                .await?;

            Ok::<_, S3TgzError>((parts, size))
        }
        .await;

        match result {
            Ok((parts, size)) => {
                let duration = started.elapsed();

                info!(key = %self.key, parts, size, ?duration, "Archive upload completed");
                self.progress.archive_upload_completed(size, duration);

                Ok(parts)
            }
            Err(e) => {
                self.abort().await;
                Err(e)
            }
        }
    }

    /// Upload every chunk, then wait for the commit signal.
    async fn upload_parts(
        &self,
        chunks: mpsc::Receiver<MultipartChunk>,
        mut commit: oneshot::Receiver<()>,
    ) -> Result<PartManifest> {
        let mut manifest = PartManifest::default();
        let mut committed = false;

        let uploads = tokio_stream::wrappers::ReceiverStream::new(chunks)
            .map(|chunk| self.upload_chunk(chunk))
            .buffer_unordered(self.upload_concurrency);
        futures::pin_mut!(uploads);

        loop {
            tokio::select! {
                ack = uploads.next() => match ack {
                    Some(ack) => {
                        let ack = ack?;
                        self.progress.archive_part_uploaded(ack.part_number, ack.size);
                        manifest.record(ack);
                    }
                    None => break,
                },
                signal = &mut commit, if !committed => match signal {
                    Ok(()) => committed = true,
                    Err(_) => return crate::error::UploadAbandonedSnafu { key: &self.key }.fail(),
                },
            }
        }

        if !committed {
            commit
                .await
                .map_err(|_| crate::error::UploadAbandonedSnafu { key: &self.key }.build())?;
        }

        Ok(manifest)
    }

    async fn upload_chunk(&self, chunk: MultipartChunk) -> Result<PartAck> {
        let size = chunk.data.len();

        if chunk.part_number > MAX_UPLOAD_PARTS {
            self.gauge.release(size);

            return crate::error::TooManyPartsSnafu {
                key: &self.key,
                max_parts: MAX_UPLOAD_PARTS,
            }
            .fail();
        }

        let result = self
            .bucket
            .upload_part(&self.key, &self.upload_id, chunk.part_number, chunk.data)
            .await;

        self.gauge.release(size);

        let ack = result?;
        debug!(key = %self.key, part_number = ack.part_number, size, "Uploaded archive part");

        Ok(ack)
    }

    async fn abort(&self) {
        match self.bucket.abort_upload(&self.key, &self.upload_id).await {
            Ok(()) => debug!(key = %self.key, upload_id = %self.upload_id, "Aborted archive upload"),
            Err(e) => {
                error!(key = %self.key, upload_id = %self.upload_id, err = %e, "Unable to abort archive upload")
            }
        }
    }
}
