//! The destinations the compressed archive can be written to.
//!
//! Whatever the destination, the archive pipeline sees a single [`SinkWriter`] which takes the
//! compressed bytes in order.  What happens when the archive is complete, or when the run fails,
//! depends on the destination and is handled by the matching [`SinkCompletion`].
use crate::upload::UploadHandle;
use crate::{Result, S3TgzError};
use snafu::{prelude::*, IntoError};
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncWrite, AsyncWriteExt, DuplexStream};
use tracing::{debug, instrument, warn};

/// The writer end of an archive destination.
pub(crate) enum SinkWriter {
    /// A file on the local filesystem
    File { file: tokio::fs::File, path: PathBuf },

    /// The write half of the duplex feeding a [`crate::upload`] chunker
    Upload(DuplexStream),

    /// Some arbitrary writer supplied by the caller
    Writer(Box<dyn AsyncWrite + Send + Unpin>),
}

/// Enough information about a [`SinkWriter`] to attach context to its write errors, which can be
/// kept after the writer itself has been moved into the packer.
#[derive(Clone, Debug)]
pub(crate) enum SinkKind {
    File(PathBuf),
    Stream,
}

impl SinkKind {
    /// Turn an I/O error from writing to the sink into the corresponding [`S3TgzError`].
    ///
    /// Errors that already carry an [`S3TgzError`] are passed through as is.
    pub fn tag_error(&self, source: io::Error) -> S3TgzError {
        match S3TgzError::from_io_error(source) {
            Ok(e) => e,
            Err(source) => match self {
                Self::File(path) => {
                    crate::error::WritingArchiveFileSnafu { path: path.clone() }.into_error(source)
                }
                Self::Stream => crate::error::ArchiveWriteSnafu.into_error(source),
            },
        }
    }
}

impl SinkWriter {
    /// Create (or truncate) the archive file at `path`, creating its parent directory first if it
    /// doesn't exist yet.
    #[instrument(err)]
    pub async fn create_file(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|_| crate::error::CreatingArchiveDirSnafu { path: parent })?;
        }

        let file = tokio::fs::File::create(path)
            .await
            .with_context(|_| crate::error::WritingArchiveFileSnafu { path })?;

        debug!(path = %path.display(), "Created archive file");

        Ok(Self::File {
            file,
            path: path.to_owned(),
        })
    }

    pub fn kind(&self) -> SinkKind {
        match self {
            Self::File { path, .. } => SinkKind::File(path.clone()),
            Self::Upload(_) | Self::Writer(_) => SinkKind::Stream,
        }
    }

    /// All of the archive has been written; make sure it's durable (for files) or signal EOF (for
    /// everything else).
    pub async fn finish(self) -> Result<()> {
        match self {
            Self::File { mut file, path } => {
                file.flush()
                    .await
                    .with_context(|_| crate::error::WritingArchiveFileSnafu { path: &path })?;
                file.sync_all()
                    .await
                    .with_context(|_| crate::error::WritingArchiveFileSnafu { path: &path })?;

                debug!(path = %path.display(), "Archive file synced to disk");
            }
            Self::Upload(mut duplex) => {
                duplex
                    .shutdown()
                    .await
                    .context(crate::error::ArchiveWriteSnafu)?;
            }
            Self::Writer(mut writer) => {
                writer
                    .flush()
                    .await
                    .context(crate::error::ArchiveWriteSnafu)?;
                writer
                    .shutdown()
                    .await
                    .context(crate::error::ArchiveWriteSnafu)?;
            }
        }

        Ok(())
    }
}

impl AsyncWrite for SinkWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Self::File { file, .. } => Pin::new(file).poll_write(cx, buf),
            Self::Upload(duplex) => Pin::new(duplex).poll_write(cx, buf),
            Self::Writer(writer) => Pin::new(writer).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::File { file, .. } => Pin::new(file).poll_flush(cx),
            Self::Upload(duplex) => Pin::new(duplex).poll_flush(cx),
            Self::Writer(writer) => Pin::new(writer).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::File { file, .. } => Pin::new(file).poll_shutdown(cx),
            Self::Upload(duplex) => Pin::new(duplex).poll_shutdown(cx),
            Self::Writer(writer) => Pin::new(writer).poll_shutdown(cx),
        }
    }
}

/// The other half of a destination: what to do once the archive is complete or has failed.
pub(crate) enum SinkCompletion {
    File { path: PathBuf },
    Upload(UploadHandle),
    Writer,
}

impl SinkCompletion {
    /// Commit the archive, once the [`SinkWriter`] has been finished successfully.
    ///
    /// For uploads this waits for all parts to be acknowledged and then completes the upload,
    /// returning the number of parts.
    ///
    /// If this is interrupted, [`Self::abort`] still abandons the destination.
    pub async fn commit(&mut self) -> Result<Option<usize>> {
        match self {
            Self::File { .. } | Self::Writer => Ok(None),
            Self::Upload(handle) => handle.finish().await.map(Some),
        }
    }

    /// Abandon the archive after a failure.
    ///
    /// The partial file is removed, or the multi-part upload aborted.  If the destination had
    /// already failed on its own, that error is returned.
    pub async fn abort(self) -> Option<S3TgzError> {
        match self {
            Self::File { path } => {
                // Best effort; the original error is what the caller needs to see
                match tokio::fs::remove_file(&path).await {
                    Ok(()) => debug!(path = %path.display(), "Removed partial archive file"),
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => {
                        warn!(path = %path.display(), err = %e, "Unable to remove partial archive file")
                    }
                }

                None
            }
            Self::Upload(handle) => handle.abort().await,
            Self::Writer => None,
        }
    }
}
