//! The gzip stage between the tar packer and the archive destination.
use crate::create::CreateProgressCallback;
use crate::sink::SinkKind;
use crate::{Result, S3TgzError};
use flate2::{write::GzEncoder, Compression, GzBuilder};
use snafu::IntoError;
use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Wraps a [`GzEncoder`] so that the gzip trailer is written exactly once, by
/// [`Self::finish`].
///
/// `flate2` writes the trailer when the encoder is dropped, which is not what we want when an
/// archive is abandoned halfway through: the destination would get what looks like a complete but
/// truncated `.tar.gz`.  So once [`PoisonHandle::poison`] has been called, nothing more reaches the
/// underlying writer, dropped or not.
pub(crate) struct CompressionStage<W: Write> {
    encoder: GzEncoder<SinkAdapter<W>>,
    poisoned: Arc<AtomicBool>,
    bytes_in: u64,
}

/// Handle which can poison a [`CompressionStage`] after it's been moved somewhere else
#[derive(Clone, Debug)]
pub(crate) struct PoisonHandle(Arc<AtomicBool>);

impl PoisonHandle {
    pub fn poison(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

/// Sizes of the archive before and after compression
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct CompressionTotals {
    pub bytes_in: u64,
    pub bytes_out: u64,
}

impl<W: Write> CompressionStage<W> {
    pub fn new(
        writer: W,
        sink_kind: SinkKind,
        level: u32,
        progress: Arc<dyn CreateProgressCallback>,
    ) -> Self {
        let poisoned = Arc::new(AtomicBool::new(false));

        let adapter = SinkAdapter {
            inner: writer,
            sink_kind,
            poisoned: poisoned.clone(),
            bytes_out: 0,
            progress,
        };

        Self {
            encoder: GzBuilder::new().write(adapter, Compression::new(level)),
            poisoned,
            bytes_in: 0,
        }
    }

    pub fn poison_handle(&self) -> PoisonHandle {
        PoisonHandle(self.poisoned.clone())
    }

    /// Write the gzip trailer, flush everything to the underlying writer and return it.
    pub fn finish(mut self) -> Result<(W, CompressionTotals)> {
        let bytes_in = self.bytes_in;

        // A failed finish must not be retried when the encoder is dropped
        if let Err(e) = self.encoder.try_finish() {
            self.poisoned.store(true, Ordering::SeqCst);
            return Err(compress_error(e));
        }

        let mut adapter = self.encoder.finish().map_err(compress_error)?;
        adapter.flush().map_err(compress_error)?;

        let totals = CompressionTotals {
            bytes_in,
            bytes_out: adapter.bytes_out,
        };

        debug!(
            bytes_in = totals.bytes_in,
            bytes_out = totals.bytes_out,
            "Compression finished"
        );

        Ok((adapter.inner, totals))
    }
}

impl<W: Write> Write for CompressionStage<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let written = self
            .encoder
            .write(buf)
            .map_err(|e| compress_error(e).into_io_error())?;
        self.bytes_in += written as u64;

        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.encoder
            .flush()
            .map_err(|e| compress_error(e).into_io_error())
    }
}

/// Errors from the writer below the encoder are already tagged by [`SinkAdapter`]; anything else
/// came from the compressor itself.
fn compress_error(e: io::Error) -> S3TgzError {
    S3TgzError::from_io_error(e)
        .unwrap_or_else(|e| crate::error::CompressSnafu.into_error(e))
}

/// The writer underneath the gzip encoder.
///
/// Counts and reports compressed bytes, attaches context to write errors, and refuses all writes
/// once poisoned.
struct SinkAdapter<W: Write> {
    inner: W,
    sink_kind: SinkKind,
    poisoned: Arc<AtomicBool>,
    bytes_out: u64,
    progress: Arc<dyn CreateProgressCallback>,
}

impl<W: Write> SinkAdapter<W> {
    fn check_poisoned(&self) -> io::Result<()> {
        if self.poisoned.load(Ordering::SeqCst) {
            Err(S3TgzError::PackerStopped.into_io_error())
        } else {
            Ok(())
        }
    }
}

impl<W: Write> Write for SinkAdapter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.check_poisoned()?;

        let written = self
            .inner
            .write(buf)
            .map_err(|e| self.sink_kind.tag_error(e).into_io_error())?;

        self.bytes_out += written as u64;
        self.progress.archive_bytes_written(written);

        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.check_poisoned()?;

        self.inner
            .flush()
            .map_err(|e| self.sink_kind.tag_error(e).into_io_error())
    }
}
