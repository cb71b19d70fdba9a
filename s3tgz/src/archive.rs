//! Framing object data into tar entries.
//!
//! The `tar` crate only speaks blocking `Read` and `Write`, so the tar builder (and the gzip
//! encoder and destination writer underneath it) live in a worker on the blocking thread pool.
//! The async side drives it by sending [`PackerCommand`]s over a bounded channel; when the channel
//! is full the sender waits, which is how backpressure from a slow destination reaches the object
//! reader.
use crate::compress::{CompressionStage, CompressionTotals, PoisonHandle};
use crate::create::CreateProgressCallback;
use crate::gauge::BufferGauge;
use crate::sink::SinkWriter;
use crate::{Config, Result, S3TgzError};
use bytes::{Buf, Bytes};
use snafu::{prelude::*, IntoError};
use std::io::Read;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::io::SyncIoBridge;
use tracing::{debug, instrument, warn};

/// Mode bits of every entry in the archive
const ENTRY_MODE: u32 = 0o644;

/// Size of the name field in a tar header
const HEADER_NAME_LEN: usize = 100;

/// Name of the pseudo-entry which carries a GNU long name
const GNU_LONG_NAME_PATH: &[u8] = b"././@LongLink";

type ArchiveBuilder = tar::Builder<CompressionStage<SyncIoBridge<SinkWriter>>>;

enum PackerCommand {
    StartEntry { name: String, size: u64 },
    Data(Bytes),
    CloseEntry(oneshot::Sender<()>),
    Finish,
}

/// The outcome of a successfully finished archive
pub(crate) struct PackedArchive {
    /// The destination writer, with all of the compressed archive written to it
    pub writer: SinkWriter,

    pub totals: CompressionTotals,
}

/// Writes entries one after the other into a single tar stream, which is compressed and written
/// to a [`SinkWriter`].
pub(crate) struct ArchivePacker {
    commands: Option<mpsc::Sender<PackerCommand>>,
    worker: Option<JoinHandle<Result<PackedArchive>>>,
    poison: PoisonHandle,
    finalized: bool,
}

impl ArchivePacker {
    /// Start the packer worker writing to `writer`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(
        writer: SinkWriter,
        config: &Config,
        gauge: BufferGauge,
        progress: Arc<dyn CreateProgressCallback>,
    ) -> Self {
        let sink_kind = writer.kind();
        let stage = CompressionStage::new(
            SyncIoBridge::new(writer),
            sink_kind,
            config.compression_level,
            progress,
        );
        let poison = stage.poison_handle();

        let (sender, receiver) = mpsc::channel(config.entry_channel_depth);

        let worker = {
            let poison = poison.clone();
            tokio::task::spawn_blocking(move || pack_entries(stage, receiver, gauge, poison))
        };

        Self {
            commands: Some(sender),
            worker: Some(worker),
            poison,
            finalized: false,
        }
    }

    /// Begin a new entry called `name` which will contain exactly `size` bytes.
    ///
    /// The entry header is written right away.  The returned writer must be given exactly `size`
    /// bytes and then closed before another entry can be started.
    #[instrument(skip(self))]
    pub async fn start_entry(&mut self, name: &str, size: u64) -> Result<ArchiveEntryWriter<'_>> {
        ensure!(
            !self.finalized,
            crate::error::ArchiveFinalizedSnafu { name }
        );

        validate_entry_name(name)?;

        self.send(PackerCommand::StartEntry {
            name: name.to_string(),
            size,
        })
        .await?;

        Ok(ArchiveEntryWriter {
            packer: self,
            name: name.to_string(),
            declared_size: size,
            written: 0,
        })
    }

    /// Write the end of archive marker, finish compression, and hand back the destination writer.
    ///
    /// No entries can be added afterwards.
    pub async fn finish(&mut self) -> Result<PackedArchive> {
        ensure!(!self.finalized, crate::error::PackerStoppedSnafu);
        self.finalized = true;

        self.send(PackerCommand::Finish).await?;
        self.commands = None;

        // Keep the worker until it's done, so that if this is interrupted `abandon` can still wait
        // for it
        let joined = match self.worker.as_mut() {
            Some(worker) => worker.await,
            None => return crate::error::PackerStoppedSnafu.fail(),
        };
        self.worker = None;

        joined.context(crate::error::SpawnBlockingSnafu)?
    }

    /// Stop the packer after a failure elsewhere, making sure the destination doesn't receive a
    /// valid looking end of archive.
    ///
    /// Waits for the worker to exit, so that once this returns the destination writer has been
    /// released.  If the worker had failed on its own, returns that error.
    pub async fn abandon(mut self) -> Option<S3TgzError> {
        self.poison.poison();
        self.finalized = true;
        self.commands = None;

        let worker = self.worker.take()?;

        match worker.await {
            Ok(Ok(_)) => None,
            Ok(Err(S3TgzError::PackerStopped)) => None,
            Ok(Err(e)) => Some(e),
            Err(e) => Some(crate::error::SpawnBlockingSnafu.into_error(e)),
        }
    }

    async fn send(&mut self, command: PackerCommand) -> Result<()> {
        let sent = match &self.commands {
            Some(commands) => commands.send(command).await.is_ok(),
            None => false,
        };

        if sent {
            Ok(())
        } else {
            Err(self.worker_error().await)
        }
    }

    /// The worker has stopped taking commands, which means it failed.  Get the reason.
    async fn worker_error(&mut self) -> S3TgzError {
        self.commands = None;
        self.finalized = true;

        match self.worker.take() {
            Some(worker) => match worker.await {
                Ok(Err(e)) => e,
                Ok(Ok(_)) => S3TgzError::PackerStopped,
                Err(e) => crate::error::SpawnBlockingSnafu.into_error(e),
            },
            None => S3TgzError::PackerStopped,
        }
    }
}

/// One entry in the archive being written.
///
/// Borrows the packer mutably, so only one entry can be open at a time.  The number of bytes
/// written must match the size declared when the entry was started, which is checked both here
/// and again by the packer worker.
pub(crate) struct ArchiveEntryWriter<'a> {
    packer: &'a mut ArchivePacker,
    name: String,
    declared_size: u64,
    written: u64,
}

impl<'a> ArchiveEntryWriter<'a> {
    pub async fn write(&mut self, data: Bytes) -> Result<()> {
        let attempted = self.written + data.len() as u64;

        ensure!(
            attempted <= self.declared_size,
            crate::error::EntryOverflowSnafu {
                name: &self.name,
                declared_size: self.declared_size,
                attempted,
            }
        );

        self.written = attempted;
        self.packer.send(PackerCommand::Data(data)).await
    }

    /// Finish this entry, waiting until the packer has written all of it.
    pub async fn close(self) -> Result<()> {
        ensure!(
            self.written == self.declared_size,
            crate::error::EntryUnderflowSnafu {
                name: &self.name,
                declared_size: self.declared_size,
                written: self.written,
            }
        );

        let (ack_sender, ack_receiver) = oneshot::channel();
        self.packer
            .send(PackerCommand::CloseEntry(ack_sender))
            .await?;

        match ack_receiver.await {
            Ok(()) => {
                debug!(name = %self.name, size = self.declared_size, "Closed archive entry");
                Ok(())
            }
            Err(_) => Err(self.packer.worker_error().await),
        }
    }
}

/// Reject entry names that would unpack outside of the directory the archive is extracted to.
pub(crate) fn validate_entry_name(name: &str) -> Result<()> {
    let reason = if name.is_empty() {
        Some("the name is empty")
    } else if name.starts_with('/') {
        Some("absolute paths are not allowed")
    } else if name.split('/').any(|component| component == "..") {
        Some("`..` path components are not allowed")
    } else if name.contains('\0') {
        Some("the name contains a NUL byte")
    } else {
        None
    };

    match reason {
        Some(reason) => crate::error::InvalidEntryNameSnafu { name, reason }.fail(),
        None => Ok(()),
    }
}

/// Body of the blocking packer worker
fn pack_entries(
    stage: CompressionStage<SyncIoBridge<SinkWriter>>,
    mut commands: mpsc::Receiver<PackerCommand>,
    gauge: BufferGauge,
    poison: PoisonHandle,
) -> Result<PackedArchive> {
    let mut builder = tar::Builder::new(stage);

    // The builder writes the end of archive marker when it's dropped, so poison the stage before
    // that can happen on a failure path
    let packed = append_entries(&mut builder, &mut commands, &gauge).and_then(|()| {
        builder
            .finish()
            .map_err(|e| tag_io_error(e, |e| crate::error::CompressSnafu.into_error(e)))
    });

    if let Err(e) = packed {
        if !matches!(e, S3TgzError::PackerStopped) {
            warn!(err = %e, "Archive packer failed; abandoning archive");
        }

        poison.poison();
        return Err(e);
    }

    let stage = builder
        .into_inner()
        .map_err(|e| tag_io_error(e, |e| crate::error::CompressSnafu.into_error(e)))?;

    let (bridge, totals) = stage.finish()?;

    Ok(PackedArchive {
        writer: bridge.into_inner(),
        totals,
    })
}

fn append_entries(
    builder: &mut ArchiveBuilder,
    commands: &mut mpsc::Receiver<PackerCommand>,
    gauge: &BufferGauge,
) -> Result<()> {
    loop {
        match commands.blocking_recv() {
            Some(PackerCommand::StartEntry { name, size }) => {
                let mut header = tar::Header::new_gnu();
                header.set_size(size);
                header.set_mode(ENTRY_MODE);
                header.set_entry_type(tar::EntryType::Regular);
                header.set_mtime(
                    std::time::SystemTime::now()
                        .duration_since(std::time::UNIX_EPOCH)
                        .map(|since_epoch| since_epoch.as_secs())
                        .unwrap_or_default(),
                );

                let mut body = EntryBodyReader {
                    name: &name,
                    declared_size: size,
                    read: 0,
                    commands: &mut *commands,
                    gauge,
                    current: None,
                    ack: None,
                };

                // Copies the body until it signals EOF
                append_raw_name(builder, &mut header, &name)
                    .and_then(|()| {
                        header.set_cksum();
                        builder.append(&header, &mut body)
                    })
                    .map_err(|e| {
                        tag_io_error(e, |e| {
                            crate::error::TarAppendDataSnafu { name: &name }.into_error(e)
                        })
                    })?;

                let ack = body
                    .ack
                    .take()
                    .expect("BUG: entry body only reports EOF after the entry is closed");

                debug!(%name, size, "Appended entry to archive");

                // The entry writer may have been dropped in the meantime; nothing to do then
                let _ = ack.send(());
            }
            Some(PackerCommand::Finish) => {
                debug!("All entries appended; finishing archive");
                return Ok(());
            }
            Some(PackerCommand::Data(_)) | Some(PackerCommand::CloseEntry(_)) => {
                unreachable!("BUG: entry data sent without starting an entry")
            }
            None => {
                // The packer was dropped or abandoned before finishing
                return crate::error::PackerStoppedSnafu.fail();
            }
        }
    }
}

/// Store `name` in `header` byte for byte, preceded by a GNU long name entry if it doesn't fit in
/// the header.
///
/// `tar::Builder::append_data` normalizes paths (`./a` becomes `a`, `a//b` becomes `a/b`, trailing
/// slashes are dropped), which would rename keys and could map two keys to one entry name.
fn append_raw_name(
    builder: &mut ArchiveBuilder,
    header: &mut tar::Header,
    name: &str,
) -> std::io::Result<()> {
    let name = name.as_bytes();

    if name.len() > HEADER_NAME_LEN {
        let mut long_name = tar::Header::new_gnu();
        long_name.as_old_mut().name[..GNU_LONG_NAME_PATH.len()]
            .copy_from_slice(GNU_LONG_NAME_PATH);
        long_name.set_mode(ENTRY_MODE);
        long_name.set_uid(0);
        long_name.set_gid(0);
        long_name.set_mtime(0);
        // GNU tar counts the terminating NUL as part of the name
        long_name.set_size(name.len() as u64 + 1);
        long_name.set_entry_type(tar::EntryType::GNULongName);
        long_name.set_cksum();

        builder.append(&long_name, std::io::Read::chain(name, &[0u8][..]))?;
    }

    let len = name.len().min(HEADER_NAME_LEN);
    header.as_old_mut().name[..len].copy_from_slice(&name[..len]);

    Ok(())
}

/// Recover our own error from an I/O error that went through the `tar` or `flate2` crates, or
/// attach context to a foreign one.
fn tag_io_error(
    e: std::io::Error,
    otherwise: impl FnOnce(std::io::Error) -> S3TgzError,
) -> S3TgzError {
    S3TgzError::from_io_error(e).unwrap_or_else(otherwise)
}

/// `Read` impl which feeds the body of one entry to [`tar::Builder::append_data`], pulling data
/// off the command channel as it goes.
///
/// Reports EOF only once the entry has been closed after exactly the declared number of bytes.
/// Anything else is an error, because the header with the size has already been written.
struct EntryBodyReader<'a> {
    name: &'a str,
    declared_size: u64,
    read: u64,
    commands: &'a mut mpsc::Receiver<PackerCommand>,
    gauge: &'a BufferGauge,

    /// The chunk currently being consumed, and its size when it was received
    current: Option<(Bytes, usize)>,

    /// Set once the entry has been closed
    ack: Option<oneshot::Sender<()>>,
}

impl<'a> Read for EntryBodyReader<'a> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        loop {
            if let Some((chunk, chunk_size)) = &mut self.current {
                if !chunk.is_empty() {
                    let len = buf.len().min(chunk.len());
                    buf[..len].copy_from_slice(&chunk[..len]);
                    chunk.advance(len);
                    self.read += len as u64;

                    if chunk.is_empty() {
                        self.gauge.release(*chunk_size);
                        self.current = None;
                    }

                    return Ok(len);
                }

                self.current = None;
            }

            if self.ack.is_some() {
                return Ok(0);
            }

            match self.commands.blocking_recv() {
                Some(PackerCommand::Data(data)) => {
                    let attempted = self.read + data.len() as u64;

                    if attempted > self.declared_size {
                        return Err(S3TgzError::EntryOverflow {
                            name: self.name.to_string(),
                            declared_size: self.declared_size,
                            attempted,
                        }
                        .into_io_error());
                    }

                    let size = data.len();
                    self.current = Some((data, size));
                }
                Some(PackerCommand::CloseEntry(ack)) if self.read == self.declared_size => {
                    self.ack = Some(ack);
                    return Ok(0);
                }
                Some(_) => {
                    return Err(S3TgzError::EntryUnderflow {
                        name: self.name.to_string(),
                        declared_size: self.declared_size,
                        written: self.read,
                    }
                    .into_io_error());
                }
                None => return Err(S3TgzError::PackerStopped.into_io_error()),
            }
        }
    }
}
