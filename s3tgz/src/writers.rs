//! A helper which constructs a [`tokio::io::AsyncWrite`] impl that collects the written bytes into
//! [`MultipartChunk`] structs and then yields them on a channel for some other async worker to
//! consume.
//!
//! [`multipart`] breaks up the written data into chunks of a certain size for uploading to object
//! storage via the multipart upload APIs.

use crate::gauge::BufferGauge;
use bytes::Bytes;
use tokio::{
    io::{AsyncReadExt, DuplexStream},
    sync::mpsc,
};
use tracing::{debug, warn};

#[derive(Debug)]
pub(crate) struct MultipartChunk {
    /// The part number of the chunk starting from 1, as multi-part uploads expect.
    pub part_number: usize,

    /// The contents of this chunk
    pub data: Bytes,
}

/// Construct a special kind of [`tokio::io::AsyncWrite`] implementation which internally buffers
/// written data into the multipart chunk size before sending it to a channel where some worker
/// task will presumably be waiting to operate on it.
///
/// Every chunk is exactly `multipart_chunk_size` bytes except the last one.  If nothing at all
/// is written, a single empty chunk is produced, since a multi-part upload needs at least one
/// part.
///
/// Each chunk is counted against `gauge` when it's produced; whoever consumes the chunk must
/// release it.
pub(crate) fn multipart(
    multipart_chunk_size: usize,
    chunks_channel_depth: usize,
    gauge: BufferGauge,
) -> (DuplexStream, mpsc::Receiver<MultipartChunk>) {
    let (bytes_sender, mut bytes_receiver) = tokio::io::duplex(multipart_chunk_size);
    let (chunks_sender, chunks_receiver) = mpsc::channel(chunks_channel_depth);

    let mut part_number = 1usize;

    tokio::spawn(async move {
        loop {
            let mut buffer = bytes::BytesMut::with_capacity(multipart_chunk_size);

            // Fill one part, or stop early at EOF (the writer half was shut down or dropped)
            while buffer.len() < multipart_chunk_size {
                let bytes_read = bytes_receiver
                    .read_buf(&mut buffer)
                    .await
                    .expect("BUG: Reads from DuplexStream are infallible");

                if bytes_read == 0 {
                    break;
                }
            }

            // A zero length chunk is only sent if it would be the only one
            let is_last = buffer.len() < multipart_chunk_size;
            if buffer.is_empty() && part_number > 1 {
                debug!("encountered end of duplex stream; worker task exiting");
                break;
            }

            gauge.acquire(buffer.len());

            let chunk = MultipartChunk {
                part_number,
                data: buffer.freeze(),
            };

            part_number += 1;

            // The uploader stopped taking parts, so it has failed or been aborted
            if let Err(mpsc::error::SendError(chunk)) = chunks_sender.send(chunk).await {
                gauge.release(chunk.data.len());
                warn!("chunks receiver was dropped; aborting the worker task");
                break;
            }

            if is_last {
                debug!(
                    parts = part_number - 1,
                    "encountered end of duplex stream; worker task exiting"
                );
                break;
            }
        }
    });

    (bytes_sender, chunks_receiver)
}
