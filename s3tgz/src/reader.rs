//! Reading a single object as a continuous stream of bytes, regardless of how large it is.
use crate::create::CreateProgressCallback;
use crate::gauge::BufferGauge;
use crate::objstore::{Bucket, ObjectDescriptor};
use crate::Result;
use bytes::Bytes;
use futures::Stream;
use std::sync::Arc;
use tracing::debug;

struct ReaderState {
    bucket: Box<dyn Bucket>,
    descriptor: ObjectDescriptor,
    window: u64,
    gauge: BufferGauge,
    progress: Arc<dyn CreateProgressCallback>,
    offset: u64,
    part_number: usize,
}

/// Stream the contents of `descriptor`'s object, issuing one range request of at most `window`
/// bytes at a time.
///
/// The stream is pull based: the next range isn't requested until the previous one has been
/// consumed, so at most one window per object is in flight.  Every range must come back with
/// exactly the number of bytes requested, since the size of the object was already committed to
/// the archive before reading started; anything else fails the stream with
/// [`crate::S3TgzError::ShortRangeRead`].
///
/// A zero-length object produces an empty stream without making any requests.
pub(crate) fn ranged_object_stream(
    bucket: Box<dyn Bucket>,
    descriptor: ObjectDescriptor,
    window: u64,
    gauge: BufferGauge,
    progress: Arc<dyn CreateProgressCallback>,
) -> impl Stream<Item = Result<Bytes>> + Send + 'static {
    assert!(window > 0, "BUG: range window size must be validated");

    let state = ReaderState {
        bucket,
        descriptor,
        window,
        gauge,
        progress,
        offset: 0,
        part_number: 0,
    };

    futures::stream::try_unfold(state, |mut state| async move {
        if state.offset >= state.descriptor.size {
            return Ok(None);
        }

        let byte_range =
            state.offset..(state.offset + state.window).min(state.descriptor.size);
        let expected = byte_range.end - byte_range.start;

        debug!(key = %state.descriptor.key, ?byte_range, "Requesting object range");

        let data = state
            .bucket
            .read_object_part(&state.descriptor.key, byte_range.clone())
            .await?;

        if data.len() as u64 != expected {
            return crate::error::ShortRangeReadSnafu {
                key: state.descriptor.key.clone(),
                range_start: byte_range.start,
                range_end: byte_range.end,
                expected,
                actual: data.len() as u64,
            }
            .fail();
        }

        state.gauge.acquire(data.len());
        state.progress.input_part_downloaded(
            state.bucket.name(),
            &state.descriptor.key,
            state.part_number,
            data.len(),
        );

        state.offset = byte_range.end;
        state.part_number += 1;

        Ok(Some((data, state)))
    })
}
