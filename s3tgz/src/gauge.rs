//! Accounting of the bytes held in the pipeline's buffers at any one time.
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Shared counter of bytes that have been produced by one pipeline stage but not yet consumed by
/// the next one.
///
/// The range reader acquires each window when it's fetched and the packer releases it once the
/// window is written into the archive; the upload chunker acquires each part and the uploader
/// releases it when the part is acknowledged.  The high water mark is what bounds the memory use
/// of a run, and is reported in [`crate::CreateArchiveSummary::peak_buffered_bytes`].
#[derive(Clone, Debug, Default)]
pub(crate) struct BufferGauge {
    inner: Arc<GaugeInner>,
}

#[derive(Debug, Default)]
struct GaugeInner {
    current: AtomicU64,
    high_water: AtomicU64,
}

impl BufferGauge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire(&self, bytes: usize) {
        let current = self
            .inner
            .current
            .fetch_add(bytes as u64, Ordering::SeqCst)
            + bytes as u64;

        self.inner.high_water.fetch_max(current, Ordering::SeqCst);
    }

    pub fn release(&self, bytes: usize) {
        // Saturate rather than wrap if a release is ever double counted
        let _ = self
            .inner
            .current
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                Some(current.saturating_sub(bytes as u64))
            });
    }

    #[allow(dead_code)] // Only used in tests
    pub fn current(&self) -> u64 {
        self.inner.current.load(Ordering::SeqCst)
    }

    pub fn high_water(&self) -> u64 {
        self.inner.high_water.load(Ordering::SeqCst)
    }
}
