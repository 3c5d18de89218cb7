use std::sync::atomic::{AtomicU64, Ordering};

/// A snapshot of what the acquisition loop has seen since it was created.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AcquisitionStats {
    /// Frames accepted as samples.
    pub samples: u64,
    /// Non-empty lines that were not valid frames.
    pub malformed_frames: u64,
    /// Read errors other than timeouts.
    pub io_errors: u64,
    /// Subscriber invocations that panicked.
    pub subscriber_failures: u64,
    /// Failed attempts to initialize or append to the record store.
    pub store_failures: u64,
    pub rows_written: u64,
}

#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub(crate) samples: AtomicU64,
    pub(crate) malformed_frames: AtomicU64,
    pub(crate) io_errors: AtomicU64,
    pub(crate) subscriber_failures: AtomicU64,
    pub(crate) store_failures: AtomicU64,
    pub(crate) rows_written: AtomicU64,
}

impl Counters {
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> AcquisitionStats {
        AcquisitionStats {
            samples: self.samples.load(Ordering::Relaxed),
            malformed_frames: self.malformed_frames.load(Ordering::Relaxed),
            io_errors: self.io_errors.load(Ordering::Relaxed),
            subscriber_failures: self.subscriber_failures.load(Ordering::Relaxed),
            store_failures: self.store_failures.load(Ordering::Relaxed),
            rows_written: self.rows_written.load(Ordering::Relaxed),
        }
    }
}
