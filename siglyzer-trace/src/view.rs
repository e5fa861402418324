use std::sync::Arc;

use parking_lot::{RwLock, RwLockReadGuard};

use crate::set::{ChannelId, TraceSet};

/// Shared read view over a trace set.
///
/// The only writer is the decoder running on the consumer thread; renderers
/// and other readers take the read lock for the duration of a query batch.
/// Write access stays within this crate's decoding path and the capture
/// pipeline.
#[derive(Clone, Default)]
pub struct SharedTraceSet {
    inner: Arc<RwLock<TraceSet>>,
}

impl SharedTraceSet {
    pub fn new() -> Self {
        SharedTraceSet::default()
    }

    pub fn from_set(set: TraceSet) -> Self {
        SharedTraceSet {
            inner: Arc::new(RwLock::new(set)),
        }
    }

    /// Read access for renderers. Hold the guard across a batch of
    /// `sample`/`multisample` calls so one frame sees a consistent set.
    pub fn read(&self) -> RwLockReadGuard<'_, TraceSet> {
        self.inner.read()
    }

    /// Write access for the decoding pipeline.
    pub fn write(&self) -> parking_lot::RwLockWriteGuard<'_, TraceSet> {
        self.inner.write()
    }

    pub fn channels(&self) -> Vec<ChannelId> {
        self.read().channels()
    }

    pub fn trace_count(&self) -> usize {
        self.read().trace_count()
    }

    /// Common time origin of all traces; `u64::MAX` while empty.
    pub fn first_sample_index(&self) -> u64 {
        self.read().first_sample_index()
    }
}
