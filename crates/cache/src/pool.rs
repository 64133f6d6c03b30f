//! Reuse pool for released pixel buffers.
//!
//! Buffers evicted from the memory tier keep valid backing storage even
//! though their logical owner is gone. The pool holds them so a later decode
//! can overwrite that storage instead of allocating. Entries enter through
//! the reclamation worker and leave either by being matched for reuse or by
//! being discarded during a scan.

use std::collections::VecDeque;
use std::sync::Mutex;

use crate::buffer::PixelBuffer;

/// Default maximum number of pooled buffers.
pub const DEFAULT_POOL_CAPACITY: usize = 16;

/// Bounded pool of released, still-allocated pixel buffers.
///
/// Shared between the interaction thread (candidate lookups) and the
/// reclamation worker (enrollment), so all access goes through a mutex.
#[derive(Debug)]
pub struct ReusePool {
    entries: Mutex<VecDeque<PixelBuffer>>,
    capacity: usize,
}

impl ReusePool {
    /// Create a pool bounded to `capacity` entries.
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
        }
    }

    /// Enroll a released buffer. Oldest entries are dropped once the pool is
    /// full; a pool is a cache of storage, not a ledger.
    pub fn enroll(&self, buffer: PixelBuffer) {
        let mut entries = self.entries.lock().unwrap();
        entries.push_back(buffer);
        while entries.len() > self.capacity {
            entries.pop_front();
        }
    }

    /// Remove and return the first buffer whose storage can hold a
    /// `width x height` image downsampled by `sample_size`.
    ///
    /// The scan is destructive: every entry inspected and rejected before the
    /// match is dropped, not requeued. This keeps the lookup a pop-and-test
    /// loop with no bookkeeping, at the cost of pool hit rate.
    pub fn take_compatible(
        &self,
        width: u32,
        height: u32,
        sample_size: u32,
    ) -> Option<PixelBuffer> {
        let mut entries = self.entries.lock().unwrap();
        while let Some(buffer) = entries.pop_front() {
            if buffer.can_rewrite(width, height, sample_size) {
                return Some(buffer);
            }
            // Rejected entries are freed here.
        }
        None
    }

    /// Number of buffers currently pooled.
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().unwrap().is_empty()
    }

    /// Drop every pooled buffer.
    pub fn clear(&self) {
        self.entries.lock().unwrap().clear();
    }
}

impl Default for ReusePool {
    fn default() -> Self {
        Self::new(DEFAULT_POOL_CAPACITY)
    }
}
