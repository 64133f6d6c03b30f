//! Deferred reclamation of released pixel buffers.
//!
//! The memory tier never frees an evicted buffer on the caller's thread.
//! Instead it sends the buffer to a single background worker that either
//! enrolls it into the reuse pool or lets it drop. A single worker (not a
//! pool) preserves release order relative to enrollment, so a consumer that
//! just took a buffer from the pool can never race a second release of the
//! same storage.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender};
use tracing::trace;

use crate::buffer::PixelBuffer;
use crate::pool::ReusePool;

/// Sending half of the release queue, handed to the memory tier.
#[derive(Debug, Clone)]
pub struct ReleaseQueue {
    sender: Sender<PixelBuffer>,
}

impl ReleaseQueue {
    /// Hand a released buffer to the coordinator. If the worker is already
    /// gone the buffer is dropped here, which frees it all the same.
    pub fn release(&self, buffer: PixelBuffer) {
        let _ = self.sender.send(buffer);
    }
}

/// Background worker that drains the release queue.
///
/// The worker blocks on the queue until a stop is signalled; the stop is a
/// clean shutdown request, not an error, and every release queued before it
/// is still processed. Dropping the coordinator performs the same shutdown.
#[derive(Debug)]
pub struct ReclamationCoordinator {
    releases: Sender<PixelBuffer>,
    stop: Option<Sender<()>>,
    worker: Option<JoinHandle<()>>,
}

impl ReclamationCoordinator {
    /// Spawn the worker, enrolling reusable buffers into `pool`.
    pub fn new(pool: Arc<ReusePool>) -> Self {
        let (releases, incoming) = crossbeam_channel::unbounded();
        let (stop, stop_signal) = crossbeam_channel::bounded::<()>(0);
        let worker = thread::Builder::new()
            .name("longview-reclaim".to_string())
            .spawn(move || Self::run(incoming, stop_signal, pool))
            .expect("failed to spawn reclamation worker");

        Self {
            releases,
            stop: Some(stop),
            worker: Some(worker),
        }
    }

    /// A handle the memory tier uses to enqueue released buffers.
    pub fn release_queue(&self) -> ReleaseQueue {
        ReleaseQueue {
            sender: self.releases.clone(),
        }
    }

    fn run(incoming: Receiver<PixelBuffer>, stop: Receiver<()>, pool: Arc<ReusePool>) {
        loop {
            crossbeam_channel::select! {
                recv(incoming) -> msg => match msg {
                    Ok(buffer) => Self::reclaim(buffer, &pool),
                    // Every sender is gone; nothing more can arrive.
                    Err(_) => break,
                },
                recv(stop) -> _ => {
                    // Shutdown requested: drain whatever is already queued,
                    // then exit.
                    while let Ok(buffer) = incoming.try_recv() {
                        Self::reclaim(buffer, &pool);
                    }
                    break;
                }
            }
        }
    }

    fn reclaim(buffer: PixelBuffer, pool: &ReusePool) {
        if buffer.is_mutable() && buffer.storage_bytes() > 0 {
            trace!(
                bytes = buffer.storage_bytes(),
                width = buffer.width(),
                height = buffer.height(),
                "enrolling released buffer for reuse"
            );
            pool.enroll(buffer);
        } else {
            trace!(bytes = buffer.byte_size(), "freeing non-reusable buffer");
            // Immutable storage cannot be decoded into; dropped here.
        }
    }

    /// Signal shutdown and wait for the worker to drain and exit.
    pub fn shutdown(mut self) {
        self.shutdown_inner();
    }

    fn shutdown_inner(&mut self) {
        // Dropping the stop sender disconnects the signal channel, which the
        // worker treats as the shutdown request.
        self.stop.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Drop for ReclamationCoordinator {
    fn drop(&mut self) {
        self.shutdown_inner();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::PixelFormat;
    use std::time::{Duration, Instant};

    fn wait_for_len(pool: &ReusePool, len: usize) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if pool.len() == len {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        pool.len() == len
    }

    #[test]
    fn test_mutable_release_reaches_pool() {
        let pool = Arc::new(ReusePool::default());
        let coordinator = ReclamationCoordinator::new(pool.clone());
        let queue = coordinator.release_queue();

        queue.release(PixelBuffer::new_mutable(16, 16, PixelFormat::Rgb565));
        assert!(wait_for_len(&pool, 1));

        coordinator.shutdown();
    }

    #[test]
    fn test_immutable_release_is_freed_not_enrolled() {
        let pool = Arc::new(ReusePool::default());
        let coordinator = ReclamationCoordinator::new(pool.clone());
        let queue = coordinator.release_queue();

        queue.release(PixelBuffer::new_mutable(16, 16, PixelFormat::Rgb565).freeze());
        queue.release(PixelBuffer::new_mutable(8, 8, PixelFormat::Rgb565));

        // Only the mutable buffer shows up.
        assert!(wait_for_len(&pool, 1));
        thread::sleep(Duration::from_millis(20));
        assert_eq!(pool.len(), 1);

        coordinator.shutdown();
    }

    #[test]
    fn test_shutdown_drains_queued_releases() {
        let pool = Arc::new(ReusePool::default());
        let coordinator = ReclamationCoordinator::new(pool.clone());
        let queue = coordinator.release_queue();

        for _ in 0..8 {
            queue.release(PixelBuffer::new_mutable(4, 4, PixelFormat::Rgb565));
        }
        coordinator.shutdown();

        // Everything queued before shutdown was processed.
        assert_eq!(pool.len(), 8);
    }

    #[test]
    fn test_shutdown_with_live_queue_does_not_hang() {
        let pool = Arc::new(ReusePool::default());
        let coordinator = ReclamationCoordinator::new(pool.clone());
        let queue = coordinator.release_queue();

        coordinator.shutdown();

        // Releases after shutdown are simply dropped.
        queue.release(PixelBuffer::new_mutable(4, 4, PixelFormat::Rgb565));
        assert!(pool.is_empty());
    }
}
