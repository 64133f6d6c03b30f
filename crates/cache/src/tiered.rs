//! Read/write fallthrough across the memory and disk tiers.
//!
//! The tiered cache is the single entry point the render path talks to:
//! memory first, then disk (decompressing into pooled storage when
//! possible), and a reuse-pool lookup for decode targets on a full miss.
//! The disk tier is best effort; its failures are logged here and never
//! propagate to callers.

use std::sync::Arc;

use image::codecs::jpeg::JpegEncoder;
use tracing::{debug, warn};

use crate::buffer::{CacheKey, PixelBuffer};
use crate::config::CacheConfig;
use crate::disk::{DiskBlobCache, DiskCacheStats};
use crate::memory::{MemoryCacheStats, MemoryPixelCache};
use crate::pool::ReusePool;
use crate::reclaim::ReclamationCoordinator;

/// Aggregated statistics from both tiers and the reuse pool.
#[derive(Debug, Clone, Default)]
pub struct TieredCacheStats {
    pub memory: MemoryCacheStats,
    /// `None` while the disk tier is unavailable.
    pub disk: Option<DiskCacheStats>,
    pub pooled_buffers: usize,
}

/// Two-tier pixel cache with a buffer-reuse pool.
///
/// Explicitly constructed and explicitly shut down; share it with
/// collaborators through an `Arc` rather than a global.
pub struct TieredPixelCache {
    // Declared before the coordinator: dropping the memory tier releases its
    // queue handle, after which the coordinator's drop can join the worker.
    memory: MemoryPixelCache,
    disk: Option<DiskBlobCache>,
    pool: Arc<ReusePool>,
    coordinator: ReclamationCoordinator,
    quality: u8,
}

impl TieredPixelCache {
    /// Build the cache from `config`.
    ///
    /// Never fails: if the disk tier cannot be opened the cache runs
    /// memory-only and says so in the log.
    pub fn new(config: &CacheConfig) -> Self {
        let pool = Arc::new(ReusePool::new(config.pool_capacity));
        let coordinator = ReclamationCoordinator::new(pool.clone());
        let memory = MemoryPixelCache::new(
            config.resolve_memory_capacity(),
            coordinator.release_queue(),
        );
        let disk = match DiskBlobCache::open(
            &config.disk_cache_dir,
            config.disk_cache_size,
            &CacheConfig::platform_version_tag(),
        ) {
            Ok(disk) => Some(disk),
            Err(e) => {
                warn!(
                    dir = %config.disk_cache_dir.display(),
                    error = %e,
                    "disk tier unavailable, running memory-only"
                );
                None
            }
        };

        Self {
            memory,
            disk,
            pool,
            coordinator,
            quality: config.compression_quality,
        }
    }

    /// Look up `key` in memory, then on disk.
    ///
    /// A disk hit is decompressed (into pooled storage when a compatible
    /// buffer exists), inserted into the memory tier, and returned. `None`
    /// means the caller must produce the pixels and `put` them.
    pub fn get(&self, key: &CacheKey) -> Option<Arc<PixelBuffer>> {
        if let Some(buffer) = self.memory.get(key) {
            return Some(buffer);
        }

        let disk = self.disk.as_ref()?;
        let blob = match disk.get(key) {
            Ok(Some(blob)) => blob,
            Ok(None) => return None,
            Err(e) => {
                warn!(key = %key, error = %e, "disk read failed, treating as miss");
                return None;
            }
        };

        match self.decompress(&blob) {
            Ok(buffer) => Some(self.memory.put(key.clone(), buffer)),
            Err(e) => {
                warn!(key = %key, error = %e, "persisted blob failed to decode, dropping it");
                if let Err(e) = disk.remove(key) {
                    debug!(key = %key, error = %e, "could not remove bad blob");
                }
                None
            }
        }
    }

    /// Insert a freshly decoded buffer.
    ///
    /// Always lands in the memory tier; additionally compressed and
    /// committed to disk if no entry exists for the key yet. Disk failures
    /// are logged and do not fail the insert.
    pub fn put(&self, key: &CacheKey, buffer: PixelBuffer) -> Arc<PixelBuffer> {
        let shared = self.memory.put(key.clone(), buffer);

        if let Some(disk) = &self.disk {
            if !disk.contains(key) {
                match self.compress(&shared) {
                    Ok(blob) => {
                        if let Err(e) = disk.put(key, &blob) {
                            warn!(key = %key, error = %e, "disk commit failed, entry is memory-only");
                        }
                    }
                    Err(e) => {
                        warn!(key = %key, error = %e, "blob compression failed, entry is memory-only");
                    }
                }
            }
        }

        shared
    }

    /// Take a pooled buffer able to hold a `width x height` decode at
    /// `sample_size`, if one exists. See [`ReusePool::take_compatible`] for
    /// the destructive-scan semantics.
    pub fn reclaim_candidate(
        &self,
        width: u32,
        height: u32,
        sample_size: u32,
    ) -> Option<PixelBuffer> {
        self.pool.take_compatible(width, height, sample_size)
    }

    /// Evict every memory entry through the regular reclamation route. The
    /// disk tier is untouched.
    pub fn clear_memory(&self) {
        self.memory.clear();
    }

    /// Whether the disk tier is available.
    pub fn has_disk_tier(&self) -> bool {
        self.disk.is_some()
    }

    pub fn stats(&self) -> TieredCacheStats {
        TieredCacheStats {
            memory: self.memory.stats(),
            disk: self.disk.as_ref().map(|d| d.stats()),
            pooled_buffers: self.pool.len(),
        }
    }

    /// Tear the cache down, draining queued buffer releases first.
    pub fn shutdown(self) {
        let Self {
            memory,
            disk,
            pool,
            coordinator,
            ..
        } = self;
        // The memory tier owns the only external queue handle; dropping it
        // lets the coordinator drain and join.
        drop(memory);
        coordinator.shutdown();
        drop(pool);
        drop(disk);
    }

    /// Encode a buffer as an opaque JPEG blob at the configured quality.
    /// Alpha is dropped; persisted pixels are lossy by design of the tier.
    fn compress(&self, buffer: &PixelBuffer) -> image::ImageResult<Vec<u8>> {
        let (w, h) = (buffer.width(), buffer.height());
        let mut rgb = Vec::with_capacity(w as usize * h as usize * 3);
        for y in 0..h {
            for x in 0..w {
                let [r, g, b, _] = buffer.pixel_at(x, y);
                rgb.extend_from_slice(&[r, g, b]);
            }
        }

        let mut blob = Vec::new();
        let mut encoder = JpegEncoder::new_with_quality(&mut blob, self.quality);
        encoder.encode(&rgb, w, h, image::ExtendedColorType::Rgb8)?;
        Ok(blob)
    }

    /// Decode a persisted blob back into a pixel buffer, reusing pooled
    /// storage when a compatible candidate is available.
    fn decompress(&self, blob: &[u8]) -> image::ImageResult<PixelBuffer> {
        let decoded = image::load_from_memory_with_format(blob, image::ImageFormat::Jpeg)?;
        let rgb = decoded.to_rgb8();
        let (w, h) = (rgb.width(), rgb.height());

        let format = CacheConfig::pixel_format(false);
        let required = w as usize * h as usize * format.bytes_per_pixel();
        let mut buffer = match self.pool.take_compatible(w, h, 1) {
            // The pool matched against the candidate's own format; re-check
            // against the decode format before writing into it.
            Some(mut candidate) if candidate.storage_bytes() >= required => {
                candidate.reset_for(w, h, format);
                candidate
            }
            _ => PixelBuffer::new_mutable(w, h, format),
        };

        let bpp = format.bytes_per_pixel();
        let bytes = buffer
            .as_bytes_mut()
            .expect("decode targets are always mutable");
        for (y, row) in rgb.rows().enumerate() {
            for (x, px) in row.enumerate() {
                let idx = (y * w as usize + x) * bpp;
                format.write_pixel(&mut bytes[idx..idx + bpp], px.0[0], px.0[1], px.0[2], 255);
            }
        }
        Ok(buffer)
    }
}
