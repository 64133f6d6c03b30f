//! Cache configuration.
//!
//! Centralizes the tunables for both tiers and the reuse pool. Configuration
//! is created programmatically (builder style) or from `LONGVIEW_*`
//! environment variables. The memory-tier capacity defaults to a fraction of
//! the platform memory budget, resolved at cache construction.

use std::env;
use std::path::{Path, PathBuf};

use sysinfo::System;
use thiserror::Error;

use crate::buffer::PixelFormat;
use crate::disk::DEFAULT_DISK_CAPACITY;
use crate::pool::DEFAULT_POOL_CAPACITY;

/// Fraction of the platform memory budget given to the memory tier.
pub const DEFAULT_MEMORY_FRACTION: f64 = 1.0 / 8.0;

/// JPEG quality used for persisted blobs.
pub const DEFAULT_COMPRESSION_QUALITY: u8 = 50;

/// Bounds for the derived memory capacity; a fraction of system memory on a
/// large workstation would otherwise dwarf what a viewer needs.
const MIN_MEMORY_CAPACITY: usize = 8 * 1024 * 1024;
const MAX_MEMORY_CAPACITY: usize = 512 * 1024 * 1024;

/// Configuration for the tiered pixel cache.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheConfig {
    /// Explicit memory-tier capacity in bytes. `None` derives the capacity
    /// from system memory via `memory_fraction`.
    pub memory_cache_size: Option<usize>,

    /// Fraction of total system memory used when no explicit capacity is
    /// set.
    pub memory_fraction: f64,

    /// Disk-tier byte ceiling.
    pub disk_cache_size: usize,

    /// Directory for the disk tier.
    pub disk_cache_dir: PathBuf,

    /// JPEG quality (1-100) for persisted blobs.
    pub compression_quality: u8,

    /// Maximum number of buffers retained in the reuse pool.
    pub pool_capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            memory_cache_size: None,
            memory_fraction: DEFAULT_MEMORY_FRACTION,
            disk_cache_size: DEFAULT_DISK_CAPACITY,
            disk_cache_dir: Self::default_cache_dir(),
            compression_quality: DEFAULT_COMPRESSION_QUALITY,
            pool_capacity: DEFAULT_POOL_CAPACITY,
        }
    }
}

impl CacheConfig {
    /// Fix the memory-tier capacity in bytes.
    pub fn with_memory_bytes(mut self, bytes: usize) -> Self {
        self.memory_cache_size = Some(bytes);
        self
    }

    /// Fix the memory-tier capacity in megabytes.
    pub fn with_memory_mb(self, mb: usize) -> Self {
        self.with_memory_bytes(mb * 1024 * 1024)
    }

    /// Set the disk-tier ceiling in megabytes.
    pub fn with_disk_mb(mut self, mb: usize) -> Self {
        self.disk_cache_size = mb * 1024 * 1024;
        self
    }

    /// Set the disk-tier directory.
    pub fn with_disk_dir<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.disk_cache_dir = path.as_ref().to_path_buf();
        self
    }

    /// Set the JPEG quality for persisted blobs (clamped to 1-100).
    pub fn with_compression_quality(mut self, quality: u8) -> Self {
        self.compression_quality = quality.clamp(1, 100);
        self
    }

    /// Set the reuse-pool bound.
    pub fn with_pool_capacity(mut self, capacity: usize) -> Self {
        self.pool_capacity = capacity.max(1);
        self
    }

    /// The pixel format decoded surfaces should use: 16-bit unless alpha
    /// transparency is required.
    pub fn pixel_format(needs_alpha: bool) -> PixelFormat {
        if needs_alpha {
            PixelFormat::Rgba8888
        } else {
            PixelFormat::Rgb565
        }
    }

    /// Returns the default cache directory for the current platform.
    ///
    /// - macOS: ~/Library/Caches/longview/pixels
    /// - Linux: ~/.cache/longview/pixels
    /// - Windows: %LOCALAPPDATA%\longview\pixels
    pub fn default_cache_dir() -> PathBuf {
        if let Some(cache_dir) = dirs::cache_dir() {
            cache_dir.join("longview").join("pixels")
        } else {
            PathBuf::from("cache/pixels")
        }
    }

    /// Resolve the memory-tier capacity in bytes: the explicit override if
    /// set, else the configured fraction of total system memory, clamped.
    pub fn resolve_memory_capacity(&self) -> usize {
        if let Some(bytes) = self.memory_cache_size {
            return bytes;
        }
        let mut sys = System::new();
        sys.refresh_memory();
        let derived = (sys.total_memory() as f64 * self.memory_fraction) as usize;
        derived.clamp(MIN_MEMORY_CAPACITY, MAX_MEMORY_CAPACITY)
    }

    /// Version tag written into the disk journal: a host platform version
    /// plus the journal's own schema constants. Changing platforms discards
    /// the persisted cache rather than trusting stale blobs.
    pub fn platform_version_tag() -> String {
        System::os_version().unwrap_or_else(|| "unknown".to_string())
    }

    /// Loads configuration from environment variables.
    ///
    /// - `LONGVIEW_MEMORY_CACHE_MB`: memory-tier capacity in MB
    /// - `LONGVIEW_DISK_CACHE_MB`: disk-tier ceiling in MB
    /// - `LONGVIEW_CACHE_DIR`: disk-tier directory
    /// - `LONGVIEW_JPEG_QUALITY`: blob compression quality (1-100)
    ///
    /// # Errors
    /// Returns an error if any variable contains an invalid value.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(val) = env::var("LONGVIEW_MEMORY_CACHE_MB") {
            let mb = val
                .parse::<usize>()
                .map_err(|_| ConfigError::InvalidValue("LONGVIEW_MEMORY_CACHE_MB".to_string()))?;
            config.memory_cache_size = Some(mb * 1024 * 1024);
        }

        if let Ok(val) = env::var("LONGVIEW_DISK_CACHE_MB") {
            config.disk_cache_size = val
                .parse::<usize>()
                .map_err(|_| ConfigError::InvalidValue("LONGVIEW_DISK_CACHE_MB".to_string()))?
                * 1024
                * 1024;
        }

        if let Ok(val) = env::var("LONGVIEW_CACHE_DIR") {
            config.disk_cache_dir = PathBuf::from(val);
        }

        if let Ok(val) = env::var("LONGVIEW_JPEG_QUALITY") {
            let quality = val
                .parse::<u8>()
                .map_err(|_| ConfigError::InvalidValue("LONGVIEW_JPEG_QUALITY".to_string()))?;
            if !(1..=100).contains(&quality) {
                return Err(ConfigError::InvalidValue(
                    "LONGVIEW_JPEG_QUALITY".to_string(),
                ));
            }
            config.compression_quality = quality;
        }

        Ok(config)
    }
}

/// Errors that can occur while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for configuration key: {0}")]
    InvalidValue(String),
}
