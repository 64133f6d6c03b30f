//! Longview cache library.
//!
//! A two-tier pixel cache for very large scrolling images: a bounded,
//! size-weighted in-memory LRU backed by a persistent journal-indexed blob
//! store, plus a buffer-reuse pool fed by a deferred-reclamation worker.

pub mod buffer;
pub mod config;
pub mod disk;
pub mod memory;
pub mod pool;
pub mod reclaim;
pub mod tiered;

pub use buffer::{CacheKey, PixelBuffer, PixelFormat};
pub use config::{CacheConfig, ConfigError};
pub use disk::{DiskBlobCache, DiskCacheError, DiskCacheStats};
pub use memory::{MemoryCacheStats, MemoryPixelCache};
pub use pool::ReusePool;
pub use reclaim::{ReclamationCoordinator, ReleaseQueue};
pub use tiered::{TieredCacheStats, TieredPixelCache};
