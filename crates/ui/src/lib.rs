//! Longview UI library.
//!
//! The embeddable [`LongImageView`] component: gesture events in, cached
//! region decodes out through a host-supplied [`RenderSink`]. Hosts own the
//! input system and the compositing surface; this crate owns everything in
//! between.

mod sink;
mod view;

pub use sink::{RenderSink, ScaleTransform};
pub use view::{LongImageView, ViewerError};

pub use longview_cache::{CacheConfig, CacheKey, PixelBuffer, PixelFormat, TieredPixelCache};
pub use longview_viewer_core::{ScrollState, ViewportController, VisibleRect};
