//! The embeddable long-image view.
//!
//! Wires the viewport controller, the region decoder, and the tiered cache
//! into one component the host embeds: input events go in, paints come out
//! through a [`RenderSink`]. The view decodes only the visible rectangle,
//! reuses pooled buffers as decode targets, and caches each decoded region
//! under a key derived from the source id and geometry.

use std::io::{BufRead, Seek};
use std::sync::Arc;
use std::time::Duration;

use longview_cache::{CacheKey, TieredPixelCache};
use longview_render::{DecodeError, DecodeInitError, Region, RegionDecoder};
use longview_viewer_core::{ScrollState, ViewportController, VisibleRect};
use thiserror::Error;
use tracing::warn;

use crate::sink::{RenderSink, ScaleTransform};

/// Failures the host can observe from the view.
#[derive(Debug, Error)]
pub enum ViewerError {
    /// The source could not be opened at all. The previous image (if any)
    /// is gone and the view draws nothing until a new source is assigned.
    #[error("source unreadable: {0}")]
    Source(#[from] DecodeInitError),

    /// One region decode failed. The viewport state is untouched and later
    /// renders may succeed.
    #[error("region decode failed: {0}")]
    Region(#[from] DecodeError),
}

/// A scrollable view over one very large image.
///
/// Owns the gesture state machine and the decoder handle; shares the cache
/// with whoever else needs it (prefetchers, sibling views).
pub struct LongImageView<S> {
    cache: Arc<TieredPixelCache>,
    controller: ViewportController,
    decoder: Option<RegionDecoder<S>>,
    source_id: String,
}

impl<S: BufRead + Seek> LongImageView<S> {
    pub fn new(cache: Arc<TieredPixelCache>) -> Self {
        Self {
            cache,
            controller: ViewportController::new(),
            decoder: None,
            source_id: String::new(),
        }
    }

    /// Set the on-screen viewport size in pixels.
    pub fn set_view_size(&mut self, width: u32, height: u32) {
        self.controller.set_view_size(width, height);
    }

    /// Assign a source image. Probes its bounds, opens the region decoder,
    /// and resets the viewport to the top of the image.
    ///
    /// On failure no image is assigned; the view draws nothing.
    pub fn set_image(&mut self, source_id: impl Into<String>, source: S) -> Result<(), ViewerError> {
        self.decoder = None;
        self.controller.clear_image();

        let decoder = RegionDecoder::open(source)?;
        self.controller.set_image(decoder.width(), decoder.height());
        self.source_id = source_id.into();
        self.decoder = Some(decoder);
        Ok(())
    }

    /// Drop the assigned image; the view goes back to drawing nothing.
    pub fn clear_image(&mut self) {
        self.decoder = None;
        self.controller.clear_image();
        self.source_id.clear();
    }

    pub fn has_image(&self) -> bool {
        self.decoder.is_some() && self.controller.has_image()
    }

    pub fn state(&self) -> ScrollState {
        self.controller.state()
    }

    pub fn scale(&self) -> Option<f32> {
        self.controller.scale()
    }

    pub fn visible_rect(&self) -> Option<VisibleRect> {
        self.controller.visible_rect()
    }

    pub fn cache(&self) -> &Arc<TieredPixelCache> {
        &self.cache
    }

    /// Pointer down: cancels any settle in flight.
    pub fn on_down(&mut self) {
        self.controller.on_down();
    }

    /// Pointer move with scroll distances in source pixels. Returns true
    /// when a redraw is needed.
    pub fn on_move(&mut self, dx: f32, dy: f32) -> bool {
        self.controller.on_move(dx, dy)
    }

    /// Pointer release with a fling velocity in px/s. Returns true when a
    /// settle animation started (keep ticking until it reports idle).
    pub fn on_fling(&mut self, velocity_x: f32, velocity_y: f32) -> bool {
        self.controller.on_fling(velocity_x, velocity_y)
    }

    /// Gesture cancelled by the host input system.
    pub fn on_cancel(&mut self) {
        self.controller.on_cancel();
    }

    /// Advance the settle animation. Returns true when a redraw is needed.
    pub fn tick(&mut self, dt: Duration) -> bool {
        self.controller.tick(dt)
    }

    /// Produce pixels for the visible rectangle and paint them through
    /// `sink`.
    ///
    /// With no image assigned (or nothing visible) this paints nothing and
    /// returns `Ok`. A region decode failure also paints nothing, leaves
    /// the viewport state intact, and surfaces as the returned error.
    pub fn render(&mut self, sink: &mut dyn RenderSink) -> Result<(), ViewerError> {
        let Some(decoder) = self.decoder.as_mut() else {
            return Ok(());
        };
        let Some(rect) = self.controller.visible_rect() else {
            return Ok(());
        };
        let Some(region) = pixel_region(&rect, decoder.width(), decoder.height()) else {
            return Ok(());
        };

        let scale = self.controller.scale().unwrap_or(1.0);
        let transform = ScaleTransform::uniform(scale);
        let sample = decoder.sample_size();
        let key = region_key(&self.source_id, region, sample);

        if let Some(buffer) = self.cache.get(&key) {
            sink.paint(&buffer, transform);
            return Ok(());
        }

        // Full cache miss: decode, preferring recycled storage. The pool
        // matched capacity against the candidate's own format, so a decode
        // in a wider format may still reject it; fall back to a fresh
        // allocation in that one case.
        let candidate = self
            .cache
            .reclaim_candidate(region.width, region.height, sample);
        let result = match decoder.decode_region(region, candidate) {
            Err(DecodeError::TargetCapacity { .. }) => decoder.decode_region(region, None),
            other => other,
        };
        let decoded = match result {
            Ok(buffer) => buffer,
            Err(e) => {
                warn!(key = %key, error = %e, "region decode failed, drawing nothing");
                return Err(e.into());
            }
        };

        let shared = self.cache.put(&key, decoded);
        sink.paint(&shared, transform);
        Ok(())
    }
}

/// Snap the fractional visible rectangle to whole source pixels, clipped to
/// the image bounds. `None` when nothing would be visible.
fn pixel_region(rect: &VisibleRect, image_width: u32, image_height: u32) -> Option<Region> {
    let y = rect.top.max(0.0).floor() as u32;
    let bottom = (rect.bottom.ceil() as u32).min(image_height);
    let width = (rect.right.ceil() as u32).min(image_width);
    if bottom <= y || width == 0 {
        return None;
    }
    Some(Region::new(0, y, width, bottom - y))
}

/// Cache key for one decoded region of one source.
fn region_key(source_id: &str, region: Region, sample_size: u32) -> CacheKey {
    CacheKey::new(format!(
        "{source_id}:{},{}+{}x{}@{sample_size}",
        region.x, region.y, region.width, region.height
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use longview_cache::{CacheConfig, PixelBuffer};
    use std::env;
    use std::fs;
    use std::io::Cursor;
    use std::path::PathBuf;

    /// RGB gradient where pixel (x, y) = (x, y, x + y) mod 256.
    fn gradient_png(width: u32, height: u32) -> Vec<u8> {
        let mut data = Vec::with_capacity((width * height * 3) as usize);
        for y in 0..height {
            for x in 0..width {
                data.extend_from_slice(&[(x % 256) as u8, (y % 256) as u8, ((x + y) % 256) as u8]);
            }
        }

        let mut out = Vec::new();
        {
            let mut encoder = png::Encoder::new(&mut out, width, height);
            encoder.set_color(png::ColorType::Rgb);
            encoder.set_depth(png::BitDepth::Eight);
            let mut writer = encoder.write_header().unwrap();
            writer.write_image_data(&data).unwrap();
        }
        out
    }

    #[derive(Default)]
    struct RecordingSink {
        paints: Vec<(u32, u32, f32, [u8; 4])>,
    }

    impl RenderSink for RecordingSink {
        fn paint(&mut self, buffer: &PixelBuffer, transform: ScaleTransform) {
            self.paints
                .push((buffer.width(), buffer.height(), transform.scale_x, buffer.pixel_at(0, 0)));
        }
    }

    fn test_view() -> (LongImageView<Cursor<Vec<u8>>>, PathBuf) {
        let dir = env::temp_dir().join(format!("longview-view-{}", rand::random::<u32>()));
        let config = CacheConfig::default()
            .with_memory_bytes(4 * 1024 * 1024)
            .with_disk_dir(&dir);
        let cache = Arc::new(TieredPixelCache::new(&config));
        let mut view = LongImageView::new(cache);
        view.set_view_size(64, 64);
        (view, dir)
    }

    fn assert_close(actual: [u8; 4], expected: (u8, u8, u8)) {
        assert!((actual[0] as i32 - expected.0 as i32).abs() <= 8, "{actual:?}");
        assert!((actual[1] as i32 - expected.1 as i32).abs() <= 8, "{actual:?}");
        assert!((actual[2] as i32 - expected.2 as i32).abs() <= 8, "{actual:?}");
    }

    #[test]
    fn test_render_without_image_paints_nothing() {
        let (mut view, dir) = test_view();
        let mut sink = RecordingSink::default();

        view.render(&mut sink).unwrap();
        assert!(sink.paints.is_empty());
        assert!(!view.has_image());

        fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn test_render_paints_visible_region_at_fixed_scale() {
        let (mut view, dir) = test_view();
        view.set_image("tall.png", Cursor::new(gradient_png(64, 256)))
            .unwrap();
        assert!(view.has_image());
        assert_eq!(view.scale(), Some(1.0));

        let mut sink = RecordingSink::default();
        view.render(&mut sink).unwrap();

        let (w, h, scale, top_left) = sink.paints[0];
        assert_eq!((w, h), (64, 64));
        assert_eq!(scale, 1.0);
        assert_close(top_left, (0, 0, 0));

        fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn test_scrolled_render_paints_shifted_region() {
        let (mut view, dir) = test_view();
        view.set_image("tall.png", Cursor::new(gradient_png(64, 256)))
            .unwrap();

        view.on_down();
        assert!(view.on_move(0.0, 96.0));

        let mut sink = RecordingSink::default();
        view.render(&mut sink).unwrap();

        let (_, _, _, top_left) = sink.paints[0];
        // The painted region starts at source row 96.
        assert_close(top_left, (0, 96, 96));

        fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn test_scroll_clamps_to_image_bottom() {
        let (mut view, dir) = test_view();
        view.set_image("tall.png", Cursor::new(gradient_png(64, 256)))
            .unwrap();

        view.on_down();
        view.on_move(0.0, 10_000.0);
        let rect = view.visible_rect().unwrap();
        assert_eq!((rect.top, rect.bottom), (192.0, 256.0));

        let mut sink = RecordingSink::default();
        view.render(&mut sink).unwrap();
        let (_, _, _, top_left) = sink.paints[0];
        assert_close(top_left, (0, 192, 192));

        fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn test_repeated_render_hits_the_cache() {
        let (mut view, dir) = test_view();
        view.set_image("tall.png", Cursor::new(gradient_png(64, 256)))
            .unwrap();

        let mut sink = RecordingSink::default();
        view.render(&mut sink).unwrap();
        view.render(&mut sink).unwrap();

        assert_eq!(sink.paints.len(), 2);
        assert!(view.cache().stats().memory.hits >= 1);

        fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn test_unreadable_source_leaves_no_image() {
        let (mut view, dir) = test_view();

        let result = view.set_image("bad", Cursor::new(vec![0u8; 64]));
        assert!(matches!(result, Err(ViewerError::Source(_))));
        assert!(!view.has_image());

        // The view still renders (to nothing) and scroll input is inert.
        let mut sink = RecordingSink::default();
        view.render(&mut sink).unwrap();
        assert!(sink.paints.is_empty());
        assert!(!view.on_move(0.0, 50.0));

        fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn test_zero_velocity_release_is_idle() {
        let (mut view, dir) = test_view();
        view.set_image("tall.png", Cursor::new(gradient_png(64, 256)))
            .unwrap();

        view.on_down();
        assert!(!view.on_fling(0.0, 0.0));
        assert_eq!(view.state(), ScrollState::Idle);

        fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn test_fling_tick_render_loop() {
        let (mut view, dir) = test_view();
        view.set_image("tall.png", Cursor::new(gradient_png(64, 256)))
            .unwrap();

        view.on_down();
        assert!(view.on_fling(0.0, -400.0));

        let mut sink = RecordingSink::default();
        let mut ticks = 0;
        while view.state() == ScrollState::Settling {
            assert!(view.tick(Duration::from_millis(16)));
            view.render(&mut sink).unwrap();
            ticks += 1;
            assert!(ticks < 10_000, "settle never finished");
        }

        assert!(view.visible_rect().unwrap().top > 0.0);
        assert!(!sink.paints.is_empty());

        fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn test_clear_image_goes_back_to_drawing_nothing() {
        let (mut view, dir) = test_view();
        view.set_image("tall.png", Cursor::new(gradient_png(64, 256)))
            .unwrap();
        view.clear_image();

        let mut sink = RecordingSink::default();
        view.render(&mut sink).unwrap();
        assert!(sink.paints.is_empty());
        assert!(!view.has_image());

        fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn test_region_keys_distinguish_geometry_and_source() {
        let a = region_key("img", Region::new(0, 0, 64, 64), 1);
        let b = region_key("img", Region::new(0, 64, 64, 64), 1);
        let c = region_key("other", Region::new(0, 0, 64, 64), 1);
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_eq!(a, region_key("img", Region::new(0, 0, 64, 64), 1));
    }
}
