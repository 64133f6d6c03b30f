//! Decoded pixel surfaces and cache keys.
//!
//! `PixelBuffer` is the value type that flows through every tier: it owns its
//! byte storage, knows its pixel layout, and carries the mutability flag that
//! decides whether the storage may be rewritten by a later decode. Ownership
//! moves with the value; a buffer shared through an `Arc` is read-only for as
//! long as it is shared.

use std::fmt;
use std::sync::Arc;

/// Pixel layout of a decoded surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    /// 16-bit opaque color (5-6-5, little-endian). Half the footprint of
    /// `Rgba8888`, used whenever the source has no transparency.
    Rgb565,

    /// 32-bit color with alpha.
    Rgba8888,
}

impl PixelFormat {
    /// Bytes of storage per pixel.
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Rgb565 => 2,
            PixelFormat::Rgba8888 => 4,
        }
    }

    /// Whether the format carries an alpha channel.
    pub fn has_alpha(self) -> bool {
        matches!(self, PixelFormat::Rgba8888)
    }

    /// Pack one 8-bit RGBA pixel into `out` (must be `bytes_per_pixel` long).
    pub fn write_pixel(self, out: &mut [u8], r: u8, g: u8, b: u8, a: u8) {
        match self {
            PixelFormat::Rgb565 => {
                let v: u16 = ((r as u16 >> 3) << 11) | ((g as u16 >> 2) << 5) | (b as u16 >> 3);
                out[..2].copy_from_slice(&v.to_le_bytes());
            }
            PixelFormat::Rgba8888 => {
                out[..4].copy_from_slice(&[r, g, b, a]);
            }
        }
    }

    /// Expand one stored pixel back to 8-bit RGBA. `Rgb565` replicates the
    /// high bits into the low bits so full-scale values round-trip exactly.
    pub fn read_pixel(self, px: &[u8]) -> [u8; 4] {
        match self {
            PixelFormat::Rgb565 => {
                let v = u16::from_le_bytes([px[0], px[1]]);
                let r5 = (v >> 11) & 0x1f;
                let g6 = (v >> 5) & 0x3f;
                let b5 = v & 0x1f;
                [
                    ((r5 << 3) | (r5 >> 2)) as u8,
                    ((g6 << 2) | (g6 >> 4)) as u8,
                    ((b5 << 3) | (b5 >> 2)) as u8,
                    255,
                ]
            }
            PixelFormat::Rgba8888 => [px[0], px[1], px[2], px[3]],
        }
    }
}

/// Opaque, stable identifier for a logical image resource.
///
/// The same logical content must always map to the same key; both cache
/// tiers index by it. Cloning is cheap (`Arc<str>`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(Arc<str>);

impl CacheKey {
    /// Create a key from any string-like identifier.
    pub fn new(key: impl Into<Arc<str>>) -> Self {
        Self(key.into())
    }

    /// The key's textual form.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CacheKey {
    fn from(key: &str) -> Self {
        Self::new(key)
    }
}

impl From<String> for CacheKey {
    fn from(key: String) -> Self {
        Self::new(key)
    }
}

/// A decoded pixel surface.
///
/// Tracks logical byte size (`byte_size`, used for cache weighting) separately
/// from allocated storage (`storage_bytes`, used for reuse matching): a buffer
/// recycled through the reuse pool may hold a smaller image than its storage
/// was originally allocated for.
#[derive(Debug)]
pub struct PixelBuffer {
    width: u32,
    height: u32,
    format: PixelFormat,
    data: Vec<u8>,
    mutable: bool,
}

impl PixelBuffer {
    /// Allocate a zeroed, mutable buffer for a `width x height` surface.
    pub fn new_mutable(width: u32, height: u32, format: PixelFormat) -> Self {
        let len = width as usize * height as usize * format.bytes_per_pixel();
        Self {
            width,
            height,
            format,
            data: vec![0; len],
            mutable: true,
        }
    }

    /// Wrap already-decoded bytes. `data.len()` must match the surface size.
    pub fn from_raw(width: u32, height: u32, format: PixelFormat, data: Vec<u8>) -> Self {
        debug_assert_eq!(
            data.len(),
            width as usize * height as usize * format.bytes_per_pixel()
        );
        Self {
            width,
            height,
            format,
            data,
            mutable: true,
        }
    }

    /// Mark the buffer immutable. An immutable buffer is never enrolled for
    /// reuse and is freed directly when its owner releases it.
    pub fn freeze(mut self) -> Self {
        self.mutable = false;
        self
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn is_mutable(&self) -> bool {
        self.mutable
    }

    /// Logical size of the current image in bytes; the cache weight.
    pub fn byte_size(&self) -> usize {
        self.data.len()
    }

    /// Allocated backing storage in bytes. May exceed `byte_size` after the
    /// buffer has been recycled for a smaller image.
    pub fn storage_bytes(&self) -> usize {
        self.data.capacity()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Mutable access to the pixel bytes, or `None` for a frozen buffer.
    pub fn as_bytes_mut(&mut self) -> Option<&mut [u8]> {
        if self.mutable {
            Some(&mut self.data)
        } else {
            None
        }
    }

    /// Whether this buffer's storage can hold a `width x height` image
    /// downsampled by `sample_size`, measured in this buffer's own format.
    pub fn can_rewrite(&self, width: u32, height: u32, sample_size: u32) -> bool {
        if !self.mutable {
            return false;
        }
        let (w, h) = if sample_size > 1 {
            (width / sample_size, height / sample_size)
        } else {
            (width, height)
        };
        let required = w as usize * h as usize * self.format.bytes_per_pixel();
        required > 0 && required <= self.storage_bytes()
    }

    /// Re-shape the buffer for an in-place decode, retaining its storage.
    ///
    /// Callers must have validated capacity first (`can_rewrite` or an
    /// explicit `storage_bytes` check); the new surface must fit the existing
    /// allocation.
    pub fn reset_for(&mut self, width: u32, height: u32, format: PixelFormat) {
        let required = width as usize * height as usize * format.bytes_per_pixel();
        debug_assert!(required <= self.data.capacity());
        self.width = width;
        self.height = height;
        self.format = format;
        self.data.clear();
        self.data.resize(required, 0);
        self.mutable = true;
    }

    /// Read back the pixel at `(x, y)` as 8-bit RGBA.
    pub fn pixel_at(&self, x: u32, y: u32) -> [u8; 4] {
        let bpp = self.format.bytes_per_pixel();
        let idx = (y as usize * self.width as usize + x as usize) * bpp;
        self.format.read_pixel(&self.data[idx..idx + bpp])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rgb565_packs_full_scale_exactly() {
        let mut px = [0u8; 2];
        for (r, g, b) in [
            (255u8, 255u8, 255u8),
            (0, 0, 0),
            (255, 0, 0),
            (0, 255, 0),
            (0, 0, 255),
        ] {
            PixelFormat::Rgb565.write_pixel(&mut px, r, g, b, 255);
            assert_eq!(PixelFormat::Rgb565.read_pixel(&px), [r, g, b, 255]);
        }
    }

    #[test]
    fn test_rgb565_quantizes_to_component_precision() {
        let mut px = [0u8; 2];
        PixelFormat::Rgb565.write_pixel(&mut px, 100, 100, 100, 255);
        let [r, g, b, a] = PixelFormat::Rgb565.read_pixel(&px);
        // 5-bit channels lose the low 3 bits, 6-bit channels the low 2.
        assert!((r as i32 - 100).abs() <= 8);
        assert!((g as i32 - 100).abs() <= 4);
        assert!((b as i32 - 100).abs() <= 8);
        assert_eq!(a, 255);
    }

    #[test]
    fn test_rgba8888_roundtrip() {
        let mut px = [0u8; 4];
        PixelFormat::Rgba8888.write_pixel(&mut px, 12, 34, 56, 78);
        assert_eq!(PixelFormat::Rgba8888.read_pixel(&px), [12, 34, 56, 78]);
    }

    #[test]
    fn test_buffer_sizes() {
        let buf = PixelBuffer::new_mutable(4, 3, PixelFormat::Rgb565);
        assert_eq!(buf.byte_size(), 4 * 3 * 2);
        assert!(buf.storage_bytes() >= buf.byte_size());
        assert!(buf.is_mutable());
    }

    #[test]
    fn test_can_rewrite_respects_capacity_and_sample_size() {
        let buf = PixelBuffer::new_mutable(100, 100, PixelFormat::Rgba8888);

        // Same size fits, larger does not.
        assert!(buf.can_rewrite(100, 100, 1));
        assert!(!buf.can_rewrite(101, 100, 1));

        // Downsampling shrinks the requirement below the allocation.
        assert!(buf.can_rewrite(200, 200, 2));
        assert!(!buf.can_rewrite(400, 400, 1));
    }

    #[test]
    fn test_frozen_buffer_is_never_rewritable() {
        let buf = PixelBuffer::new_mutable(8, 8, PixelFormat::Rgb565).freeze();
        assert!(!buf.is_mutable());
        assert!(!buf.can_rewrite(1, 1, 1));
    }

    #[test]
    fn test_reset_for_keeps_storage() {
        let mut buf = PixelBuffer::new_mutable(10, 10, PixelFormat::Rgba8888);
        let storage = buf.storage_bytes();

        buf.reset_for(5, 5, PixelFormat::Rgb565);
        assert_eq!(buf.width(), 5);
        assert_eq!(buf.height(), 5);
        assert_eq!(buf.byte_size(), 5 * 5 * 2);
        assert_eq!(buf.storage_bytes(), storage);
    }

    #[test]
    fn test_pixel_at() {
        let mut buf = PixelBuffer::new_mutable(2, 2, PixelFormat::Rgba8888);
        let bytes = buf.as_bytes_mut().unwrap();
        PixelFormat::Rgba8888.write_pixel(&mut bytes[12..16], 9, 8, 7, 6);
        assert_eq!(buf.pixel_at(1, 1), [9, 8, 7, 6]);
    }

    #[test]
    fn test_cache_key_equality_and_display() {
        let a = CacheKey::new("image:42");
        let b = CacheKey::from("image:42");
        let c = CacheKey::from("image:43".to_string());
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.to_string(), "image:42");
    }
}
