//! Windowed region decoding.
//!
//! Decodes an arbitrary axis-aligned rectangle of a large encoded image
//! without ever materializing the full frame: rows are streamed from the
//! source, rows above the window are discarded, and the stream stops after
//! the last row the window needs. The handle keeps its seekable source so
//! the same image can serve any number of region requests.

use std::io::{BufRead, Read, Seek, SeekFrom};

use longview_cache::{PixelBuffer, PixelFormat};
use thiserror::Error;

const PNG_SIGNATURE: [u8; 8] = [0x89, b'P', b'N', b'G', b'\r', b'\n', 0x1a, b'\n'];

/// An axis-aligned rectangle in source-image pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Region {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }
}

/// The source cannot be used for region decoding at all. Fatal to the image
/// assignment; no cache interaction happens for such a source.
#[derive(Debug, Error)]
pub enum DecodeInitError {
    #[error("I/O error reading source: {0}")]
    Io(#[from] std::io::Error),

    #[error("source is not a supported streamable format")]
    UnsupportedFormat,

    #[error("interlaced sources cannot be streamed row-wise")]
    InterlacedSource,

    #[error("corrupt image header: {0}")]
    InvalidHeader(String),
}

/// A single region request failed. The handle stays valid for future valid
/// requests.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("region is empty")]
    EmptyRegion,

    #[error("region {x},{y} {width}x{height} exceeds image bounds {image_width}x{image_height}")]
    OutOfBounds {
        x: u32,
        y: u32,
        width: u32,
        height: u32,
        image_width: u32,
        image_height: u32,
    },

    #[error("decoder is closed")]
    Closed,

    #[error("target buffer holds {available} bytes, decode needs {required}")]
    TargetCapacity { required: usize, available: usize },

    #[error("source ended before the requested region")]
    TruncatedSource,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("decode failed: {0}")]
    Codec(String),
}

/// Decode only the header of a source: its pixel dimensions. Constant cost
/// regardless of image size.
pub fn probe_bounds<R: BufRead + Seek>(source: R) -> Result<(u32, u32), DecodeInitError> {
    let probe = image::ImageReader::new(source).with_guessed_format()?;
    probe.into_dimensions().map_err(|e| match e {
        image::ImageError::Unsupported(_) => DecodeInitError::UnsupportedFormat,
        other => DecodeInitError::InvalidHeader(other.to_string()),
    })
}

/// A reusable handle for partial decodes of one source image.
#[derive(Debug)]
pub struct RegionDecoder<R> {
    source: Option<R>,
    width: u32,
    height: u32,
    sample_size: u32,
    format: PixelFormat,
}

impl<R: BufRead + Seek> RegionDecoder<R> {
    /// Open a source for repeated region decodes, producing opaque 16-bit
    /// pixels.
    pub fn open(source: R) -> Result<Self, DecodeInitError> {
        Self::open_with(source, false)
    }

    /// Open a source, choosing the pixel format from the alpha requirement:
    /// 16-bit opaque by default, 32-bit when transparency must survive.
    pub fn open_with(mut source: R, needs_alpha: bool) -> Result<Self, DecodeInitError> {
        source.seek(SeekFrom::Start(0))?;
        let mut signature = [0u8; 8];
        if source.read_exact(&mut signature).is_err() || signature != PNG_SIGNATURE {
            return Err(DecodeInitError::UnsupportedFormat);
        }

        source.seek(SeekFrom::Start(0))?;
        let decoder = png::Decoder::new(&mut source);
        let reader = decoder
            .read_info()
            .map_err(|e| DecodeInitError::InvalidHeader(e.to_string()))?;
        let info = reader.info();
        if info.interlaced {
            return Err(DecodeInitError::InterlacedSource);
        }
        let (width, height) = (info.width, info.height);
        drop(reader);
        source.seek(SeekFrom::Start(0))?;

        Ok(Self {
            source: Some(source),
            width,
            height,
            sample_size: 1,
            format: if needs_alpha {
                PixelFormat::Rgba8888
            } else {
                PixelFormat::Rgb565
            },
        })
    }

    /// Configure the integer downsampling factor applied by every decode.
    pub fn with_sample_size(mut self, sample_size: u32) -> Self {
        self.sample_size = sample_size.max(1);
        self
    }

    /// Source image width in pixels.
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Source image height in pixels.
    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn sample_size(&self) -> u32 {
        self.sample_size
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn is_closed(&self) -> bool {
        self.source.is_none()
    }

    /// Release the source. Later region requests fail with
    /// [`DecodeError::Closed`]; the render step treats that as "no image".
    pub fn close(&mut self) {
        self.source = None;
    }

    /// Decode exactly `region` into a pixel buffer.
    ///
    /// With `target` supplied, its capacity is validated and the pixels are
    /// written in place with no allocation; an incompatible target is a
    /// [`DecodeError::TargetCapacity`] error, never a silent reallocation.
    /// With `None`, a fresh buffer is allocated.
    pub fn decode_region(
        &mut self,
        region: Region,
        target: Option<PixelBuffer>,
    ) -> Result<PixelBuffer, DecodeError> {
        let (image_width, image_height) = (self.width, self.height);
        let sample = self.sample_size;
        let format = self.format;
        let source = self.source.as_mut().ok_or(DecodeError::Closed)?;

        if region.width == 0 || region.height == 0 {
            return Err(DecodeError::EmptyRegion);
        }
        if region.x as u64 + region.width as u64 > image_width as u64
            || region.y as u64 + region.height as u64 > image_height as u64
        {
            return Err(DecodeError::OutOfBounds {
                x: region.x,
                y: region.y,
                width: region.width,
                height: region.height,
                image_width,
                image_height,
            });
        }

        let out_width = (region.width / sample).max(1);
        let out_height = (region.height / sample).max(1);
        let bpp = format.bytes_per_pixel();
        let required = out_width as usize * out_height as usize * bpp;

        let mut buffer = match target {
            Some(mut target) => {
                if target.is_mutable() && target.storage_bytes() >= required {
                    target.reset_for(out_width, out_height, format);
                    target
                } else {
                    return Err(DecodeError::TargetCapacity {
                        required,
                        available: target.storage_bytes(),
                    });
                }
            }
            None => PixelBuffer::new_mutable(out_width, out_height, format),
        };

        source.seek(SeekFrom::Start(0))?;
        let mut decoder = png::Decoder::new(&mut *source);
        decoder.set_transformations(png::Transformations::EXPAND | png::Transformations::STRIP_16);
        let mut reader = decoder
            .read_info()
            .map_err(|e| DecodeError::Codec(e.to_string()))?;
        let (color, _depth) = reader.output_color_type();
        let samples = color.samples();

        // Rows stream in order; everything above the window is discarded and
        // the loop stops at the last row the window needs.
        let last_row = region.y + (out_height - 1) * sample;
        let out = buffer
            .as_bytes_mut()
            .expect("decode targets are always mutable");
        let mut src_y: u32 = 0;
        loop {
            let row = reader
                .next_row()
                .map_err(|e| DecodeError::Codec(e.to_string()))?
                .ok_or(DecodeError::TruncatedSource)?;

            if src_y >= region.y && (src_y - region.y) % sample == 0 {
                let out_y = (src_y - region.y) / sample;
                if out_y < out_height {
                    let data = row.data();
                    for out_x in 0..out_width {
                        let sx = (region.x + out_x * sample) as usize * samples;
                        let (r, g, b, a) = match samples {
                            1 => (data[sx], data[sx], data[sx], 255),
                            2 => (data[sx], data[sx], data[sx], data[sx + 1]),
                            3 => (data[sx], data[sx + 1], data[sx + 2], 255),
                            _ => (data[sx], data[sx + 1], data[sx + 2], data[sx + 3]),
                        };
                        let idx = (out_y as usize * out_width as usize + out_x as usize) * bpp;
                        format.write_pixel(&mut out[idx..idx + bpp], r, g, b, a);
                    }
                }
            }

            if src_y >= last_row {
                break;
            }
            src_y += 1;
        }

        Ok(buffer)
    }
}
