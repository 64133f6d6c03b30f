//! Downsampled whole-image decoding.
//!
//! For bounded-size images (thumbnails, covers) where the full frame is
//! acceptable to decode, this picks a power-of-two sample size that brings
//! the result under a maximum width and height, optionally writing into a
//! recycled buffer. The long-image path never comes through here; it uses
//! [`crate::region`].

use std::io::{BufRead, Seek};

use longview_cache::{PixelBuffer, PixelFormat};

use crate::region::DecodeError;

/// Power-of-two downsampling factor that brings `width x height` under the
/// given maxima. Both dimensions must exceed their maximum for any
/// downsampling to happen at all.
pub fn sample_size_for(width: u32, height: u32, max_width: u32, max_height: u32) -> u32 {
    let mut sample_size = 1;
    if width > max_width && height > max_height {
        sample_size = 2;
        while width / sample_size > max_width && height / sample_size > max_height {
            sample_size *= 2;
        }
    }
    sample_size
}

/// Decode a whole image downsampled to fit `max_width x max_height`.
///
/// `keep_alpha` selects the 32-bit format; otherwise pixels are stored as
/// opaque 16-bit color. A supplied `reusable` buffer is capacity-validated
/// and written in place; an incompatible one is a
/// [`DecodeError::TargetCapacity`] error.
pub fn decode_scaled<R: BufRead + Seek>(
    source: R,
    max_width: u32,
    max_height: u32,
    keep_alpha: bool,
    reusable: Option<PixelBuffer>,
) -> Result<PixelBuffer, DecodeError> {
    let decoded = image::ImageReader::new(source)
        .with_guessed_format()?
        .decode()
        .map_err(|e| DecodeError::Codec(e.to_string()))?;

    let (width, height) = (decoded.width(), decoded.height());
    let sample = sample_size_for(width, height, max_width, max_height);
    let out_width = (width / sample).max(1);
    let out_height = (height / sample).max(1);

    let scaled = if sample > 1 {
        decoded.resize_exact(out_width, out_height, image::imageops::FilterType::Triangle)
    } else {
        decoded
    };

    let format = if keep_alpha {
        PixelFormat::Rgba8888
    } else {
        PixelFormat::Rgb565
    };
    let bpp = format.bytes_per_pixel();
    let required = out_width as usize * out_height as usize * bpp;

    let mut buffer = match reusable {
        Some(mut reusable) => {
            if reusable.is_mutable() && reusable.storage_bytes() >= required {
                reusable.reset_for(out_width, out_height, format);
                reusable
            } else {
                return Err(DecodeError::TargetCapacity {
                    required,
                    available: reusable.storage_bytes(),
                });
            }
        }
        None => PixelBuffer::new_mutable(out_width, out_height, format),
    };

    let rgba = scaled.to_rgba8();
    let bytes = buffer
        .as_bytes_mut()
        .expect("decode targets are always mutable");
    for (y, row) in rgba.rows().enumerate() {
        for (x, px) in row.enumerate() {
            let idx = (y * out_width as usize + x) * bpp;
            format.write_pixel(&mut bytes[idx..idx + bpp], px.0[0], px.0[1], px.0[2], px.0[3]);
        }
    }

    Ok(buffer)
}
