//! Longview render library.
//!
//! Region decoding for very large images: a bounds probe, a reusable
//! windowed decoder that streams only the rows a requested rectangle needs,
//! and a downsampled whole-image decode for bounded-size images.

pub mod region;
pub mod resize;

pub use region::{probe_bounds, DecodeError, DecodeInitError, Region, RegionDecoder};
pub use resize::{decode_scaled, sample_size_for};
