//! Frame encoders.
//!
//! [`FrameEncoder`] is the seam to whatever image or video encoder a
//! deployment uses. [`ZstdEncoder`] is the built-in implementation:
//!
//! - rows are packed tightly (stride padding dropped),
//! - each channel is quantised to a precision derived from `quality`
//!   (100 keeps all 8 bits, 10 keeps 3),
//! - the result is zstd-compressed behind a small header.
//!
//! Payload layout (little-endian):
//! ```text
//! magic:   [u8; 4]  "VZF1"
//! width:   u32
//! height:  u32
//! format:  u8       (0 = BGRA8, 1 = RGBA8, 2 = RGB8)
//! bits:    u8       retained bits per channel
//! body:    [u8]     zstd(packed pixels)
//! ```

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::StreamError;
use crate::stream::types::{PixelFormat, RawFrame};

/// Header magic for [`ZstdEncoder`] payloads.
pub const MAGIC: [u8; 4] = *b"VZF1";
/// Size of the payload header.
pub const HEADER_LEN: usize = 14;

// ── FrameEncoder ─────────────────────────────────────────────────

/// Turns raw captures into transmittable bytes.
///
/// Implementations are called from the blocking worker pool and may be
/// CPU heavy.
pub trait FrameEncoder: Send + Sync {
    /// Encode `frame` at `quality` (10..=100).
    fn encode(&self, frame: &RawFrame, quality: u8) -> Result<Bytes, StreamError>;
}

// ── ZstdEncoder ──────────────────────────────────────────────────

/// Quantising zstd encoder.
#[derive(Debug, Clone)]
pub struct ZstdEncoder {
    /// zstd compression level (1 = fastest).
    level: i32,
}

impl ZstdEncoder {
    pub fn new(level: i32) -> Self {
        Self {
            level: level.clamp(1, 19),
        }
    }

    /// Bits of precision kept per channel at `quality`.
    pub fn bits_for_quality(quality: u8) -> u8 {
        let q = quality.clamp(10, 100) as u32;
        // 10 → 3 bits, 100 → 8 bits, linear in between.
        (3 + (q - 10) * 5 / 90) as u8
    }

    fn format_tag(format: PixelFormat) -> u8 {
        match format {
            PixelFormat::Bgra8 => 0,
            PixelFormat::Rgba8 => 1,
            PixelFormat::Rgb8 => 2,
        }
    }

    /// Visible pixels, rows packed, each byte masked to `bits`.
    fn pack(frame: &RawFrame, bits: u8) -> Vec<u8> {
        let mask: u8 = 0xFFu8 << (8 - bits.clamp(1, 8));
        let mut out = Vec::with_capacity(frame.row_len() * frame.height as usize);
        for y in 0..frame.height {
            if let Some(row) = frame.row(y) {
                out.extend(row.iter().map(|b| b & mask));
            }
        }
        out
    }
}

impl Default for ZstdEncoder {
    fn default() -> Self {
        Self::new(3)
    }
}

impl FrameEncoder for ZstdEncoder {
    fn encode(&self, frame: &RawFrame, quality: u8) -> Result<Bytes, StreamError> {
        frame.validate()?;
        let bits = Self::bits_for_quality(quality);
        let packed = Self::pack(frame, bits);

        let body = zstd::encode_all(packed.as_slice(), self.level)
            .map_err(|e| StreamError::Encode(format!("zstd encode failed: {e}")))?;

        let mut out = BytesMut::with_capacity(HEADER_LEN + body.len());
        out.put_slice(&MAGIC);
        out.put_u32_le(frame.width);
        out.put_u32_le(frame.height);
        out.put_u8(Self::format_tag(frame.format));
        out.put_u8(bits);
        out.put_slice(&body);
        Ok(out.freeze())
    }
}

// ── Tests ────────────────────────────────────────────────────────
