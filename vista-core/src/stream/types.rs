//! Shared types for the capture/encode/delivery pipeline.
//!
//! These are **internal** frame representations used between pipeline
//! stages. The serialisable wire type is
//! [`FrameMessage`](crate::message::FrameMessage).

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::codec::MAX_FRAME_SIZE;
use crate::error::StreamError;

/// Bytes reserved for the fields framed alongside raw pixel data.
const FRAME_HEADER_ALLOWANCE: usize = 64;

// ── PixelFormat ──────────────────────────────────────────────────

/// Pixel layout for raw captured frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PixelFormat {
    /// 4 bytes per pixel: Blue, Green, Red, Alpha.
    Bgra8,
    /// 4 bytes per pixel: Red, Green, Blue, Alpha.
    Rgba8,
    /// 3 bytes per pixel: Red, Green, Blue.
    Rgb8,
}

impl PixelFormat {
    /// Bytes consumed by a single pixel in this format.
    pub const fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Bgra8 | PixelFormat::Rgba8 => 4,
            PixelFormat::Rgb8 => 3,
        }
    }
}

// ── Viewport ─────────────────────────────────────────────────────

/// Dimensions of the remote page viewport in CSS pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

impl Viewport {
    /// Largest accepted edge length.
    pub const MAX_EDGE: u32 = 8192;

    /// Largest accepted pixel count. A full 4-byte-per-pixel capture plus
    /// its reply header must fit in one wire frame.
    pub const MAX_AREA: u64 = ((MAX_FRAME_SIZE - FRAME_HEADER_ALLOWANCE) / 4) as u64;

    pub fn new(width: u32, height: u32) -> Result<Self, StreamError> {
        StreamError::check_range("viewport.width", width as i64, 1, Self::MAX_EDGE as i64)?;
        StreamError::check_range("viewport.height", height as i64, 1, Self::MAX_EDGE as i64)?;
        let area = width as u64 * height as u64;
        StreamError::check_range("viewport.area", area as i64, 1, Self::MAX_AREA as i64)?;
        Ok(Self { width, height })
    }
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
        }
    }
}

// ── RawFrame ─────────────────────────────────────────────────────

/// A raw, uncompressed capture obtained from the renderer.
///
/// The `data` buffer holds `height` rows of `stride` bytes each.
/// `stride` may be larger than `width * bytes_per_pixel` when the
/// renderer pads rows.
#[derive(Debug, Clone)]
pub struct RawFrame {
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Row pitch in **bytes** (may exceed `width * bpp`).
    pub stride: u32,
    /// Pixel layout.
    pub format: PixelFormat,
    /// Raw pixel data: `stride * height` bytes.
    pub data: Vec<u8>,
}

impl RawFrame {
    /// A tightly packed frame filled with a single byte value.
    pub fn filled(width: u32, height: u32, format: PixelFormat, value: u8) -> Self {
        let stride = width * format.bytes_per_pixel() as u32;
        Self {
            width,
            height,
            stride,
            format,
            data: vec![value; stride as usize * height as usize],
        }
    }

    /// Total byte size the raw bitmap occupies.
    pub fn byte_len(&self) -> usize {
        self.stride as usize * self.height as usize
    }

    /// Bytes of visible pixels in one row (excluding padding).
    pub fn row_len(&self) -> usize {
        self.width as usize * self.format.bytes_per_pixel()
    }

    /// Check that the buffer is large enough for the declared geometry.
    pub fn validate(&self) -> Result<(), StreamError> {
        if (self.stride as usize) < self.row_len() {
            return Err(StreamError::Encode(format!(
                "stride {} shorter than row length {}",
                self.stride,
                self.row_len()
            )));
        }
        if self.data.len() < self.byte_len() {
            return Err(StreamError::Encode(format!(
                "frame buffer too short: {} < {}",
                self.data.len(),
                self.byte_len()
            )));
        }
        Ok(())
    }

    /// Returns the visible part of row `y`, or `None` when out of bounds.
    pub fn row(&self, y: u32) -> Option<&[u8]> {
        let start = y as usize * self.stride as usize;
        self.data.get(start..start + self.row_len())
    }
}

// ── EncodedFrame ─────────────────────────────────────────────────

/// A compressed frame ready for fan-out.
///
/// `data` is reference counted so every subscriber shares one buffer.
#[derive(Debug, Clone)]
pub struct EncodedFrame {
    /// Per-session sequence number, strictly increasing.
    pub sequence: u64,
    /// Monotonic capture timestamp.
    pub captured_at: Instant,
    /// Wall-clock capture time in milliseconds since the Unix epoch.
    pub timestamp_ms: u64,
    pub width: u32,
    pub height: u32,
    /// Quality the frame was encoded at.
    pub quality: u8,
    /// Encoded payload.
    pub data: Bytes,
}

impl EncodedFrame {
    pub fn size_bytes(&self) -> usize {
        self.data.len()
    }
}

/// Milliseconds since the Unix epoch for a wall-clock time.
pub fn unix_millis(t: std::time::SystemTime) -> u64 {
    t.duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// ── Tests ────────────────────────────────────────────────────────
