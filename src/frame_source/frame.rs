//! Decoded frame and frame validation

use chrono::{DateTime, Utc};
use std::sync::Arc;

/// JPEG start-of-image marker
pub const JPEG_SOI: [u8; 2] = [0xFF, 0xD8];
/// JPEG end-of-image marker
pub const JPEG_EOI: [u8; 2] = [0xFF, 0xD9];
/// Anything shorter cannot hold a JPEG header plus scan data
pub const MIN_FRAME_BYTES: usize = 100;

/// One decoded still image (JPEG bytes)
#[derive(Debug, Clone)]
pub struct Frame {
    pub data: Arc<[u8]>,
    pub captured_at: DateTime<Utc>,
    /// Monotonic per FrameSource, starting at 0
    pub sequence: u64,
}

impl Frame {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Why a reassembled frame was dropped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameRejection {
    TooShort(usize),
    MissingStartMarker,
    Oversized(usize),
}

impl std::fmt::Display for FrameRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameRejection::TooShort(len) => write!(f, "frame too short ({} bytes)", len),
            FrameRejection::MissingStartMarker => write!(f, "missing JPEG start marker"),
            FrameRejection::Oversized(len) => write!(f, "frame oversized ({} bytes)", len),
        }
    }
}

/// Check minimal JPEG signature and size bounds.
pub fn validate_frame(data: &[u8], max_frame_bytes: usize) -> Result<(), FrameRejection> {
    if data.len() < MIN_FRAME_BYTES {
        return Err(FrameRejection::TooShort(data.len()));
    }
    if data[..2] != JPEG_SOI {
        return Err(FrameRejection::MissingStartMarker);
    }
    if data.len() > max_frame_bytes {
        return Err(FrameRejection::Oversized(data.len()));
    }
    Ok(())
}
