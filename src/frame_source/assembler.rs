//! FrameAssembler - JPEG frame reassembly from the decoder byte stream
//!
//! ffmpeg writes back-to-back JPEGs to stdout with no framing. Frames are cut
//! at each end-of-image marker; whatever follows the marker is kept as the
//! start of the next frame.

use super::frame::JPEG_EOI;

pub struct FrameAssembler {
    buffer: Vec<u8>,
    /// Bytes already searched for a marker (minus one, markers may straddle chunks)
    scanned: usize,
    max_frame_bytes: usize,
    resets: u64,
}

impl FrameAssembler {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(64 * 1024),
            scanned: 0,
            max_frame_bytes,
            resets: 0,
        }
    }

    /// Feed a chunk, returning every completed frame in stream order.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Vec<u8>> {
        self.buffer.extend_from_slice(chunk);

        let mut frames = Vec::new();
        loop {
            let from = self.scanned.saturating_sub(1);
            let Some(pos) = find_marker(&self.buffer[from..], &JPEG_EOI) else {
                self.scanned = self.buffer.len();
                break;
            };

            let frame_end = from + pos + JPEG_EOI.len();
            let frame: Vec<u8> = self.buffer.drain(..frame_end).collect();
            frames.push(frame);
            self.scanned = 0;
        }

        // Corruption guard: no end marker within twice the largest legal frame
        if self.buffer.len() > self.max_frame_bytes.saturating_mul(2) {
            tracing::warn!(
                pending_bytes = self.buffer.len(),
                max_frame_bytes = self.max_frame_bytes,
                "Frame accumulator overflow, discarding buffered bytes"
            );
            self.reset();
            self.resets += 1;
        }

        frames
    }

    /// Drop any partial frame (new decoder process).
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.scanned = 0;
    }

    pub fn pending_len(&self) -> usize {
        self.buffer.len()
    }

    pub fn resets(&self) -> u64 {
        self.resets
    }
}

fn find_marker(buffer: &[u8], marker: &[u8]) -> Option<usize> {
    buffer
        .windows(marker.len())
        .position(|window| window == marker)
}
