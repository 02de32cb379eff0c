//! Bounded window of recent frames

use super::frame::Frame;
use std::collections::VecDeque;

/// Ring buffer for frames, oldest evicted first
pub struct FrameRingBuffer {
    frames: VecDeque<Frame>,
    capacity: usize,
}

impl FrameRingBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            frames: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Insert a frame, returning the evicted one when full.
    pub fn push(&mut self, frame: Frame) -> Option<Frame> {
        let evicted = if self.frames.len() >= self.capacity {
            self.frames.pop_front()
        } else {
            None
        };
        self.frames.push_back(frame);
        evicted
    }

    pub fn latest(&self) -> Option<&Frame> {
        self.frames.back()
    }

    /// Newest first
    pub fn get_latest(&self, count: usize) -> Vec<Frame> {
        self.frames.iter().rev().take(count).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.frames.clear();
    }
}
