//! InferenceEngine - Object Detection Capability
//!
//! The model itself is opaque: a frame goes in, labelled detections come
//! out. One engine instance is shared by every pipeline, so implementations
//! must tolerate concurrent `detect` calls.

mod http_engine;

pub use http_engine::HttpInferenceEngine;

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Bounding box in pixel coordinates
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

/// One detected object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub class: String,
    /// 0.0 - 1.0
    pub confidence: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bbox: Option<BBox>,
}

impl Detection {
    pub fn new(class: impl Into<String>, confidence: f64) -> Self {
        Self {
            class: class.into(),
            confidence,
            bbox: None,
        }
    }
}

#[async_trait]
pub trait InferenceEngine: Send + Sync {
    /// Load the model / check the backend. Called once before any detect.
    async fn initialize(&self) -> Result<()>;

    /// Detections for one JPEG frame, in engine order.
    async fn detect(&self, frame: &[u8]) -> Result<Vec<Detection>>;

    /// Release resources. Called once at shutdown.
    async fn dispose(&self);
}
