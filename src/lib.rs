//! streamwatch - Live Stream Object Detection
//!
//! Samples frames from live video streams, runs them through an inference
//! engine and turns qualifying detections into rate-limited chat notifications.
//!
//! ## Architecture (5 Components)
//!
//! 1. FrameSource - ffmpeg decode process, frame demux, reconnect/backoff
//! 2. InferenceEngine - object detection capability (consumed)
//! 3. RuleEngine - per-channel detection rules with TTL cache
//! 4. DetectionPipeline - one channel: frames -> detections -> notifications
//! 5. Orchestrator - all channels: liveness polling, pause/resume, isolation
//!
//! Persistence, chat transport and stream liveness live behind the traits in
//! [`collaborators`].

pub mod collaborators;
pub mod config;
pub mod detection_pipeline;
pub mod error;
pub mod frame_source;
pub mod inference;
pub mod orchestrator;
pub mod rule_engine;

#[cfg(test)]
pub(crate) mod testing;

pub use error::{Error, Result};
pub use orchestrator::Orchestrator;
