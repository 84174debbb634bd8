//! Autonomous person tracking
//!
//! This module handles:
//! - Turning detection frames into debounced motion commands
//! - Latest-only camera frame delivery
//! - The per-session frame-analysis worker

mod analyzer;
mod detector;
mod engine;

pub use analyzer::{FrameAnalyzer, TrackedCommand};
pub use detector::{CameraFrame, Detector, FrameFeed, ScriptedDetector};
pub use engine::TrackingConfig;
