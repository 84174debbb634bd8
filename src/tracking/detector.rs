//! Vision detector seam and camera frame feed

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bytes::Bytes;
use robofleet_shared::{DetectedObject, DetectionFrame};
use std::collections::VecDeque;
use std::sync::Mutex;
use tokio::sync::watch;

/// A raw camera frame handed to the detector
#[derive(Debug, Clone, PartialEq)]
pub struct CameraFrame {
    pub sequence: u64,
    pub width: u32,
    pub height: u32,
    pub data: Bytes,
}

impl CameraFrame {
    pub fn new(sequence: u64, width: u32, height: u32) -> Self {
        Self {
            sequence,
            width,
            height,
            data: Bytes::new(),
        }
    }
}

/// External object detector
#[async_trait]
pub trait Detector: Send + Sync + 'static {
    async fn detect(&self, frame: &CameraFrame) -> Result<DetectionFrame>;
}

/// Latest-only camera feed for one session.
///
/// Publishing a frame replaces any frame the analysis worker has not picked
/// up yet; stale frames are never queued.
#[derive(Clone)]
pub struct FrameFeed {
    tx: watch::Sender<Option<CameraFrame>>,
}

impl FrameFeed {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx }
    }

    /// Offer a new frame from the camera
    pub fn push(&self, frame: CameraFrame) {
        self.tx.send_replace(Some(frame));
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<Option<CameraFrame>> {
        self.tx.subscribe()
    }
}

impl Default for FrameFeed {
    fn default() -> Self {
        Self::new()
    }
}

/// Detector that replays a script of results, one per frame.
///
/// Frames beyond the end of the script detect nothing.
#[derive(Default)]
pub struct ScriptedDetector {
    script: Mutex<VecDeque<Result<Vec<DetectedObject>, String>>>,
}

impl ScriptedDetector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_objects(&self, objects: Vec<DetectedObject>) {
        self.push(Ok(objects));
    }

    pub fn push_failure(&self, reason: impl Into<String>) {
        self.push(Err(reason.into()));
    }

    pub fn remaining(&self) -> usize {
        self.script.lock().map(|s| s.len()).unwrap_or(0)
    }

    fn push(&self, entry: Result<Vec<DetectedObject>, String>) {
        if let Ok(mut script) = self.script.lock() {
            script.push_back(entry);
        }
    }
}

#[async_trait]
impl Detector for ScriptedDetector {
    async fn detect(&self, frame: &CameraFrame) -> Result<DetectionFrame> {
        let next = self
            .script
            .lock()
            .map_err(|_| anyhow!("Detector script poisoned"))?
            .pop_front();

        match next {
            Some(Ok(objects)) => Ok(DetectionFrame::new(frame.width, frame.height, objects)),
            Some(Err(reason)) => Err(anyhow!(reason)),
            None => Ok(DetectionFrame::empty(frame.width, frame.height)),
        }
    }
}
