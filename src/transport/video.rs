//! Local stand-in for the video engine
//!
//! The console has no media engine of its own; this one only tracks channel
//! membership so teardown ordering can be observed.

use crate::transport::traits::VideoTransport;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Calls made against a `RecordingVideo`, in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VideoCall {
    Join(String),
    Leave,
    Destroy,
}

#[derive(Clone, Default)]
pub struct RecordingVideo {
    calls: Arc<Mutex<Vec<VideoCall>>>,
    fail_leave: bool,
}

impl RecordingVideo {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `leave` fail, to exercise best-effort teardown
    #[cfg(test)]
    pub fn failing_leave() -> Self {
        Self {
            fail_leave: true,
            ..Self::default()
        }
    }

    pub fn calls(&self) -> Vec<VideoCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    fn record(&self, call: VideoCall) {
        debug!("[VIDEO] {:?}", call);
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(call);
        }
    }
}

#[async_trait]
impl VideoTransport for RecordingVideo {
    async fn join(&self, channel: &str) -> Result<()> {
        self.record(VideoCall::Join(channel.to_string()));
        Ok(())
    }

    async fn leave(&self) -> Result<()> {
        self.record(VideoCall::Leave);
        if self.fail_leave {
            return Err(anyhow!("Video engine refused to leave channel"));
        }
        Ok(())
    }

    async fn destroy(&self) -> Result<()> {
        self.record(VideoCall::Destroy);
        Ok(())
    }
}
