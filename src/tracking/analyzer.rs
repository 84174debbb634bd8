//! Frame-analysis worker
//!
//! Runs while a session is autonomous: pulls the latest camera frame, asks the
//! detector for objects, feeds the tracking engine and reports any emitted
//! command back to the session worker.

use super::detector::{CameraFrame, Detector};
use super::engine::{TrackingConfig, TrackingDecisionEngine};
use crate::error::CoordinatorError;
use robofleet_shared::{Command, RobotId};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// A command produced by frame analysis, tagged with the analyzer generation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackedCommand {
    pub command: Command,
    pub epoch: u64,
}

/// Counters returned when an analyzer stops
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AnalyzerStats {
    pub frames_analyzed: u64,
    pub detector_failures: u64,
    pub commands_emitted: u64,
}

/// Handle to a running frame-analysis worker
pub struct FrameAnalyzer {
    robot_id: RobotId,
    epoch: u64,
    stop_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<AnalyzerStats>,
}

impl FrameAnalyzer {
    /// Start analysis with a fresh engine; frames already in the feed are skipped
    pub fn spawn(
        robot_id: RobotId,
        epoch: u64,
        mut frames: watch::Receiver<Option<CameraFrame>>,
        detector: Arc<dyn Detector>,
        config: TrackingConfig,
        out: mpsc::UnboundedSender<TrackedCommand>,
    ) -> Self {
        // Only frames captured after autonomy began count
        frames.borrow_and_update();

        let (stop_tx, stop_rx) = oneshot::channel();
        let engine = TrackingDecisionEngine::new(config);

        let task = tokio::spawn(async move {
            analysis_loop(robot_id, epoch, frames, detector, engine, out, stop_rx).await
        });

        info!("[TRACK {}] Frame analysis started (epoch {})", robot_id, epoch);
        Self {
            robot_id,
            epoch,
            stop_tx: Some(stop_tx),
            task,
        }
    }

    /// Stop frame delivery; an in-flight detection gets `grace` to finish
    pub async fn stop(mut self, grace: Duration) -> AnalyzerStats {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }

        let stats = match tokio::time::timeout(grace, &mut self.task).await {
            Ok(Ok(stats)) => stats,
            Ok(Err(e)) => {
                warn!("[TRACK {}] Analyzer task ended abnormally: {}", self.robot_id, e);
                AnalyzerStats::default()
            }
            Err(_) => {
                warn!("[TRACK {}] Analyzer did not stop in {:?}, aborting", self.robot_id, grace);
                self.task.abort();
                AnalyzerStats::default()
            }
        };

        info!(
            "[TRACK {}] Frame analysis stopped (epoch {}): {} analyzed, {} failed, {} commands",
            self.robot_id, self.epoch, stats.frames_analyzed, stats.detector_failures, stats.commands_emitted
        );
        stats
    }
}

async fn analysis_loop(
    robot_id: RobotId,
    epoch: u64,
    mut frames: watch::Receiver<Option<CameraFrame>>,
    detector: Arc<dyn Detector>,
    mut engine: TrackingDecisionEngine,
    out: mpsc::UnboundedSender<TrackedCommand>,
    mut stop_rx: oneshot::Receiver<()>,
) -> AnalyzerStats {
    let mut stats = AnalyzerStats::default();

    loop {
        tokio::select! {
            biased;
            _ = &mut stop_rx => break,
            changed = frames.changed() => {
                if changed.is_err() {
                    debug!("[TRACK {}] Frame feed closed", robot_id);
                    break;
                }
            }
        }

        let Some(frame) = frames.borrow_and_update().clone() else {
            continue;
        };

        let detection = match detector.detect(&frame).await {
            Ok(detection) => detection,
            Err(e) => {
                stats.detector_failures += 1;
                let err = CoordinatorError::DetectorFailure(e.to_string());
                warn!("[TRACK {}] Frame {} skipped: {}", robot_id, frame.sequence, err);
                continue;
            }
        };
        stats.frames_analyzed += 1;

        if let Some(command) = engine.observe(&detection) {
            stats.commands_emitted += 1;
            debug!(
                "[TRACK {}] Frame {} ({} bytes) -> {}",
                robot_id,
                frame.sequence,
                frame.data.len(),
                command
            );
            if out.send(TrackedCommand { command, epoch }).is_err() {
                break;
            }
        }
    }

    debug!(
        "[TRACK {}] Engine saw {} frames, last {:?}, {} empty in a row",
        robot_id,
        engine.frames_seen(),
        engine.last_command(),
        engine.consecutive_empty_frames()
    );
    stats
}
