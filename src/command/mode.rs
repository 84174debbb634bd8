//! Mode arbiter - gates manual and autonomous commands for one session

use super::dispatcher::CommandDispatcher;
use crate::readiness::{Disposition, ReadinessQueue};
use crate::tracking::{Detector, FrameAnalyzer, FrameFeed, TrackedCommand, TrackingConfig};
use robofleet_shared::state_machine::{ModeEvent, ModeStateMachine, TransitionResult};
use robofleet_shared::{codec, Command, ControlMode, RobotId, Topic};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Owns a session's control mode and the side effects of changing it.
///
/// Entering autonomous starts a frame analyzer with a fresh engine; entering
/// manual stops it and forces a STOP. Lives inside the session worker and
/// is never shared.
///
/// The session also subscribes to its own `ai_mode` topic, so every announced
/// toggle comes back. Announced modes wait in `echoes` until their echo is
/// consumed; anything else on the topic is a genuine remote set.
pub struct ModeArbiter {
    robot_id: RobotId,
    fsm: ModeStateMachine,
    dispatcher: CommandDispatcher,
    queue: ReadinessQueue,
    frames: FrameFeed,
    detector: Arc<dyn Detector>,
    tracking: TrackingConfig,
    tracked_tx: mpsc::UnboundedSender<TrackedCommand>,
    analyzer: Option<FrameAnalyzer>,
    epoch: u64,
    analyzer_grace: Duration,
    mode_tx: watch::Sender<ControlMode>,
    echoes: VecDeque<ControlMode>,
}

impl ModeArbiter {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        robot_id: RobotId,
        dispatcher: CommandDispatcher,
        queue: ReadinessQueue,
        frames: FrameFeed,
        detector: Arc<dyn Detector>,
        tracking: TrackingConfig,
        tracked_tx: mpsc::UnboundedSender<TrackedCommand>,
        analyzer_grace: Duration,
    ) -> Self {
        let (mode_tx, _) = watch::channel(ControlMode::Manual);
        Self {
            robot_id,
            fsm: ModeStateMachine::new(),
            dispatcher,
            queue,
            frames,
            detector,
            tracking,
            tracked_tx,
            analyzer: None,
            epoch: 0,
            analyzer_grace,
            mode_tx,
            echoes: VecDeque::new(),
        }
    }

    pub fn mode(&self) -> ControlMode {
        self.fsm.mode()
    }

    /// Watch mode changes
    pub fn watch(&self) -> watch::Receiver<ControlMode> {
        self.mode_tx.subscribe()
    }

    #[cfg(test)]
    pub fn is_tracking(&self) -> bool {
        self.analyzer.is_some()
    }

    /// Operator pressed the mode button: flip and announce the new mode
    pub async fn toggle(&mut self) -> TransitionResult {
        let result = self.fsm.process_event(ModeEvent::LocalToggle);
        if let TransitionResult::Entered { from, to } = result {
            self.apply(from, to).await;

            let disposition = self
                .queue
                .publish_topic(Topic::ai_mode(self.robot_id), codec::encode_mode(to))
                .await;
            match disposition {
                Disposition::Queued | Disposition::Executed => self.echoes.push_back(to),
                Disposition::Failed | Disposition::Dropped => {
                    warn!("[MODE {}] Mode {} not announced: {:?}", self.robot_id, to, disposition)
                }
            }
        }
        result
    }

    /// A value arrived on the `ai_mode` topic
    pub async fn on_remote(&mut self, payload: &[u8]) -> TransitionResult {
        let requested = ControlMode::from_payload(payload);
        if !self.fsm.is_closed() {
            match self.echoes.pop_front() {
                Some(announced) if announced == requested => {
                    debug!("[MODE {}] Echo of announced {}", self.robot_id, announced);
                    return TransitionResult::Unchanged(self.mode());
                }
                // Another writer got in between; later echoes are ordinary sets
                Some(_) => self.echoes.clear(),
                None => {}
            }
        }

        let result = self.fsm.process_event(ModeEvent::RemoteSet(requested));

        match result {
            TransitionResult::Entered { from, to } => self.apply(from, to).await,
            TransitionResult::Unchanged(mode) => {
                debug!("[MODE {}] Remote mode {} already active", self.robot_id, mode)
            }
            TransitionResult::Closed => {}
        }
        result
    }

    /// Operator issued a motion command; dropped while autonomous
    pub fn manual(&mut self, command: Command) -> bool {
        if self.fsm.is_closed() || self.mode() == ControlMode::Autonomous {
            debug!("[MODE {}] Manual {} ignored in {}", self.robot_id, command, self.mode());
            return false;
        }
        self.forward(command)
    }

    /// Frame analysis produced a command; only the current analyzer generation counts
    pub fn on_tracked(&mut self, tracked: TrackedCommand) -> bool {
        if self.mode() != ControlMode::Autonomous || tracked.epoch != self.epoch {
            debug!(
                "[MODE {}] Stale tracking command {} (epoch {}, current {})",
                self.robot_id, tracked.command, tracked.epoch, self.epoch
            );
            return false;
        }
        self.forward(tracked.command)
    }

    /// Session teardown: stop frame delivery regardless of mode
    pub async fn close(&mut self) {
        let result = self.fsm.process_event(ModeEvent::SessionClosed);
        if result.entered().is_some() {
            self.mode_tx.send_replace(ControlMode::Manual);
        }
        self.stop_tracking().await;
    }

    async fn apply(&mut self, from: ControlMode, to: ControlMode) {
        info!("[MODE {}] {} -> {}", self.robot_id, from, to);
        self.mode_tx.send_replace(to);

        match to {
            ControlMode::Autonomous => self.start_tracking(),
            ControlMode::Manual => {
                self.stop_tracking().await;
                if let Err(e) = self.dispatcher.force_stop() {
                    warn!("[MODE {}] Could not issue STOP: {}", self.robot_id, e);
                }
            }
        }
    }

    fn start_tracking(&mut self) {
        self.epoch += 1;
        self.analyzer = Some(FrameAnalyzer::spawn(
            self.robot_id,
            self.epoch,
            self.frames.subscribe(),
            self.detector.clone(),
            self.tracking.clone(),
            self.tracked_tx.clone(),
        ));
    }

    async fn stop_tracking(&mut self) {
        if let Some(analyzer) = self.analyzer.take() {
            analyzer.stop(self.analyzer_grace).await;
        }
    }

    fn forward(&self, command: Command) -> bool {
        match self.dispatcher.send(command) {
            Ok(()) => true,
            Err(e) => {
                warn!("[MODE {}] {} not forwarded: {}", self.robot_id, command, e);
                false
            }
        }
    }
}
