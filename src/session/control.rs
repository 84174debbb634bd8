//! Control session - one robot's control connection and its worker

use super::teardown::{TeardownConfig, TeardownReport, TeardownStep};
use crate::command::{CommandDispatcher, ModeArbiter};
use crate::connection::{ConnectionConfig, ConnectionManager};
use crate::error::{CoordinatorError, Result};
use crate::readiness::{self, Disposition, Readiness, ReadinessQueue};
use crate::tracking::{Detector, FrameFeed, TrackedCommand, TrackingConfig};
use crate::transport::{PubSubTransport, Subscription, VideoTransport};
use anyhow::anyhow;
use bytes::Bytes;
use futures::StreamExt;
use robofleet_shared::topics::video_channel;
use robofleet_shared::{codec, Command, ControlMode, RobotId, SessionRole, Topic};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

/// Configuration for one control session
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub role: SessionRole,
    pub connection: ConnectionConfig,
    pub tracking: TrackingConfig,
    pub teardown: TeardownConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            role: SessionRole::Operator,
            connection: ConnectionConfig::default(),
            tracking: TrackingConfig::default(),
            teardown: TeardownConfig::default(),
        }
    }
}

enum SessionRequest {
    Command(Command, oneshot::Sender<bool>),
    ToggleAi(oneshot::Sender<ControlMode>),
    RemoteMode(Bytes),
    Close(oneshot::Sender<TeardownReport>),
}

/// Handle to an open control session.
///
/// All session state lives in the session worker; the handle only sends it
/// requests and reads the snapshots it publishes. Clones address the same
/// worker.
#[derive(Clone)]
pub struct ControlSession {
    robot_id: RobotId,
    tx: mpsc::UnboundedSender<SessionRequest>,
    frames: FrameFeed,
    mode: watch::Receiver<ControlMode>,
    readiness: watch::Receiver<Readiness>,
}

impl ControlSession {
    /// Open a session: announce it, start its workers and join the video channel
    pub async fn open(
        robot_id: RobotId,
        transport: Arc<dyn PubSubTransport>,
        video: Arc<dyn VideoTransport>,
        detector: Arc<dyn Detector>,
        config: SessionConfig,
    ) -> Self {
        let role = config.role;
        let (tx, rx) = mpsc::unbounded_channel();

        let queue = ReadinessQueue::new(transport.clone());
        let readiness = queue.watch();
        let connection = ConnectionManager::start(queue.clone(), config.connection.clone());

        queue
            .publish_topic(Topic::status(robot_id), codec::encode_status(role.connected_status()))
            .await;

        let dispatcher = CommandDispatcher::spawn(robot_id, transport);

        let pending = queue.subscribe(Topic::ai_mode(robot_id).to_string()).await;
        tokio::spawn(mode_pump(robot_id, pending, tx.clone()));

        let channel = video_channel(robot_id);
        match video.join(&channel).await {
            Ok(()) => debug!("[SESSION {}] Joined video channel {}", robot_id, channel),
            Err(e) => warn!("[SESSION {}] Could not join {}: {}", robot_id, channel, e),
        }

        let frames = FrameFeed::new();
        let (tracked_tx, tracked_rx) = mpsc::unbounded_channel();
        let arbiter = ModeArbiter::new(
            robot_id,
            dispatcher.clone(),
            queue.clone(),
            frames.clone(),
            detector,
            config.tracking.clone(),
            tracked_tx,
            config.teardown.analysis_grace,
        );
        let mode = arbiter.watch();

        let worker = SessionWorker {
            robot_id,
            role,
            arbiter,
            dispatcher,
            queue,
            video,
            connection,
            teardown: config.teardown,
        };
        tokio::spawn(worker.run(rx, tracked_rx));

        info!("[SESSION {}] Opened as {}", robot_id, role);
        Self {
            robot_id,
            tx,
            frames,
            mode,
            readiness,
        }
    }

    /// Camera feed for this session; frames are only analyzed while autonomous
    pub fn frames(&self) -> &FrameFeed {
        &self.frames
    }

    pub fn mode(&self) -> ControlMode {
        *self.mode.borrow()
    }

    /// Watch mode changes, local or remote
    pub fn watch_mode(&self) -> watch::Receiver<ControlMode> {
        self.mode.clone()
    }

    /// Wait until the transport has connected or given up
    pub async fn wait_ready(&self) -> Readiness {
        readiness::settled(self.readiness.clone()).await
    }

    /// Issue a manual command; returns false if it was not accepted (autonomous mode)
    pub async fn command(&self, command: Command) -> Result<bool> {
        self.request(|reply| SessionRequest::Command(command, reply))
            .await
    }

    /// Flip between manual and autonomous control
    pub async fn toggle_ai(&self) -> Result<ControlMode> {
        self.request(SessionRequest::ToggleAi).await
    }

    /// Tear the session down
    pub async fn close(self) -> Result<TeardownReport> {
        self.request(SessionRequest::Close).await
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> SessionRequest) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(build(reply))
            .map_err(|_| CoordinatorError::SessionClosed(self.robot_id))?;
        rx.await.map_err(|_| CoordinatorError::SessionClosed(self.robot_id))
    }
}

struct SessionWorker {
    robot_id: RobotId,
    role: SessionRole,
    arbiter: ModeArbiter,
    dispatcher: CommandDispatcher,
    queue: ReadinessQueue,
    video: Arc<dyn VideoTransport>,
    connection: ConnectionManager,
    teardown: TeardownConfig,
}

impl SessionWorker {
    async fn run(
        mut self,
        mut rx: mpsc::UnboundedReceiver<SessionRequest>,
        mut tracked_rx: mpsc::UnboundedReceiver<TrackedCommand>,
    ) {
        let mut events_open = true;

        loop {
            tokio::select! {
                request = rx.recv() => {
                    let Some(request) = request else { break };
                    match request {
                        SessionRequest::Command(command, reply) => {
                            let _ = reply.send(self.arbiter.manual(command));
                        }
                        SessionRequest::ToggleAi(reply) => {
                            self.arbiter.toggle().await;
                            let _ = reply.send(self.arbiter.mode());
                        }
                        SessionRequest::RemoteMode(payload) => {
                            self.arbiter.on_remote(&payload).await;
                        }
                        SessionRequest::Close(reply) => {
                            let report = self.close().await;
                            let _ = reply.send(report);
                            return;
                        }
                    }
                }
                Some(tracked) = tracked_rx.recv() => {
                    self.arbiter.on_tracked(tracked);
                }
                event = self.connection.recv(), if events_open => match event {
                    Some(event) => debug!("[SESSION {}] Connection {}", self.robot_id, event),
                    None => events_open = false,
                },
            }
        }

        // Every handle is gone without an explicit close
        self.close().await;
    }

    async fn close(&mut self) -> TeardownReport {
        info!("[SESSION {}] Closing", self.robot_id);
        let mut report = TeardownReport::new(self.robot_id);

        self.arbiter.close().await;
        report.record(TeardownStep::StopAnalysis, Ok(()));

        let queued = self
            .dispatcher
            .force_stop()
            .map_err(anyhow::Error::from);
        report.dispatch = self.dispatcher.shutdown(self.teardown.stop_grace).await;
        let final_stop = queued.and_then(|()| match report.dispatch {
            Some(_) => Ok(()),
            None => Err(anyhow!("command worker did not drain in {:?}", self.teardown.stop_grace)),
        });
        report.record(TeardownStep::FinalStop, final_stop);

        let left = self.video.leave().await;
        tokio::time::sleep(self.teardown.video_flush_grace).await;
        report.record(TeardownStep::LeaveVideo, left);

        report.record(TeardownStep::DestroyVideo, self.video.destroy().await);

        let released = self.role.released_status();
        let disposition = self
            .queue
            .publish_topic(Topic::status(self.robot_id), codec::encode_status(released))
            .await;
        let published = match disposition {
            Disposition::Executed => Ok(()),
            other => Err(anyhow!("{} not delivered: {:?}", released, other)),
        };
        report.record(TeardownStep::PublishReleased, published);

        self.connection.stop();
        report.record(
            TeardownStep::Disconnect,
            self.queue.transport().disconnect().await,
        );

        info!(
            "[SESSION {}] Closed ({} step(s) failed)",
            self.robot_id,
            report.failed_steps().len()
        );
        report
    }
}

/// Forward `ai_mode` messages from the transport into the session worker
async fn mode_pump(
    robot_id: RobotId,
    pending: oneshot::Receiver<Subscription>,
    inbox: mpsc::UnboundedSender<SessionRequest>,
) {
    let mut subscription = match pending.await {
        Ok(subscription) => subscription,
        Err(_) => {
            let err = CoordinatorError::SubscriptionFailure {
                topic: Topic::ai_mode(robot_id).to_string(),
                reason: "subscription was never established".into(),
            };
            warn!("[SESSION {}] {}", robot_id, err);
            return;
        }
    };

    while let Some(message) = subscription.next().await {
        if inbox.send(SessionRequest::RemoteMode(message.payload)).is_err() {
            break;
        }
    }
}
