//! Command dispatcher - serializes motion commands for one robot

use crate::error::CoordinatorError;
use crate::transport::PubSubTransport;
use robofleet_shared::{codec, Command, RobotId, Topic};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// Counters reported when the command worker shuts down
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub forwarded: u64,
    pub deduplicated: u64,
    pub dropped: u64,
}

enum DispatchRequest {
    Send { command: Command, force: bool },
    Shutdown(oneshot::Sender<DispatchStats>),
}

/// Handle to the per-robot command worker.
///
/// Every command for a robot goes through one worker task, so publishes are
/// strictly ordered and never concurrent. Commands are published directly
/// and never queued: if the transport is not ready the command is dropped.
#[derive(Clone)]
pub struct CommandDispatcher {
    robot_id: RobotId,
    tx: mpsc::UnboundedSender<DispatchRequest>,
}

impl CommandDispatcher {
    /// Create a dispatcher and start its worker
    pub fn spawn(robot_id: RobotId, transport: Arc<dyn PubSubTransport>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(command_worker(robot_id, transport, rx));
        Self { robot_id, tx }
    }

    /// Forward a command unless it repeats the last one forwarded
    pub fn send(&self, command: Command) -> Result<(), CoordinatorError> {
        self.enqueue(command, false)
    }

    /// Forward STOP even if STOP was the last command
    pub fn force_stop(&self) -> Result<(), CoordinatorError> {
        self.enqueue(Command::Stop, true)
    }

    /// Drain pending commands and stop the worker, waiting at most `grace`
    pub async fn shutdown(&self, grace: Duration) -> Option<DispatchStats> {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(DispatchRequest::Shutdown(reply)).is_err() {
            return None;
        }

        match tokio::time::timeout(grace, rx).await {
            Ok(Ok(stats)) => Some(stats),
            Ok(Err(_)) => None,
            Err(_) => {
                warn!("[CMD {}] Command worker did not drain within {:?}", self.robot_id, grace);
                None
            }
        }
    }

    fn enqueue(&self, command: Command, force: bool) -> Result<(), CoordinatorError> {
        self.tx
            .send(DispatchRequest::Send { command, force })
            .map_err(|_| CoordinatorError::SessionClosed(self.robot_id))
    }
}

async fn command_worker(
    robot_id: RobotId,
    transport: Arc<dyn PubSubTransport>,
    mut rx: mpsc::UnboundedReceiver<DispatchRequest>,
) {
    let topic = Topic::control(robot_id);
    let retain = topic.retained();
    let topic = topic.to_string();
    let mut last_forwarded = Command::Stop;
    let mut stats = DispatchStats::default();

    while let Some(request) = rx.recv().await {
        let (command, force) = match request {
            DispatchRequest::Send { command, force } => (command, force),
            DispatchRequest::Shutdown(reply) => {
                info!("[CMD {}] Command worker stopped: {:?}", robot_id, stats);
                let _ = reply.send(stats);
                return;
            }
        };

        if !force && command == last_forwarded {
            stats.deduplicated += 1;
            debug!("[CMD {}] {} repeats last command, skipped", robot_id, command);
            continue;
        }

        if !transport.is_ready() {
            stats.dropped += 1;
            let err = CoordinatorError::TransportUnavailable(transport.name().to_string());
            warn!("[CMD {}] {} dropped: {}", robot_id, command, err);
            continue;
        }

        match transport
            .publish(&topic, codec::encode_command(command), retain)
            .await
        {
            Ok(()) => {
                stats.forwarded += 1;
                last_forwarded = command;
                debug!("[CMD {}] Sent {}", robot_id, command);
            }
            Err(e) => {
                stats.dropped += 1;
                warn!("[CMD {}] Publish of {} failed: {}", robot_id, command, e);
            }
        }
    }
}
