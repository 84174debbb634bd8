//! Presence coordinator - tracks the status of every known robot

use crate::connection::{ConnectionConfig, ConnectionManager};
use crate::error::{CoordinatorError, Result};
use crate::readiness::{self, Readiness, ReadinessQueue};
use crate::transport::{Message, PubSubTransport, Subscription};
use futures::StreamExt;
use robofleet_shared::{codec, Channel, Command, ControlMode, RobotId, RobotStatus, SessionRole, Topic};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

const WORKER: &str = "Presence";

/// Status rules that are policy rather than protocol
#[derive(Debug, Clone, Copy)]
pub struct PresencePolicy {
    /// An operator returning from a robot that is `offline` leaves it offline
    /// instead of marking it `online` again.
    pub sticky_offline: bool,
}

impl Default for PresencePolicy {
    fn default() -> Self {
        Self {
            sticky_offline: true,
        }
    }
}

/// Configuration for the presence coordinator
#[derive(Debug, Clone)]
pub struct PresenceConfig {
    /// Robots are numbered `0..robot_count`
    pub robot_count: u32,
    pub policy: PresencePolicy,
    pub connection: ConnectionConfig,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            robot_count: 5,
            policy: PresencePolicy::default(),
            connection: ConnectionConfig {
                client_id: "presence".into(),
                ..ConnectionConfig::default()
            },
        }
    }
}

/// Where a status change came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOrigin {
    Local,
    Remote,
}

/// Notification delivered to the view layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresenceUpdate {
    pub robot_id: RobotId,
    pub status: RobotStatus,
    pub origin: UpdateOrigin,
}

/// Result of a control view handing a robot back
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnOutcome {
    /// Operator returned, robot marked `online`
    MarkedOnline,
    /// Operator returned but the robot was `offline`; nothing changed
    KeptOffline,
    /// Robot-side device left; marked `disconnected`, published `offline`
    MarkedDisconnected,
}

enum PresenceRequest {
    SetLocal {
        robot_id: RobotId,
        status: RobotStatus,
        reply: oneshot::Sender<Result<()>>,
    },
    Remote {
        robot_id: RobotId,
        status: RobotStatus,
    },
    ControlReturned {
        robot_id: RobotId,
        role: SessionRole,
        reply: oneshot::Sender<Result<ReturnOutcome>>,
    },
    ResetFleet(oneshot::Sender<()>),
    Snapshot(oneshot::Sender<Vec<RobotStatus>>),
    Shutdown(oneshot::Sender<()>),
}

/// Handle to the presence worker.
///
/// The worker is the only owner of the status table. Subscription traffic and
/// handle calls both arrive as messages, so the view sees updates in the order
/// they reached the worker.
#[derive(Clone)]
pub struct PresenceCoordinator {
    robot_count: u32,
    tx: mpsc::UnboundedSender<PresenceRequest>,
    readiness: watch::Receiver<Readiness>,
}

impl PresenceCoordinator {
    /// Start the worker; view notifications arrive on the returned receiver
    pub fn start(
        transport: Arc<dyn PubSubTransport>,
        config: PresenceConfig,
    ) -> (Self, mpsc::UnboundedReceiver<PresenceUpdate>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (view_tx, view_rx) = mpsc::unbounded_channel();

        let queue = ReadinessQueue::new(transport);
        let readiness = queue.watch();
        let connection = ConnectionManager::start(queue.clone(), config.connection.clone());

        let worker = PresenceWorker {
            statuses: vec![RobotStatus::Offline; config.robot_count as usize],
            policy: config.policy,
            queue,
            view_tx,
        };
        let presence = Self {
            robot_count: config.robot_count,
            tx,
            readiness,
        };
        tokio::spawn(worker.run(rx, presence.clone(), connection));

        info!("[PRESENCE] Tracking {} robots", config.robot_count);
        (presence, view_rx)
    }

    pub fn robot_count(&self) -> u32 {
        self.robot_count
    }

    /// Wait until the presence transport has connected or given up
    pub async fn settled(&self) -> Readiness {
        readiness::settled(self.readiness.clone()).await
    }

    /// Update a robot's status locally and publish it
    pub async fn set_local_status(&self, robot_id: RobotId, status: RobotStatus) -> Result<()> {
        self.request(|reply| PresenceRequest::SetLocal {
            robot_id,
            status,
            reply,
        })
        .await?
    }

    /// Apply a status observed on the transport
    pub fn on_remote_status(&self, robot_id: RobotId, status: RobotStatus) -> Result<()> {
        self.tx
            .send(PresenceRequest::Remote { robot_id, status })
            .map_err(|_| CoordinatorError::WorkerStopped(WORKER))
    }

    /// A control view handed the robot back
    pub async fn control_returned(&self, robot_id: RobotId, role: SessionRole) -> Result<ReturnOutcome> {
        self.request(|reply| PresenceRequest::ControlReturned {
            robot_id,
            role,
            reply,
        })
        .await?
    }

    /// Return every robot to `offline`, `OFF` and `STOP`
    pub async fn reset_fleet(&self) -> Result<()> {
        self.request(PresenceRequest::ResetFleet).await
    }

    /// Current status of every robot, indexed by id
    pub async fn snapshot(&self) -> Result<Vec<RobotStatus>> {
        self.request(PresenceRequest::Snapshot).await
    }

    pub async fn status(&self, robot_id: RobotId) -> Result<RobotStatus> {
        self.snapshot()
            .await?
            .get(robot_id as usize)
            .copied()
            .ok_or(CoordinatorError::OutOfRangeSessionId(robot_id))
    }

    /// Robots a session with `role` may currently open
    pub async fn available(&self, role: SessionRole) -> Result<Vec<RobotId>> {
        Ok(self
            .snapshot()
            .await?
            .into_iter()
            .enumerate()
            .filter(|(_, status)| status.available_for(role))
            .map(|(id, _)| id as RobotId)
            .collect())
    }

    /// Stop the worker and disconnect its transport
    pub async fn shutdown(self) {
        let _ = self.request(PresenceRequest::Shutdown).await;
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> PresenceRequest) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(build(reply))
            .map_err(|_| CoordinatorError::WorkerStopped(WORKER))?;
        rx.await.map_err(|_| CoordinatorError::WorkerStopped(WORKER))
    }
}

struct PresenceWorker {
    statuses: Vec<RobotStatus>,
    policy: PresencePolicy,
    queue: ReadinessQueue,
    view_tx: mpsc::UnboundedSender<PresenceUpdate>,
}

impl PresenceWorker {
    async fn run(
        mut self,
        mut rx: mpsc::UnboundedReceiver<PresenceRequest>,
        presence: PresenceCoordinator,
        mut connection: ConnectionManager,
    ) {
        let filter = Topic::wildcard(Channel::Status);
        let pending = self.queue.subscribe(filter.clone()).await;
        tokio::spawn(status_pump(filter, pending, presence));

        let mut events_open = true;
        loop {
            tokio::select! {
                event = connection.recv(), if events_open => match event {
                    Some(event) => debug!("[PRESENCE] Connection {}", event),
                    None => events_open = false,
                },
                request = rx.recv() => {
                    let Some(request) = request else { break };
                    if let PresenceRequest::Shutdown(reply) = request {
                        connection.stop();
                        if let Err(e) = self.queue.transport().disconnect().await {
                            warn!("[PRESENCE] Disconnect failed: {}", e);
                        }
                        info!("[PRESENCE] Stopped");
                        let _ = reply.send(());
                        break;
                    }
                    self.handle(request).await;
                }
            }
        }
    }

    async fn handle(&mut self, request: PresenceRequest) {
        match request {
            PresenceRequest::SetLocal {
                robot_id,
                status,
                reply,
            } => {
                let _ = reply.send(self.set_local(robot_id, status).await);
            }
            PresenceRequest::Remote { robot_id, status } => self.apply_remote(robot_id, status),
            PresenceRequest::ControlReturned {
                robot_id,
                role,
                reply,
            } => {
                let _ = reply.send(self.control_returned(robot_id, role).await);
            }
            PresenceRequest::ResetFleet(reply) => {
                self.reset_fleet().await;
                let _ = reply.send(());
            }
            PresenceRequest::Snapshot(reply) => {
                let _ = reply.send(self.statuses.clone());
            }
            PresenceRequest::Shutdown(reply) => {
                let _ = reply.send(());
            }
        }
    }

    fn index(&self, robot_id: RobotId) -> Result<usize> {
        let index = robot_id as usize;
        if index < self.statuses.len() {
            Ok(index)
        } else {
            Err(CoordinatorError::OutOfRangeSessionId(robot_id))
        }
    }

    fn record(&mut self, index: usize, status: RobotStatus, origin: UpdateOrigin) {
        self.statuses[index] = status;
        let update = PresenceUpdate {
            robot_id: index as RobotId,
            status,
            origin,
        };
        debug!("[PRESENCE] {:?}", update);
        let _ = self.view_tx.send(update);
    }

    async fn publish_status(&self, robot_id: RobotId, status: RobotStatus) {
        self.queue
            .publish_topic(Topic::status(robot_id), codec::encode_status(status))
            .await;
    }

    async fn set_local(&mut self, robot_id: RobotId, status: RobotStatus) -> Result<()> {
        let index = self.index(robot_id)?;
        self.record(index, status, UpdateOrigin::Local);
        self.publish_status(robot_id, status).await;
        Ok(())
    }

    fn apply_remote(&mut self, robot_id: RobotId, status: RobotStatus) {
        match self.index(robot_id) {
            Ok(index) => self.record(index, status, UpdateOrigin::Remote),
            Err(e) => debug!("[PRESENCE] Ignoring {} status: {}", status, e),
        }
    }

    async fn control_returned(&mut self, robot_id: RobotId, role: SessionRole) -> Result<ReturnOutcome> {
        let index = self.index(robot_id)?;

        match role {
            SessionRole::Operator => {
                if self.policy.sticky_offline && self.statuses[index] == RobotStatus::Offline {
                    info!("[PRESENCE] Robot {} is offline, left unchanged", robot_id);
                    return Ok(ReturnOutcome::KeptOffline);
                }
                self.set_local(robot_id, RobotStatus::Online).await?;
                info!("[PRESENCE] Robot {} marked online (operator returned)", robot_id);
                Ok(ReturnOutcome::MarkedOnline)
            }
            SessionRole::Robot => {
                self.record(index, RobotStatus::Disconnected, UpdateOrigin::Local);
                self.publish_status(robot_id, RobotStatus::Offline).await;
                info!("[PRESENCE] Robot {} marked disconnected (device left)", robot_id);
                Ok(ReturnOutcome::MarkedDisconnected)
            }
        }
    }

    async fn reset_fleet(&mut self) {
        for index in 0..self.statuses.len() {
            let robot_id = index as RobotId;
            self.record(index, RobotStatus::Offline, UpdateOrigin::Local);
            self.publish_status(robot_id, RobotStatus::Offline).await;
            self.queue
                .publish_topic(Topic::ai_mode(robot_id), codec::encode_mode(ControlMode::Manual))
                .await;
            self.queue
                .publish_topic(Topic::control(robot_id), codec::encode_command(Command::Stop))
                .await;
        }
        info!("[PRESENCE] Fleet of {} reset", self.statuses.len());
    }
}

/// Forward status messages from the transport to the worker
async fn status_pump(
    filter: String,
    pending: oneshot::Receiver<Subscription>,
    presence: PresenceCoordinator,
) {
    let mut subscription = match pending.await {
        Ok(subscription) => subscription,
        Err(_) => {
            let err = CoordinatorError::SubscriptionFailure {
                topic: filter,
                reason: "subscription was never established".into(),
            };
            warn!("[PRESENCE] {}, statuses stay at last known values", err);
            return;
        }
    };
    debug!("[PRESENCE] Subscribed to {}", Subscription::filter(&subscription));

    while let Some(message) = subscription.next().await {
        let Some((robot_id, status)) = decode(&message) else {
            continue;
        };
        if presence.on_remote_status(robot_id, status).is_err() {
            break;
        }
    }
}

fn decode(message: &Message) -> Option<(RobotId, RobotStatus)> {
    let topic = match Topic::parse(&message.topic) {
        Ok(topic) if topic.channel == Channel::Status => topic,
        Ok(_) => return None,
        Err(e) => {
            warn!("[PRESENCE] Ignoring message: {}", e);
            return None;
        }
    };

    match codec::decode_status(&message.payload) {
        Ok(status) => Some((topic.robot_id, status)),
        Err(e) => {
            warn!("[PRESENCE] Ignoring status for robot {}: {}", topic.robot_id, e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryBroker;
    use bytes::Bytes;
    use std::time::Duration;

    fn fast_config() -> PresenceConfig {
        PresenceConfig {
            connection: ConnectionConfig {
                client_id: "presence-test".into(),
                max_attempts: 2,
                retry_delay: Duration::from_millis(1),
                max_retry_delay: Duration::from_millis(2),
                connect_timeout: Duration::from_millis(500),
            },
            ..PresenceConfig::default()
        }
    }

    async fn start(broker: &MemoryBroker) -> (PresenceCoordinator, mpsc::UnboundedReceiver<PresenceUpdate>) {
        let transport: Arc<dyn PubSubTransport> = Arc::new(broker.client("presence"));
        let (presence, updates) = PresenceCoordinator::start(transport, fast_config());
        assert_eq!(presence.settled().await, Readiness::Ready);
        (presence, updates)
    }

    async fn peer(broker: &MemoryBroker) -> Arc<dyn PubSubTransport> {
        let transport: Arc<dyn PubSubTransport> = Arc::new(broker.client("peer"));
        transport.connect().await.unwrap();
        transport
    }

    async fn next_remote(updates: &mut mpsc::UnboundedReceiver<PresenceUpdate>) -> PresenceUpdate {
        loop {
            let update = tokio::time::timeout(Duration::from_secs(2), updates.recv())
                .await
                .expect("timed out waiting for update")
                .expect("view channel closed");
            if update.origin == UpdateOrigin::Remote {
                return update;
            }
        }
    }

    #[tokio::test]
    async fn test_all_robots_start_offline() {
        let broker = MemoryBroker::new();
        let (presence, _updates) = start(&broker).await;

        assert_eq!(presence.snapshot().await.unwrap(), vec![RobotStatus::Offline; 5]);
        assert_eq!(presence.available(SessionRole::Robot).await.unwrap(), vec![0, 1, 2, 3, 4]);
        assert!(presence.available(SessionRole::Operator).await.unwrap().is_empty());
        presence.shutdown().await;
    }

    #[tokio::test]
    async fn test_local_status_is_optimistic_and_published_after_ready() {
        let broker = MemoryBroker::new();
        let transport: Arc<dyn PubSubTransport> =
            Arc::new(broker.client("presence").with_connect_delay(Duration::from_millis(30)));
        let (presence, mut updates) = PresenceCoordinator::start(transport, fast_config());

        presence.set_local_status(2, RobotStatus::Online).await.unwrap();
        assert_eq!(presence.status(2).await.unwrap(), RobotStatus::Online);
        assert!(broker.payloads("robot/2/status").is_empty());

        let first = updates.recv().await.unwrap();
        assert_eq!(first.origin, UpdateOrigin::Local);

        assert_eq!(presence.settled().await, Readiness::Ready);
        assert_eq!(broker.payloads("robot/2/status"), vec!["online"]);
        presence.shutdown().await;
    }

    #[tokio::test]
    async fn test_remote_status_reaches_view() {
        let broker = MemoryBroker::new();
        let (presence, mut updates) = start(&broker).await;
        let other = peer(&broker).await;

        other
            .publish("robot/1/status", Bytes::from("ADMIN_CONNECTED"), true)
            .await
            .unwrap();

        let update = next_remote(&mut updates).await;
        assert_eq!(update.robot_id, 1);
        assert_eq!(update.status, RobotStatus::AdminConnected);
        assert_eq!(presence.status(1).await.unwrap(), RobotStatus::AdminConnected);
        presence.shutdown().await;
    }

    #[tokio::test]
    async fn test_retained_status_populates_late_coordinator() {
        let broker = MemoryBroker::new();
        let other = peer(&broker).await;
        other.publish("robot/4/status", Bytes::from("online"), true).await.unwrap();

        let (presence, mut updates) = start(&broker).await;
        let update = next_remote(&mut updates).await;
        assert_eq!((update.robot_id, update.status), (4, RobotStatus::Online));
        assert_eq!(presence.available(SessionRole::Operator).await.unwrap(), vec![4]);
        presence.shutdown().await;
    }

    #[tokio::test]
    async fn test_out_of_range_and_garbage_are_ignored() {
        let broker = MemoryBroker::new();
        let (presence, mut updates) = start(&broker).await;
        let other = peer(&broker).await;

        other.publish("robot/9/status", Bytes::from("online"), true).await.unwrap();
        other.publish("robot/1/status", Bytes::from("sleeping"), true).await.unwrap();
        other.publish("robot/0/status", Bytes::from("online"), true).await.unwrap();

        let update = next_remote(&mut updates).await;
        assert_eq!(update.robot_id, 0);
        assert_eq!(presence.snapshot().await.unwrap().len(), 5);
        assert!(matches!(
            presence.set_local_status(9, RobotStatus::Online).await,
            Err(CoordinatorError::OutOfRangeSessionId(9))
        ));
        presence.shutdown().await;
    }

    #[tokio::test]
    async fn test_remote_update_overrides_local() {
        let broker = MemoryBroker::new();
        let (presence, mut updates) = start(&broker).await;

        presence.set_local_status(3, RobotStatus::Online).await.unwrap();
        let echo = next_remote(&mut updates).await;
        assert_eq!(echo.status, RobotStatus::Online);

        presence.on_remote_status(3, RobotStatus::Offline).unwrap();
        let update = next_remote(&mut updates).await;
        assert_eq!(update.status, RobotStatus::Offline);
        assert_eq!(presence.status(3).await.unwrap(), RobotStatus::Offline);
        presence.shutdown().await;
    }

    #[tokio::test]
    async fn test_operator_return_keeps_offline_robot_offline() {
        let broker = MemoryBroker::new();
        let (presence, _updates) = start(&broker).await;

        let outcome = presence.control_returned(1, SessionRole::Operator).await.unwrap();
        assert_eq!(outcome, ReturnOutcome::KeptOffline);
        assert_eq!(presence.status(1).await.unwrap(), RobotStatus::Offline);
        assert!(broker.payloads("robot/1/status").is_empty());
        presence.shutdown().await;
    }

    #[tokio::test]
    async fn test_operator_return_marks_busy_robot_online() {
        let broker = MemoryBroker::new();
        let (presence, _updates) = start(&broker).await;

        presence.set_local_status(1, RobotStatus::AdminDisconnected).await.unwrap();
        let outcome = presence.control_returned(1, SessionRole::Operator).await.unwrap();

        assert_eq!(outcome, ReturnOutcome::MarkedOnline);
        assert_eq!(
            broker.payloads("robot/1/status"),
            vec!["admin_disconnected", "online"]
        );
        presence.shutdown().await;
    }

    #[tokio::test]
    async fn test_operator_return_without_sticky_offline() {
        let broker = MemoryBroker::new();
        let transport: Arc<dyn PubSubTransport> = Arc::new(broker.client("presence"));
        let config = PresenceConfig {
            policy: PresencePolicy {
                sticky_offline: false,
            },
            ..fast_config()
        };
        let (presence, _updates) = PresenceCoordinator::start(transport, config);

        let outcome = presence.control_returned(0, SessionRole::Operator).await.unwrap();
        assert_eq!(outcome, ReturnOutcome::MarkedOnline);
        presence.shutdown().await;
    }

    #[tokio::test]
    async fn test_robot_return_disconnects_then_echo_settles_offline() {
        let broker = MemoryBroker::new();
        let (presence, mut updates) = start(&broker).await;

        let outcome = presence.control_returned(2, SessionRole::Robot).await.unwrap();
        assert_eq!(outcome, ReturnOutcome::MarkedDisconnected);
        assert_eq!(broker.payloads("robot/2/status"), vec!["offline"]);

        let local = updates.recv().await.unwrap();
        assert_eq!(
            (local.robot_id, local.status, local.origin),
            (2, RobotStatus::Disconnected, UpdateOrigin::Local)
        );

        // Our own publish comes back and wins
        let echo = next_remote(&mut updates).await;
        assert_eq!((echo.robot_id, echo.status), (2, RobotStatus::Offline));
        assert_eq!(presence.status(2).await.unwrap(), RobotStatus::Offline);
        presence.shutdown().await;
    }

    #[tokio::test]
    async fn test_reset_fleet_publishes_safe_defaults() {
        let broker = MemoryBroker::new();
        let (presence, _updates) = start(&broker).await;

        presence.reset_fleet().await.unwrap();
        for id in 0..5 {
            assert_eq!(broker.retained(&format!("robot/{}/status", id)), Some(Bytes::from("offline")));
            assert_eq!(broker.retained(&format!("robot/{}/ai_mode", id)), Some(Bytes::from("OFF")));
            assert_eq!(broker.retained(&format!("robot/{}/control", id)), Some(Bytes::from("STOP")));
        }
        presence.shutdown().await;
    }

    #[tokio::test]
    async fn test_degraded_transport_keeps_local_state() {
        let broker = MemoryBroker::new();
        let transport: Arc<dyn PubSubTransport> = Arc::new(broker.client("presence").fail_connects(10));
        let (presence, _updates) = PresenceCoordinator::start(transport, fast_config());

        assert_eq!(presence.settled().await, Readiness::Degraded);
        presence.set_local_status(0, RobotStatus::Online).await.unwrap();

        assert_eq!(presence.status(0).await.unwrap(), RobotStatus::Online);
        assert!(broker.history().is_empty());
        presence.shutdown().await;
    }
}
