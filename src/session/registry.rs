//! Session registry for every open control session

use super::control::{ControlSession, SessionConfig};
use super::teardown::TeardownReport;
use crate::error::{CoordinatorError, Result};
use crate::readiness::Readiness;
use crate::tracking::{Detector, FrameFeed};
use crate::transport::{PubSubTransport, VideoTransport};
use robofleet_shared::{Command, ControlMode, RobotId};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{watch, RwLock};
use tracing::{info, warn};

enum Slot {
    /// Id reserved while the session is being opened
    Opening,
    Open(ControlSession),
}

/// Holds at most one open session per robot id.
///
/// The map lock is never held across a session call; handles are cloned out
/// first, so a slow session cannot stall the others.
pub struct SessionRegistry {
    sessions: Arc<RwLock<HashMap<RobotId, Slot>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Open a session for a robot that has none
    pub async fn open(
        &self,
        robot_id: RobotId,
        transport: Arc<dyn PubSubTransport>,
        video: Arc<dyn VideoTransport>,
        detector: Arc<dyn Detector>,
        config: SessionConfig,
    ) -> Result<()> {
        {
            let mut sessions = self.sessions.write().await;
            if sessions.contains_key(&robot_id) {
                return Err(CoordinatorError::SessionAlreadyOpen(robot_id));
            }
            sessions.insert(robot_id, Slot::Opening);
        }

        let session = ControlSession::open(robot_id, transport, video, detector, config).await;

        {
            let mut sessions = self.sessions.write().await;
            if matches!(sessions.get(&robot_id), Some(Slot::Opening)) {
                sessions.insert(robot_id, Slot::Open(session));
                return Ok(());
            }
        }

        // Reservation was dropped by `close_all` while opening
        warn!("[SESSION {}] Registry closed while opening, tearing down", robot_id);
        if let Err(e) = session.close().await {
            warn!("[SESSION {}] Teardown after cancelled open failed: {}", robot_id, e);
        }
        Err(CoordinatorError::SessionClosed(robot_id))
    }

    /// Issue a manual command to a robot's session
    pub async fn send_command(&self, robot_id: RobotId, command: Command) -> Result<bool> {
        self.session(robot_id).await?.command(command).await
    }

    pub async fn toggle_ai(&self, robot_id: RobotId) -> Result<ControlMode> {
        self.session(robot_id).await?.toggle_ai().await
    }

    pub async fn mode(&self, robot_id: RobotId) -> Option<ControlMode> {
        self.session(robot_id).await.ok().map(|s| s.mode())
    }

    /// Mode changes of a robot's session, local or remote
    pub async fn watch_mode(&self, robot_id: RobotId) -> Option<watch::Receiver<ControlMode>> {
        self.session(robot_id).await.ok().map(|s| s.watch_mode())
    }

    /// Wait until a robot's session has connected or given up
    pub async fn wait_ready(&self, robot_id: RobotId) -> Result<Readiness> {
        Ok(self.session(robot_id).await?.wait_ready().await)
    }

    /// Camera feed of a robot's session
    pub async fn frames(&self, robot_id: RobotId) -> Option<FrameFeed> {
        self.session(robot_id).await.ok().map(|s| s.frames().clone())
    }

    /// Close and forget a robot's session
    pub async fn close(&self, robot_id: RobotId) -> Result<TeardownReport> {
        let session = {
            let mut sessions = self.sessions.write().await;
            match sessions.remove(&robot_id) {
                Some(Slot::Open(session)) => session,
                Some(Slot::Opening) => {
                    sessions.insert(robot_id, Slot::Opening);
                    return Err(CoordinatorError::SessionClosed(robot_id));
                }
                None => return Err(CoordinatorError::SessionClosed(robot_id)),
            }
        };
        session.close().await
    }

    /// Close every open session
    pub async fn close_all(&self) -> Vec<TeardownReport> {
        let drained: Vec<_> = self
            .sessions
            .write()
            .await
            .drain()
            .filter_map(|(_, slot)| match slot {
                Slot::Open(session) => Some(session),
                Slot::Opening => None,
            })
            .collect();
        info!("Closing {} session(s)", drained.len());

        let mut reports = Vec::with_capacity(drained.len());
        for session in drained {
            if let Ok(report) = session.close().await {
                reports.push(report);
            }
        }
        reports
    }

    /// Ids of robots with an open session, ascending
    pub async fn open_ids(&self) -> Vec<RobotId> {
        let mut ids: Vec<_> = self
            .sessions
            .read()
            .await
            .iter()
            .filter(|(_, slot)| matches!(slot, Slot::Open(_)))
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        ids
    }

    pub async fn count(&self) -> usize {
        self.open_ids().await.len()
    }

    async fn session(&self, robot_id: RobotId) -> Result<ControlSession> {
        match self.sessions.read().await.get(&robot_id) {
            Some(Slot::Open(session)) => Ok(session.clone()),
            _ => Err(CoordinatorError::SessionClosed(robot_id)),
        }
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionConfig;
    use crate::tracking::{CameraFrame, ScriptedDetector};
    use crate::transport::{MemoryBroker, RecordingVideo};
    use robofleet_shared::DetectionFrame;
    use std::time::Duration;

    fn config() -> SessionConfig {
        let mut config = SessionConfig::default();
        config.connection = ConnectionConfig {
            retry_delay: Duration::from_millis(1),
            ..ConnectionConfig::default()
        };
        config.teardown.video_flush_grace = Duration::from_millis(5);
        config
    }

    async fn open(registry: &SessionRegistry, broker: &MemoryBroker, robot_id: RobotId) -> Result<()> {
        registry
            .open(
                robot_id,
                Arc::new(broker.client(format!("station-{}", robot_id))),
                Arc::new(RecordingVideo::new()),
                Arc::new(ScriptedDetector::new()),
                config(),
            )
            .await
    }

    #[tokio::test]
    async fn test_second_session_for_same_robot_is_rejected() {
        let broker = MemoryBroker::new();
        let registry = SessionRegistry::new();

        open(&registry, &broker, 2).await.unwrap();
        assert!(matches!(
            open(&registry, &broker, 2).await,
            Err(CoordinatorError::SessionAlreadyOpen(2))
        ));
        assert_eq!(registry.count().await, 1);
        registry.close_all().await;
    }

    #[tokio::test]
    async fn test_unknown_session_reports_closed() {
        let registry = SessionRegistry::new();
        assert!(matches!(
            registry.send_command(1, Command::Forward).await,
            Err(CoordinatorError::SessionClosed(1))
        ));
        assert!(matches!(
            registry.close(1).await,
            Err(CoordinatorError::SessionClosed(1))
        ));
        assert!(registry.frames(1).await.is_none());
    }

    #[tokio::test]
    async fn test_sessions_are_independent() {
        let broker = MemoryBroker::new();
        let registry = SessionRegistry::new();
        open(&registry, &broker, 0).await.unwrap();
        open(&registry, &broker, 1).await.unwrap();
        assert_eq!(registry.open_ids().await, vec![0, 1]);
        assert_eq!(registry.wait_ready(1).await.unwrap(), Readiness::Ready);

        assert_eq!(registry.toggle_ai(1).await.unwrap(), ControlMode::Autonomous);
        assert_eq!(registry.mode(0).await, Some(ControlMode::Manual));

        let report = registry.close(1).await.unwrap();
        assert_eq!(report.robot_id, 1);
        assert_eq!(registry.open_ids().await, vec![0]);

        // Reopening after close is allowed
        open(&registry, &broker, 1).await.unwrap();
        let reports = registry.close_all().await;
        assert_eq!(reports.len(), 2);
        assert_eq!(registry.count().await, 0);
    }

    /// Holds every detection for a fixed time
    struct SlowDetector(Duration);

    #[async_trait::async_trait]
    impl Detector for SlowDetector {
        async fn detect(&self, frame: &CameraFrame) -> anyhow::Result<DetectionFrame> {
            tokio::time::sleep(self.0).await;
            Ok(DetectionFrame::empty(frame.width, frame.height))
        }
    }

    #[tokio::test]
    async fn test_slow_session_does_not_block_registry() {
        let broker = MemoryBroker::new();
        let registry = Arc::new(SessionRegistry::new());

        let mut slow = config();
        slow.teardown.analysis_grace = Duration::from_secs(2);
        registry
            .open(
                0,
                Arc::new(broker.client("station-0")),
                Arc::new(RecordingVideo::new()),
                Arc::new(SlowDetector(Duration::from_millis(500))),
                slow,
            )
            .await
            .unwrap();
        open(&registry, &broker, 1).await.unwrap();

        assert_eq!(registry.toggle_ai(0).await.unwrap(), ControlMode::Autonomous);
        registry
            .frames(0)
            .await
            .unwrap()
            .push(CameraFrame::new(1, 640, 480));
        tokio::time::sleep(Duration::from_millis(20)).await;

        // Returning to manual waits for the in-flight detection
        let toggle = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.toggle_ai(0).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        open(&registry, &broker, 2).await.unwrap();
        assert!(registry.send_command(1, Command::Forward).await.unwrap());
        assert!(!toggle.is_finished());

        assert_eq!(toggle.await.unwrap().unwrap(), ControlMode::Manual);
        assert_eq!(registry.open_ids().await, vec![0, 1, 2]);
        registry.close_all().await;
    }

    #[tokio::test]
    async fn test_concurrent_open_of_same_robot_is_rejected() {
        let broker = MemoryBroker::new();
        let registry = Arc::new(SessionRegistry::new());

        let opening = {
            let registry = registry.clone();
            let broker = broker.clone();
            tokio::spawn(async move { open(&registry, &broker, 3).await })
        };
        tokio::task::yield_now().await;

        assert!(matches!(
            open(&registry, &broker, 3).await,
            Err(CoordinatorError::SessionAlreadyOpen(3))
        ));
        opening.await.unwrap().unwrap();
        assert_eq!(registry.count().await, 1);
        registry.close_all().await;
    }
}
