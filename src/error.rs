//! Error taxonomy for the coordination engine
//!
//! None of these are fatal. Each one is logged where it is absorbed and the
//! engine degrades to "not delivered" instead of failing.

use robofleet_shared::RobotId;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoordinatorError {
    #[error("Transport unavailable: {0}")]
    TransportUnavailable(String),

    #[error("Malformed frame: {width}x{height}")]
    MalformedFrame { width: u32, height: u32 },

    #[error("Detector failure: {0}")]
    DetectorFailure(String),

    #[error("Subscription to {topic} failed: {reason}")]
    SubscriptionFailure { topic: String, reason: String },

    #[error("Robot id {0} is outside the known set")]
    OutOfRangeSessionId(RobotId),

    #[error("Session for robot {0} is already open")]
    SessionAlreadyOpen(RobotId),

    #[error("Session for robot {0} is closed")]
    SessionClosed(RobotId),

    #[error("{0} worker has stopped")]
    WorkerStopped(&'static str),
}

pub type Result<T, E = CoordinatorError> = std::result::Result<T, E>;
