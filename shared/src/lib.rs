//! Robofleet Shared Protocol Types
//!
//! This crate provides the wire vocabulary shared by operator consoles and
//! robot-side devices: motion commands, presence statuses, control modes,
//! topic naming and the payload codec.

pub mod codec;
pub mod detection;
pub mod state_machine;
pub mod topics;

use std::fmt;
use std::str::FromStr;

pub use codec::CodecError;
pub use detection::{BoundingBox, DetectedObject, DetectionFrame, Label};
pub use topics::{Channel, Topic};

/// Robots are addressed by small, stable integers
pub type RobotId = u32;

/// Person-tracking parameters
pub mod tracking {
    /// Consecutive frames without a person before STOP is forced
    pub const EMPTY_FRAME_THRESHOLD: u32 = 10;

    /// Horizontal dead zone is `frame_width / CENTER_TOLERANCE_DIVISOR`
    pub const CENTER_TOLERANCE_DIVISOR: u32 = 6;

    /// Height/width band for the unlabeled person heuristic
    pub const MIN_PERSON_ASPECT: f32 = 1.3;
    pub const MAX_PERSON_ASPECT: f32 = 3.5;

    /// Minimum box area as a fraction of the frame for the heuristic
    pub const MIN_PERSON_AREA_FRACTION: f32 = 0.01;

    /// Label fragments that classify an object as a person
    pub const PERSON_LABELS: &[&str] = &["person", "human", "people", "face", "man", "woman", "child"];

    /// Frame-count period for diagnostic logging
    pub const DIAGNOSTIC_INTERVAL: u64 = 30;
}

/// Timing parameters for connection and teardown
pub mod timing {
    /// Bounded number of transport connect attempts
    pub const CONNECT_MAX_ATTEMPTS: u32 = 5;

    /// Initial delay between connect attempts
    pub const CONNECT_RETRY_DELAY_MS: u64 = 100;

    /// Ceiling for the exponential connect backoff
    pub const CONNECT_MAX_RETRY_DELAY_MS: u64 = 2000;

    /// Per-attempt connect timeout
    pub const CONNECT_TIMEOUT_MS: u64 = 5000;

    /// Grace period for the final STOP to land before teardown continues
    pub const STOP_GRACE_MS: u64 = 200;

    /// Grace period for the video engine to flush after leaving a channel
    pub const VIDEO_FLUSH_GRACE_MS: u64 = 200;

    /// Time an in-flight detection gets to finish once analysis is stopped
    pub const ANALYSIS_STOP_GRACE_MS: u64 = 500;
}

/// Discrete motion commands understood by every robot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    Forward,
    Backward,
    Left,
    Right,
    Stop,
}

impl Command {
    pub const ALL: [Command; 5] = [
        Command::Forward,
        Command::Backward,
        Command::Left,
        Command::Right,
        Command::Stop,
    ];

    /// Wire representation on the `control` channel
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Forward => "FORWARD",
            Command::Backward => "BACKWARD",
            Command::Left => "LEFT",
            Command::Right => "RIGHT",
            Command::Stop => "STOP",
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Command {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        Command::ALL
            .into_iter()
            .find(|c| c.as_str().eq_ignore_ascii_case(trimmed))
            .ok_or_else(|| CodecError::UnknownValue {
                channel: Channel::Control,
                value: trimmed.to_string(),
            })
    }
}

/// Presence status of a robot as seen on the `status` channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RobotStatus {
    Offline,
    Online,
    AdminConnected,
    AdminDisconnected,
    Disconnected,
}

impl RobotStatus {
    pub const ALL: [RobotStatus; 5] = [
        RobotStatus::Offline,
        RobotStatus::Online,
        RobotStatus::AdminConnected,
        RobotStatus::AdminDisconnected,
        RobotStatus::Disconnected,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RobotStatus::Offline => "offline",
            RobotStatus::Online => "online",
            RobotStatus::AdminConnected => "admin_connected",
            RobotStatus::AdminDisconnected => "admin_disconnected",
            RobotStatus::Disconnected => "disconnected",
        }
    }

    /// Whether a session with the given role may be opened for a robot in this status.
    ///
    /// Operators take over robots that are `online`; a robot-side device
    /// claims a slot that is currently `offline`.
    pub fn available_for(&self, role: SessionRole) -> bool {
        match role {
            SessionRole::Operator => *self == RobotStatus::Online,
            SessionRole::Robot => *self == RobotStatus::Offline,
        }
    }
}

impl fmt::Display for RobotStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RobotStatus {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        RobotStatus::ALL
            .into_iter()
            .find(|st| st.as_str().eq_ignore_ascii_case(trimmed))
            .ok_or_else(|| CodecError::UnknownValue {
                channel: Channel::Status,
                value: trimmed.to_string(),
            })
    }
}

/// Who is driving a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ControlMode {
    #[default]
    Manual,
    Autonomous,
}

impl ControlMode {
    /// Decode an `ai_mode` payload. Anything but a case-insensitive `ON` is manual.
    pub fn from_payload(payload: &[u8]) -> Self {
        match std::str::from_utf8(payload) {
            Ok(text) if text.trim().eq_ignore_ascii_case("ON") => ControlMode::Autonomous,
            _ => ControlMode::Manual,
        }
    }

    pub fn as_payload(&self) -> &'static str {
        match self {
            ControlMode::Manual => "OFF",
            ControlMode::Autonomous => "ON",
        }
    }

    pub fn toggled(&self) -> Self {
        match self {
            ControlMode::Manual => ControlMode::Autonomous,
            ControlMode::Autonomous => ControlMode::Manual,
        }
    }
}

impl fmt::Display for ControlMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlMode::Manual => f.write_str("MANUAL"),
            ControlMode::Autonomous => f.write_str("AUTONOMOUS"),
        }
    }
}

/// Which side of the link opened a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionRole {
    /// Remote operator console
    Operator,
    /// Device mounted on the robot itself
    Robot,
}

impl SessionRole {
    /// Status published when the session opens
    pub fn connected_status(&self) -> RobotStatus {
        match self {
            SessionRole::Operator => RobotStatus::AdminConnected,
            SessionRole::Robot => RobotStatus::Online,
        }
    }

    /// Status published as the last step of teardown
    pub fn released_status(&self) -> RobotStatus {
        match self {
            SessionRole::Operator => RobotStatus::AdminDisconnected,
            SessionRole::Robot => RobotStatus::Offline,
        }
    }
}

impl fmt::Display for SessionRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionRole::Operator => f.write_str("operator"),
            SessionRole::Robot => f.write_str("robot"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_parse_is_case_insensitive() {
        assert_eq!("forward".parse::<Command>().unwrap(), Command::Forward);
        assert_eq!(" Stop\n".parse::<Command>().unwrap(), Command::Stop);
        assert!("JUMP".parse::<Command>().is_err());
    }

    #[test]
    fn test_status_parse() {
        assert_eq!(
            "ADMIN_CONNECTED".parse::<RobotStatus>().unwrap(),
            RobotStatus::AdminConnected
        );
        assert_eq!("offline".parse::<RobotStatus>().unwrap(), RobotStatus::Offline);
        assert!("busy".parse::<RobotStatus>().is_err());
    }

    #[test]
    fn test_mode_payload() {
        assert_eq!(ControlMode::from_payload(b"on"), ControlMode::Autonomous);
        assert_eq!(ControlMode::from_payload(b" ON "), ControlMode::Autonomous);
        assert_eq!(ControlMode::from_payload(b"OFF"), ControlMode::Manual);
        assert_eq!(ControlMode::from_payload(b"yes"), ControlMode::Manual);
        assert_eq!(ControlMode::from_payload(&[0xff, 0xfe]), ControlMode::Manual);
    }

    #[test]
    fn test_availability_by_role() {
        assert!(RobotStatus::Online.available_for(SessionRole::Operator));
        assert!(!RobotStatus::AdminConnected.available_for(SessionRole::Operator));
        assert!(RobotStatus::Offline.available_for(SessionRole::Robot));
        assert!(!RobotStatus::Online.available_for(SessionRole::Robot));
    }

    #[test]
    fn test_role_statuses() {
        assert_eq!(SessionRole::Operator.connected_status(), RobotStatus::AdminConnected);
        assert_eq!(SessionRole::Operator.released_status(), RobotStatus::AdminDisconnected);
        assert_eq!(SessionRole::Robot.connected_status(), RobotStatus::Online);
        assert_eq!(SessionRole::Robot.released_status(), RobotStatus::Offline);
    }
}
