//! Topic naming
//!
//! Every robot owns three retained topics:
//! ```text
//! robot/{id}/control   FORWARD | BACKWARD | LEFT | RIGHT | STOP
//! robot/{id}/status    offline | online | admin_connected | admin_disconnected | disconnected
//! robot/{id}/ai_mode   ON | OFF
//! ```
//! Ids are small integers, so no escaping is needed.

use std::fmt;

use crate::codec::CodecError;
use crate::RobotId;

const TOPIC_ROOT: &str = "robot";

/// Per-robot channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Control,
    Status,
    AiMode,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Control => "control",
            Channel::Status => "status",
            Channel::AiMode => "ai_mode",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "control" => Some(Channel::Control),
            "status" => Some(Channel::Status),
            "ai_mode" => Some(Channel::AiMode),
            _ => None,
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A fully qualified topic for one robot and one channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Topic {
    pub robot_id: RobotId,
    pub channel: Channel,
}

impl Topic {
    pub fn new(robot_id: RobotId, channel: Channel) -> Self {
        Self { robot_id, channel }
    }

    pub fn control(robot_id: RobotId) -> Self {
        Self::new(robot_id, Channel::Control)
    }

    pub fn status(robot_id: RobotId) -> Self {
        Self::new(robot_id, Channel::Status)
    }

    pub fn ai_mode(robot_id: RobotId) -> Self {
        Self::new(robot_id, Channel::AiMode)
    }

    /// All three channels are published retained so late subscribers see the last value
    pub fn retained(&self) -> bool {
        true
    }

    /// Filter matching one channel across every robot, e.g. `robot/+/status`
    pub fn wildcard(channel: Channel) -> String {
        format!("{}/+/{}", TOPIC_ROOT, channel)
    }

    /// Parse a concrete topic string back into its robot id and channel
    pub fn parse(topic: &str) -> Result<Self, CodecError> {
        let invalid = || CodecError::InvalidTopic(topic.to_string());

        let mut parts = topic.split('/');
        match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(TOPIC_ROOT), Some(id), Some(channel), None) => {
                let robot_id = id.parse::<RobotId>().map_err(|_| invalid())?;
                let channel = Channel::parse(channel).ok_or_else(invalid)?;
                Ok(Self { robot_id, channel })
            }
            _ => Err(invalid()),
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", TOPIC_ROOT, self.robot_id, self.channel)
    }
}

/// Name of the video channel paired with a robot
pub fn video_channel(robot_id: RobotId) -> String {
    format!("robot_{}_channel", robot_id)
}

/// MQTT-style filter matching: `+` matches one level, a trailing `#` matches the rest
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return filter_levels.next().is_none(),
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}
