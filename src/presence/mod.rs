//! Fleet presence tracking
//!
//! This module handles:
//! - The status of every known robot, owned by a single worker
//! - Optimistic local edits published through the readiness queue
//! - Remote status updates from the `robot/+/status` subscription
//! - View notifications in arrival order

mod coordinator;

pub use coordinator::{PresenceConfig, PresenceCoordinator, PresencePolicy, UpdateOrigin};
