//! Control sessions
//!
//! This module handles:
//! - Opening a robot's control session and owning its state in one worker
//! - Bounded, best-effort teardown with a per-step report
//! - Enforcing one open session per robot

mod control;
mod registry;
mod teardown;

pub use control::SessionConfig;
pub use registry::SessionRegistry;
pub use teardown::{StepOutcome, TeardownConfig};
