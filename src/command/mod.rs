//! Motion command flow for one robot
//!
//! This module handles:
//! - Serializing and deduplicating outgoing commands
//! - Arbitrating between manual and autonomous control

mod dispatcher;
mod mode;

pub use dispatcher::{CommandDispatcher, DispatchStats};
pub use mode::ModeArbiter;
