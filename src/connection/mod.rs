//! Connection management for the messaging transport
//!
//! This module handles:
//! - Bounded connect attempts with exponential backoff
//! - Driving the readiness queue to ready (replay) or degraded (drop)
//! - Reporting connection events to the owning session

mod manager;

pub use manager::{ConnectionConfig, ConnectionManager};
