//! Deferred transport operations
//!
//! Status and mode publishes (and topic subscriptions) requested before the
//! messaging transport is connected are buffered here and replayed once.
//! Motion commands never pass through this queue.

mod queue;

pub use queue::{settled, Disposition, Readiness, ReadinessQueue};
