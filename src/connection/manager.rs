//! Connection worker with bounded retries
//!
//! The worker is the sole writer of a queue's readiness: it either marks the
//! queue ready (replaying deferred work) or, once attempts are exhausted,
//! degraded.

use crate::readiness::ReadinessQueue;
use robofleet_shared::timing;
use std::fmt;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// Events emitted by the connection worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// Connected; `replayed` queued operations were executed
    Connected { attempts: u32, replayed: usize },
    /// A single attempt failed, another will follow
    AttemptFailed { attempt: u32, reason: String },
    /// Failed to connect after all retries
    ConnectionFailed { attempts: u32, reason: String },
}

impl fmt::Display for ConnectionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionEvent::Connected { attempts, replayed } => {
                write!(f, "connected after {} attempt(s), {} replayed", attempts, replayed)
            }
            ConnectionEvent::AttemptFailed { attempt, reason } => {
                write!(f, "attempt {} failed: {}", attempt, reason)
            }
            ConnectionEvent::ConnectionFailed { attempts, reason } => {
                write!(f, "gave up after {} attempt(s): {}", attempts, reason)
            }
        }
    }
}

/// Configuration for the connection worker
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Client identifier, used in logs
    pub client_id: String,
    /// Maximum number of connect attempts
    pub max_attempts: u32,
    /// Delay before the second attempt
    pub retry_delay: Duration,
    /// Maximum delay between attempts
    pub max_retry_delay: Duration,
    /// Per-attempt connect timeout
    pub connect_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            client_id: "control-station".into(),
            max_attempts: timing::CONNECT_MAX_ATTEMPTS,
            retry_delay: Duration::from_millis(timing::CONNECT_RETRY_DELAY_MS),
            max_retry_delay: Duration::from_millis(timing::CONNECT_MAX_RETRY_DELAY_MS),
            connect_timeout: Duration::from_millis(timing::CONNECT_TIMEOUT_MS),
        }
    }
}

/// Drives one transport to readiness in the background
pub struct ConnectionManager {
    config: ConnectionConfig,
    event_rx: mpsc::Receiver<ConnectionEvent>,
    task: JoinHandle<()>,
}

impl ConnectionManager {
    /// Create a connection manager and start the connection loop
    pub fn start(queue: ReadinessQueue, config: ConnectionConfig) -> Self {
        let (event_tx, event_rx) = mpsc::channel::<ConnectionEvent>(32);

        let config_clone = config.clone();
        let task = tokio::spawn(async move {
            connection_loop(config_clone, queue, event_tx).await;
        });

        Self {
            config,
            event_rx,
            task,
        }
    }

    /// Receive the next connection event
    pub async fn recv(&mut self) -> Option<ConnectionEvent> {
        self.event_rx.recv().await
    }

    /// Abort a connect still in progress
    pub fn stop(&self) {
        if !self.task.is_finished() {
            info!("[{}] Abandoning connection attempts", self.config.client_id);
            self.task.abort();
        }
    }
}

/// Bounded connect loop with exponential backoff
async fn connection_loop(
    config: ConnectionConfig,
    queue: ReadinessQueue,
    event_tx: mpsc::Sender<ConnectionEvent>,
) {
    let transport = queue.transport().clone();
    let mut retry_delay = config.retry_delay;
    let mut last_error = String::from("no attempts made");

    for attempt in 1..=config.max_attempts {
        debug!(
            "[{}] Connect attempt {}/{}, {} operation(s) waiting",
            config.client_id,
            attempt,
            config.max_attempts,
            queue.pending_len().await
        );
        match timeout(config.connect_timeout, transport.connect()).await {
            Ok(Ok(())) => {
                let replayed = queue.mark_ready().await;
                info!(
                    "[{}] Connected via {} after {} attempt(s)",
                    config.client_id,
                    transport.name(),
                    attempt
                );
                let _ = event_tx
                    .send(ConnectionEvent::Connected {
                        attempts: attempt,
                        replayed,
                    })
                    .await;
                return;
            }
            Ok(Err(e)) => last_error = e.to_string(),
            Err(_) => last_error = format!("connect timed out after {:?}", config.connect_timeout),
        }

        warn!(
            "[{}] Connect attempt {}/{} failed: {}",
            config.client_id, attempt, config.max_attempts, last_error
        );
        let _ = event_tx
            .send(ConnectionEvent::AttemptFailed {
                attempt,
                reason: last_error.clone(),
            })
            .await;

        if attempt < config.max_attempts {
            tokio::time::sleep(retry_delay).await;
            retry_delay = std::cmp::min(retry_delay * 2, config.max_retry_delay);
        }
    }

    queue.mark_degraded().await;
    error!(
        "[{}] Giving up after {} attempts, publishes will be dropped: {}",
        config.client_id, config.max_attempts, last_error
    );
    let _ = event_tx
        .send(ConnectionEvent::ConnectionFailed {
            attempts: config.max_attempts,
            reason: last_error,
        })
        .await;
}
