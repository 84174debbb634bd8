//! Readiness queue - defers publishes and subscribes until the transport is connected

use crate::error::CoordinatorError;
use crate::transport::{PubSubTransport, Subscription};
use bytes::Bytes;
use robofleet_shared::Topic;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{oneshot, watch, Mutex};
use tracing::{debug, info, warn};

/// Transport readiness as seen by the queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// Not connected yet, operations accumulate
    Pending,
    /// Connected, operations execute immediately
    Ready,
    /// Connect attempts exhausted, operations are dropped
    Degraded,
}

/// A deferred unit of transport work
pub enum QueuedOperation {
    Publish {
        topic: String,
        payload: Bytes,
        retain: bool,
    },
    Subscribe {
        filter: String,
        reply: oneshot::Sender<Subscription>,
    },
}

impl fmt::Debug for QueuedOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueuedOperation::Publish { topic, payload, retain } => f
                .debug_struct("Publish")
                .field("topic", topic)
                .field("payload", payload)
                .field("retain", retain)
                .finish(),
            QueuedOperation::Subscribe { filter, .. } => {
                f.debug_struct("Subscribe").field("filter", filter).finish()
            }
        }
    }
}

/// What happened to a submitted operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Queued,
    Executed,
    Failed,
    Dropped,
}

enum QueueState {
    Pending(VecDeque<QueuedOperation>),
    Ready,
    Degraded,
}

struct QueueInner {
    transport: Arc<dyn PubSubTransport>,
    state: Mutex<QueueState>,
    readiness_tx: watch::Sender<Readiness>,
}

/// FIFO of operations requested before the transport is ready.
///
/// The readiness transition drains the queue while holding the state lock, so
/// a concurrent `submit` either lands in the queue before the drain or runs
/// after it. Every operation executes exactly once.
#[derive(Clone)]
pub struct ReadinessQueue {
    inner: Arc<QueueInner>,
}

impl ReadinessQueue {
    pub fn new(transport: Arc<dyn PubSubTransport>) -> Self {
        let (readiness_tx, _) = watch::channel(Readiness::Pending);
        Self {
            inner: Arc::new(QueueInner {
                transport,
                state: Mutex::new(QueueState::Pending(VecDeque::new())),
                readiness_tx,
            }),
        }
    }

    #[cfg(test)]
    pub fn readiness(&self) -> Readiness {
        *self.inner.readiness_tx.borrow()
    }

    /// Watch readiness changes
    pub fn watch(&self) -> watch::Receiver<Readiness> {
        self.inner.readiness_tx.subscribe()
    }

    pub fn transport(&self) -> &Arc<dyn PubSubTransport> {
        &self.inner.transport
    }

    /// Number of operations waiting for readiness
    pub async fn pending_len(&self) -> usize {
        match &*self.inner.state.lock().await {
            QueueState::Pending(ops) => ops.len(),
            _ => 0,
        }
    }

    /// Submit an operation: queue it, run it, or drop it depending on readiness
    pub async fn submit(&self, op: QueuedOperation) -> Disposition {
        {
            let mut state = self.inner.state.lock().await;
            match &mut *state {
                QueueState::Pending(ops) => {
                    debug!("Transport not ready, queued {:?}", op);
                    ops.push_back(op);
                    return Disposition::Queued;
                }
                QueueState::Degraded => {
                    warn!("Transport degraded, dropped {:?}", op);
                    return Disposition::Dropped;
                }
                QueueState::Ready => {}
            }
        }

        execute(self.inner.transport.as_ref(), op).await
    }

    /// Submit a publish
    pub async fn publish(&self, topic: impl Into<String>, payload: Bytes, retain: bool) -> Disposition {
        self.submit(QueuedOperation::Publish {
            topic: topic.into(),
            payload,
            retain,
        })
        .await
    }

    /// Submit a publish to a robot topic, retained per its channel
    pub async fn publish_topic(&self, topic: Topic, payload: Bytes) -> Disposition {
        self.publish(topic.to_string(), payload, topic.retained()).await
    }

    /// Submit a subscribe; the receiver resolves once the subscription exists.
    ///
    /// The receiver errors if the subscribe fails or the queue degrades.
    pub async fn subscribe(&self, filter: impl Into<String>) -> oneshot::Receiver<Subscription> {
        let (reply, rx) = oneshot::channel();
        self.submit(QueuedOperation::Subscribe {
            filter: filter.into(),
            reply,
        })
        .await;
        rx
    }

    /// Transition to ready and replay queued operations in submission order.
    ///
    /// Only the first transition drains; later calls return 0. The drain runs
    /// on its own task, so aborting the caller cannot leave it half done.
    pub async fn mark_ready(&self) -> usize {
        let queue = self.clone();
        match tokio::spawn(async move { queue.drain_ready().await }).await {
            Ok(count) => count,
            Err(e) => {
                warn!("Queue drain did not complete: {}", e);
                0
            }
        }
    }

    async fn drain_ready(&self) -> usize {
        let mut state = self.inner.state.lock().await;
        let ops = match std::mem::replace(&mut *state, QueueState::Ready) {
            QueueState::Pending(ops) => ops,
            previous => {
                *state = previous;
                return 0;
            }
        };

        let count = ops.len();
        for op in ops {
            execute(self.inner.transport.as_ref(), op).await;
        }
        self.inner.readiness_tx.send_replace(Readiness::Ready);
        drop(state);

        info!("Transport ready, replayed {} queued operations", count);
        count
    }

    /// Give up on readiness, dropping everything still queued
    pub async fn mark_degraded(&self) -> usize {
        let mut state = self.inner.state.lock().await;
        let dropped = match std::mem::replace(&mut *state, QueueState::Degraded) {
            QueueState::Pending(ops) => ops.len(),
            previous => {
                *state = previous;
                return 0;
            }
        };
        self.inner.readiness_tx.send_replace(Readiness::Degraded);

        if dropped > 0 {
            warn!("Transport degraded, dropped {} queued operations", dropped);
        }
        dropped
    }
}

/// Wait until `readiness` leaves `Pending`
pub async fn settled(mut readiness: watch::Receiver<Readiness>) -> Readiness {
    let outcome = readiness
        .wait_for(|r| *r != Readiness::Pending)
        .await
        .map(|r| *r);
    outcome.unwrap_or_else(|_| *readiness.borrow())
}

async fn execute(transport: &dyn PubSubTransport, op: QueuedOperation) -> Disposition {
    match op {
        QueuedOperation::Publish { topic, payload, retain } => {
            match transport.publish(&topic, payload, retain).await {
                Ok(()) => Disposition::Executed,
                Err(e) => {
                    warn!("Publish to {} failed: {}", topic, e);
                    Disposition::Failed
                }
            }
        }
        QueuedOperation::Subscribe { filter, reply } => match transport.subscribe(&filter).await {
            Ok(subscription) => {
                let _ = reply.send(subscription);
                Disposition::Executed
            }
            Err(e) => {
                let err = CoordinatorError::SubscriptionFailure {
                    topic: filter,
                    reason: e.to_string(),
                };
                warn!("{}", err);
                Disposition::Failed
            }
        },
    }
}
