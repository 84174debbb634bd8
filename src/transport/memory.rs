//! In-process broker with retained messages
//!
//! Used by the console when no external broker is configured, and by tests.
//! Each `MemoryTransport` is one client connection to a shared `MemoryBroker`.

use crate::transport::traits::{Message, PubSubTransport, Subscription};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bytes::Bytes;
use robofleet_shared::topics::topic_matches;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;

struct Subscriber {
    client_id: String,
    filter: String,
    tx: mpsc::UnboundedSender<Message>,
}

#[derive(Default)]
struct BrokerState {
    retained: HashMap<String, Bytes>,
    subscribers: Vec<Subscriber>,
    history: Vec<Message>,
}

/// Shared broker state; cheap to clone
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new client of this broker
    pub fn client(&self, client_id: impl Into<String>) -> MemoryTransport {
        MemoryTransport {
            client_id: client_id.into(),
            broker: self.clone(),
            connected: AtomicBool::new(false),
            failures_remaining: AtomicU32::new(0),
            connect_delay: Duration::ZERO,
        }
    }

    /// Every message published so far, in arrival order
    pub fn history(&self) -> Vec<Message> {
        self.lock().history.clone()
    }

    /// Payloads published on one topic, in arrival order
    pub fn payloads(&self, topic: &str) -> Vec<String> {
        self.lock()
            .history
            .iter()
            .filter(|m| m.topic == topic)
            .map(|m| String::from_utf8_lossy(&m.payload).into_owned())
            .collect()
    }

    /// Last retained value for a topic
    pub fn retained(&self, topic: &str) -> Option<Bytes> {
        self.lock().retained.get(topic).cloned()
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        // A poisoned broker only means a test panicked mid-publish
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn publish(&self, topic: &str, payload: Bytes, retain: bool) {
        let mut state = self.lock();
        let message = Message {
            topic: topic.to_string(),
            payload,
        };

        if retain {
            if message.payload.is_empty() {
                state.retained.remove(topic);
            } else {
                state.retained.insert(topic.to_string(), message.payload.clone());
            }
        }

        state.history.push(message.clone());
        state
            .subscribers
            .retain(|s| !topic_matches(&s.filter, topic) || s.tx.send(message.clone()).is_ok());
    }

    fn subscribe(&self, client_id: &str, filter: &str) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.lock();

        let mut retained: Vec<_> = state
            .retained
            .iter()
            .filter(|(topic, _)| topic_matches(filter, topic))
            .map(|(topic, payload)| Message {
                topic: topic.clone(),
                payload: payload.clone(),
            })
            .collect();
        retained.sort_by(|a, b| a.topic.cmp(&b.topic));
        for message in retained {
            let _ = tx.send(message);
        }

        state.subscribers.push(Subscriber {
            client_id: client_id.to_string(),
            filter: filter.to_string(),
            tx,
        });

        Subscription::new(filter, rx)
    }

    fn drop_client(&self, client_id: &str) {
        self.lock().subscribers.retain(|s| s.client_id != client_id);
    }
}

/// One client connection to a `MemoryBroker`
pub struct MemoryTransport {
    client_id: String,
    broker: MemoryBroker,
    connected: AtomicBool,
    failures_remaining: AtomicU32,
    connect_delay: Duration,
}

impl MemoryTransport {
    /// Make the next `count` connect attempts fail
    pub fn fail_connects(self, count: u32) -> Self {
        self.failures_remaining.store(count, Ordering::SeqCst);
        self
    }

    /// Delay every connect attempt
    pub fn with_connect_delay(mut self, delay: Duration) -> Self {
        self.connect_delay = delay;
        self
    }
}

#[async_trait]
impl PubSubTransport for MemoryTransport {
    async fn connect(&self) -> Result<()> {
        if !self.connect_delay.is_zero() {
            tokio::time::sleep(self.connect_delay).await;
        }

        let refused = self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(anyhow!("Broker refused connection for {}", self.client_id));
        }

        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Bytes, retain: bool) -> Result<()> {
        if !self.is_ready() {
            return Err(anyhow!("Client {} not connected", self.client_id));
        }
        self.broker.publish(topic, payload, retain);
        Ok(())
    }

    async fn subscribe(&self, filter: &str) -> Result<Subscription> {
        if !self.is_ready() {
            return Err(anyhow!("Client {} not connected", self.client_id));
        }
        Ok(self.broker.subscribe(&self.client_id, filter))
    }

    async fn disconnect(&self) -> Result<()> {
        if self.connected.swap(false, Ordering::SeqCst) {
            self.broker.drop_client(&self.client_id);
        }
        Ok(())
    }

    fn is_ready(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn name(&self) -> &str {
        "memory"
    }
}
