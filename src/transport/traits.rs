//! Transport trait abstraction for pluggable messaging and video backends

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;

/// A message delivered on a subscription
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub topic: String,
    pub payload: Bytes,
}

/// A live subscription. Dropping it cancels delivery.
#[derive(Debug)]
pub struct Subscription {
    filter: String,
    rx: mpsc::UnboundedReceiver<Message>,
}

impl Subscription {
    pub fn new(filter: impl Into<String>, rx: mpsc::UnboundedReceiver<Message>) -> Self {
        Self {
            filter: filter.into(),
            rx,
        }
    }

    pub fn filter(&self) -> &str {
        &self.filter
    }
}

/// Yields `None` once the transport has dropped the subscription
impl Stream for Subscription {
    type Item = Message;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Message>> {
        self.rx.poll_recv(cx)
    }
}

/// Publish/subscribe messaging client
#[async_trait]
pub trait PubSubTransport: Send + Sync + 'static {
    /// Attempt one connection to the broker
    async fn connect(&self) -> Result<()>;

    /// Publish a payload; fails if not connected
    async fn publish(&self, topic: &str, payload: Bytes, retain: bool) -> Result<()>;

    /// Subscribe to a topic filter; retained values are delivered first
    async fn subscribe(&self, filter: &str) -> Result<Subscription>;

    /// Disconnect, ending every subscription of this client
    async fn disconnect(&self) -> Result<()>;

    /// Whether the client is connected and able to publish/subscribe
    fn is_ready(&self) -> bool;

    /// Human-readable name for this transport
    fn name(&self) -> &str;
}

/// Peer-to-peer media engine carrying the robot's camera feed
#[async_trait]
pub trait VideoTransport: Send + Sync + 'static {
    async fn join(&self, channel: &str) -> Result<()>;

    async fn leave(&self) -> Result<()>;

    async fn destroy(&self) -> Result<()>;
}
