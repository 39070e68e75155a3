//! Message Bus
//!
//! The publish/subscribe transport the room is carried on. The session only
//! needs an already connected bus exposing `subscribe` and `send`; connection
//! management belongs to the bus implementation.

mod memory;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

pub use memory::LocalBus;

/// Bus errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BusError {
    #[error("Bus not connected")]
    NotConnected,
    #[error("Failed to subscribe to {topic}: {reason}")]
    SubscribeFailed { topic: String, reason: String },
    #[error("Failed to send to {destination}: {reason}")]
    SendFailed { destination: String, reason: String },
}

/// A live subscription. Dropping it unsubscribes.
#[derive(Debug)]
pub struct BusSubscription {
    topic: String,
    rx: mpsc::UnboundedReceiver<String>,
}

impl BusSubscription {
    pub fn new(topic: impl Into<String>, rx: mpsc::UnboundedReceiver<String>) -> Self {
        Self {
            topic: topic.into(),
            rx,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Next payload, or `None` once the bus closed the subscription.
    pub async fn recv(&mut self) -> Option<String> {
        self.rx.recv().await
    }
}

/// Topic-based publish/subscribe with at-least-once delivery.
///
/// No ordering is promised across distinct topics.
#[async_trait]
pub trait MessageBus: Send + Sync {
    async fn subscribe(&self, topic: &str) -> Result<BusSubscription, BusError>;

    async fn send(&self, destination: &str, payload: String) -> Result<(), BusError>;
}
