//! In-process broadcast bus.
//!
//! Every payload sent to a destination is delivered to every live subscriber
//! of the topic with the same name, the sender included.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, RwLock};
use tracing::debug;

use super::{BusError, BusSubscription, MessageBus};

/// Loopback bus shared by clients in one process.
#[derive(Clone, Default)]
pub struct LocalBus {
    topics: Arc<RwLock<HashMap<String, Vec<mpsc::UnboundedSender<String>>>>>,
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live subscriptions on a topic.
    pub async fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .read()
            .await
            .get(topic)
            .map_or(0, |subs| subs.iter().filter(|tx| !tx.is_closed()).count())
    }
}

#[async_trait]
impl MessageBus for LocalBus {
    async fn subscribe(&self, topic: &str) -> Result<BusSubscription, BusError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.topics
            .write()
            .await
            .entry(topic.to_string())
            .or_default()
            .push(tx);

        debug!(topic = %topic, "Local bus subscription added");
        Ok(BusSubscription::new(topic, rx))
    }

    async fn send(&self, destination: &str, payload: String) -> Result<(), BusError> {
        let mut topics = self.topics.write().await;

        if let Some(subscribers) = topics.get_mut(destination) {
            // Closed receivers are dropped subscriptions.
            subscribers.retain(|tx| tx.send(payload.clone()).is_ok());
            if subscribers.is_empty() {
                topics.remove(destination);
            }
        }

        Ok(())
    }
}
