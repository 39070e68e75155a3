//! Signaling Channel
//!
//! Binds a session to the two topics of a room. Inbound payloads are decoded
//! on pump tasks and handed to a sink; outbound messages are encoded and sent
//! through the bus.

use std::fmt;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use vc_mesh_common::protocol::{PresenceMessage, RoomTopics, SignalMessage};
use vc_mesh_common::{Participant, StateUpdate, UserId};

use crate::bus::{BusError, BusSubscription, MessageBus};

/// A decoded message addressed to us.
#[derive(Debug, Clone)]
pub enum Inbound {
    Presence(PresenceMessage),
    Signal(SignalMessage),
}

/// Receives every [`Inbound`] message.
pub type InboundSink = Arc<dyn Fn(Inbound) + Send + Sync>;

/// Whether a presence message originates from `local`.
fn is_self_echo(message: &PresenceMessage, local: UserId) -> bool {
    match message {
        PresenceMessage::Join { participant } => participant.user_id == local,
        PresenceMessage::Leave { user_id } | PresenceMessage::State { user_id, .. } => {
            *user_id == local
        }
        PresenceMessage::Roster { .. } => false,
    }
}

/// Decode a presence payload, dropping our own echoes.
pub fn accept_presence(payload: &str, local: UserId) -> Option<PresenceMessage> {
    match PresenceMessage::decode(payload) {
        Ok(message) if is_self_echo(&message, local) => None,
        Ok(message) => Some(message),
        Err(e) => {
            warn!(error = %e, "Malformed presence message dropped");
            None
        }
    }
}

/// Decode a signaling payload, dropping anything not addressed to `local`.
pub fn accept_signal(payload: &str, local: UserId) -> Option<SignalMessage> {
    match SignalMessage::decode(payload) {
        Ok(message) if message.to_user_id() != local => None,
        Ok(message) if message.from_user_id() == local => None,
        Ok(message) => Some(message),
        Err(e) => {
            warn!(error = %e, "Malformed signaling message dropped");
            None
        }
    }
}

/// The subscriptions and send primitives of one joined room.
///
/// Dropping the channel stops its pumps.
pub struct SignalingChannel {
    bus: Arc<dyn MessageBus>,
    local: UserId,
    topics: RoomTopics,
    pumps: Vec<JoinHandle<()>>,
}

impl SignalingChannel {
    /// Subscribe to both room topics.
    ///
    /// Either both subscriptions are live on return or neither is.
    pub async fn open(
        bus: Arc<dyn MessageBus>,
        local: UserId,
        topics: RoomTopics,
        sink: InboundSink,
    ) -> Result<Self, BusError> {
        let presence = bus.subscribe(&topics.presence).await?;
        // On failure `presence` is dropped here, which unsubscribes it.
        let signal = bus.subscribe(&topics.signal).await?;

        let pumps = vec![
            tokio::spawn(pump_presence(presence, local, sink.clone())),
            tokio::spawn(pump_signal(signal, local, sink)),
        ];

        info!(
            user_id = %local,
            presence = %topics.presence,
            signal = %topics.signal,
            "Signaling channel open"
        );

        Ok(Self {
            bus,
            local,
            topics,
            pumps,
        })
    }

    async fn publish_presence(&self, message: &PresenceMessage) -> Result<(), BusError> {
        let payload = message.encode().map_err(|e| BusError::SendFailed {
            destination: self.topics.presence.clone(),
            reason: e.to_string(),
        })?;
        debug!(kind = message.kind(), "Sending presence message");
        self.bus.send(&self.topics.presence, payload).await
    }

    /// Send a signaling message on the room's signal topic.
    pub async fn send_signal(&self, message: &SignalMessage) -> Result<(), BusError> {
        let payload = message.encode().map_err(|e| BusError::SendFailed {
            destination: self.topics.signal.clone(),
            reason: e.to_string(),
        })?;
        debug!(
            kind = message.kind(),
            to_user_id = %message.to_user_id(),
            "Sending signaling message"
        );
        self.bus.send(&self.topics.signal, payload).await
    }

    pub async fn announce_join(&self, participant: &Participant) -> Result<(), BusError> {
        self.publish_presence(&PresenceMessage::Join {
            participant: participant.clone(),
        })
        .await
    }

    pub async fn announce_leave(&self) -> Result<(), BusError> {
        self.publish_presence(&PresenceMessage::Leave {
            user_id: self.local,
        })
        .await
    }

    pub async fn broadcast_state(&self, update: StateUpdate) -> Result<(), BusError> {
        self.publish_presence(&PresenceMessage::state(self.local, update))
            .await
    }

    /// Stop receiving. Sending keeps working.
    pub fn close(&mut self) {
        for pump in self.pumps.drain(..) {
            pump.abort();
        }
        debug!(user_id = %self.local, "Signaling channel closed");
    }
}

impl Drop for SignalingChannel {
    fn drop(&mut self) {
        for pump in &self.pumps {
            pump.abort();
        }
    }
}

impl fmt::Debug for SignalingChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignalingChannel")
            .field("local", &self.local)
            .field("topics", &self.topics)
            .finish_non_exhaustive()
    }
}

async fn pump_presence(mut subscription: BusSubscription, local: UserId, sink: InboundSink) {
    while let Some(payload) = subscription.recv().await {
        if let Some(message) = accept_presence(&payload, local) {
            sink(Inbound::Presence(message));
        }
    }
    debug!(topic = %subscription.topic(), "Presence subscription ended");
}

async fn pump_signal(mut subscription: BusSubscription, local: UserId, sink: InboundSink) {
    while let Some(payload) = subscription.recv().await {
        if let Some(message) = accept_signal(&payload, local) {
            sink(Inbound::Signal(message));
        }
    }
    debug!(topic = %subscription.topic(), "Signaling subscription ended");
}
