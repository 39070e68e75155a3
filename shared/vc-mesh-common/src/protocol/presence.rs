//! Presence (roster) messages.

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::types::{Participant, StateUpdate, UserId};

/// Messages carried on a room's presence topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum PresenceMessage {
    /// Full roster snapshot.
    Roster { participants: Vec<Participant> },
    /// A participant joined (or re-announced itself).
    Join { participant: Participant },
    /// A participant left.
    #[serde(rename_all = "camelCase")]
    Leave { user_id: UserId },
    /// Media flag deltas for one participant.
    #[serde(rename_all = "camelCase")]
    State {
        user_id: UserId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mic_on: Option<bool>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cam_on: Option<bool>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        screen_on: Option<bool>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        speaking: Option<bool>,
    },
}

impl PresenceMessage {
    /// Build a `state` message from an update.
    pub const fn state(user_id: UserId, update: StateUpdate) -> Self {
        Self::State {
            user_id,
            mic_on: update.mic_on,
            cam_on: update.cam_on,
            screen_on: update.screen_on,
            speaking: update.speaking,
        }
    }

    /// The flag deltas of a `state` message.
    pub const fn state_update(&self) -> Option<StateUpdate> {
        match *self {
            Self::State {
                mic_on,
                cam_on,
                screen_on,
                speaking,
                ..
            } => Some(StateUpdate {
                mic_on,
                cam_on,
                screen_on,
                speaking,
            }),
            _ => None,
        }
    }

    /// Short name used in logs.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Roster { .. } => "roster",
            Self::Join { .. } => "join",
            Self::Leave { .. } => "leave",
            Self::State { .. } => "state",
        }
    }

    pub fn decode(payload: &str) -> Result<Self> {
        Ok(serde_json::from_str(payload)?)
    }

    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}
