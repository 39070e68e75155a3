//! Point-to-point signaling messages (offer / answer / ICE candidate).

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::types::UserId;

/// Session description kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// A network-traversal candidate, shaped like the browser's `RTCIceCandidateInit`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default, rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
    #[serde(default)]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    /// Candidate with only the candidate line set.
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        }
    }
}

/// Messages carried on a room's signaling topic. Each is addressed to one peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum SignalMessage {
    #[serde(rename_all = "camelCase")]
    Offer {
        from_user_id: UserId,
        to_user_id: UserId,
        sdp: String,
    },
    #[serde(rename_all = "camelCase")]
    Answer {
        from_user_id: UserId,
        to_user_id: UserId,
        sdp: String,
    },
    #[serde(rename_all = "camelCase")]
    Candidate {
        from_user_id: UserId,
        to_user_id: UserId,
        candidate: IceCandidate,
    },
}

impl SignalMessage {
    /// Build an offer or answer.
    pub fn description(kind: SdpKind, from: UserId, to: UserId, sdp: String) -> Self {
        match kind {
            SdpKind::Offer => Self::Offer {
                from_user_id: from,
                to_user_id: to,
                sdp,
            },
            SdpKind::Answer => Self::Answer {
                from_user_id: from,
                to_user_id: to,
                sdp,
            },
        }
    }

    pub const fn from_user_id(&self) -> UserId {
        match self {
            Self::Offer { from_user_id, .. }
            | Self::Answer { from_user_id, .. }
            | Self::Candidate { from_user_id, .. } => *from_user_id,
        }
    }

    pub const fn to_user_id(&self) -> UserId {
        match self {
            Self::Offer { to_user_id, .. }
            | Self::Answer { to_user_id, .. }
            | Self::Candidate { to_user_id, .. } => *to_user_id,
        }
    }

    /// Short name used in logs.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Offer { .. } => "offer",
            Self::Answer { .. } => "answer",
            Self::Candidate { .. } => "candidate",
        }
    }

    pub fn decode(payload: &str) -> Result<Self> {
        Ok(serde_json::from_str(payload)?)
    }

    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}
