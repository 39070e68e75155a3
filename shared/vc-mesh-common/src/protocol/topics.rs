//! Per-room topic naming.

use crate::error::{Error, Result};
use crate::types::RoomId;

const ROOM_PLACEHOLDER: &str = "{room}";

/// Default presence topic template.
pub const DEFAULT_PRESENCE_TEMPLATE: &str = "/topic/rooms/{room}/presence";

/// Default signaling topic template.
pub const DEFAULT_SIGNAL_TEMPLATE: &str = "/topic/rooms/{room}/signal";

/// The two topics a room is carried on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomTopics {
    pub presence: String,
    pub signal: String,
}

impl RoomTopics {
    /// Topics built from the default templates.
    pub fn for_room(room: &RoomId) -> Self {
        Self {
            presence: DEFAULT_PRESENCE_TEMPLATE.replace(ROOM_PLACEHOLDER, room.as_str()),
            signal: DEFAULT_SIGNAL_TEMPLATE.replace(ROOM_PLACEHOLDER, room.as_str()),
        }
    }

    /// Topics built from custom templates; each must contain `{room}`.
    pub fn from_templates(presence: &str, signal: &str, room: &RoomId) -> Result<Self> {
        for template in [presence, signal] {
            if !template.contains(ROOM_PLACEHOLDER) {
                return Err(Error::InvalidTopicTemplate(template.to_string()));
            }
        }

        Ok(Self {
            presence: presence.replace(ROOM_PLACEHOLDER, room.as_str()),
            signal: signal.replace(ROOM_PLACEHOLDER, room.as_str()),
        })
    }
}
