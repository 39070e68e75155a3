//! Read-only view of a session for presentation.

use std::collections::HashMap;
use std::sync::Arc;

use vc_mesh_common::{Participant, RoomId, UserId};

use crate::media::LocalTrack;
use crate::pool::RemoteStream;

/// Where the session is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Idle,
    /// Waiting for local media.
    Joining,
    Joined,
}

/// The local user's toggles.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LocalFlags {
    pub mic_on: bool,
    pub cam_on: bool,
    pub screen_on: bool,
    pub speaking: bool,
}

impl From<&Participant> for LocalFlags {
    fn from(p: &Participant) -> Self {
        Self {
            mic_on: p.mic_on,
            cam_on: p.cam_on,
            screen_on: p.screen_on,
            speaking: p.speaking,
        }
    }
}

/// Everything needed to render the room.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub status: SessionStatus,
    pub room_id: Option<RoomId>,
    pub local_user_id: UserId,
    pub local: LocalFlags,
    /// Local participant first, then remotes by id.
    pub participants: Vec<Participant>,
    /// Inbound media per remote user; absent until negotiation delivers a track.
    pub streams: HashMap<UserId, RemoteStream>,
    /// Active local video for preview: the screen while sharing, else the camera when on.
    pub local_video: Option<Arc<LocalTrack>>,
}

impl SessionSnapshot {
    /// The state outside of any room.
    pub fn idle(local_user_id: UserId) -> Self {
        Self {
            status: SessionStatus::Idle,
            room_id: None,
            local_user_id,
            local: LocalFlags::default(),
            participants: Vec::new(),
            streams: HashMap::new(),
            local_video: None,
        }
    }

    pub fn is_joined(&self) -> bool {
        self.status == SessionStatus::Joined
    }

    pub fn participant(&self, user_id: UserId) -> Option<&Participant> {
        self.participants.iter().find(|p| p.user_id == user_id)
    }

    pub fn stream(&self, user_id: UserId) -> Option<&RemoteStream> {
        self.streams.get(&user_id)
    }
}
