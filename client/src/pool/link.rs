//! One connection to one remote participant.

use std::fmt;
use std::sync::Arc;

use vc_mesh_common::UserId;

use super::candidates::PendingCandidates;
use super::NegotiationRole;
use crate::rtc::{ConnectionState, PeerConnection, RemoteTrack, RtpSender};

/// A peer link and its negotiation state.
pub struct PeerLink {
    pub(super) remote: UserId,
    pub(super) seq: u64,
    pub(super) role: NegotiationRole,
    pub(super) connection: Arc<dyn PeerConnection>,
    pub(super) audio: Arc<dyn RtpSender>,
    pub(super) video: Arc<dyn RtpSender>,
    pub(super) pending: PendingCandidates,
    pub(super) remote_description_set: bool,
    /// Last offer applied, to recognise redelivery.
    pub(super) last_remote_offer: Option<String>,
    pub(super) state: ConnectionState,
    pub(super) remote_tracks: Vec<RemoteTrack>,
}

impl PeerLink {
    pub const fn remote(&self) -> UserId {
        self.remote
    }

    /// Sequence number tagging this link's callbacks.
    pub const fn seq(&self) -> u64 {
        self.seq
    }

    pub const fn role(&self) -> NegotiationRole {
        self.role
    }

    pub const fn state(&self) -> ConnectionState {
        self.state
    }

    pub const fn has_remote_description(&self) -> bool {
        self.remote_description_set
    }

    /// Candidates waiting for the remote description.
    pub fn pending_candidates(&self) -> usize {
        self.pending.len()
    }

    pub fn audio_sender(&self) -> &Arc<dyn RtpSender> {
        &self.audio
    }

    pub fn video_sender(&self) -> &Arc<dyn RtpSender> {
        &self.video
    }

    pub fn remote_tracks(&self) -> &[RemoteTrack] {
        &self.remote_tracks
    }

    /// Record an inbound track, replacing one with the same id.
    pub(super) fn add_remote_track(&mut self, track: RemoteTrack) {
        if let Some(existing) = self.remote_tracks.iter_mut().find(|t| t.id == track.id) {
            *existing = track;
        } else {
            self.remote_tracks.push(track);
        }
    }
}

impl fmt::Debug for PeerLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerLink")
            .field("remote", &self.remote)
            .field("seq", &self.seq)
            .field("role", &self.role)
            .field("state", &self.state)
            .field("remote_description_set", &self.remote_description_set)
            .field("pending", &self.pending.len())
            .field("remote_tracks", &self.remote_tracks.len())
            .finish_non_exhaustive()
    }
}
