//! Peer Connection Pool
//!
//! One [`PeerLink`] per remote participant in a mesh room. The pool creates
//! links on demand, assigns negotiation roles, buffers early ICE candidates
//! and swaps outbound tracks on every link at once.
//!
//! The pool never touches the bus: signaling messages it produces are queued
//! and collected with [`PeerConnectionPool::take_outbound`].

mod candidates;
mod link;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures::future::join_all;
use tracing::{debug, info, warn};
use vc_mesh_common::protocol::{IceCandidate, SdpKind, SignalMessage};
use vc_mesh_common::UserId;

use crate::media::{LocalTrack, TrackKind};
use crate::rtc::{
    ConnectionState, PeerConnectionFactory, PeerEvent, PeerEventSink, RemoteTrack, RtcError,
};

pub use candidates::PendingCandidates;
pub use link::PeerLink;

/// Whether `local` makes the offer to `remote`.
///
/// The greater id offers. Both sides evaluate the same comparison, so every
/// pair has exactly one offerer without exchanging anything. Requires user ids
/// to be totally ordered and distinct.
pub fn is_offerer(local: UserId, remote: UserId) -> bool {
    local > remote
}

/// Which side of the offer/answer exchange we are on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationRole {
    Offerer,
    Answerer,
}

impl NegotiationRole {
    pub fn between(local: UserId, remote: UserId) -> Self {
        if is_offerer(local, remote) {
            Self::Offerer
        } else {
            Self::Answerer
        }
    }
}

/// What happened to an inbound candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateDisposition {
    Applied,
    Buffered,
    Discarded,
}

/// A link callback tagged with its origin.
#[derive(Debug, Clone)]
pub struct LinkEvent {
    pub remote: UserId,
    pub seq: u64,
    pub event: PeerEvent,
}

/// Receives every [`LinkEvent`].
pub type LinkEventHandler = Arc<dyn Fn(LinkEvent) + Send + Sync>;

/// Inbound media from one participant.
#[derive(Debug, Clone)]
pub struct RemoteStream {
    pub user_id: UserId,
    pub tracks: Vec<RemoteTrack>,
}

impl RemoteStream {
    pub fn audio(&self) -> impl Iterator<Item = &RemoteTrack> {
        self.tracks.iter().filter(|t| t.kind == TrackKind::Audio)
    }

    pub fn video(&self) -> impl Iterator<Item = &RemoteTrack> {
        self.tracks.iter().filter(|t| t.kind == TrackKind::Video)
    }
}

/// The connections of one session.
pub struct PeerConnectionPool {
    local: UserId,
    factory: Arc<dyn PeerConnectionFactory>,
    events: LinkEventHandler,
    links: HashMap<UserId, PeerLink>,
    /// Users that left; their late candidates are dropped.
    departed: HashSet<UserId>,
    /// Latest offer from each departed user, answered if they come back.
    parked_offers: HashMap<UserId, String>,
    next_seq: u64,
    outbound_audio: Option<Arc<LocalTrack>>,
    outbound_video: Option<Arc<LocalTrack>>,
    outbox: Vec<SignalMessage>,
}

impl PeerConnectionPool {
    pub fn new(
        local: UserId,
        factory: Arc<dyn PeerConnectionFactory>,
        events: LinkEventHandler,
    ) -> Self {
        Self {
            local,
            factory,
            events,
            links: HashMap::new(),
            departed: HashSet::new(),
            parked_offers: HashMap::new(),
            next_seq: 0,
            outbound_audio: None,
            outbound_video: None,
            outbox: Vec::new(),
        }
    }

    pub const fn local(&self) -> UserId {
        self.local
    }

    pub fn link(&self, remote: UserId) -> Option<&PeerLink> {
        self.links.get(&remote)
    }

    pub fn contains(&self, remote: UserId) -> bool {
        self.links.contains_key(&remote)
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    pub fn remote_ids(&self) -> Vec<UserId> {
        self.links.keys().copied().collect()
    }

    /// Whether a callback tagged `(remote, seq)` belongs to a live link.
    pub fn is_current(&self, remote: UserId, seq: u64) -> bool {
        self.links.get(&remote).is_some_and(|l| l.seq == seq)
    }

    /// Signaling messages produced since the last call.
    pub fn take_outbound(&mut self) -> Vec<SignalMessage> {
        std::mem::take(&mut self.outbox)
    }

    /// Streams of every link that has received at least one track.
    pub fn remote_streams(&self) -> HashMap<UserId, RemoteStream> {
        self.links
            .values()
            .filter(|l| !l.remote_tracks.is_empty())
            .map(|l| {
                (
                    l.remote,
                    RemoteStream {
                        user_id: l.remote,
                        tracks: l.remote_tracks.clone(),
                    },
                )
            })
            .collect()
    }

    /// Set the track new links send as audio and swap it on existing ones.
    pub async fn set_outbound_audio(&mut self, track: Option<Arc<LocalTrack>>) {
        self.outbound_audio.clone_from(&track);
        let results = join_all(self.links.values().map(|link| {
            let track = track.clone();
            async move { (link.remote, link.audio.replace_track(track).await) }
        }))
        .await;
        for (remote, result) in results {
            if let Err(e) = result {
                warn!(user_id = %remote, error = %e, "Audio track replacement failed");
            }
        }
    }

    /// Set the track new links send as video and swap it on existing ones.
    pub async fn set_outbound_video(&mut self, track: Option<Arc<LocalTrack>>) {
        self.outbound_video.clone_from(&track);
        let results = join_all(self.links.values().map(|link| {
            let track = track.clone();
            async move { (link.remote, link.video.replace_track(track).await) }
        }))
        .await;
        for (remote, result) in results {
            if let Err(e) = result {
                warn!(user_id = %remote, error = %e, "Video track replacement failed");
            }
        }
        debug!(
            track_id = track.as_ref().map_or("none", |t| t.id()),
            links = self.links.len(),
            "Outbound video replaced"
        );
    }

    /// Create the link to `remote` unless it exists or is ourselves.
    ///
    /// The offerer side also produces the offer. Returns whether a link was created.
    pub async fn ensure_link(&mut self, remote: UserId) -> Result<bool, RtcError> {
        if remote == self.local || self.links.contains_key(&remote) {
            return Ok(false);
        }
        self.departed.remove(&remote);

        let link = self.open_link(remote).await?;
        let role = link.role;
        self.links.insert(remote, link);
        info!(user_id = %remote, role = ?role, "Peer link created");

        if role == NegotiationRole::Offerer {
            self.send_offer(remote).await?;
        }
        Ok(true)
    }

    async fn open_link(&mut self, remote: UserId) -> Result<PeerLink, RtcError> {
        let seq = self.next_seq;
        self.next_seq += 1;

        let handler = self.events.clone();
        let sink = PeerEventSink::new(move |event| {
            handler(LinkEvent { remote, seq, event });
        });
        let connection = self.factory.create(remote, sink).await?;

        let senders = async {
            let audio = connection
                .add_sender(TrackKind::Audio, self.outbound_audio.clone())
                .await?;
            let video = connection
                .add_sender(TrackKind::Video, self.outbound_video.clone())
                .await?;
            Ok::<_, RtcError>((audio, video))
        }
        .await;

        let (audio, video) = match senders {
            Ok(senders) => senders,
            Err(e) => {
                if let Err(close_err) = connection.close().await {
                    debug!(user_id = %remote, error = %close_err, "Close after failed setup");
                }
                return Err(e);
            }
        };

        Ok(PeerLink {
            remote,
            seq,
            role: NegotiationRole::between(self.local, remote),
            connection,
            audio,
            video,
            pending: PendingCandidates::new(),
            remote_description_set: false,
            last_remote_offer: None,
            state: ConnectionState::New,
            remote_tracks: Vec::new(),
        })
    }

    async fn send_offer(&mut self, remote: UserId) -> Result<(), RtcError> {
        let Some(link) = self.links.get(&remote) else {
            return Ok(());
        };
        let connection = link.connection.clone();

        let sdp = connection.create_offer().await?;
        connection
            .set_local_description(SdpKind::Offer, sdp.clone())
            .await?;

        debug!(user_id = %remote, "Offer created");
        self.outbox
            .push(SignalMessage::description(SdpKind::Offer, self.local, remote, sdp));
        Ok(())
    }

    /// Apply a remote offer and answer it.
    pub async fn handle_offer(&mut self, from: UserId, sdp: String) -> Result<(), RtcError> {
        if from == self.local {
            return Ok(());
        }
        if is_offerer(self.local, from) {
            warn!(user_id = %from, "Ignoring offer from a peer that should answer");
            return Ok(());
        }
        if self.departed.contains(&from) {
            debug!(user_id = %from, "Offer from departed peer parked");
            self.parked_offers.insert(from, sdp);
            return Ok(());
        }

        self.ensure_link(from).await?;
        let Some(link) = self.links.get_mut(&from) else {
            return Ok(());
        };
        if link.last_remote_offer.as_deref() == Some(sdp.as_str()) {
            debug!(user_id = %from, "Duplicate offer ignored");
            return Ok(());
        }
        let connection = link.connection.clone();

        connection
            .set_remote_description(SdpKind::Offer, sdp.clone())
            .await?;
        if let Some(link) = self.links.get_mut(&from) {
            link.remote_description_set = true;
            link.last_remote_offer = Some(sdp);
        }
        self.flush_candidates(from).await;

        let answer = connection.create_answer().await?;
        connection
            .set_local_description(SdpKind::Answer, answer.clone())
            .await?;

        debug!(user_id = %from, "Answer created");
        self.outbox.push(SignalMessage::description(
            SdpKind::Answer,
            self.local,
            from,
            answer,
        ));
        Ok(())
    }

    /// Apply the answer to our offer.
    pub async fn handle_answer(&mut self, from: UserId, sdp: String) -> Result<(), RtcError> {
        let Some(link) = self.links.get(&from) else {
            debug!(user_id = %from, "Answer for unknown link ignored");
            return Ok(());
        };
        if link.role != NegotiationRole::Offerer {
            warn!(user_id = %from, "Ignoring answer on a link we did not offer");
            return Ok(());
        }
        if link.remote_description_set {
            debug!(user_id = %from, "Duplicate answer ignored");
            return Ok(());
        }
        let connection = link.connection.clone();

        connection
            .set_remote_description(SdpKind::Answer, sdp)
            .await?;
        if let Some(link) = self.links.get_mut(&from) {
            link.remote_description_set = true;
        }
        self.flush_candidates(from).await;
        Ok(())
    }

    /// Apply a remote candidate, or hold it until the remote description is set.
    ///
    /// A candidate from an unknown peer creates the link first. Candidates from
    /// peers that left are dropped.
    pub async fn handle_candidate(
        &mut self,
        from: UserId,
        candidate: IceCandidate,
    ) -> Result<CandidateDisposition, RtcError> {
        if from == self.local || self.departed.contains(&from) {
            debug!(user_id = %from, "Candidate from departed peer discarded");
            return Ok(CandidateDisposition::Discarded);
        }

        self.ensure_link(from).await?;
        let Some(link) = self.links.get_mut(&from) else {
            return Ok(CandidateDisposition::Discarded);
        };

        if link.remote_description_set {
            let connection = link.connection.clone();
            connection.add_ice_candidate(candidate).await?;
            Ok(CandidateDisposition::Applied)
        } else {
            link.pending.push(candidate);
            debug!(user_id = %from, pending = link.pending.len(), "Candidate buffered");
            Ok(CandidateDisposition::Buffered)
        }
    }

    async fn flush_candidates(&mut self, remote: UserId) {
        let Some(link) = self.links.get_mut(&remote) else {
            return;
        };
        let Some(candidates) = link.pending.flush() else {
            return;
        };
        let connection = link.connection.clone();

        if !candidates.is_empty() {
            debug!(user_id = %remote, count = candidates.len(), "Flushing buffered candidates");
        }
        for candidate in candidates {
            if let Err(e) = connection.add_ice_candidate(candidate).await {
                warn!(user_id = %remote, error = %e, "Buffered candidate rejected");
            }
        }
    }

    /// Queue a locally gathered candidate for `remote`. False if the link is gone.
    pub fn on_local_candidate(&mut self, remote: UserId, seq: u64, candidate: IceCandidate) -> bool {
        if !self.is_current(remote, seq) {
            return false;
        }
        self.outbox.push(SignalMessage::Candidate {
            from_user_id: self.local,
            to_user_id: remote,
            candidate,
        });
        true
    }

    /// Record an inbound track. False if the link is gone.
    pub fn on_remote_track(&mut self, remote: UserId, seq: u64, track: RemoteTrack) -> bool {
        match self.links.get_mut(&remote) {
            Some(link) if link.seq == seq => {
                info!(user_id = %remote, kind = ?track.kind, "Remote track attached");
                link.add_remote_track(track);
                true
            }
            _ => false,
        }
    }

    /// Record a connection state change. False if the link is gone.
    pub fn on_state_changed(&mut self, remote: UserId, seq: u64, state: ConnectionState) -> bool {
        match self.links.get_mut(&remote) {
            Some(link) if link.seq == seq => {
                if state == ConnectionState::Failed {
                    warn!(user_id = %remote, "Negotiation failed, link kept without media");
                }
                link.state = state;
                true
            }
            _ => false,
        }
    }

    /// Close the link to `remote`, dropping its buffered candidates and stream.
    /// Safe to call repeatedly.
    pub async fn close_link(&mut self, remote: UserId) -> bool {
        let Some(link) = self.links.remove(&remote) else {
            return false;
        };

        if let Err(e) = link.connection.close().await {
            debug!(user_id = %remote, error = %e, "Error closing peer connection");
        }
        info!(
            user_id = %remote,
            discarded_candidates = link.pending.len(),
            "Peer link closed"
        );
        true
    }

    /// Close the link and ignore anything `remote` still sends us.
    ///
    /// `known` says whether the room knew the user; strangers are not
    /// remembered.
    pub async fn depart(&mut self, remote: UserId, known: bool) -> bool {
        let closed = self.close_link(remote).await;
        if known || closed {
            self.departed.insert(remote);
            self.parked_offers.remove(&remote);
        }
        closed
    }

    /// Link to a user the room lists, forgetting an earlier departure.
    ///
    /// An offer that arrived while the user was still marked as departed is
    /// answered now. Returns whether a link was created.
    pub async fn admit(&mut self, remote: UserId) -> Result<bool, RtcError> {
        self.departed.remove(&remote);
        let parked = self.parked_offers.remove(&remote);
        let created = self.ensure_link(remote).await?;
        if let Some(sdp) = parked {
            debug!(user_id = %remote, "Answering parked offer");
            self.handle_offer(remote, sdp).await?;
        }
        Ok(created)
    }

    /// Close every link.
    pub async fn close_all(&mut self) {
        for remote in self.remote_ids() {
            self.close_link(remote).await;
        }
        self.departed.clear();
        self.parked_offers.clear();
        self.outbox.clear();
    }
}
