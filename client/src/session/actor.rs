//! The session actor.
//!
//! Owns all mutable session state. Commands come from [`Session`](super::Session)
//! handles; everything asynchronous (bus pumps, peer callbacks, device prompts,
//! the speaking monitor) posts [`Event`]s tagged with the generation current
//! when the work started. `join` and `leave` bump the generation, which turns
//! every event still in flight into a no-op.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use vc_mesh_common::protocol::{PresenceMessage, RoomTopics, SignalMessage};
use vc_mesh_common::{LocalIdentity, Participant, RoomId, StateUpdate, UserId};

use super::roster::Roster;
use super::snapshot::{LocalFlags, SessionSnapshot, SessionStatus};
use super::{Command, Reply, SessionError, StateCallback};
use crate::bus::MessageBus;
use crate::config::SessionConfig;
use crate::media::{LocalMedia, LocalTrack, MediaController, MediaDevices, MediaError, ScreenCapture};
use crate::pool::{LinkEvent, PeerConnectionPool};
use crate::rtc::{PeerConnectionFactory, PeerEvent};
use crate::signaling::{Inbound, InboundSink, SignalingChannel};
use crate::speaking::SpeakingMonitor;

/// Asynchronous results and notifications.
enum Event {
    MediaAcquired(Result<LocalMedia, MediaError>),
    CameraAcquired {
        result: Result<Arc<LocalTrack>, MediaError>,
        reply: Reply<bool>,
    },
    ScreenAcquired {
        result: Result<ScreenCapture, MediaError>,
        reply: Reply<bool>,
    },
    /// Capture ended outside our control.
    ScreenEnded { track_id: String },
    Inbound(Inbound),
    Link(LinkEvent),
    Speaking(bool),
}

impl Event {
    const fn kind(&self) -> &'static str {
        match self {
            Self::MediaAcquired(_) => "media_acquired",
            Self::CameraAcquired { .. } => "camera_acquired",
            Self::ScreenAcquired { .. } => "screen_acquired",
            Self::ScreenEnded { .. } => "screen_ended",
            Self::Inbound(_) => "inbound",
            Self::Link(_) => "link",
            Self::Speaking(_) => "speaking",
        }
    }

    /// Drop a result nobody wants any more, releasing captured devices.
    fn discard(self) {
        debug!(kind = self.kind(), "Stale operation discarded");
        match self {
            Self::MediaAcquired(Ok(media)) => media.release(),
            Self::CameraAcquired { result, reply } => {
                if let Ok(camera) = result {
                    camera.stop();
                }
                let _ = reply.send(Err(SessionError::Cancelled));
            }
            Self::ScreenAcquired { result, reply } => {
                if let Ok(capture) = result {
                    capture.release();
                }
                let _ = reply.send(Err(SessionError::Cancelled));
            }
            _ => {}
        }
    }
}

struct Tagged {
    generation: u64,
    event: Event,
}

/// Posts events for one generation.
#[derive(Clone)]
struct EventPoster {
    tx: mpsc::UnboundedSender<Tagged>,
    generation: u64,
}

impl EventPoster {
    /// Returns false once the actor is gone; the event is discarded then.
    fn post(&self, event: Event) -> bool {
        match self.tx.send(Tagged {
            generation: self.generation,
            event,
        }) {
            Ok(()) => true,
            Err(mpsc::error::SendError(tagged)) => {
                tagged.event.discard();
                false
            }
        }
    }
}

enum Phase {
    Idle,
    Joining {
        room: RoomId,
        topics: RoomTopics,
        reply: Reply<()>,
    },
    Joined(Box<Room>),
}

/// State of a joined room.
struct Room {
    id: RoomId,
    channel: SignalingChannel,
    pool: PeerConnectionPool,
    media: MediaController,
    roster: Roster,
    speaking: Option<SpeakingMonitor>,
    /// A camera or screen prompt is open.
    prompt_pending: bool,
}

impl Room {
    /// Update our own flags and tell the room. Returns whether anything changed.
    async fn publish_local(&mut self, update: StateUpdate) -> bool {
        let changed = self.roster.apply_local(&update);
        if let Err(e) = self.channel.broadcast_state(update).await {
            warn!(error = %e, "State broadcast failed");
        }
        changed
    }

    /// Send whatever the pool produced.
    async fn flush_outbound(&mut self) {
        for message in self.pool.take_outbound() {
            if let Err(e) = self.channel.send_signal(&message).await {
                warn!(
                    to_user_id = %message.to_user_id(),
                    kind = message.kind(),
                    error = %e,
                    "Signaling send failed"
                );
            }
        }
    }

    async fn connect(&mut self, remote: UserId) {
        if let Err(e) = self.pool.admit(remote).await {
            warn!(user_id = %remote, error = %e, "Negotiation failed");
        }
        self.flush_outbound().await;
    }

    async fn on_presence(&mut self, message: PresenceMessage, reannounce: bool) -> bool {
        match message {
            PresenceMessage::Roster { participants } => {
                let diff = self.roster.reconcile(participants);
                for removed in &diff.removed {
                    self.pool.depart(*removed, true).await;
                }
                for remote in self.roster.remote_ids() {
                    self.connect(remote).await;
                }
                debug!(
                    added = diff.added.len(),
                    removed = diff.removed.len(),
                    "Roster reconciled"
                );
                !diff.is_empty()
            }
            PresenceMessage::Join { participant } => {
                let remote = participant.user_id;
                let is_new = self.roster.upsert(participant);
                info!(user_id = %remote, is_new, "Participant joined");
                self.connect(remote).await;

                if is_new && reannounce {
                    if let Err(e) = self.channel.announce_join(self.roster.local()).await {
                        warn!(error = %e, "Presence re-announce failed");
                    }
                }
                true
            }
            PresenceMessage::Leave { user_id } => {
                let removed = self.roster.remove(user_id).is_some();
                let closed = self.pool.depart(user_id, removed).await;
                info!(user_id = %user_id, "Participant left");
                removed || closed
            }
            PresenceMessage::State {
                user_id,
                mic_on,
                cam_on,
                screen_on,
                speaking,
            } => {
                let update = StateUpdate {
                    mic_on,
                    cam_on,
                    screen_on,
                    speaking,
                };
                if !self.roster.contains(user_id) {
                    debug!(user_id = %user_id, "State for unknown participant ignored");
                }
                self.roster.apply(user_id, &update)
            }
        }
    }

    async fn on_signal(&mut self, message: SignalMessage) {
        let from = message.from_user_id();
        let result = match message {
            SignalMessage::Offer { sdp, .. } => self.pool.handle_offer(from, sdp).await,
            SignalMessage::Answer { sdp, .. } => self.pool.handle_answer(from, sdp).await,
            SignalMessage::Candidate { candidate, .. } => self
                .pool
                .handle_candidate(from, candidate)
                .await
                .map(|_| ()),
        };

        if let Err(e) = result {
            warn!(user_id = %from, error = %e, "Negotiation failed");
        }
        self.flush_outbound().await;
    }

    /// Returns whether the snapshot changed.
    async fn on_link(&mut self, event: LinkEvent) -> bool {
        let LinkEvent { remote, seq, event } = event;
        match event {
            PeerEvent::LocalCandidate(candidate) => {
                if self.pool.on_local_candidate(remote, seq, candidate) {
                    self.flush_outbound().await;
                } else {
                    debug!(user_id = %remote, "Candidate from closed link discarded");
                }
                false
            }
            PeerEvent::RemoteTrack(track) => self.pool.on_remote_track(remote, seq, track),
            PeerEvent::StateChanged(state) => {
                self.pool.on_state_changed(remote, seq, state);
                false
            }
        }
    }

    async fn start_screen_share(&mut self, capture: ScreenCapture) -> Arc<LocalTrack> {
        let video = self.media.start_screen_share(capture);
        self.pool.set_outbound_video(Some(video.clone())).await;
        self.publish_local(StateUpdate::screen(true)).await;
        video
    }

    /// Returns false if nothing was being shared.
    async fn stop_screen_share(&mut self) -> bool {
        if !self.media.stop_screen_share() {
            return false;
        }
        self.pool.set_outbound_video(self.media.outbound_video()).await;
        self.publish_local(StateUpdate::screen(false)).await;
        true
    }

    async fn close(mut self) {
        if let Err(e) = self.channel.announce_leave().await {
            warn!(error = %e, "Leave announcement failed");
        }
        self.channel.close();
        self.speaking = None;
        self.pool.close_all().await;
        self.media.release_all();
        info!(room_id = %self.id, "Left room");
    }

    fn snapshot(&self, local_user_id: UserId) -> SessionSnapshot {
        SessionSnapshot {
            status: SessionStatus::Joined,
            room_id: Some(self.id.clone()),
            local_user_id,
            local: LocalFlags::from(self.roster.local()),
            participants: self.roster.participants(),
            streams: self.pool.remote_streams(),
            local_video: self.media.outbound_video().filter(|t| t.is_enabled()),
        }
    }
}

pub(super) struct Parts {
    pub identity: LocalIdentity,
    pub config: SessionConfig,
    pub bus: Arc<dyn MessageBus>,
    pub devices: Arc<dyn MediaDevices>,
    pub peers: Arc<dyn PeerConnectionFactory>,
    pub commands: mpsc::Receiver<Command>,
    pub snapshot: watch::Sender<SessionSnapshot>,
    pub on_state_change: Option<StateCallback>,
}

pub(super) struct Actor {
    identity: LocalIdentity,
    config: SessionConfig,
    bus: Arc<dyn MessageBus>,
    devices: Arc<dyn MediaDevices>,
    peers: Arc<dyn PeerConnectionFactory>,
    commands: mpsc::Receiver<Command>,
    events_tx: mpsc::UnboundedSender<Tagged>,
    events_rx: mpsc::UnboundedReceiver<Tagged>,
    snapshot: watch::Sender<SessionSnapshot>,
    on_state_change: Option<StateCallback>,
    generation: u64,
    phase: Phase,
    dirty: bool,
}

impl Actor {
    pub(super) fn new(parts: Parts) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            identity: parts.identity,
            config: parts.config,
            bus: parts.bus,
            devices: parts.devices,
            peers: parts.peers,
            commands: parts.commands,
            events_tx,
            events_rx,
            snapshot: parts.snapshot,
            on_state_change: parts.on_state_change,
            generation: 0,
            phase: Phase::Idle,
            dirty: false,
        }
    }

    pub(super) async fn run(mut self) {
        loop {
            tokio::select! {
                command = self.commands.recv() => {
                    let Some(command) = command else {
                        break;
                    };
                    self.handle_command(command).await;
                }
                Some(tagged) = self.events_rx.recv() => {
                    self.handle_event(tagged).await;
                }
            }
            self.publish();
        }

        self.leave().await;
        self.publish();
        debug!(user_id = %self.identity.user_id, "Session actor stopped");
    }

    fn poster(&self) -> EventPoster {
        EventPoster {
            tx: self.events_tx.clone(),
            generation: self.generation,
        }
    }

    /// Publish one snapshot if anything changed since the last one.
    fn publish(&mut self) {
        if !std::mem::take(&mut self.dirty) {
            return;
        }

        let snapshot = match &self.phase {
            Phase::Idle => SessionSnapshot::idle(self.identity.user_id),
            Phase::Joining { room, .. } => SessionSnapshot {
                status: SessionStatus::Joining,
                room_id: Some(room.clone()),
                participants: vec![Participant::from(&self.identity)],
                ..SessionSnapshot::idle(self.identity.user_id)
            },
            Phase::Joined(room) => room.snapshot(self.identity.user_id),
        };

        if let Some(callback) = &self.on_state_change {
            callback(&snapshot);
        }
        self.snapshot.send_replace(snapshot);
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Join { room, reply } => self.join(room, reply).await,
            Command::Leave { reply } => {
                self.leave().await;
                let _ = reply.send(());
            }
            Command::ToggleMic { reply } => {
                let result = self.toggle_mic().await;
                let _ = reply.send(result);
            }
            Command::ToggleCamera { reply } => self.toggle_camera(reply).await,
            Command::ToggleScreenShare { reply } => self.toggle_screen_share(reply).await,
        }
    }

    async fn handle_event(&mut self, tagged: Tagged) {
        if tagged.generation != self.generation {
            tagged.event.discard();
            return;
        }

        match tagged.event {
            Event::MediaAcquired(result) => self.on_media_acquired(result).await,
            Event::CameraAcquired { result, reply } => self.on_camera_acquired(result, reply).await,
            Event::ScreenAcquired { result, reply } => self.on_screen_acquired(result, reply).await,
            Event::ScreenEnded { track_id } => {
                if let Phase::Joined(room) = &mut self.phase {
                    if room.media.is_current_screen(&track_id) {
                        info!("Screen capture ended by the system");
                        self.dirty |= room.stop_screen_share().await;
                    }
                }
            }
            Event::Inbound(Inbound::Presence(message)) => {
                let reannounce = self.config.reannounce_on_peer_join;
                if let Phase::Joined(room) = &mut self.phase {
                    debug!(kind = message.kind(), "Presence message");
                    self.dirty |= room.on_presence(message, reannounce).await;
                }
            }
            Event::Inbound(Inbound::Signal(message)) => {
                if let Phase::Joined(room) = &mut self.phase {
                    debug!(
                        kind = message.kind(),
                        from_user_id = %message.from_user_id(),
                        "Signaling message"
                    );
                    room.on_signal(message).await;
                }
            }
            Event::Link(event) => {
                if let Phase::Joined(room) = &mut self.phase {
                    self.dirty |= room.on_link(event).await;
                }
            }
            Event::Speaking(speaking) => {
                if let Phase::Joined(room) = &mut self.phase {
                    if let Some(update) = room.roster.local_speaking(speaking) {
                        self.dirty |= room.publish_local(update).await;
                    }
                }
            }
        }
    }

    async fn join(&mut self, room_id: RoomId, reply: Reply<()>) {
        if let Phase::Joined(room) = &self.phase {
            if room.id == room_id {
                let _ = reply.send(Ok(()));
                return;
            }
            info!(from = %room.id, to = %room_id, "Switching rooms");
        }
        self.leave().await;

        let topics = match RoomTopics::from_templates(
            &self.config.presence_topic,
            &self.config.signal_topic,
            &room_id,
        ) {
            Ok(topics) => topics,
            Err(e) => {
                let _ = reply.send(Err(e.into()));
                return;
            }
        };

        self.generation += 1;
        let poster = self.poster();
        let devices = self.devices.clone();
        tokio::spawn(async move {
            let result = MediaController::acquire_local_media(devices.as_ref()).await;
            poster.post(Event::MediaAcquired(result));
        });

        info!(room_id = %room_id, user_id = %self.identity.user_id, "Joining room");
        self.phase = Phase::Joining {
            room: room_id,
            topics,
            reply,
        };
        self.dirty = true;
    }

    async fn on_media_acquired(&mut self, result: Result<LocalMedia, MediaError>) {
        let Phase::Joining {
            room,
            topics,
            reply,
        } = std::mem::replace(&mut self.phase, Phase::Idle)
        else {
            // Generations change on every join, so this cannot be a live join.
            if let Ok(media) = result {
                media.release();
            }
            return;
        };
        self.dirty = true;

        let media = match result {
            Ok(media) => media,
            Err(e) => {
                warn!(room_id = %room, error = %e, "Local media acquisition failed");
                let _ = reply.send(Err(SessionError::MediaAcquisitionFailed(e)));
                return;
            }
        };

        match self.enter_room(room, topics, media).await {
            Ok(room) => {
                info!(
                    room_id = %room.id,
                    user_id = %self.identity.user_id,
                    audio_only = room.media.camera().is_none(),
                    "Joined room"
                );
                self.phase = Phase::Joined(Box::new(room));
                let _ = reply.send(Ok(()));
            }
            Err(e) => {
                let _ = reply.send(Err(e));
            }
        }
    }

    /// Subscribe, announce and build the room state. On failure nothing is
    /// left subscribed and the media is released.
    async fn enter_room(
        &self,
        id: RoomId,
        topics: RoomTopics,
        media: LocalMedia,
    ) -> Result<Room, SessionError> {
        let user_id = self.identity.user_id;

        let poster = self.poster();
        let sink: InboundSink = Arc::new(move |message: Inbound| {
            poster.post(Event::Inbound(message));
        });
        let channel = match SignalingChannel::open(self.bus.clone(), user_id, topics, sink).await
        {
            Ok(channel) => channel,
            Err(e) => {
                warn!(room_id = %id, error = %e, "Room subscription failed");
                media.release();
                return Err(e.into());
            }
        };

        let mut local = Participant::from(&self.identity);
        local.mic_on = true;
        if let Err(e) = channel.announce_join(&local).await {
            warn!(room_id = %id, error = %e, "Join announcement failed");
            drop(channel);
            media.release();
            return Err(e.into());
        }

        let media = MediaController::new(media);

        let poster = self.poster();
        let mut pool = PeerConnectionPool::new(
            user_id,
            self.peers.clone(),
            Arc::new(move |event: LinkEvent| {
                poster.post(Event::Link(event));
            }),
        );
        pool.set_outbound_audio(media.outbound_audio()).await;
        pool.set_outbound_video(media.outbound_video()).await;

        let speaking = media.microphone().map(|mic| {
            let poster = self.poster();
            SpeakingMonitor::spawn(mic.clone(), self.config.speaking, move |speaking| {
                poster.post(Event::Speaking(speaking))
            })
        });

        Ok(Room {
            id,
            channel,
            pool,
            media,
            roster: Roster::new(local),
            speaking,
            prompt_pending: false,
        })
    }

    async fn leave(&mut self) {
        match std::mem::replace(&mut self.phase, Phase::Idle) {
            Phase::Idle => return,
            Phase::Joining { room, reply, .. } => {
                info!(room_id = %room, "Join cancelled by leave");
                let _ = reply.send(Err(SessionError::Cancelled));
            }
            Phase::Joined(room) => room.close().await,
        }
        self.generation += 1;
        self.dirty = true;
    }

    async fn toggle_mic(&mut self) -> Result<bool, SessionError> {
        let Phase::Joined(room) = &mut self.phase else {
            return Err(SessionError::NotJoined);
        };

        let enable = !room.media.mic_on();
        room.media.set_mic_enabled(enable);

        let mut update = StateUpdate::mic(enable);
        if !enable && room.roster.local().speaking {
            update.speaking = Some(false);
        }
        room.publish_local(update).await;

        self.dirty = true;
        Ok(enable)
    }

    async fn toggle_camera(&mut self, reply: Reply<bool>) {
        let poster = self.poster();
        let Phase::Joined(room) = &mut self.phase else {
            let _ = reply.send(Err(SessionError::NotJoined));
            return;
        };

        let enable = !room.media.cam_on();
        if enable && room.media.camera().is_none() {
            if room.prompt_pending {
                let _ = reply.send(Err(SessionError::DevicePromptPending));
                return;
            }
            room.prompt_pending = true;

            let devices = self.devices.clone();
            tokio::spawn(async move {
                let result = MediaController::acquire_camera(devices.as_ref()).await;
                poster.post(Event::CameraAcquired { result, reply });
            });
            return;
        }

        room.media.set_camera_enabled(enable);
        room.publish_local(StateUpdate::camera(enable)).await;
        self.dirty = true;
        let _ = reply.send(Ok(enable));
    }

    async fn on_camera_acquired(
        &mut self,
        result: Result<Arc<LocalTrack>, MediaError>,
        reply: Reply<bool>,
    ) {
        let Phase::Joined(room) = &mut self.phase else {
            Event::CameraAcquired { result, reply }.discard();
            return;
        };
        room.prompt_pending = false;

        match result {
            Ok(camera) => {
                camera.set_enabled(true);
                room.media.install_camera(camera);
                if !room.media.is_screen_sharing() {
                    room.pool.set_outbound_video(room.media.outbound_video()).await;
                }
                room.publish_local(StateUpdate::camera(true)).await;
                self.dirty = true;
                info!("Camera acquired");
                let _ = reply.send(Ok(true));
            }
            Err(e) => {
                warn!(error = %e, "Camera acquisition failed");
                let _ = reply.send(Err(SessionError::MediaAcquisitionFailed(e)));
            }
        }
    }

    async fn toggle_screen_share(&mut self, reply: Reply<bool>) {
        let poster = self.poster();
        let Phase::Joined(room) = &mut self.phase else {
            let _ = reply.send(Err(SessionError::NotJoined));
            return;
        };

        if room.media.is_screen_sharing() {
            room.stop_screen_share().await;
            self.dirty = true;
            let _ = reply.send(Ok(false));
            return;
        }

        if room.prompt_pending {
            let _ = reply.send(Err(SessionError::DevicePromptPending));
            return;
        }
        room.prompt_pending = true;

        let devices = self.devices.clone();
        tokio::spawn(async move {
            let result = MediaController::request_screen(devices.as_ref(), false).await;
            poster.post(Event::ScreenAcquired { result, reply });
        });
    }

    async fn on_screen_acquired(
        &mut self,
        result: Result<ScreenCapture, MediaError>,
        reply: Reply<bool>,
    ) {
        let poster = self.poster();
        let Phase::Joined(room) = &mut self.phase else {
            Event::ScreenAcquired { result, reply }.discard();
            return;
        };
        room.prompt_pending = false;

        match result {
            Ok(capture) => {
                let video = room.start_screen_share(capture).await;
                watch_screen_end(&video, poster);
                self.dirty = true;
                let _ = reply.send(Ok(true));
            }
            Err(MediaError::Cancelled) => {
                info!("Screen share prompt cancelled");
                let _ = reply.send(Ok(false));
            }
            Err(e) => {
                warn!(error = %e, "Screen capture failed");
                let _ = reply.send(Err(SessionError::MediaAcquisitionFailed(e)));
            }
        }
    }
}

/// Turn the system's "stop sharing" into an event.
fn watch_screen_end(video: &Arc<LocalTrack>, poster: EventPoster) {
    let mut ended = video.subscribe_ended();
    let track_id = video.id().to_string();
    tokio::spawn(async move {
        if ended.wait_for(|ended| *ended).await.is_ok() {
            poster.post(Event::ScreenEnded { track_id });
        }
    });
}
