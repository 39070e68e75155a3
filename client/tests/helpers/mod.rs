//! Reusable fakes for session integration tests.
//!
//! Provides a recording wrapper around [`LocalBus`], scripted capture devices
//! and a peer-connection stack that records everything the pool asks of it.
//!
//! ## Clients
//!
//! Use [`TestClient::join_room`] to get a joined session backed by fakes that
//! share one in-process bus with every other client of the test.
#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use vc_mesh::bus::{BusError, BusSubscription, LocalBus, MessageBus};
use vc_mesh::media::{
    CaptureHandle, LocalTrack, MediaDevices, MediaError, MediaRequest, TrackKind, TrackSource,
};
use vc_mesh::rtc::{
    ConnectionState, PeerConnection, PeerConnectionFactory, PeerEvent, PeerEventSink, RemoteTrack,
    RtcError, RtpSender,
};
use vc_mesh::{LocalIdentity, Session, SessionConfig, SessionSnapshot};
use vc_mesh_common::protocol::{IceCandidate, PresenceMessage, RoomTopics, SdpKind, SignalMessage};
use vc_mesh_common::{Participant, RoomId, UserId};

pub const WAIT: Duration = Duration::from_secs(5);

// ============================================================================
// Bus
// ============================================================================

/// A client's view of a shared [`LocalBus`] that records what it sent.
pub struct RecordingBus {
    inner: LocalBus,
    sent: Mutex<Vec<(String, String)>>,
    fail_sends: AtomicBool,
    fail_subscribe: Mutex<Option<String>>,
}

impl RecordingBus {
    pub fn new(inner: LocalBus) -> Arc<Self> {
        Arc::new(Self {
            inner,
            sent: Mutex::new(Vec::new()),
            fail_sends: AtomicBool::new(false),
            fail_subscribe: Mutex::new(None),
        })
    }

    pub fn set_fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    /// Make subscriptions to `topic` fail.
    pub fn fail_subscribe_to(&self, topic: impl Into<String>) {
        *self.fail_subscribe.lock().unwrap() = Some(topic.into());
    }

    pub fn sent_to(&self, topic: &str) -> Vec<String> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, payload)| payload.clone())
            .collect()
    }

    pub fn presence_sent(&self, topics: &RoomTopics) -> Vec<PresenceMessage> {
        self.sent_to(&topics.presence)
            .iter()
            .map(|p| PresenceMessage::decode(p).unwrap())
            .collect()
    }

    /// Every `state` message this client sent.
    pub fn states_sent(&self, topics: &RoomTopics) -> Vec<PresenceMessage> {
        self.presence_sent(topics)
            .into_iter()
            .filter(|m| matches!(m, PresenceMessage::State { .. }))
            .collect()
    }

    pub fn signals_sent(&self, topics: &RoomTopics) -> Vec<SignalMessage> {
        self.sent_to(&topics.signal)
            .iter()
            .map(|p| SignalMessage::decode(p).unwrap())
            .collect()
    }

    pub fn clear(&self) {
        self.sent.lock().unwrap().clear();
    }
}

#[async_trait]
impl MessageBus for RecordingBus {
    async fn subscribe(&self, topic: &str) -> Result<BusSubscription, BusError> {
        if self.fail_subscribe.lock().unwrap().as_deref() == Some(topic) {
            return Err(BusError::SubscribeFailed {
                topic: topic.to_string(),
                reason: "refused".into(),
            });
        }
        self.inner.subscribe(topic).await
    }

    async fn send(&self, destination: &str, payload: String) -> Result<(), BusError> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(BusError::NotConnected);
        }
        self.sent
            .lock()
            .unwrap()
            .push((destination.to_string(), payload.clone()));
        self.inner.send(destination, payload).await
    }
}

/// Publish a presence message as some other client would.
pub async fn inject_presence(bus: &LocalBus, topics: &RoomTopics, message: PresenceMessage) {
    bus.send(&topics.presence, message.encode().unwrap())
        .await
        .unwrap();
}

pub async fn inject_signal(bus: &LocalBus, topics: &RoomTopics, message: SignalMessage) {
    bus.send(&topics.signal, message.encode().unwrap())
        .await
        .unwrap();
}

// ============================================================================
// Devices
// ============================================================================

/// Capture stub; counts device releases and reports a fixed level.
#[derive(Clone, Default)]
pub struct FakeCapture {
    stops: Arc<AtomicUsize>,
    level: Arc<Mutex<f32>>,
}

impl CaptureHandle for FakeCapture {
    fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
    }

    fn audio_samples(&self) -> Option<Vec<f32>> {
        let level = *self.level.lock().unwrap();
        Some(vec![level; 480])
    }
}

/// Scripted capture devices.
pub struct FakeDevices {
    user_media_calls: AtomicUsize,
    display_calls: AtomicUsize,
    camera_available: AtomicBool,
    microphone_available: AtomicBool,
    screen_error: Mutex<Option<MediaError>>,
    gate: Mutex<Option<Arc<Notify>>>,
    mic_level: Arc<Mutex<f32>>,
    issued: Mutex<Vec<Arc<LocalTrack>>>,
}

impl FakeDevices {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            user_media_calls: AtomicUsize::new(0),
            display_calls: AtomicUsize::new(0),
            camera_available: AtomicBool::new(true),
            microphone_available: AtomicBool::new(true),
            screen_error: Mutex::new(None),
            gate: Mutex::new(None),
            mic_level: Arc::new(Mutex::new(0.0)),
            issued: Mutex::new(Vec::new()),
        })
    }

    pub fn set_camera_available(&self, available: bool) {
        self.camera_available.store(available, Ordering::SeqCst);
    }

    pub fn set_microphone_available(&self, available: bool) {
        self.microphone_available.store(available, Ordering::SeqCst);
    }

    /// Fail the next screen requests with `error`, or succeed with `None`.
    pub fn set_screen_error(&self, error: Option<MediaError>) {
        *self.screen_error.lock().unwrap() = error;
    }

    /// Hold new requests until [`release`](Self::release).
    pub fn hold(&self) {
        *self.gate.lock().unwrap() = Some(Arc::new(Notify::new()));
    }

    /// Let one held request through and stop holding new ones.
    pub fn release(&self) {
        if let Some(gate) = self.gate.lock().unwrap().take() {
            gate.notify_one();
        }
    }

    pub fn set_mic_level(&self, level: f32) {
        *self.mic_level.lock().unwrap() = level;
    }

    pub fn user_media_calls(&self) -> usize {
        self.user_media_calls.load(Ordering::SeqCst)
    }

    pub fn display_calls(&self) -> usize {
        self.display_calls.load(Ordering::SeqCst)
    }

    pub fn issued(&self) -> Vec<Arc<LocalTrack>> {
        self.issued.lock().unwrap().clone()
    }

    pub fn issued_of(&self, source: TrackSource) -> Vec<Arc<LocalTrack>> {
        self.issued()
            .into_iter()
            .filter(|t| t.source() == source)
            .collect()
    }

    pub fn last_screen(&self) -> Option<Arc<LocalTrack>> {
        self.issued_of(TrackSource::ScreenVideo).pop()
    }

    pub fn camera(&self) -> Option<Arc<LocalTrack>> {
        self.issued_of(TrackSource::Camera).pop()
    }

    pub fn all_stopped(&self) -> bool {
        self.issued().iter().all(|t| t.is_stopped())
    }

    async fn wait_gate(&self) {
        let gate = self.gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
    }

    fn issue(&self, source: TrackSource, capture: FakeCapture) -> Arc<LocalTrack> {
        let track = LocalTrack::new(source, format!("fake {source:?}"), capture);
        self.issued.lock().unwrap().push(track.clone());
        track
    }
}

#[async_trait]
impl MediaDevices for FakeDevices {
    async fn user_media(&self, request: MediaRequest) -> Result<Vec<Arc<LocalTrack>>, MediaError> {
        self.user_media_calls.fetch_add(1, Ordering::SeqCst);
        self.wait_gate().await;

        if request.audio && !self.microphone_available.load(Ordering::SeqCst) {
            return Err(MediaError::PermissionDenied);
        }
        if request.video && !self.camera_available.load(Ordering::SeqCst) {
            return Err(MediaError::NoDevice("camera".into()));
        }

        let mut tracks = Vec::new();
        if request.audio {
            let capture = FakeCapture {
                level: self.mic_level.clone(),
                ..FakeCapture::default()
            };
            tracks.push(self.issue(TrackSource::Microphone, capture));
        }
        if request.video {
            tracks.push(self.issue(TrackSource::Camera, FakeCapture::default()));
        }
        Ok(tracks)
    }

    async fn display_media(&self, with_audio: bool) -> Result<Vec<Arc<LocalTrack>>, MediaError> {
        self.display_calls.fetch_add(1, Ordering::SeqCst);
        self.wait_gate().await;

        if let Some(error) = self.screen_error.lock().unwrap().clone() {
            return Err(error);
        }

        let mut tracks = vec![self.issue(TrackSource::ScreenVideo, FakeCapture::default())];
        if with_audio {
            tracks.push(self.issue(TrackSource::ScreenAudio, FakeCapture::default()));
        }
        Ok(tracks)
    }
}

// ============================================================================
// Peer connections
// ============================================================================

pub struct FakeSender {
    pub kind: TrackKind,
    track: Mutex<Option<Arc<LocalTrack>>>,
}

impl FakeSender {
    pub fn track_id(&self) -> Option<String> {
        self.track().map(|t| t.id().to_string())
    }
}

#[async_trait]
impl RtpSender for FakeSender {
    async fn replace_track(&self, track: Option<Arc<LocalTrack>>) -> Result<(), RtcError> {
        *self.track.lock().unwrap() = track;
        Ok(())
    }

    fn track(&self) -> Option<Arc<LocalTrack>> {
        self.track.lock().unwrap().clone()
    }
}

/// Records the negotiation and raises a remote track once both
/// descriptions are in place.
pub struct FakeConnection {
    pub local: UserId,
    pub remote: UserId,
    events: PeerEventSink,
    offers: AtomicUsize,
    local_descriptions: Mutex<Vec<(SdpKind, String)>>,
    remote_descriptions: Mutex<Vec<(SdpKind, String)>>,
    candidates: Mutex<Vec<IceCandidate>>,
    senders: Mutex<Vec<Arc<FakeSender>>>,
    track_emitted: AtomicBool,
    closed: AtomicBool,
}

impl FakeConnection {
    pub fn local_descriptions(&self) -> Vec<(SdpKind, String)> {
        self.local_descriptions.lock().unwrap().clone()
    }

    pub fn remote_descriptions(&self) -> Vec<(SdpKind, String)> {
        self.remote_descriptions.lock().unwrap().clone()
    }

    pub fn candidates(&self) -> Vec<IceCandidate> {
        self.candidates.lock().unwrap().clone()
    }

    pub fn sender(&self, kind: TrackKind) -> Option<Arc<FakeSender>> {
        self.senders
            .lock()
            .unwrap()
            .iter()
            .find(|s| s.kind == kind)
            .cloned()
    }

    pub fn video_track_id(&self) -> Option<String> {
        self.sender(TrackKind::Video).and_then(|s| s.track_id())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn maybe_emit_track(&self) {
        let ready = !self.local_descriptions.lock().unwrap().is_empty()
            && !self.remote_descriptions.lock().unwrap().is_empty();
        if ready && !self.track_emitted.swap(true, Ordering::SeqCst) {
            self.events
                .emit(PeerEvent::StateChanged(ConnectionState::Connected));
            self.events.emit(PeerEvent::RemoteTrack(RemoteTrack {
                id: format!("audio-{}", self.remote),
                stream_id: self.remote.to_string(),
                kind: TrackKind::Audio,
                handle: Arc::new(()),
            }));
        }
    }
}

#[async_trait]
impl PeerConnection for FakeConnection {
    async fn add_sender(
        &self,
        kind: TrackKind,
        track: Option<Arc<LocalTrack>>,
    ) -> Result<Arc<dyn RtpSender>, RtcError> {
        let sender = Arc::new(FakeSender {
            kind,
            track: Mutex::new(track),
        });
        self.senders.lock().unwrap().push(sender.clone());
        Ok(sender)
    }

    async fn create_offer(&self) -> Result<String, RtcError> {
        let n = self.offers.fetch_add(1, Ordering::SeqCst);
        Ok(format!("offer {}->{} #{n}", self.local, self.remote))
    }

    async fn create_answer(&self) -> Result<String, RtcError> {
        Ok(format!("answer {}->{}", self.local, self.remote))
    }

    async fn set_local_description(&self, kind: SdpKind, sdp: String) -> Result<(), RtcError> {
        self.local_descriptions.lock().unwrap().push((kind, sdp));
        self.events.emit(PeerEvent::LocalCandidate(IceCandidate::new(format!(
            "candidate:{}-{}",
            self.local, self.remote
        ))));
        self.maybe_emit_track();
        Ok(())
    }

    async fn set_remote_description(&self, kind: SdpKind, sdp: String) -> Result<(), RtcError> {
        self.remote_descriptions.lock().unwrap().push((kind, sdp));
        self.maybe_emit_track();
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), RtcError> {
        self.candidates.lock().unwrap().push(candidate);
        Ok(())
    }

    async fn close(&self) -> Result<(), RtcError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Factory handing out [`FakeConnection`]s.
pub struct FakePeers {
    local: UserId,
    connections: Mutex<Vec<Arc<FakeConnection>>>,
}

impl FakePeers {
    pub fn new(local: UserId) -> Arc<Self> {
        Arc::new(Self {
            local,
            connections: Mutex::new(Vec::new()),
        })
    }

    pub fn connections(&self) -> Vec<Arc<FakeConnection>> {
        self.connections.lock().unwrap().clone()
    }

    /// Connections ever created for `remote`, oldest first.
    pub fn connections_to(&self, remote: UserId) -> Vec<Arc<FakeConnection>> {
        self.connections()
            .into_iter()
            .filter(|c| c.remote == remote)
            .collect()
    }

    pub fn open_connections(&self) -> Vec<Arc<FakeConnection>> {
        self.connections()
            .into_iter()
            .filter(|c| !c.is_closed())
            .collect()
    }
}

#[async_trait]
impl PeerConnectionFactory for FakePeers {
    async fn create(
        &self,
        remote: UserId,
        events: PeerEventSink,
    ) -> Result<Arc<dyn PeerConnection>, RtcError> {
        let connection = Arc::new(FakeConnection {
            local: self.local,
            remote,
            events,
            offers: AtomicUsize::new(0),
            local_descriptions: Mutex::new(Vec::new()),
            remote_descriptions: Mutex::new(Vec::new()),
            candidates: Mutex::new(Vec::new()),
            senders: Mutex::new(Vec::new()),
            track_emitted: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        });
        self.connections.lock().unwrap().push(connection.clone());
        Ok(connection)
    }
}

// ============================================================================
// Clients
// ============================================================================

pub fn identity(id: u64) -> LocalIdentity {
    LocalIdentity::new(id, format!("user-{id}"))
}

pub fn participant(id: u64) -> Participant {
    Participant::new(UserId(id), format!("user-{id}"))
}

pub fn topics(room: &str) -> RoomTopics {
    RoomTopics::for_room(&RoomId::new(room))
}

/// Config with a fast speaking monitor.
pub fn test_config() -> SessionConfig {
    let mut config = SessionConfig::default();
    config.speaking.interval_ms = 10;
    config
}

/// A session wired to fakes.
pub struct TestClient {
    pub id: UserId,
    pub session: Session,
    pub bus: Arc<RecordingBus>,
    pub devices: Arc<FakeDevices>,
    pub peers: Arc<FakePeers>,
}

impl TestClient {
    pub fn new(id: u64, bus: &LocalBus) -> Self {
        Self::with_config(id, bus, test_config())
    }

    pub fn with_config(id: u64, bus: &LocalBus, config: SessionConfig) -> Self {
        let recording = RecordingBus::new(bus.clone());
        let devices = FakeDevices::new();
        let peers = FakePeers::new(UserId(id));
        let session = Session::builder(identity(id), recording.clone())
            .devices(devices.clone())
            .peer_factory(peers.clone())
            .config(config)
            .build()
            .unwrap();

        Self {
            id: UserId(id),
            session,
            bus: recording,
            devices,
            peers,
        }
    }

    /// A client that has already joined `room`.
    pub async fn join_room(id: u64, bus: &LocalBus, room: &str) -> Self {
        let client = Self::new(id, bus);
        client.session.join(room).await.unwrap();
        client
    }

    pub async fn wait_for(
        &self,
        what: &str,
        predicate: impl FnMut(&SessionSnapshot) -> bool,
    ) -> SessionSnapshot {
        wait_for_snapshot(&self.session, what, predicate).await
    }
}

/// Wait until the session publishes a snapshot matching `predicate`.
pub async fn wait_for_snapshot(
    session: &Session,
    what: &str,
    mut predicate: impl FnMut(&SessionSnapshot) -> bool,
) -> SessionSnapshot {
    let mut rx = session.watch();
    let snapshot = match tokio::time::timeout(WAIT, rx.wait_for(|s| predicate(s))).await {
        Ok(Ok(snapshot)) => snapshot.clone(),
        Ok(Err(_)) => panic!("session closed while waiting for {what}"),
        Err(_) => panic!("timed out waiting for {what}: {:#?}", session.snapshot()),
    };
    snapshot
}

/// Poll `condition` until it holds.
pub async fn eventually(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Wait until nothing is subscribed to `topic` any more.
pub async fn wait_unsubscribed(bus: &LocalBus, topic: &str) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while bus.subscriber_count(topic).await > 0 {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {topic} to be unsubscribed"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Give in-flight bus deliveries time to be processed.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(100)).await;
}
