//! webrtc-rs backed peer connections.
//!
//! Each [`LocalTrack`] is bound to one `TrackLocalStaticSample` shared by every
//! connection that sends it, so all peers see the same outbound source. A
//! track that produces encoded frames gets one writer task per binding.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use webrtc::{
    api::{
        interceptor_registry::register_default_interceptors, media_engine::MediaEngine, APIBuilder,
        API,
    },
    ice_transport::{
        ice_candidate::{RTCIceCandidate, RTCIceCandidateInit},
        ice_server::RTCIceServer,
    },
    interceptor::registry::Registry,
    media::Sample,
    peer_connection::{
        configuration::RTCConfiguration, peer_connection_state::RTCPeerConnectionState,
        sdp::session_description::RTCSessionDescription, RTCPeerConnection,
    },
    rtp_transceiver::{
        rtp_codec::{RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType},
        rtp_sender::RTCRtpSender,
        rtp_transceiver_direction::RTCRtpTransceiverDirection,
        RTCRtpTransceiverInit,
    },
    track::{
        track_local::{track_local_static_sample::TrackLocalStaticSample, TrackLocal},
        track_remote::TrackRemote,
    },
};

use vc_mesh_common::protocol::{IceCandidate, SdpKind};
use vc_mesh_common::UserId;

use super::{
    ConnectionState, PeerConnection, PeerConnectionFactory, PeerEvent, PeerEventSink,
    RemoteTrack, RtcError, RtpSender,
};
use crate::config::IceServerConfig;
use crate::media::{EncodedFrame, LocalTrack, TrackKind};

const STREAM_ID: &str = "vc-mesh";

fn opus_capability() -> RTCRtpCodecCapability {
    RTCRtpCodecCapability {
        mime_type: "audio/opus".to_string(),
        clock_rate: 48000,
        channels: 2,
        sdp_fmtp_line: "minptime=10;useinbandfec=1".to_string(),
        rtcp_feedback: vec![],
    }
}

fn vp8_capability() -> RTCRtpCodecCapability {
    RTCRtpCodecCapability {
        mime_type: "video/VP8".to_string(),
        clock_rate: 90000,
        channels: 0,
        sdp_fmtp_line: String::new(),
        rtcp_feedback: vec![],
    }
}

const fn codec_type(kind: TrackKind) -> RTPCodecType {
    match kind {
        TrackKind::Audio => RTPCodecType::Audio,
        TrackKind::Video => RTPCodecType::Video,
    }
}

/// Create `RTCConfiguration` from ICE server config
fn create_rtc_config(ice_servers: &[IceServerConfig]) -> RTCConfiguration {
    let ice_servers: Vec<RTCIceServer> = ice_servers
        .iter()
        .map(|s| RTCIceServer {
            urls: s.urls.clone(),
            username: s.username.clone().unwrap_or_default(),
            credential: s.credential.clone().unwrap_or_default(),
            ..Default::default()
        })
        .collect();

    RTCConfiguration {
        ice_servers,
        ..Default::default()
    }
}

/// LocalTrack id -> the webrtc track every sender of it shares.
#[derive(Default)]
struct TrackBindings {
    bound: Mutex<HashMap<String, (Weak<LocalTrack>, Arc<TrackLocalStaticSample>)>>,
}

impl TrackBindings {
    fn bind(&self, track: &Arc<LocalTrack>) -> Arc<TrackLocalStaticSample> {
        let mut bound = match self.bound.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        bound.retain(|_, (local, _)| local.upgrade().is_some_and(|t| !t.is_stopped()));

        if let Some((_, rtc_track)) = bound.get(track.id()) {
            return rtc_track.clone();
        }

        let capability = match track.kind() {
            TrackKind::Audio => opus_capability(),
            TrackKind::Video => vp8_capability(),
        };
        let rtc_track = Arc::new(TrackLocalStaticSample::new(
            capability,
            track.id().to_string(),
            STREAM_ID.to_string(),
        ));

        if let Some(frames) = track.encoded_frames() {
            match tokio::runtime::Handle::try_current() {
                Ok(runtime) => {
                    runtime.spawn(write_samples(
                        Arc::downgrade(track),
                        rtc_track.clone(),
                        frames,
                    ));
                }
                Err(_) => warn!(track_id = track.id(), "No runtime to feed outbound track"),
            }
        }

        bound.insert(
            track.id().to_string(),
            (Arc::downgrade(track), rtc_track.clone()),
        );
        rtc_track
    }
}

/// Copy encoded frames into `rtc_track` until the local track stops.
///
/// Frames produced while the track is disabled are dropped.
async fn write_samples(
    local: Weak<LocalTrack>,
    rtc_track: Arc<TrackLocalStaticSample>,
    mut frames: broadcast::Receiver<EncodedFrame>,
) {
    let track_id = rtc_track.id().to_string();
    loop {
        let frame = match frames.recv().await {
            Ok(frame) => frame,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                debug!(track_id = %track_id, skipped, "Outbound frames dropped");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };

        let enabled = match local.upgrade() {
            Some(track) if !track.is_stopped() => track.is_enabled(),
            _ => break,
        };
        if !enabled {
            continue;
        }

        let sample = Sample {
            data: frame.data.into(),
            duration: frame.duration,
            ..Default::default()
        };
        if let Err(e) = rtc_track.write_sample(&sample).await {
            debug!(track_id = %track_id, error = %e, "Sample write failed");
        }
    }
    debug!(track_id = %track_id, "Outbound track writer stopped");
}

/// Factory for webrtc-rs peer connections.
pub struct NativePeerFactory {
    api: Arc<API>,
    config: RTCConfiguration,
    bindings: Arc<TrackBindings>,
}

impl NativePeerFactory {
    /// Build the API with Opus audio and VP8 video.
    pub fn new(ice_servers: &[IceServerConfig]) -> Result<Self, RtcError> {
        let mut media_engine = MediaEngine::default();

        media_engine
            .register_codec(
                RTCRtpCodecParameters {
                    capability: opus_capability(),
                    payload_type: 111,
                    ..Default::default()
                },
                RTPCodecType::Audio,
            )
            .map_err(|e| RtcError::Api(e.to_string()))?;

        media_engine
            .register_codec(
                RTCRtpCodecParameters {
                    capability: vp8_capability(),
                    payload_type: 96,
                    ..Default::default()
                },
                RTPCodecType::Video,
            )
            .map_err(|e| RtcError::Api(e.to_string()))?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| RtcError::Api(e.to_string()))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        info!("WebRTC peer factory initialized");

        Ok(Self {
            api: Arc::new(api),
            config: create_rtc_config(ice_servers),
            bindings: Arc::new(TrackBindings::default()),
        })
    }
}

#[async_trait]
impl PeerConnectionFactory for NativePeerFactory {
    async fn create(
        &self,
        remote: UserId,
        events: PeerEventSink,
    ) -> Result<Arc<dyn PeerConnection>, RtcError> {
        let pc = self
            .api
            .new_peer_connection(self.config.clone())
            .await
            .map_err(|e| RtcError::PeerConnection(e.to_string()))?;
        let pc = Arc::new(pc);

        setup_event_handlers(&pc, remote, events);

        debug!(user_id = %remote, "Peer connection created");
        Ok(Arc::new(NativeConnection {
            pc,
            bindings: self.bindings.clone(),
        }))
    }
}

/// Forward webrtc callbacks into the sink.
fn setup_event_handlers(pc: &Arc<RTCPeerConnection>, remote: UserId, events: PeerEventSink) {
    let sink = events.clone();
    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let sink = sink.clone();
        Box::pin(async move {
            let Some(candidate) = candidate else {
                return;
            };
            match candidate.to_json() {
                Ok(init) => sink.emit(PeerEvent::LocalCandidate(IceCandidate {
                    candidate: init.candidate,
                    sdp_mid: init.sdp_mid,
                    sdp_mline_index: init.sdp_mline_index,
                    username_fragment: init.username_fragment,
                })),
                Err(e) => warn!(user_id = %remote, error = %e, "Failed to serialize ICE candidate"),
            }
        })
    }));

    let sink = events.clone();
    pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
        let sink = sink.clone();
        Box::pin(async move {
            let state = match s {
                RTCPeerConnectionState::New | RTCPeerConnectionState::Unspecified => {
                    ConnectionState::New
                }
                RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
                RTCPeerConnectionState::Connected => ConnectionState::Connected,
                RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
                RTCPeerConnectionState::Failed => ConnectionState::Failed,
                RTCPeerConnectionState::Closed => ConnectionState::Closed,
            };
            debug!(user_id = %remote, state = ?s, "Peer connection state changed");
            sink.emit(PeerEvent::StateChanged(state));
        })
    }));

    let sink = events;
    pc.on_track(Box::new(
        move |track: Arc<TrackRemote>, _receiver, _transceiver| {
            let sink = sink.clone();
            Box::pin(async move {
                let kind = match track.kind() {
                    RTPCodecType::Audio => TrackKind::Audio,
                    RTPCodecType::Video => TrackKind::Video,
                    RTPCodecType::Unspecified => return,
                };

                info!(
                    user_id = %remote,
                    mime_type = %track.codec().capability.mime_type,
                    "Remote track received"
                );

                sink.emit(PeerEvent::RemoteTrack(RemoteTrack {
                    id: track.id(),
                    stream_id: track.stream_id(),
                    kind,
                    handle: track,
                }));
            })
        },
    ));
}

struct NativeConnection {
    pc: Arc<RTCPeerConnection>,
    bindings: Arc<TrackBindings>,
}

impl NativeConnection {
    fn description(kind: SdpKind, sdp: String) -> Result<RTCSessionDescription, RtcError> {
        match kind {
            SdpKind::Offer => RTCSessionDescription::offer(sdp),
            SdpKind::Answer => RTCSessionDescription::answer(sdp),
        }
        .map_err(|e| RtcError::Sdp(e.to_string()))
    }
}

#[async_trait]
impl PeerConnection for NativeConnection {
    async fn add_sender(
        &self,
        kind: TrackKind,
        track: Option<Arc<LocalTrack>>,
    ) -> Result<Arc<dyn RtpSender>, RtcError> {
        let sender = if let Some(local) = &track {
            let bound = self.bindings.bind(local);
            self.pc
                .add_track(bound as Arc<dyn TrackLocal + Send + Sync>)
                .await
                .map_err(|e| RtcError::Track(e.to_string()))?
        } else {
            // An empty sendrecv slot keeps the m-line so a track can be swapped in later.
            let transceiver = self
                .pc
                .add_transceiver_from_kind(
                    codec_type(kind),
                    Some(RTCRtpTransceiverInit {
                        direction: RTCRtpTransceiverDirection::Sendrecv,
                        send_encodings: vec![],
                    }),
                )
                .await
                .map_err(|e| RtcError::Track(e.to_string()))?;
            transceiver.sender().await
        };

        Ok(Arc::new(NativeSender {
            sender,
            bindings: self.bindings.clone(),
            current: Mutex::new(track),
        }))
    }

    async fn create_offer(&self) -> Result<String, RtcError> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| RtcError::Sdp(e.to_string()))?;
        Ok(offer.sdp)
    }

    async fn create_answer(&self) -> Result<String, RtcError> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| RtcError::Sdp(e.to_string()))?;
        Ok(answer.sdp)
    }

    async fn set_local_description(&self, kind: SdpKind, sdp: String) -> Result<(), RtcError> {
        self.pc
            .set_local_description(Self::description(kind, sdp)?)
            .await
            .map_err(|e| RtcError::Sdp(e.to_string()))
    }

    async fn set_remote_description(&self, kind: SdpKind, sdp: String) -> Result<(), RtcError> {
        self.pc
            .set_remote_description(Self::description(kind, sdp)?)
            .await
            .map_err(|e| RtcError::Sdp(e.to_string()))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), RtcError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|e| RtcError::Ice(e.to_string()))
    }

    async fn close(&self) -> Result<(), RtcError> {
        self.pc
            .close()
            .await
            .map_err(|e| RtcError::PeerConnection(e.to_string()))
    }
}

struct NativeSender {
    sender: Arc<RTCRtpSender>,
    bindings: Arc<TrackBindings>,
    current: Mutex<Option<Arc<LocalTrack>>>,
}

#[async_trait]
impl RtpSender for NativeSender {
    async fn replace_track(&self, track: Option<Arc<LocalTrack>>) -> Result<(), RtcError> {
        let rtc_track = track
            .as_ref()
            .map(|t| self.bindings.bind(t) as Arc<dyn TrackLocal + Send + Sync>);

        self.sender
            .replace_track(rtc_track)
            .await
            .map_err(|e| RtcError::Track(e.to_string()))?;

        if let Ok(mut current) = self.current.lock() {
            *current = track;
        }
        Ok(())
    }

    fn track(&self) -> Option<Arc<LocalTrack>> {
        self.current.lock().ok().and_then(|t| t.clone())
    }
}
