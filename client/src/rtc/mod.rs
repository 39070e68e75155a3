//! Peer Connection Seam
//!
//! The narrow slice of a WebRTC stack the pool drives. [`native`] implements it
//! with webrtc-rs; tests substitute recording fakes.

pub mod native;

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use vc_mesh_common::protocol::{IceCandidate, SdpKind};
use vc_mesh_common::UserId;

use crate::media::{LocalTrack, TrackKind};

pub use native::NativePeerFactory;

/// WebRTC errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RtcError {
    #[error("WebRTC API error: {0}")]
    Api(String),
    #[error("Peer connection error: {0}")]
    PeerConnection(String),
    #[error("SDP error: {0}")]
    Sdp(String),
    #[error("ICE error: {0}")]
    Ice(String),
    #[error("Track error: {0}")]
    Track(String),
    #[error("Connection closed")]
    Closed,
}

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// An inbound media track from a remote peer.
#[derive(Clone)]
pub struct RemoteTrack {
    pub id: String,
    pub stream_id: String,
    pub kind: TrackKind,
    /// The stack's own track object, for whoever renders it.
    pub handle: Arc<dyn Any + Send + Sync>,
}

impl RemoteTrack {
    /// Downcast the stack-specific handle.
    pub fn native<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.handle.clone().downcast::<T>().ok()
    }
}

impl fmt::Debug for RemoteTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteTrack")
            .field("id", &self.id)
            .field("stream_id", &self.stream_id)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

/// Events raised by a connection's callbacks.
#[derive(Debug, Clone)]
pub enum PeerEvent {
    LocalCandidate(IceCandidate),
    RemoteTrack(RemoteTrack),
    StateChanged(ConnectionState),
}

/// Where a connection posts its [`PeerEvent`]s.
#[derive(Clone)]
pub struct PeerEventSink(Arc<dyn Fn(PeerEvent) + Send + Sync>);

impl PeerEventSink {
    pub fn new(f: impl Fn(PeerEvent) + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    pub fn emit(&self, event: PeerEvent) {
        (self.0)(event);
    }
}

impl fmt::Debug for PeerEventSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PeerEventSink")
    }
}

/// One outbound media slot on a connection.
#[async_trait]
pub trait RtpSender: Send + Sync {
    /// Swap the payload without renegotiating. `None` sends nothing.
    async fn replace_track(&self, track: Option<Arc<LocalTrack>>) -> Result<(), RtcError>;

    /// The track currently attached.
    fn track(&self) -> Option<Arc<LocalTrack>>;
}

/// A single negotiated connection to one remote participant.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    /// Add a send slot of `kind`, carrying `track` if given.
    async fn add_sender(
        &self,
        kind: TrackKind,
        track: Option<Arc<LocalTrack>>,
    ) -> Result<Arc<dyn RtpSender>, RtcError>;

    async fn create_offer(&self) -> Result<String, RtcError>;

    async fn create_answer(&self) -> Result<String, RtcError>;

    async fn set_local_description(&self, kind: SdpKind, sdp: String) -> Result<(), RtcError>;

    async fn set_remote_description(&self, kind: SdpKind, sdp: String) -> Result<(), RtcError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), RtcError>;

    async fn close(&self) -> Result<(), RtcError>;
}

/// Creates connections; one call per remote participant.
#[async_trait]
pub trait PeerConnectionFactory: Send + Sync {
    async fn create(
        &self,
        remote: UserId,
        events: PeerEventSink,
    ) -> Result<Arc<dyn PeerConnection>, RtcError>;
}
