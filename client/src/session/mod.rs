//! Session
//!
//! The public face of the crate. A [`Session`] is a cheap handle to an actor
//! task that owns the roster, the peer connections and the local media of at
//! most one room at a time. Every operation is a message to that task, so all
//! state changes happen in one place and in order.

mod actor;
mod roster;
mod snapshot;

use std::fmt;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::info;
use vc_mesh_common::{LocalIdentity, RoomId, UserId};

use crate::bus::{BusError, MessageBus};
use crate::config::SessionConfig;
use crate::media::{MediaDevices, MediaError, NativeDevices};
use crate::rtc::{NativePeerFactory, PeerConnectionFactory, RtcError};

pub use roster::{Roster, RosterDiff};
pub use snapshot::{LocalFlags, SessionSnapshot, SessionStatus};

/// Session errors
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Not in a room")]
    NotJoined,
    #[error("Media acquisition failed: {0}")]
    MediaAcquisitionFailed(#[from] MediaError),
    #[error("Transport error: {0}")]
    Transport(#[from] BusError),
    #[error("Protocol error: {0}")]
    Protocol(#[from] vc_mesh_common::Error),
    #[error("WebRTC error: {0}")]
    Rtc(#[from] RtcError),
    #[error("Invalid configuration: {0}")]
    Config(String),
    #[error("A device request is already pending")]
    DevicePromptPending,
    #[error("Cancelled by leave")]
    Cancelled,
    #[error("Session closed")]
    Closed,
}

/// Called with every published snapshot.
pub type StateCallback = Arc<dyn Fn(&SessionSnapshot) + Send + Sync>;

type Reply<T> = oneshot::Sender<Result<T, SessionError>>;

/// Requests from the handle to the actor.
enum Command {
    Join { room: RoomId, reply: Reply<()> },
    Leave { reply: oneshot::Sender<()> },
    ToggleMic { reply: Reply<bool> },
    ToggleCamera { reply: Reply<bool> },
    ToggleScreenShare { reply: Reply<bool> },
}

/// Builds a [`Session`].
pub struct SessionBuilder {
    identity: LocalIdentity,
    bus: Arc<dyn MessageBus>,
    devices: Option<Arc<dyn MediaDevices>>,
    peers: Option<Arc<dyn PeerConnectionFactory>>,
    config: SessionConfig,
    on_state_change: Option<StateCallback>,
}

impl SessionBuilder {
    pub fn new(identity: LocalIdentity, bus: Arc<dyn MessageBus>) -> Self {
        Self {
            identity,
            bus,
            devices: None,
            peers: None,
            config: SessionConfig::default(),
            on_state_change: None,
        }
    }

    /// Capture devices. Defaults to [`NativeDevices`].
    #[must_use]
    pub fn devices(mut self, devices: Arc<dyn MediaDevices>) -> Self {
        self.devices = Some(devices);
        self
    }

    /// Peer connection stack. Defaults to [`NativePeerFactory`].
    #[must_use]
    pub fn peer_factory(mut self, peers: Arc<dyn PeerConnectionFactory>) -> Self {
        self.peers = Some(peers);
        self
    }

    #[must_use]
    pub fn config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    /// Callback run after every coalesced state change.
    #[must_use]
    pub fn on_state_change(
        mut self,
        callback: impl Fn(&SessionSnapshot) + Send + Sync + 'static,
    ) -> Self {
        self.on_state_change = Some(Arc::new(callback));
        self
    }

    /// Spawn the session actor. Must be called inside a tokio runtime.
    pub fn build(self) -> Result<Session, SessionError> {
        self.config
            .validate()
            .map_err(|e| SessionError::Config(e.to_string()))?;

        let devices = match self.devices {
            Some(devices) => devices,
            None => Arc::new(NativeDevices::new()),
        };
        let peers = match self.peers {
            Some(peers) => peers,
            None => Arc::new(NativePeerFactory::new(&self.config.ice_servers)?),
        };

        let user_id = self.identity.user_id;
        let (commands_tx, commands_rx) = mpsc::channel(32);
        let (snapshot_tx, snapshot_rx) = watch::channel(SessionSnapshot::idle(user_id));

        let actor = actor::Actor::new(actor::Parts {
            identity: self.identity,
            config: self.config,
            bus: self.bus,
            devices,
            peers,
            commands: commands_rx,
            snapshot: snapshot_tx,
            on_state_change: self.on_state_change,
        });
        tokio::spawn(actor.run());

        info!(user_id = %user_id, "Session created");
        Ok(Session {
            commands: commands_tx,
            snapshot: snapshot_rx,
            user_id,
        })
    }
}

/// Handle to a session. Clones share the same session; it shuts down (leaving
/// any room) once every handle is dropped.
#[derive(Clone)]
pub struct Session {
    commands: mpsc::Sender<Command>,
    snapshot: watch::Receiver<SessionSnapshot>,
    user_id: UserId,
}

impl Session {
    pub fn builder(identity: LocalIdentity, bus: Arc<dyn MessageBus>) -> SessionBuilder {
        SessionBuilder::new(identity, bus)
    }

    pub const fn local_user_id(&self) -> UserId {
        self.user_id
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, SessionError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(command(tx))
            .await
            .map_err(|_| SessionError::Closed)?;
        rx.await.map_err(|_| SessionError::Closed)
    }

    /// Join `room`, leaving the current room first if it is a different one.
    ///
    /// Resolves once local media is captured, both room topics are subscribed
    /// and our presence is announced.
    pub async fn join(&self, room: impl Into<RoomId>) -> Result<(), SessionError> {
        let room = room.into();
        self.request(|reply| Command::Join { room, reply }).await?
    }

    /// Leave the current room. Always succeeds; a no-op outside a room.
    pub async fn leave(&self) {
        // A closed actor has already torn everything down.
        let _ = self.request(|reply| Command::Leave { reply }).await;
    }

    /// Returns the new microphone state.
    pub async fn toggle_mic(&self) -> Result<bool, SessionError> {
        self.request(|reply| Command::ToggleMic { reply }).await?
    }

    /// Returns the new camera state.
    pub async fn toggle_camera(&self) -> Result<bool, SessionError> {
        self.request(|reply| Command::ToggleCamera { reply }).await?
    }

    /// Start or stop sharing the screen. Returns whether sharing is now on;
    /// a cancelled OS prompt yields `Ok(false)`.
    pub async fn toggle_screen_share(&self) -> Result<bool, SessionError> {
        self.request(|reply| Command::ToggleScreenShare { reply })
            .await?
    }

    /// The latest published snapshot.
    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Subscribe to snapshot changes.
    pub fn watch(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot.clone()
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("user_id", &self.user_id)
            .finish_non_exhaustive()
    }
}
