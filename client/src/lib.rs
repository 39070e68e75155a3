//! Mesh Room Client Library
//!
//! Client-side coordinator for a mesh voice/video room: joins a room over a
//! publish/subscribe bus, tracks who is present, negotiates one peer
//! connection per remote participant and owns the local capture tracks.
//!
//! Start with [`Session::builder`].

pub mod bus;
pub mod config;
pub mod media;
pub mod pool;
pub mod rtc;
pub mod session;
pub mod signaling;
pub mod speaking;

pub use bus::{BusError, BusSubscription, LocalBus, MessageBus};
pub use config::{IceServerConfig, SessionConfig, SpeakingConfig};
pub use session::{
    LocalFlags, Session, SessionBuilder, SessionError, SessionSnapshot, SessionStatus,
};
pub use vc_mesh_common::{LocalIdentity, Participant, RoomId, StateUpdate, UserId};

/// Install the default `tracing` subscriber.
///
/// Filtering follows `RUST_LOG`, defaulting to debug output for this crate.
/// Does nothing if a global subscriber is already set.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "vc_mesh=debug".into()),
        )
        .try_init();
}
