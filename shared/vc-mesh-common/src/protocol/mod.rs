//! Room Wire Protocol
//!
//! Two logical topics per room: presence (roster, join, leave, state) and
//! signaling (offer, answer, candidate). Payloads are JSON objects tagged by `kind`.

pub mod presence;
pub mod signal;
pub mod topics;

pub use presence::PresenceMessage;
pub use signal::{IceCandidate, SdpKind, SignalMessage};
pub use topics::RoomTopics;
