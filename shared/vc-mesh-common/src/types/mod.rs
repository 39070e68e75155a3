//! Shared Types

pub mod participant;
pub mod user;

pub use participant::{Participant, StateUpdate};
pub use user::{LocalIdentity, RoomId, UserId};
