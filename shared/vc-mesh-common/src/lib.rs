//! Mesh Room Common Library
//!
//! Shared types and the room wire protocol (presence and signaling messages)
//! spoken by every client of a mesh voice/video room.

pub mod error;
pub mod protocol;
pub mod types;

pub use error::{Error, Result};
pub use types::*;
