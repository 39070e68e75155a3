//! Remote ICE candidates that arrived before the remote description.

use vc_mesh_common::protocol::IceCandidate;

/// Arrival-ordered buffer, drained exactly once.
#[derive(Debug, Default)]
pub struct PendingCandidates {
    queue: Vec<IceCandidate>,
    flushed: bool,
}

impl PendingCandidates {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a candidate. Only valid before the flush.
    pub fn push(&mut self, candidate: IceCandidate) {
        debug_assert!(!self.flushed, "candidate buffered after flush");
        self.queue.push(candidate);
    }

    /// Hand out the buffered candidates in arrival order.
    ///
    /// Returns `None` on every call after the first.
    pub fn flush(&mut self) -> Option<Vec<IceCandidate>> {
        if self.flushed {
            return None;
        }
        self.flushed = true;
        Some(std::mem::take(&mut self.queue))
    }

    pub const fn is_flushed(&self) -> bool {
        self.flushed
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}
