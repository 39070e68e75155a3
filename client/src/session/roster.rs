//! Room membership as seen by one client.

use std::collections::BTreeMap;

use vc_mesh_common::{Participant, StateUpdate, UserId};

/// Membership changes from a roster sync.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct RosterDiff {
    pub added: Vec<UserId>,
    pub removed: Vec<UserId>,
    /// Some already known participant changed.
    pub updated: bool,
}

impl RosterDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && !self.updated
    }
}

/// One participant per user id; the local participant is always present.
#[derive(Debug, Clone)]
pub struct Roster {
    local: Participant,
    remotes: BTreeMap<UserId, Participant>,
}

impl Roster {
    pub fn new(local: Participant) -> Self {
        Self {
            local,
            remotes: BTreeMap::new(),
        }
    }

    pub const fn local(&self) -> &Participant {
        &self.local
    }

    pub fn apply_local(&mut self, update: &StateUpdate) -> bool {
        self.local.apply(update)
    }

    /// The update to send for a detector report, if any.
    ///
    /// A muted microphone never reports speaking, even for a report that was
    /// taken before the mute.
    pub fn local_speaking(&self, speaking: bool) -> Option<StateUpdate> {
        if speaking && !self.local.mic_on {
            return None;
        }
        (self.local.speaking != speaking).then(|| StateUpdate::speaking(speaking))
    }

    pub fn get(&self, user_id: UserId) -> Option<&Participant> {
        if user_id == self.local.user_id {
            Some(&self.local)
        } else {
            self.remotes.get(&user_id)
        }
    }

    pub fn contains(&self, user_id: UserId) -> bool {
        self.get(user_id).is_some()
    }

    /// Insert or replace a remote participant. Returns true if it was new.
    ///
    /// Entries for the local user are ignored.
    pub fn upsert(&mut self, participant: Participant) -> bool {
        if participant.user_id == self.local.user_id {
            return false;
        }
        self.remotes
            .insert(participant.user_id, participant)
            .is_none()
    }

    pub fn remove(&mut self, user_id: UserId) -> Option<Participant> {
        self.remotes.remove(&user_id)
    }

    /// Apply flag deltas to a known remote. Unknown users are ignored.
    pub fn apply(&mut self, user_id: UserId, update: &StateUpdate) -> bool {
        self.remotes
            .get_mut(&user_id)
            .is_some_and(|p| p.apply(update))
    }

    /// Make the remote set equal to `participants` (minus ourselves).
    pub fn reconcile(&mut self, participants: Vec<Participant>) -> RosterDiff {
        let mut diff = RosterDiff::default();
        let incoming: BTreeMap<UserId, Participant> = participants
            .into_iter()
            .filter(|p| p.user_id != self.local.user_id)
            .map(|p| (p.user_id, p))
            .collect();

        self.remotes.retain(|id, _| {
            let keep = incoming.contains_key(id);
            if !keep {
                diff.removed.push(*id);
            }
            keep
        });

        for (id, participant) in incoming {
            match self.remotes.get_mut(&id) {
                Some(existing) => {
                    if *existing != participant {
                        *existing = participant;
                        diff.updated = true;
                    }
                }
                None => {
                    self.remotes.insert(id, participant);
                    diff.added.push(id);
                }
            }
        }

        diff
    }

    pub fn remote_ids(&self) -> Vec<UserId> {
        self.remotes.keys().copied().collect()
    }

    /// Every participant, local first, then remotes by id.
    pub fn participants(&self) -> Vec<Participant> {
        std::iter::once(&self.local)
            .chain(self.remotes.values())
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.remotes.len() + 1
    }
}
