//! Presence registry: the authoritative "who is in the session" mapping.
//!
//! Consumed by rendering to draw participant panels and by the roles to
//! decide which peers to call. Holds at most one entry per peer id; an
//! upsert with an already-present id replaces the entry in place rather
//! than appending a duplicate. Iteration order is insertion order.

use uuid::Uuid;

use crate::protocol::PeerSummary;

/// A session participant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub id: Uuid,
    pub name: String,
    /// True for the one entry describing this process itself.
    pub is_local: bool,
}

impl User {
    pub fn new(id: Uuid, name: impl Into<String>, is_local: bool) -> Self {
        Self {
            id,
            name: name.into(),
            is_local,
        }
    }

    pub fn summary(&self) -> PeerSummary {
        PeerSummary {
            peer: self.id,
            name: self.name.clone(),
        }
    }
}

/// Insertion-ordered registry of session participants.
#[derive(Debug, Default)]
pub struct PresenceRegistry {
    users: Vec<User>,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the entry for `id`, keeping its original position
    /// when replacing. Returns `true` when the peer was not present before.
    pub fn upsert(&mut self, id: Uuid, name: impl Into<String>, is_local: bool) -> bool {
        let user = User::new(id, name, is_local);
        match self.users.iter_mut().find(|u| u.id == id) {
            Some(existing) => {
                *existing = user;
                false
            }
            None => {
                self.users.push(user);
                true
            }
        }
    }

    /// Remove the entry for `id`, returning it if present.
    pub fn remove(&mut self, id: Uuid) -> Option<User> {
        let pos = self.users.iter().position(|u| u.id == id)?;
        Some(self.users.remove(pos))
    }

    pub fn get(&self, id: Uuid) -> Option<&User> {
        self.users.iter().find(|u| u.id == id)
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.get(id).is_some()
    }

    /// All participants in insertion order.
    pub fn all(&self) -> &[User] {
        &self.users
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}
