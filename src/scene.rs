//! Replicated scene object state.
//!
//! Rendering and hit-testing live outside this crate; what is replicated
//! is the pose of every object (position, toggle state, dragging owner).
//! `Move` is last-writer-wins per object; `Init` resets everything ahead
//! of a snapshot replay. Membership events are routed to the presence
//! registry by the roles, never here.

use std::collections::BTreeMap;

use uuid::Uuid;

use crate::protocol::Event;

/// The replicated pose of one scene object.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ObjectPose {
    pub x: f32,
    pub y: f32,
    pub state: u8,
    /// Peer currently dragging the object, if any.
    pub owner: Option<Uuid>,
}

/// All replicated object poses, keyed by object id.
///
/// A `BTreeMap` keeps snapshot batches in stable object order so every
/// newcomer replays the same sequence.
#[derive(Debug, Default)]
pub struct SceneState {
    objects: BTreeMap<u32, ObjectPose>,
}

impl SceneState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a batch in order. Unknown-to-the-scene events (membership)
    /// are skipped.
    pub fn apply(&mut self, events: &[Event]) {
        for event in events {
            match event {
                Event::Init => self.objects.clear(),
                Event::Move {
                    object,
                    x,
                    y,
                    state,
                    owner,
                } => {
                    self.objects.insert(
                        *object,
                        ObjectPose {
                            x: *x,
                            y: *y,
                            state: *state,
                            owner: *owner,
                        },
                    );
                }
                Event::User { .. } | Event::Gone { .. } => {}
            }
        }
    }

    /// The event sequence that reproduces this scene on a fresh peer:
    /// a reset followed by one move per object.
    pub fn snapshot_events(&self) -> Vec<Event> {
        let mut events = Vec::with_capacity(self.objects.len() + 1);
        events.push(Event::Init);
        for (id, pose) in &self.objects {
            events.push(Event::Move {
                object: *id,
                x: pose.x,
                y: pose.y,
                state: pose.state,
                owner: pose.owner,
            });
        }
        events
    }

    pub fn object(&self, id: u32) -> Option<&ObjectPose> {
        self.objects.get(&id)
    }

    pub fn objects(&self) -> impl Iterator<Item = (&u32, &ObjectPose)> {
        self.objects.iter()
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}
