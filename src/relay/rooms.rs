//! Room membership table for the signaling relay.
//!
//! Room keys are opaque, case-insensitive strings ("portal keys"). Members
//! are kept in insertion order so that "the first existing member" is always
//! the earliest joiner, which keeps peer discovery deterministic.

use std::collections::HashMap;

#[derive(Debug, Default)]
pub struct RoomTable {
    rooms: HashMap<String, Vec<String>>,
}

fn normalize(room_key: &str) -> String {
    room_key.trim().to_lowercase()
}

impl RoomTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a participant to a room, creating the room on first join.
    /// Returns the members that were present before insertion, in join order.
    /// Re-joining a room the participant is already in is a no-op.
    pub fn join(&mut self, room_key: &str, participant_id: &str) -> Vec<String> {
        let members = self.rooms.entry(normalize(room_key)).or_default();
        let existing = members.clone();

        if !members.iter().any(|m| m == participant_id) {
            members.push(participant_id.to_string());
        }

        existing
    }

    /// Remove a participant from every room it belongs to. Returns each room
    /// it left together with the remaining members, for disconnect broadcast.
    /// Rooms that become empty are deleted.
    pub fn leave_all(&mut self, participant_id: &str) -> Vec<(String, Vec<String>)> {
        let mut departed = Vec::new();

        self.rooms.retain(|key, members| {
            let before = members.len();
            members.retain(|m| m != participant_id);
            if members.len() != before {
                departed.push((key.clone(), members.clone()));
            }
            !members.is_empty()
        });

        departed
    }

    pub fn members(&self, room_key: &str) -> Vec<String> {
        self.rooms
            .get(&normalize(room_key))
            .cloned()
            .unwrap_or_default()
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }
}
