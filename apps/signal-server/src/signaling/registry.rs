//! Connection and room registries backing the signaling relay.

use std::collections::HashSet;

use dashmap::DashMap;
use parking_lot::Mutex;

use subvox_common::id::{prefix, prefixed_ulid};

/// Identity and room tags for one live connection.
#[derive(Debug, Clone, Default)]
pub struct SessionRecord {
    pub user_id: Option<String>,
    pub room_id: Option<String>,
}

/// Membership and lifecycle flag for one room.
#[derive(Debug, Default)]
struct RoomEntry {
    members: HashSet<String>,
    /// Set by endBroadcast. An ended room is dropped once its last member
    /// leaves; a fresh join revives it.
    ended: bool,
}

/// Shared registry of live connections and rooms.
///
/// Uses `DashMap` for shard-level concurrency and `parking_lot::Mutex` per
/// entry for non-poisoning, fast locking.
pub struct RoomRegistry {
    sessions: DashMap<String, Mutex<SessionRecord>>,
    rooms: DashMap<String, Mutex<RoomEntry>>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
            rooms: DashMap::new(),
        }
    }

    /// Register a new connection, returning its connection id.
    pub fn register_connection(&self) -> String {
        let conn_id = prefixed_ulid(prefix::CONNECTION);
        self.sessions
            .insert(conn_id.clone(), Mutex::new(SessionRecord::default()));
        conn_id
    }

    /// Associate a user id with a connection.
    pub fn set_user_id(&self, conn_id: &str, user_id: &str) {
        if let Some(entry) = self.sessions.get(conn_id) {
            entry.lock().user_id = Some(user_id.to_string());
        }
    }

    pub fn user_id(&self, conn_id: &str) -> Option<String> {
        let entry = self.sessions.get(conn_id)?;
        let record = entry.lock();
        record.user_id.clone()
    }

    pub fn current_room(&self, conn_id: &str) -> Option<String> {
        let entry = self.sessions.get(conn_id)?;
        let record = entry.lock();
        record.room_id.clone()
    }

    /// Add a connection's user to a room, creating the entry if it does not
    /// exist yet. Returns the other members already present.
    ///
    /// Joining a second room moves the membership; joining an ended room
    /// revives it.
    pub fn join(&self, conn_id: &str, room_id: &str, user_id: &str) -> Vec<String> {
        let previous = match self.sessions.get(conn_id) {
            Some(entry) => {
                let mut record = entry.lock();
                record.user_id = Some(user_id.to_string());
                record.room_id.replace(room_id.to_string())
            }
            None => None,
        };
        if let Some(previous) = previous {
            if previous != room_id {
                self.remove_member(&previous, user_id);
            }
        }

        let entry = self
            .rooms
            .entry(room_id.to_string())
            .or_insert_with(|| Mutex::new(RoomEntry::default()));
        let mut room = entry.lock();
        room.ended = false;
        let others: Vec<String> = room
            .members
            .iter()
            .filter(|member| member.as_str() != user_id)
            .cloned()
            .collect();
        room.members.insert(user_id.to_string());
        others
    }

    /// Tear down a connection: drop its session record and its room
    /// membership. Returns `(user_id, room_id)` when the remaining members
    /// should be notified. Idempotent — the record can only be removed once.
    pub fn disconnect(&self, conn_id: &str) -> Option<(String, String)> {
        let (_, record) = self.sessions.remove(conn_id)?;
        let record = record.into_inner();
        let user_id = record.user_id?;
        let room_id = record.room_id?;
        self.remove_member(&room_id, &user_id);
        Some((user_id, room_id))
    }

    /// Mark a room as ended. The entry survives until its last member
    /// leaves; a room that is already empty is dropped immediately.
    pub fn mark_ended(&self, room_id: &str) {
        let mut drop_entry = false;
        if let Some(entry) = self.rooms.get(room_id) {
            let mut room = entry.lock();
            room.ended = true;
            drop_entry = room.members.is_empty();
        }
        if drop_entry {
            self.remove_if_dead(room_id);
        }
    }

    /// Current member ids of a room. Empty for unknown rooms.
    pub fn members(&self, room_id: &str) -> Vec<String> {
        match self.rooms.get(room_id) {
            Some(entry) => entry.lock().members.iter().cloned().collect(),
            None => Vec::new(),
        }
    }

    pub fn has_room(&self, room_id: &str) -> bool {
        self.rooms.contains_key(room_id)
    }

    pub fn connection_count(&self) -> usize {
        self.sessions.len()
    }

    fn remove_member(&self, room_id: &str, user_id: &str) {
        let mut drop_entry = false;
        if let Some(entry) = self.rooms.get(room_id) {
            let mut room = entry.lock();
            room.members.remove(user_id);
            drop_entry = room.ended && room.members.is_empty();
        }
        if drop_entry {
            self.remove_if_dead(room_id);
        }
    }

    // Re-checks under the entry lock: a concurrent join between our check
    // and the removal keeps the room alive.
    fn remove_if_dead(&self, room_id: &str) {
        self.rooms.remove_if(room_id, |_, entry| {
            let room = entry.lock();
            room.ended && room.members.is_empty()
        });
    }
}
