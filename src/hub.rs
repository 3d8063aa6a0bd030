//! Room membership hub
//!
//! Maps room ids to the connections that entered them. The map is a
//! `DashMap`, so `add`/`del` for one room serialize on that room's shard
//! while other rooms proceed in parallel.

use std::collections::HashMap;

use dashmap::DashMap;
use tracing::debug;

use crate::session::{ConnHandle, ConnId};

/// Room membership store used by sessions
///
/// Both operations are idempotent and safe to call from many connection
/// tasks at once.
pub trait RoomStore: Send + Sync {
    /// Register `conn` as a member of `rid`
    fn add(&self, rid: &str, conn: &ConnHandle);

    /// Drop `conn` from `rid`
    fn del(&self, rid: &str, conn: &ConnHandle);
}

/// Hub manages room memberships for every connection
#[derive(Default)]
pub struct Hub {
    /// room id -> (conn id -> handle)
    rooms: DashMap<String, HashMap<ConnId, ConnHandle>>,
}

impl Hub {
    /// Create an empty hub
    pub fn new() -> Self {
        Self::default()
    }

    /// Handles of every connection in a room
    pub fn members(&self, rid: &str) -> Vec<ConnHandle> {
        self.rooms
            .get(rid)
            .map(|members| members.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Member count for a room
    pub fn member_count(&self, rid: &str) -> usize {
        self.rooms.get(rid).map(|members| members.len()).unwrap_or(0)
    }

    /// Check if a connection is a member of a room
    pub fn is_member(&self, rid: &str, conn_id: ConnId) -> bool {
        self.rooms
            .get(rid)
            .is_some_and(|members| members.contains_key(&conn_id))
    }

    /// Number of non-empty rooms
    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }
}

impl RoomStore for Hub {
    fn add(&self, rid: &str, conn: &ConnHandle) {
        let mut members = self.rooms.entry(rid.to_string()).or_default();
        if members.insert(conn.id(), conn.clone()).is_none() {
            debug!(conn_id = conn.id(), rid, members = members.len(), "joined room");
        }
    }

    fn del(&self, rid: &str, conn: &ConnHandle) {
        let removed = self.rooms.remove_if_mut(rid, |_, members| {
            members.remove(&conn.id());
            members.is_empty()
        });

        if removed.is_some() {
            debug!(rid, "removed empty room");
        }
        debug!(conn_id = conn.id(), rid, "left room");
    }
}

impl std::fmt::Debug for Hub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hub")
            .field("rooms", &self.rooms.len())
            .finish()
    }
}
