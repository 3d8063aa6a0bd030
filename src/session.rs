//! Connection session management
//!
//! A session is the logical client (`uid` + `sid`) currently bound to one
//! physical connection, plus the sorted set of rooms it has entered.

use std::fmt;

use tokio::sync::mpsc;
use tracing::debug;

use crate::hub::RoomStore;
use crate::protocol::Message;

/// Connection identifier, unique for the lifetime of the process
pub type ConnId = u64;

/// Exclusive write channel back to one client socket
///
/// Clones are handed to the room store for delivery; equality is by id.
#[derive(Clone)]
pub struct ConnHandle {
    id: ConnId,
    outgoing_tx: mpsc::Sender<Message>,
}

impl ConnHandle {
    pub fn new(id: ConnId, outgoing_tx: mpsc::Sender<Message>) -> Self {
        Self { id, outgoing_tx }
    }

    pub fn id(&self) -> ConnId {
        self.id
    }

    /// Queue a message for the connection's writer task
    pub async fn write(&self, msg: Message) -> Result<(), TransportError> {
        self.outgoing_tx
            .send(msg)
            .await
            .map_err(|_| TransportError::Closed(self.id))
    }
}

impl PartialEq for ConnHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ConnHandle {}

impl fmt::Debug for ConnHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnHandle").field("id", &self.id).finish()
    }
}

/// Transport errors
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("connection {0} writer is closed")]
    Closed(ConnId),
}

/// Result of applying an ENTER to the room set
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnterOutcome {
    /// Room added to the existing identity's set
    Joined,
    /// Room was already held; nothing changed
    AlreadyMember,
    /// A different identity took over the connection; old rooms were dropped
    Rebound,
    /// Set is full; nothing changed
    RoomLimit,
}

/// Per-connection session
#[derive(Debug)]
pub struct Session {
    uid: String,
    sid: String,
    /// Sorted ascending, no duplicates
    rooms: Vec<String>,
    conn: ConnHandle,
}

impl Session {
    /// Create an anonymous session for a freshly accepted connection
    pub fn new(conn: ConnHandle) -> Self {
        Self {
            uid: String::new(),
            sid: String::new(),
            rooms: Vec::new(),
            conn,
        }
    }

    pub fn uid(&self) -> &str {
        &self.uid
    }

    pub fn sid(&self) -> &str {
        &self.sid
    }

    pub fn rooms(&self) -> &[String] {
        &self.rooms
    }

    pub fn conn(&self) -> &ConnHandle {
        &self.conn
    }

    pub fn conn_id(&self) -> ConnId {
        self.conn.id
    }

    /// Check if an ENTER has bound an identity
    pub fn is_bound(&self) -> bool {
        !self.uid.is_empty()
    }

    /// Check if the session holds a room
    pub fn contains(&self, rid: &str) -> bool {
        self.rooms
            .binary_search_by(|probe| probe.as_str().cmp(rid))
            .is_ok()
    }

    /// Check if an ENTER for `(uid, sid)` into `rid` would pass the room
    /// limit, without changing anything
    pub fn admits(&self, uid: &str, sid: &str, rid: &str, max_rooms: usize) -> bool {
        self.is_rebind(uid, sid) || self.contains(rid) || self.rooms.len() < max_rooms
    }

    fn is_rebind(&self, uid: &str, sid: &str) -> bool {
        self.uid != uid || self.sid != sid
    }

    /// Apply an ENTER for `(uid, sid)` into room `rid`
    ///
    /// A different identity evicts every room held by the previous one and
    /// is admitted to `rid` regardless of `max_rooms`.
    pub fn enter(
        &mut self,
        uid: &str,
        sid: &str,
        rid: &str,
        max_rooms: usize,
        store: &dyn RoomStore,
    ) -> EnterOutcome {
        if !self.admits(uid, sid, rid, max_rooms) {
            return EnterOutcome::RoomLimit;
        }

        if self.is_rebind(uid, sid) {
            for room in self.rooms.drain(..) {
                store.del(&room, &self.conn);
            }
            debug!(
                conn_id = self.conn.id,
                old_uid = %self.uid,
                uid,
                sid,
                "session rebound"
            );
            self.uid = uid.to_string();
            self.sid = sid.to_string();
            self.rooms.push(rid.to_string());
            store.add(rid, &self.conn);
            return EnterOutcome::Rebound;
        }

        match self.rooms.binary_search_by(|probe| probe.as_str().cmp(rid)) {
            Ok(_) => EnterOutcome::AlreadyMember,
            Err(pos) => {
                self.rooms.insert(pos, rid.to_string());
                store.add(rid, &self.conn);
                EnterOutcome::Joined
            }
        }
    }

    /// Remove `rid` from the set
    ///
    /// The store is told to drop the membership even when the session did
    /// not hold the room. Returns whether the room was held.
    pub fn leave(&mut self, rid: &str, store: &dyn RoomStore) -> bool {
        let held = match self.rooms.binary_search_by(|probe| probe.as_str().cmp(rid)) {
            Ok(pos) => {
                self.rooms.remove(pos);
                true
            }
            Err(_) => false,
        };
        store.del(rid, &self.conn);
        held
    }

    /// Drop every membership; used on disconnect
    pub fn release(&mut self, store: &dyn RoomStore) {
        for room in self.rooms.drain(..) {
            store.del(&room, &self.conn);
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Mutex;

    use super::*;
    use pretty_assertions::assert_eq;

    /// Room store that records every call
    #[derive(Default)]
    pub(crate) struct RecordingStore {
        pub calls: Mutex<Vec<(&'static str, String)>>,
    }

    impl RecordingStore {
        pub fn calls(&self) -> Vec<(&'static str, String)> {
            self.calls.lock().unwrap().clone()
        }

        pub fn count(&self, op: &'static str, rid: &str) -> usize {
            self.calls()
                .iter()
                .filter(|(o, r)| *o == op && r == rid)
                .count()
        }
    }

    impl RoomStore for RecordingStore {
        fn add(&self, rid: &str, _conn: &ConnHandle) {
            self.calls.lock().unwrap().push(("add", rid.to_string()));
        }

        fn del(&self, rid: &str, _conn: &ConnHandle) {
            self.calls.lock().unwrap().push(("del", rid.to_string()));
        }
    }

    pub(crate) fn test_conn(id: ConnId) -> (ConnHandle, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(16);
        (ConnHandle::new(id, tx), rx)
    }

    fn is_sorted_unique(rooms: &[String]) -> bool {
        rooms.windows(2).all(|w| w[0] < w[1])
    }

    #[test]
    fn test_first_enter_binds_identity() {
        let store = RecordingStore::default();
        let (conn, _rx) = test_conn(1);
        let mut session = Session::new(conn);
        assert!(!session.is_bound());

        let outcome = session.enter("u1", "s1", "r1", 4, &store);
        assert_eq!(outcome, EnterOutcome::Rebound);
        assert!(session.is_bound());
        assert_eq!(session.uid(), "u1");
        assert_eq!(session.sid(), "s1");
        assert_eq!(session.rooms(), ["r1".to_string()]);
        assert_eq!(store.calls(), vec![("add", "r1".to_string())]);
    }

    #[test]
    fn test_rooms_stay_sorted_and_unique() {
        let store = RecordingStore::default();
        let (conn, _rx) = test_conn(1);
        let mut session = Session::new(conn);

        for rid in ["m", "c", "x", "a", "c", "m", "b"] {
            session.enter("u1", "s1", rid, 10, &store);
            assert!(is_sorted_unique(session.rooms()));
        }
        session.leave("c", &store);
        assert!(is_sorted_unique(session.rooms()));
        session.enter("u1", "s1", "d", 10, &store);
        assert!(is_sorted_unique(session.rooms()));

        assert_eq!(session.rooms(), ["a", "b", "d", "m", "x"].map(String::from));
    }

    #[test]
    fn test_duplicate_enter_is_noop() {
        let store = RecordingStore::default();
        let (conn, _rx) = test_conn(1);
        let mut session = Session::new(conn);

        session.enter("u1", "s1", "r1", 4, &store);
        let outcome = session.enter("u1", "s1", "r1", 4, &store);
        assert_eq!(outcome, EnterOutcome::AlreadyMember);
        assert_eq!(store.count("add", "r1"), 1);
        assert_eq!(session.rooms().len(), 1);
    }

    #[test]
    fn test_room_limit_rejects_without_mutation() {
        let store = RecordingStore::default();
        let (conn, _rx) = test_conn(1);
        let mut session = Session::new(conn);

        session.enter("u1", "s1", "r1", 2, &store);
        session.enter("u1", "s1", "r2", 2, &store);
        let before = store.calls();

        assert_eq!(session.enter("u1", "s1", "r3", 2, &store), EnterOutcome::RoomLimit);
        assert_eq!(session.enter("u1", "s1", "r3", 2, &store), EnterOutcome::RoomLimit);
        assert_eq!(session.rooms(), ["r1", "r2"].map(String::from));
        assert_eq!(store.calls(), before);

        // A room already held is still accepted at capacity
        assert_eq!(session.enter("u1", "s1", "r2", 2, &store), EnterOutcome::AlreadyMember);
    }

    #[test]
    fn test_admits_matches_enter_without_mutation() {
        let store = RecordingStore::default();
        let (conn, _rx) = test_conn(1);
        let mut session = Session::new(conn);

        assert!(session.admits("u1", "s1", "r1", 1));
        session.enter("u1", "s1", "r1", 1, &store);
        let before = store.calls();

        assert!(session.contains("r1"));
        assert!(!session.contains("r2"));
        assert!(session.admits("u1", "s1", "r1", 1));
        assert!(!session.admits("u1", "s1", "r2", 1));
        assert!(session.admits("u2", "s1", "r2", 1));
        assert_eq!(store.calls(), before);
        assert_eq!(session.rooms(), ["r1".to_string()]);
    }

    #[test]
    fn test_identity_change_evicts_old_rooms_once() {
        let store = RecordingStore::default();
        let (conn, _rx) = test_conn(1);
        let mut session = Session::new(conn);

        session.enter("u1", "s1", "r1", 2, &store);
        session.enter("u1", "s1", "r2", 2, &store);

        let outcome = session.enter("u2", "s2", "r9", 2, &store);
        assert_eq!(outcome, EnterOutcome::Rebound);
        assert_eq!(store.count("del", "r1"), 1);
        assert_eq!(store.count("del", "r2"), 1);
        assert_eq!(store.count("add", "r9"), 1);
        assert_eq!(session.uid(), "u2");
        assert_eq!(session.rooms(), ["r9".to_string()]);

        // Old rooms are dropped before the new one is added
        let calls = store.calls();
        assert_eq!(calls.last(), Some(&("add", "r9".to_string())));
    }

    #[test]
    fn test_sid_change_alone_rebinds() {
        let store = RecordingStore::default();
        let (conn, _rx) = test_conn(1);
        let mut session = Session::new(conn);

        session.enter("u1", "s1", "r1", 1, &store);
        assert_eq!(session.enter("u1", "s2", "r2", 1, &store), EnterOutcome::Rebound);
        assert_eq!(session.rooms(), ["r2".to_string()]);
    }

    #[test]
    fn test_leave_unheld_room_still_unregisters() {
        let store = RecordingStore::default();
        let (conn, _rx) = test_conn(1);
        let mut session = Session::new(conn);

        session.enter("u1", "s1", "r1", 4, &store);
        assert!(!session.leave("zz", &store));
        assert_eq!(session.rooms(), ["r1".to_string()]);
        assert_eq!(store.count("del", "zz"), 1);

        assert!(session.leave("r1", &store));
        assert!(session.rooms().is_empty());
        assert!(session.is_bound());
    }

    #[test]
    fn test_release_drops_every_room() {
        let store = RecordingStore::default();
        let (conn, _rx) = test_conn(1);
        let mut session = Session::new(conn);

        for rid in ["a", "b", "c"] {
            session.enter("u1", "s1", rid, 4, &store);
        }
        session.release(&store);
        assert!(session.rooms().is_empty());
        for rid in ["a", "b", "c"] {
            assert_eq!(store.count("del", rid), 1);
        }
    }

    #[tokio::test]
    async fn test_conn_handle_write_and_close() {
        let (conn, mut rx) = test_conn(5);
        conn.write(Message::new(crate::protocol::Cmd::Ping)).await.unwrap();
        assert_eq!(rx.recv().await.unwrap().cmd, crate::protocol::Cmd::Ping);

        drop(rx);
        let err = conn.write(Message::new(crate::protocol::Cmd::Ping)).await.unwrap_err();
        assert!(matches!(err, TransportError::Closed(5)));
    }
}
