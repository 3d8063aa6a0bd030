//! Command dispatch
//!
//! One decoded [`Message`] at a time, per connection. Each command either
//! writes exactly the replies listed below or nothing:
//!
//! - `PING`: echo
//! - `ENTER`: join a room, then reply `MSGS` with any backlog (no reply if
//!   there is none); `ERR` if the room limit is hit
//! - `LEAVE`: part a room, no reply
//! - `PUB`: forward to the backend, reply with its body or `ERR`
//! - `MSGS`: reply with the backlog, possibly `{}`

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Deserialize;
use tracing::{debug, warn};

use crate::hub::RoomStore;
use crate::message_log::MessageLog;
use crate::protocol::{Cmd, Message};
use crate::publish::{PublishError, PublishRouter};
use crate::session::{Session, TransportError};

/// `{"msgids": {"<subcmd>": "<msg id>", ...}}`
#[derive(Debug, Deserialize)]
struct MsgIdsBody {
    msgids: BTreeMap<u8, String>,
}

/// Decode an ENTER/MSGS body into subcmd -> message id
///
/// Accepts the `msgids` envelope or the bare mapping. An empty body or
/// `null` means none.
pub fn decode_msg_ids(body: &str) -> Result<BTreeMap<u8, String>, serde_json::Error> {
    let body = body.trim();
    if body.is_empty() || body == "null" {
        return Ok(BTreeMap::new());
    }
    match serde_json::from_str::<MsgIdsBody>(body) {
        Ok(wrapped) => Ok(wrapped.msgids),
        Err(_) => serde_json::from_str(body),
    }
}

/// Per-connection command dispatcher
///
/// Shared by every connection task; all per-connection state lives in the
/// [`Session`] passed to [`Dispatcher::dispatch`].
pub struct Dispatcher {
    rooms: Arc<dyn RoomStore>,
    log: Arc<dyn MessageLog>,
    router: Arc<PublishRouter>,
    max_rooms: usize,
}

impl Dispatcher {
    pub fn new(
        rooms: Arc<dyn RoomStore>,
        log: Arc<dyn MessageLog>,
        router: Arc<PublishRouter>,
        max_rooms: usize,
    ) -> Self {
        Self {
            rooms,
            log,
            router,
            max_rooms,
        }
    }

    pub fn rooms(&self) -> &Arc<dyn RoomStore> {
        &self.rooms
    }

    /// Process one message to completion
    ///
    /// Errors are local to this message; only [`DispatchError::is_fatal`]
    /// ones mean the connection cannot be written to anymore.
    pub async fn dispatch(&self, session: &mut Session, req: Message) -> Result<(), DispatchError> {
        debug!(
            conn_id = session.conn_id(),
            cmd = ?req.cmd,
            subcmd = req.subcmd,
            uid = %req.uid,
            rid = %req.rid,
            "dispatching message"
        );

        match req.cmd {
            Cmd::Ping => session.conn().write(req).await?,
            Cmd::Enter => self.enter(session, req).await?,
            Cmd::Leave => self.leave(session, &req),
            Cmd::Pub => self.publish(session, req).await?,
            Cmd::Msgs => self.msgs(session, req).await?,
            other => {
                warn!(conn_id = session.conn_id(), cmd = other.code(), "unexpected cmd");
            }
        }
        Ok(())
    }

    async fn enter(&self, session: &mut Session, req: Message) -> Result<(), DispatchError> {
        if req.uid.is_empty() || req.rid.is_empty() {
            debug!(conn_id = session.conn_id(), "ENTER without uid or rid ignored");
            return Ok(());
        }

        // The limit is checked before the body so a full set always gets ERR
        if !session.admits(&req.uid, &req.sid, &req.rid, self.max_rooms) {
            warn!(
                conn_id = session.conn_id(),
                uid = %req.uid,
                rid = %req.rid,
                max = self.max_rooms,
                "room limit reached"
            );
            session.conn().write(req.reply_with_cmd(Cmd::Err)).await?;
            return Ok(());
        }

        // Decode before touching the session so a bad body leaves it intact
        let msg_ids = decode_msg_ids(&req.body).map_err(|source| DispatchError::MalformedBody {
            cmd: Cmd::Enter,
            source,
        })?;

        let outcome = session.enter(
            &req.uid,
            &req.sid,
            &req.rid,
            self.max_rooms,
            self.rooms.as_ref(),
        );
        debug!(conn_id = session.conn_id(), rid = %req.rid, ?outcome, "entered room");

        let found = self.collect_bodies(&req, &msg_ids).await;
        if found.is_empty() {
            return Ok(());
        }

        let body = serde_json::to_string(&found).map_err(DispatchError::Encode)?;
        let reply = Message {
            cmd: Cmd::Msgs,
            body,
            ..req
        };
        session.conn().write(reply).await?;
        Ok(())
    }

    fn leave(&self, session: &mut Session, req: &Message) {
        if req.uid.is_empty() || req.rid.is_empty() {
            debug!(conn_id = session.conn_id(), "LEAVE without uid or rid ignored");
            return;
        }
        let held = session.leave(&req.rid, self.rooms.as_ref());
        debug!(conn_id = session.conn_id(), rid = %req.rid, held, "left room");
    }

    async fn publish(&self, session: &mut Session, req: Message) -> Result<(), DispatchError> {
        let reply = self.router.publish(&req).await?;
        session.conn().write(reply).await?;
        Ok(())
    }

    async fn msgs(&self, session: &mut Session, req: Message) -> Result<(), DispatchError> {
        let msg_ids = decode_msg_ids(&req.body).map_err(|source| DispatchError::MalformedBody {
            cmd: Cmd::Msgs,
            source,
        })?;

        let found = self.collect_bodies(&req, &msg_ids).await;
        let body = serde_json::to_string(&found).map_err(DispatchError::Encode)?;
        session.conn().write(req.reply_with_body(body)).await?;
        Ok(())
    }

    /// Query the log once per subcommand, keeping non-empty results
    async fn collect_bodies(
        &self,
        req: &Message,
        msg_ids: &BTreeMap<u8, String>,
    ) -> BTreeMap<u8, Vec<String>> {
        let mut found = BTreeMap::new();
        for (&subcmd, msg_id) in msg_ids {
            let ctx = req.with_subcmd(subcmd);
            let bodies = self.log.bodies(msg_id, &ctx).await;
            if !bodies.is_empty() {
                found.insert(subcmd, bodies);
            }
        }
        found
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("router", &self.router)
            .field("max_rooms", &self.max_rooms)
            .finish()
    }
}

/// Dispatch errors
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("invalid {cmd:?} body: {source}")]
    MalformedBody {
        cmd: Cmd,
        #[source]
        source: serde_json::Error,
    },
    #[error(transparent)]
    Publish(#[from] PublishError),
    #[error("failed to encode reply: {0}")]
    Encode(#[source] serde_json::Error),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl DispatchError {
    /// The connection's writer is gone; stop reading from it
    pub fn is_fatal(&self) -> bool {
        matches!(self, DispatchError::Transport(_))
    }
}
