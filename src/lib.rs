//! RoomCast - room-based push gateway
//!
//! Clients speak a length-prefixed binary protocol over TCP. Each
//! connection carries one [`Session`]: an identity (uid, sid) plus a
//! sorted, bounded set of rooms registered in the shared [`Hub`].
//!
//! ## Commands
//!
//! ```text
//! PING   echo
//! ENTER  join a room, replay missed messages
//! LEAVE  part a room
//! PUB    forward to an HTTP backend with retry
//! MSGS   replay missed messages
//! ```

pub mod config;
pub mod dispatcher;
pub mod hub;
pub mod message_log;
pub mod protocol;
pub mod publish;
pub mod server;
pub mod session;

pub use config::Config;
pub use dispatcher::{DispatchError, Dispatcher};
pub use hub::{Hub, RoomStore};
pub use message_log::{MemoryMessageLog, MessageLog};
pub use protocol::{Cmd, Message, MessageCodec, ProtocolError};
pub use publish::{Backend, HttpBackend, PubTarget, PublishRouter};
pub use server::{Server, ServerError};
pub use session::{ConnHandle, EnterOutcome, Session};
