//! Message log lookups
//!
//! ENTER and MSGS ask the log for every body a client has not yet seen on
//! a room/subcommand channel, identified by the last message id it holds.

use std::collections::VecDeque;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::debug;

use crate::protocol::Message;

/// Message log lookup service
#[async_trait]
pub trait MessageLog: Send + Sync {
    /// Bodies newer than `msg_id` on the channel described by `ctx`
    /// (its `rid` and `subcmd`). May be empty.
    async fn bodies(&self, msg_id: &str, ctx: &Message) -> Vec<String>;
}

#[derive(Debug, Clone)]
struct LogEntry {
    id: String,
    body: String,
}

/// Bounded in-memory log, one ring per (room, subcommand)
///
/// The gateway only reads from it. Whatever delivers room messages (a
/// broadcaster embedding this crate) must call [`MemoryMessageLog::append`];
/// until then ENTER and MSGS find no backlog.
#[derive(Debug)]
pub struct MemoryMessageLog {
    channels: DashMap<(String, u8), VecDeque<LogEntry>>,
    capacity: usize,
}

impl MemoryMessageLog {
    /// Create a log keeping `capacity` entries per channel
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    /// Append a body to a channel, evicting the oldest entry when full
    pub fn append(&self, rid: &str, subcmd: u8, id: impl Into<String>, body: impl Into<String>) {
        let mut ring = self.channels.entry((rid.to_string(), subcmd)).or_default();
        if ring.len() >= self.capacity {
            ring.pop_front();
        }
        ring.push_back(LogEntry {
            id: id.into(),
            body: body.into(),
        });
    }

    /// Entries retained for a channel
    pub fn len(&self, rid: &str, subcmd: u8) -> usize {
        self.channels
            .get(&(rid.to_string(), subcmd))
            .map(|ring| ring.len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl MessageLog for MemoryMessageLog {
    async fn bodies(&self, msg_id: &str, ctx: &Message) -> Vec<String> {
        let Some(ring) = self.channels.get(&(ctx.rid.clone(), ctx.subcmd)) else {
            return Vec::new();
        };

        // Unknown or evicted ids get the whole retained history
        let start = if msg_id.is_empty() {
            0
        } else {
            ring.iter()
                .position(|entry| entry.id == msg_id)
                .map(|pos| pos + 1)
                .unwrap_or(0)
        };

        let bodies: Vec<String> = ring.iter().skip(start).map(|e| e.body.clone()).collect();
        debug!(rid = %ctx.rid, subcmd = ctx.subcmd, msg_id, found = bodies.len(), "message log lookup");
        bodies
    }
}
