//! Rendezvous — applies join/leave messages and introduces peers sharing a channel

use super::channel_index::ChannelIndex;
use crate::channel::{Channel, ConnectId};
use crate::protocol::{ClientMessage, ServerMessage};
use std::collections::{HashMap, HashSet};
use std::fmt;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Identity of one live discovery socket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionHandle(u64);

impl fmt::Display for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Outbound half of a discovery connection
pub type Outbox = mpsc::UnboundedSender<ServerMessage>;

/// Statistics about rendezvous operations
#[derive(Debug, Clone, Default)]
pub struct RendezvousStats {
    /// Number of open discovery connections
    pub connections_active: usize,
    /// Total pairings minted since start
    pub pairings_sent: u64,
}

/// Channel membership plus the pairing protocol.
///
/// All methods are synchronous; callers serialize access (the service keeps
/// it behind a mutex and never holds the lock across an await).
pub struct RendezvousServer {
    index: ChannelIndex<ConnectionHandle>,
    outboxes: HashMap<ConnectionHandle, Outbox>,
    next_handle: u64,
    pairings_sent: u64,
}

impl RendezvousServer {
    pub fn new() -> Self {
        Self {
            index: ChannelIndex::new(),
            outboxes: HashMap::new(),
            next_handle: 0,
            pairings_sent: 0,
        }
    }

    /// Register a newly accepted discovery socket
    pub fn connect(&mut self, outbox: Outbox) -> ConnectionHandle {
        self.next_handle += 1;
        let handle = ConnectionHandle(self.next_handle);
        self.outboxes.insert(handle, outbox);
        debug!("{} connected", handle);
        handle
    }

    /// Apply one client message; returns the number of pairings minted.
    ///
    /// `leave` is applied first. Of the `join` channels only those the
    /// connection had not already joined count; every other connection found
    /// on them that did not already share a channel with the joiner is
    /// introduced exactly once, whatever the number of overlapping channels.
    pub fn handle_message(&mut self, handle: ConnectionHandle, msg: ClientMessage) -> usize {
        if let Some(leave) = msg.leave {
            self.index.leave(handle, &leave);
        }

        let Some(join) = msg.join else {
            return 0;
        };

        let mut seen = HashSet::new();
        let fresh: Vec<Channel> = join
            .into_iter()
            .filter(|c| !self.index.contains(handle, c) && seen.insert(c.clone()))
            .collect();
        if fresh.is_empty() {
            return 0;
        }

        let current: Vec<Channel> = self.index.channels_of(handle).into_iter().collect();
        let introduced_before = self.index.sharing_any(&current, handle);

        let mut others: Vec<ConnectionHandle> = self
            .index
            .sharing_any(&fresh, handle)
            .into_iter()
            .filter(|other| !introduced_before.contains(other))
            .collect();
        others.sort();

        for other in &others {
            self.introduce(handle, *other);
        }

        self.index.join(handle, &fresh);
        others.len()
    }

    /// Forget a closed socket. No notifications are sent for the removal.
    pub fn disconnect(&mut self, handle: ConnectionHandle) -> HashSet<Channel> {
        self.outboxes.remove(&handle);
        let channels = self.index.remove(handle);
        debug!("{} disconnected ({} channels)", handle, channels.len());
        channels
    }

    pub fn index(&self) -> &ChannelIndex<ConnectionHandle> {
        &self.index
    }

    pub fn connection_count(&self) -> usize {
        self.outboxes.len()
    }

    pub fn get_stats(&self) -> RendezvousStats {
        RendezvousStats {
            connections_active: self.outboxes.len(),
            pairings_sent: self.pairings_sent,
        }
    }

    fn introduce(&mut self, joiner: ConnectionHandle, existing: ConnectionHandle) {
        let id = ConnectId::generate();
        info!("pairing {} with {} as {}", joiner, existing, id);
        self.send(existing, ServerMessage::new(id.clone(), false));
        self.send(joiner, ServerMessage::new(id, true));
        self.pairings_sent += 1;
    }

    fn send(&self, handle: ConnectionHandle, msg: ServerMessage) {
        match self.outboxes.get(&handle) {
            Some(outbox) => {
                if outbox.send(msg).is_err() {
                    debug!("{} is closing, dropping notification", handle);
                }
            }
            None => debug!("{} has no outbox, dropping notification", handle),
        }
    }
}

impl Default for RendezvousServer {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// TESTS
// ============================================================================
