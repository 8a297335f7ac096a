//! The broker's table of connected peers and its browser reference.
//!
//! The table is the only owner of a peer's outbound channel. Everything that
//! reads or writes the browser reference does so through `&mut PeerTable` or
//! `&PeerTable`, which the broker hands out under a single mutex, so "look up
//! the browser, check it is open, enqueue the payload" cannot interleave with
//! that peer being removed.

use crate::websocket::Message;
use std::collections::HashMap;
use std::fmt::Display;
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::mpsc::Sender;
use std::time::{Duration, Instant};

/// Identity of one accepted connection. Never reused within a broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(u64);

impl Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// What the broker knows about a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Connected, not yet identified.
    Unknown,
    /// Announced itself as the browser tab; the forwarding target.
    Browser,
    /// Sent a payload; about to be closed.
    Sender,
}

/// Work for a peer's writer thread.
#[derive(Debug)]
pub(crate) enum Outbound {
    Message(Message),
    /// Send a close frame with this code, then shut the socket down.
    Close(u16),
}

/// A point-in-time view of a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub id: PeerId,
    pub addr: SocketAddr,
    pub role: Role,
}

#[derive(Debug)]
pub(crate) struct Peer {
    pub(crate) addr: SocketAddr,
    pub(crate) role: Role,
    last_seen: Instant,
    outbox: Sender<Outbound>,
    socket: TcpStream,
}

impl Peer {
    /// Queues a message. False if the writer thread is gone.
    pub(crate) fn send(&self, message: Message) -> bool {
        self.outbox.send(Outbound::Message(message)).is_ok()
    }

    /// Queues a close; the writer drains what was queued before it.
    pub(crate) fn close(&self, code: u16) -> bool {
        self.outbox.send(Outbound::Close(code)).is_ok()
    }

    /// Shuts the socket down immediately, waking the peer's reader.
    pub(crate) fn kill(&self) {
        let _ = self.socket.shutdown(Shutdown::Both);
    }
}

/// Where a payload ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Forwarded {
    /// Handed to the browser peer.
    Browser(PeerId),
    /// No usable browser; queued to this many other peers.
    Broadcast(usize),
}

#[derive(Debug, Default)]
pub(crate) struct PeerTable {
    peers: HashMap<PeerId, Peer>,
    browser: Option<PeerId>,
    next_id: u64,
}

impl PeerTable {
    pub(crate) fn new() -> PeerTable {
        PeerTable::default()
    }

    pub(crate) fn insert(
        &mut self,
        addr: SocketAddr,
        outbox: Sender<Outbound>,
        socket: TcpStream,
    ) -> PeerId {
        let id = PeerId(self.next_id);
        self.next_id += 1;
        self.peers.insert(
            id,
            Peer {
                addr,
                role: Role::Unknown,
                last_seen: Instant::now(),
                outbox,
                socket,
            },
        );
        id
    }

    /// Removes a peer, unsetting the browser reference if it pointed there.
    pub(crate) fn remove(&mut self, id: PeerId) -> Option<Peer> {
        if self.browser == Some(id) {
            self.browser = None;
        }
        self.peers.remove(&id)
    }

    pub(crate) fn get(&self, id: PeerId) -> Option<&Peer> {
        self.peers.get(&id)
    }

    pub(crate) fn len(&self) -> usize {
        self.peers.len()
    }

    /// Records activity. False if the peer is no longer in the table.
    pub(crate) fn touch(&mut self, id: PeerId) -> bool {
        match self.peers.get_mut(&id) {
            Some(peer) => {
                peer.last_seen = Instant::now();
                true
            }
            None => false,
        }
    }

    /// Makes `id` the browser unless a live browser is already set.
    ///
    /// Returns true if `id` became the browser with this call.
    pub(crate) fn classify_browser(&mut self, id: PeerId) -> bool {
        if self.browser.is_some() {
            return false;
        }
        match self.peers.get_mut(&id) {
            Some(peer) if peer.role == Role::Unknown => {
                peer.role = Role::Browser;
                self.browser = Some(id);
                true
            }
            _ => false,
        }
    }

    pub(crate) fn mark_sender(&mut self, id: PeerId) {
        if let Some(peer) = self.peers.get_mut(&id) {
            if peer.role == Role::Unknown {
                peer.role = Role::Sender;
            }
        }
    }

    pub(crate) fn browser(&self) -> Option<PeerId> {
        self.browser
    }

    /// Queues `message` to every peer except `except`; returns how many accepted it.
    pub(crate) fn broadcast(&self, message: &Message, except: Option<PeerId>) -> usize {
        let mut delivered = 0;
        for (id, peer) in &self.peers {
            if Some(*id) == except {
                continue;
            }
            if peer.send(message.clone()) {
                delivered += 1;
            } else {
                logwise::warn_sync!(
                    "Writer for {addr} is gone; skipping it",
                    addr = logwise::privacy::LogIt(&peer.addr)
                );
            }
        }
        delivered
    }

    /// Delivers a payload from `from`: to the browser if it is still open,
    /// otherwise to every other peer.
    pub(crate) fn forward(&self, from: PeerId, payload: Vec<u8>) -> Forwarded {
        let message = Message::Binary(payload);
        if let Some(id) = self.browser {
            if let Some(browser) = self.peers.get(&id) {
                if browser.send(message.clone()) {
                    return Forwarded::Browser(id);
                }
                logwise::warn_sync!(
                    "Browser {addr} closed before the payload could be queued",
                    addr = logwise::privacy::LogIt(&browser.addr)
                );
            }
        }
        Forwarded::Broadcast(self.broadcast(&message, Some(from)))
    }

    /// Peers silent for longer than `timeout` as of `now`.
    pub(crate) fn stale(&self, now: Instant, timeout: Duration) -> Vec<PeerId> {
        self.peers
            .iter()
            .filter(|(_, peer)| now.saturating_duration_since(peer.last_seen) > timeout)
            .map(|(id, _)| *id)
            .collect()
    }

    pub(crate) fn snapshot(&self) -> Vec<PeerInfo> {
        let mut peers: Vec<PeerInfo> = self
            .peers
            .iter()
            .map(|(id, peer)| PeerInfo {
                id: *id,
                addr: peer.addr,
                role: peer.role,
            })
            .collect();
        peers.sort_by_key(|info| info.id);
        peers
    }

    /// Empties the table, handing back every peer.
    pub(crate) fn drain(&mut self) -> Vec<Peer> {
        self.browser = None;
        self.peers.drain().map(|(_, peer)| peer).collect()
    }
}
