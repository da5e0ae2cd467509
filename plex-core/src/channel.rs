//! Stream channels: id minting, per-channel state, sequence checks, credit accounting.

use std::collections::HashMap;

use crate::protocol::{ChannelRef, Owner, StreamSpec};

/// Default number of chunks a receiver accepts per channel before granting more credit.
pub const DEFAULT_WINDOW: u32 = 16;

/// A channel as this peer knows it: minted here (`Local`) or by the peer (`Remote`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ChannelKey {
    Local(u64),
    Remote(u64),
}

impl ChannelKey {
    /// Wire reference for a frame we are about to send.
    pub fn to_wire(self) -> ChannelRef {
        match self {
            ChannelKey::Local(id) => ChannelRef {
                id,
                owner: Owner::Sender,
            },
            ChannelKey::Remote(id) => ChannelRef {
                id,
                owner: Owner::Receiver,
            },
        }
    }

    /// Local key for a reference in a frame we received.
    pub fn from_wire(r: ChannelRef) -> Self {
        match r.owner {
            Owner::Sender => ChannelKey::Remote(r.id),
            Owner::Receiver => ChannelKey::Local(r.id),
        }
    }

    /// Local key for a reference in a frame we sent ourselves.
    pub fn from_sent(r: ChannelRef) -> Self {
        match r.owner {
            Owner::Sender => ChannelKey::Local(r.id),
            Owner::Receiver => ChannelKey::Remote(r.id),
        }
    }

    pub fn id(self) -> u64 {
        match self {
            ChannelKey::Local(id) | ChannelKey::Remote(id) => id,
        }
    }

    /// Minted by this peer, i.e. we are the callee side of the channel.
    pub fn is_local(self) -> bool {
        matches!(self, ChannelKey::Local(_))
    }
}

impl std::fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelKey::Local(id) => write!(f, "L{id}"),
            ChannelKey::Remote(id) => write!(f, "R{id}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    #[error("unknown channel {0}")]
    Unknown(ChannelKey),
    #[error("channel {0} already closed")]
    Retired(ChannelKey),
    #[error("channel id {0} reused")]
    Reused(ChannelKey),
    #[error("channel {0} does not carry data in this direction")]
    WrongDirection(ChannelKey),
    #[error("channel {0} already ended")]
    Ended(ChannelKey),
    #[error("channel {key}: expected chunk {expected}, got {got}")]
    OutOfOrder { key: ChannelKey, expected: u64, got: u64 },
    #[error("channel {0}: peer exceeded its credit window")]
    OverWindow(ChannelKey),
}

/// One logical sub-stream.
#[derive(Debug, Clone)]
pub struct StreamChannel {
    pub spec: StreamSpec,
    ready: bool,
    /// This side produces data on the channel at all.
    sends: bool,
    receives: bool,
    /// We may still send chunks.
    send_open: bool,
    /// The peer may still send chunks.
    recv_open: bool,
    send_seq: u64,
    recv_seq: u64,
    /// Chunks handed to the local consumer and not yet drained.
    buffered: u32,
    /// Drained since the last credit grant.
    drained: u32,
}

impl StreamChannel {
    fn new(key: ChannelKey, spec: StreamSpec) -> Self {
        let (sends, receives) = if key.is_local() {
            (spec.direction.caller_reads(), spec.direction.caller_writes())
        } else {
            (spec.direction.caller_writes(), spec.direction.caller_reads())
        };
        Self {
            spec,
            ready: false,
            sends,
            receives,
            send_open: sends,
            recv_open: receives,
            send_seq: 0,
            recv_seq: 0,
            buffered: 0,
            drained: 0,
        }
    }

    pub fn sends(&self) -> bool {
        self.sends
    }

    pub fn receives(&self) -> bool {
        self.receives
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub fn is_send_open(&self) -> bool {
        self.send_open
    }

    pub fn is_recv_open(&self) -> bool {
        self.recv_open
    }

    pub fn buffered(&self) -> u32 {
        self.buffered
    }

    fn is_finished(&self) -> bool {
        !self.send_open && !self.recv_open
    }
}

/// All open channels of a session. Ids are monotonic and never reused.
pub struct ChannelTable {
    window: u32,
    next_local: u64,
    /// Highest id the peer has announced so far.
    remote_high: Option<u64>,
    channels: HashMap<ChannelKey, StreamChannel>,
}

impl ChannelTable {
    pub fn new(window: u32) -> Self {
        Self {
            window: window.max(1),
            next_local: 0,
            remote_high: None,
            channels: HashMap::new(),
        }
    }

    pub fn window(&self) -> u32 {
        self.window
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    pub fn get(&self, key: ChannelKey) -> Option<&StreamChannel> {
        self.channels.get(&key)
    }

    pub fn keys(&self) -> Vec<ChannelKey> {
        let mut keys: Vec<ChannelKey> = self.channels.keys().copied().collect();
        keys.sort();
        keys
    }

    /// Mint a fresh channel for a stream we are about to produce/consume as callee.
    pub fn open_local(&mut self, spec: StreamSpec) -> ChannelKey {
        let key = ChannelKey::Local(self.next_local);
        self.next_local += 1;
        self.channels.insert(key, StreamChannel::new(key, spec));
        key
    }

    /// Register a channel the peer announced in a `Result` frame.
    pub fn open_remote(&mut self, id: u64, spec: StreamSpec) -> Result<ChannelKey, ChannelError> {
        let key = ChannelKey::Remote(id);
        if self.remote_high.is_some_and(|high| id <= high) {
            return Err(ChannelError::Reused(key));
        }
        self.remote_high = Some(id);
        self.channels.insert(key, StreamChannel::new(key, spec));
        Ok(key)
    }

    fn lookup(&mut self, key: ChannelKey) -> Result<&mut StreamChannel, ChannelError> {
        let retired = match key {
            ChannelKey::Local(id) => id < self.next_local,
            ChannelKey::Remote(id) => self.remote_high.is_some_and(|high| id <= high),
        };
        match self.channels.get_mut(&key) {
            Some(ch) => Ok(ch),
            None if retired => Err(ChannelError::Retired(key)),
            None => Err(ChannelError::Unknown(key)),
        }
    }

    /// Producer side is open. Returns true on the first call only.
    pub fn mark_ready(&mut self, key: ChannelKey) -> Result<bool, ChannelError> {
        let ch = self.lookup(key)?;
        let first = !ch.ready;
        ch.ready = true;
        Ok(first)
    }

    /// Sequence number for the next outbound chunk.
    pub fn next_send_seq(&mut self, key: ChannelKey) -> Result<u64, ChannelError> {
        let ch = self.lookup(key)?;
        if !ch.sends {
            return Err(ChannelError::WrongDirection(key));
        }
        if !ch.send_open {
            return Err(ChannelError::Ended(key));
        }
        let seq = ch.send_seq;
        ch.send_seq += 1;
        Ok(seq)
    }

    /// Validate an inbound chunk and count it against the window.
    pub fn accept_chunk(&mut self, key: ChannelKey, seq: u64) -> Result<(), ChannelError> {
        let window = self.window;
        let ch = self.lookup(key)?;
        if !ch.receives {
            return Err(ChannelError::WrongDirection(key));
        }
        if !ch.recv_open {
            return Err(ChannelError::Ended(key));
        }
        if seq != ch.recv_seq {
            return Err(ChannelError::OutOfOrder {
                key,
                expected: ch.recv_seq,
                got: seq,
            });
        }
        if ch.buffered >= window {
            return Err(ChannelError::OverWindow(key));
        }
        ch.recv_seq += 1;
        ch.buffered += 1;
        Ok(())
    }

    /// The local consumer drained `n` chunks. Returns credit to grant the peer, batched
    /// to half a window.
    pub fn drained(&mut self, key: ChannelKey, n: u32) -> Option<u32> {
        let threshold = (self.window / 2).max(1);
        let ch = self.channels.get_mut(&key)?;
        let n = n.min(ch.buffered);
        ch.buffered -= n;
        if !ch.recv_open {
            return None;
        }
        ch.drained += n;
        if ch.drained >= threshold {
            let grant = ch.drained;
            ch.drained = 0;
            return Some(grant);
        }
        None
    }

    /// We sent `End`. Returns true when the channel is now fully closed and removed.
    pub fn finish_send(&mut self, key: ChannelKey) -> Result<bool, ChannelError> {
        let ch = self.lookup(key)?;
        if !ch.sends {
            return Err(ChannelError::WrongDirection(key));
        }
        if !ch.send_open {
            return Err(ChannelError::Ended(key));
        }
        ch.send_open = false;
        Ok(self.retire_if_finished(key))
    }

    /// Peer sent `End`. Returns true when the channel is now fully closed and removed.
    pub fn finish_recv(&mut self, key: ChannelKey) -> Result<bool, ChannelError> {
        let ch = self.lookup(key)?;
        if !ch.receives {
            return Err(ChannelError::WrongDirection(key));
        }
        if !ch.recv_open {
            return Err(ChannelError::Ended(key));
        }
        ch.recv_open = false;
        Ok(self.retire_if_finished(key))
    }

    /// Whether we may send on this channel right now.
    pub fn can_send(&self, key: ChannelKey) -> bool {
        self.channels.get(&key).is_some_and(|ch| ch.send_open)
    }

    /// Whether the peer may still send on this channel.
    pub fn can_recv(&self, key: ChannelKey) -> bool {
        self.channels.get(&key).is_some_and(|ch| ch.recv_open)
    }

    fn retire_if_finished(&mut self, key: ChannelKey) -> bool {
        if self.channels.get(&key).is_some_and(StreamChannel::is_finished) {
            self.channels.remove(&key);
            return true;
        }
        false
    }

    /// Drop a channel regardless of state (stream failure, session teardown).
    pub fn remove(&mut self, key: ChannelKey) -> Option<StreamChannel> {
        self.channels.remove(&key)
    }

    /// Remove every channel, returning their keys in order.
    pub fn close_all(&mut self) -> Vec<ChannelKey> {
        let keys = self.keys();
        self.channels.clear();
        keys
    }
}
