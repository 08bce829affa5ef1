//! Flow addressing key.
//!
//! A [`Key`] names one logical backend-to-backend flow as seen from the local
//! side: which query (`session_id`, `command_id`), which pair of plan slices,
//! and which processes at either end.
//!
//! Identity (equality and hashing) deliberately covers the command id, the
//! slice pair and the `(dbid, pid)` of both ends. The session id and content
//! ids ride along as attributes: the session id is what the liveness check
//! compares, so packets of an older or newer session still find the client
//! registered for the same processes and are then dropped or cached.
use std::{
    cmp::Ordering,
    fmt,
    hash::{Hash, Hasher},
};

use super::wire::{Endpoint, Header};

/// How current a packet is relative to a key's `(session, command)` epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    OutOfDate,
    Live,
    Future,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Key {
    pub session_id: i32,
    pub command_id: u32,
    pub send_slice: i16,
    pub recv_slice: i16,
    pub local: Endpoint,
    pub remote: Endpoint,
}

impl Key {
    /// Key of the client that sent `header` (the packet travels client -> peer).
    pub fn from_c2p(header: &Header) -> Self {
        Self {
            session_id: header.session_id,
            command_id: header.command_id,
            send_slice: header.send_slice,
            recv_slice: header.recv_slice,
            local: header.src,
            remote: header.dst,
        }
    }

    /// Key of the client `header` is addressed to (the packet travels peer -> client).
    pub fn from_p2c(header: &Header) -> Self {
        Self::from_c2p(header).reverse()
    }

    /// Swaps the local and remote ends, e.g. to address a reply.
    pub fn reverse(&self) -> Self {
        Self {
            local: self.remote,
            remote: self.local,
            ..*self
        }
    }

    pub fn epoch(&self) -> (i32, u32) {
        (self.session_id, self.command_id)
    }

    /// Lexicographic comparison of a packet epoch against this key's epoch.
    pub fn classify(&self, session_id: i32, command_id: u32) -> Liveness {
        match (session_id, command_id).cmp(&self.epoch()) {
            Ordering::Less => Liveness::OutOfDate,
            Ordering::Equal => Liveness::Live,
            Ordering::Greater => Liveness::Future,
        }
    }
}

impl PartialEq for Key {
    fn eq(&self, other: &Self) -> bool {
        self.local.dbid == other.local.dbid
            && self.local.pid == other.local.pid
            && self.remote.dbid == other.remote.dbid
            && self.remote.pid == other.remote.pid
            && self.command_id == other.command_id
            && self.send_slice == other.send_slice
            && self.recv_slice == other.recv_slice
    }
}

impl Eq for Key {}

impl Hash for Key {
    fn hash<H: Hasher>(&self, state: &mut H) {
        let mixed = ((self.local.pid ^ self.remote.pid) as u32)
            .wrapping_add(self.remote.dbid as u32)
            .wrapping_add(self.command_id);
        state.write_u32(mixed);
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[con{},cmd{},slice[{}->{}] {}->{}]",
            self.session_id,
            self.command_id,
            self.send_slice,
            self.recv_slice,
            self.local,
            self.remote
        )
    }
}
