//! The proxy core.
//!
//! # Overview
//!
//! [`Proxy`] owns every piece of proxy state: the packet pool, the address
//! table, the client table (one entry per local backend flow, keyed by
//! [`Key`]), the peer table (one entry per remote node, keyed by [`PeerId`])
//! and the deferred loopback queue.
//!
//! The core never touches a socket. Connections are named by opaque
//! [`Token`]s; whatever the state machines want done to a connection is
//! queued as an [`Effect`] and collected with [`Proxy::take_effects`]. The
//! driver (see [`server`](crate::server)) executes the effects and reports
//! back through the `on_*` methods: bytes read, EOF, write completion,
//! shutdown completion, connect result. A write carries a [`Completion`]
//! that the driver hands back untouched together with the packet, so the
//! packet returns to the pool and the right state machine learns the result.
//!
//! Connection objects refer to each other by token or key only. A lookup
//! that misses means the other side is already gone, and is ignored.
//!
//! # Key Components
//!
//! - `client`: the per-flow state machine fronting one local backend.
//! - `peer`: the per-node state machine fronting one remote proxy.
//! - `router`: dispatch of a packet to loopback, a local client or a peer.
//!
//! # See Also
//!
//! - [`packet`](crate::packet): packets, keys and framing buffers.
mod client;
mod peer;
mod router;

use std::{
    collections::{HashMap, VecDeque},
    fmt, io, mem,
    net::SocketAddr,
};

use log::info;
use thiserror::Error;

use crate::{
    addr::AddressTable,
    packet::{FramingError, Key, Packet, PacketPool, PoolError, WireError},
};

use client::Client;
use peer::Peer;
use router::Delay;

/// Unconsumed packets at which the remote sender is asked to pause.
pub const PAUSE_HIGH: usize = 4;
/// Unconsumed packets at which a paused remote sender is resumed.
pub const RESUME_LOW: usize = 2;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error(transparent)]
    Framing(#[from] FramingError),
    #[error(transparent)]
    Pool(#[from] PoolError),
}

/// Result of an I/O operation reported back to the core.
pub type Status = Result<(), io::ErrorKind>;

/// Names one connection (or connection-less placeholder) owned by the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Token(pub u64);

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Identity of a remote node's proxy.
///
/// Ordered by `(content_id, dbid)`; the node with the greater id dials the
/// node with the lower one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId {
    pub content_id: i16,
    pub dbid: u16,
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "seg{},dbid{}", self.content_id, self.dbid)
    }
}

/// The node this proxy runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeIdentity {
    pub content_id: i16,
    pub dbid: u16,
}

impl NodeIdentity {
    pub fn peer_id(&self) -> PeerId {
        PeerId {
            content_id: self.content_id,
            dbid: self.dbid,
        }
    }
}

/// Work the core asks the driver to perform.
#[derive(Debug)]
pub enum Effect {
    /// Write `packet.as_bytes()[offset..]`, then call [`Proxy::on_written`].
    Write {
        conn: Token,
        packet: Packet,
        offset: usize,
        completion: Completion,
    },
    StartRead(Token),
    StopRead(Token),
    /// Half-close the write side, then call [`Proxy::on_shutdown`].
    Shutdown(Token),
    /// Release the connection. Writes already handed over still complete.
    Close(Token),
    /// Dial a peer, then call [`Proxy::on_connected`].
    Connect { conn: Token, addr: SocketAddr },
}

/// What to do once a write finished.
#[derive(Debug)]
pub enum Completion {
    HelloAck(Token),
    P2cData(Token),
    C2pBye(Token),
    C2pPause(Token),
    C2pResume(Token),
    PeerHello(Token),
    PeerHelloAck(Token),
    PeerData {
        peer: Token,
        then: Option<Box<Completion>>,
    },
    PeerQuit(Token),
}

pub struct Proxy {
    me: NodeIdentity,
    pool: PacketPool,
    addrs: AddressTable,
    clients: HashMap<Token, Client>,
    registry: HashMap<Key, Token>,
    peers: HashMap<Token, Peer>,
    peer_registry: HashMap<PeerId, Token>,
    loopback: VecDeque<Delay>,
    effects: Vec<Effect>,
    next_token: u64,
    quitting: bool,
    exit_code: i32,
}

impl Proxy {
    pub fn new(me: NodeIdentity, pool: PacketPool, addrs: AddressTable) -> Self {
        Self {
            me,
            pool,
            addrs,
            clients: HashMap::new(),
            registry: HashMap::new(),
            peers: HashMap::new(),
            peer_registry: HashMap::new(),
            loopback: VecDeque::new(),
            effects: Vec::new(),
            next_token: 0,
            quitting: false,
            exit_code: 1,
        }
    }

    pub fn identity(&self) -> NodeIdentity {
        self.me
    }

    pub fn pool(&self) -> &PacketPool {
        &self.pool
    }

    pub fn addresses(&self) -> &AddressTable {
        &self.addrs
    }

    /// Swaps in a freshly parsed address table and re-evaluates the peers.
    pub fn set_addresses(&mut self, addrs: AddressTable) {
        self.addrs = addrs;
        self.maintain();
    }

    pub fn take_effects(&mut self) -> Vec<Effect> {
        mem::take(&mut self.effects)
    }

    /// Registers a freshly accepted backend connection.
    pub fn on_client_accepted(&mut self) -> Token {
        self.client_accept()
    }

    /// Registers a freshly accepted peer connection.
    pub fn on_peer_accepted(&mut self) -> Token {
        self.peer_accept()
    }

    pub fn on_connected(&mut self, conn: Token, result: io::Result<()>) {
        self.peer_on_connected(conn, result);
    }

    pub fn on_read(&mut self, conn: Token, data: &[u8]) {
        if self.clients.contains_key(&conn) {
            self.client_read(conn, data);
        } else if self.peers.contains_key(&conn) {
            self.peer_read(conn, data);
        }
    }

    /// The connection reached EOF (`error` is `None`) or failed to read.
    pub fn on_eof(&mut self, conn: Token, error: Option<io::Error>) {
        if self.clients.contains_key(&conn) {
            self.client_eof(conn, error);
        } else if self.peers.contains_key(&conn) {
            self.peer_eof(conn, error);
        }
    }

    pub fn on_shutdown(&mut self, conn: Token, result: io::Result<()>) {
        if self.clients.contains_key(&conn) {
            self.client_on_shutdown_p2c(conn, result);
        } else if self.peers.contains_key(&conn) {
            self.peer_on_shutdown(conn, result);
        }
    }

    /// Periodic maintenance: make sure a connection toward every lower
    /// numbered node exists.
    pub fn maintain(&mut self) {
        if self.quitting {
            return;
        }

        let lower: Vec<PeerId> = self
            .addrs
            .iter()
            .map(|node| PeerId {
                content_id: node.content_id,
                dbid: node.dbid,
            })
            .filter(|id| id.dbid != self.me.dbid && *id < self.me.peer_id())
            .collect();

        for id in lower {
            let token = self.peer_blessed_lookup(id);
            self.peer_maybe_connect(token);
        }
    }

    /// Stops taking new work. Existing clients drain through their own
    /// state machines; once none is left the peers are told to quit.
    ///
    /// With `relaunch` the exit code asks the supervisor for a restart.
    pub fn quit(&mut self, relaunch: bool) {
        info!("ic-proxy-server: quiting");

        self.exit_code = if relaunch { 1 } else { 0 };
        self.quitting = true;
        self.check_quit();
    }

    pub fn is_quitting(&self) -> bool {
        self.quitting
    }

    /// Quitting, and nothing is left to drain.
    pub fn is_finished(&self) -> bool {
        self.quitting
            && self.clients.is_empty()
            && self.peers.is_empty()
            && self.loopback.is_empty()
    }

    pub fn exit_code(&self) -> i32 {
        self.exit_code
    }

    /// Number of backend connections, placeholders excluded.
    pub fn client_count(&self) -> usize {
        self.clients.values().filter(|c| !c.is_placeholder()).count()
    }

    pub fn placeholder_count(&self) -> usize {
        self.clients.values().filter(|c| c.is_placeholder()).count()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    fn alloc_token(&mut self) -> Token {
        self.next_token += 1;
        Token(self.next_token)
    }

    fn free(&mut self, packet: Packet) {
        self.pool.free(packet.into_block());
    }

    fn complete(&mut self, completion: Completion, status: Status) {
        match completion {
            Completion::HelloAck(t) => self.client_on_sent_hello_ack(t, status),
            Completion::P2cData(t) => self.client_on_sent_p2c_data(t, status),
            Completion::C2pBye(t) => self.client_on_sent_c2p_bye(t, status),
            Completion::C2pPause(t) | Completion::C2pResume(t) => {
                self.client_on_sent_c2p_message(t, status)
            }
            Completion::PeerHello(t) => self.peer_on_sent_hello(t, status),
            Completion::PeerHelloAck(t) => self.peer_on_sent_hello_ack(t, status),
            Completion::PeerData { peer, then } => self.peer_on_sent_data(peer, then, status),
            Completion::PeerQuit(t) => self.peer_on_sent_quit(t, status),
        }
    }

    fn check_quit(&mut self) {
        if !self.quitting || self.client_count() > 0 {
            return;
        }

        let placeholders: Vec<Token> = self
            .clients
            .iter()
            .filter(|(_, c)| c.is_placeholder())
            .map(|(t, _)| *t)
            .collect();
        for token in placeholders {
            self.client_drop_placeholder(token);
        }

        let peers: Vec<Token> = self.peers.keys().copied().collect();
        for token in peers {
            self.peer_quit(token);
        }
    }
}

#[cfg(test)]
pub(crate) mod harness {
    //! Plays the driver's role against a [`Proxy`] in unit tests.
    use std::collections::HashSet;

    use crate::packet::{HEADER_SIZE, Header, MessageType};

    use super::*;

    pub const BLOCK_SIZE: usize = HEADER_SIZE + 64;

    pub struct Harness {
        pub proxy: Proxy,
        /// Bytes written per connection, in order.
        pub written: Vec<(Token, Vec<u8>)>,
        pub reading: HashSet<Token>,
        pub shut: HashSet<Token>,
        pub closed: Vec<Token>,
        pub connects: Vec<(Token, SocketAddr)>,
        /// Writes to these connections stay pending until released.
        pub hold: HashSet<Token>,
        pub pending: Vec<(Token, Packet, Completion)>,
    }

    impl Harness {
        pub fn new(dbid: u16, content_id: i16, addrs: &str) -> Self {
            let me = NodeIdentity { content_id, dbid };
            let proxy = Proxy::new(
                me,
                PacketPool::new(BLOCK_SIZE, None),
                AddressTable::parse(addrs).unwrap(),
            );

            Self {
                proxy,
                written: Vec::new(),
                reading: HashSet::new(),
                shut: HashSet::new(),
                closed: Vec::new(),
                connects: Vec::new(),
                hold: HashSet::new(),
                pending: Vec::new(),
            }
        }

        /// Executes effects until the core goes quiet. Loopback deliveries
        /// are only drained when `deferred` is set.
        pub fn pump_with(&mut self, deferred: bool) {
            loop {
                let effects = self.proxy.take_effects();
                if effects.is_empty() {
                    if deferred && self.proxy.has_deferred() {
                        self.proxy.run_deferred();
                        continue;
                    }
                    break;
                }

                for effect in effects {
                    match effect {
                        Effect::Write {
                            conn,
                            packet,
                            offset,
                            completion,
                        } => {
                            self.written
                                .push((conn, packet.as_bytes()[offset..].to_vec()));
                            if self.hold.contains(&conn) {
                                self.pending.push((conn, packet, completion));
                            } else {
                                self.proxy.on_written(packet, completion, Ok(()));
                            }
                        }
                        Effect::StartRead(conn) => {
                            self.reading.insert(conn);
                        }
                        Effect::StopRead(conn) => {
                            self.reading.remove(&conn);
                        }
                        Effect::Shutdown(conn) => {
                            self.shut.insert(conn);
                            self.proxy.on_shutdown(conn, Ok(()));
                        }
                        Effect::Close(conn) => {
                            self.reading.remove(&conn);
                            self.closed.push(conn);
                        }
                        Effect::Connect { conn, addr } => self.connects.push((conn, addr)),
                    }
                }
            }
        }

        pub fn pump(&mut self) {
            self.pump_with(true);
        }

        /// Completes the oldest held write of `conn`.
        pub fn release_one(&mut self, conn: Token) {
            if let Some(at) = self.pending.iter().position(|(c, _, _)| *c == conn) {
                let (_, packet, completion) = self.pending.remove(at);
                self.proxy.on_written(packet, completion, Ok(()));
            }
        }

        /// Bytes written to `conn`, drained.
        pub fn take_written(&mut self, conn: Token) -> Vec<Vec<u8>> {
            let (mine, rest): (Vec<_>, Vec<_>) = mem::take(&mut self.written)
                .into_iter()
                .partition(|(c, _)| *c == conn);
            self.written = rest;
            mine.into_iter().map(|(_, bytes)| bytes).collect()
        }

        /// Accepts a backend and completes its handshake for `key`.
        pub fn connect_backend(&mut self, key: &Key) -> Token {
            let conn = self.proxy.on_client_accepted();
            self.pump();

            let hello = Packet::message(&mut self.proxy.pool, MessageType::Hello, key).unwrap();
            let bytes = hello.as_bytes().to_vec();
            self.proxy.free(hello);
            self.proxy.on_read(conn, &bytes);
            self.pump();
            conn
        }

        /// Builds a p2p packet as a remote proxy would send it.
        pub fn wire(&mut self, kind: MessageType, key: &Key, payload: &[u8]) -> Vec<u8> {
            let packet = if kind == MessageType::Data {
                Packet::data(&mut self.proxy.pool, key, payload).unwrap()
            } else {
                Packet::message(&mut self.proxy.pool, kind, key).unwrap()
            };
            let bytes = packet.as_bytes().to_vec();
            self.proxy.free(packet);
            bytes
        }
    }

    /// A b2c frame carrying `body`.
    pub fn b2c(body: &[u8]) -> Vec<u8> {
        [&((body.len() + 4) as u32).to_be_bytes()[..], body].concat()
    }

    pub fn message_type(bytes: &[u8]) -> MessageType {
        Header::decode(bytes).unwrap().message_type().unwrap()
    }
}
