//! Peer connections: one TCP connection per remote node's proxy.
//!
//! For every pair of nodes exactly one side dials: the node with the greater
//! [`PeerId`] connects to the lower one. The dialing side sends HELLO with
//! its own identity as the source; the accepting side learns the peer id
//! from it, registers the connection and answers HELLO ACK. Packets routed
//! to a peer before its handshake completes are queued and flushed in order
//! once it does.
//!
//! A node that reconnects (e.g. after a restart) supersedes its previous
//! connection. The old connection is marked legacy: it still delivers what
//! the remote already sent on it, but is never written to again, and its
//! queued packets move to the new connection.
use std::{collections::VecDeque, io, mem};

use log::{debug, info, warn};

use crate::packet::{Dialect, Endpoint, InputBuffer, Key, MessageType, Packet};

use super::{
    Completion, Effect, NodeIdentity, PeerId, Proxy, Status, Token, client::HalfClose, router::Delay,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Link {
    /// Known by id only; no socket yet.
    Idle,
    Connecting,
    /// Dialed by us.
    Connected,
    /// Dialed by the remote.
    Accepted,
}

#[derive(Debug)]
pub(super) struct Peer {
    id: Option<PeerId>,
    link: Link,
    legacy: bool,
    sent_hello: bool,
    received_hello_ack: bool,
    received_hello: bool,
    sent_hello_ack: bool,
    shut: HalfClose,
    closing: bool,
    sending: usize,
    ibuf: InputBuffer,
    queue: VecDeque<Delay>,
}

impl Peer {
    fn new(id: Option<PeerId>, link: Link) -> Self {
        Self {
            id,
            link,
            legacy: false,
            sent_hello: false,
            received_hello_ack: false,
            received_hello: false,
            sent_hello_ack: false,
            shut: HalfClose::Open,
            closing: false,
            sending: 0,
            ibuf: InputBuffer::new(Dialect::P2p),
            queue: VecDeque::new(),
        }
    }

    pub(super) fn name(&self) -> String {
        let suffix = if self.legacy { ".legacy" } else { "" };
        match self.id {
            Some(id) => format!("peer{suffix}[{id}]"),
            None => format!("peer{suffix}"),
        }
    }

    /// Handshake done in either direction, and still writable.
    fn is_ready(&self) -> bool {
        (self.sent_hello_ack || (self.sent_hello && self.received_hello_ack))
            && !self.legacy
            && !self.closing
            && self.shut == HalfClose::Open
    }

    fn handshaking(&self) -> bool {
        match self.link {
            Link::Connected => !self.received_hello_ack,
            Link::Accepted => !self.received_hello,
            Link::Idle | Link::Connecting => true,
        }
    }

    /// Packets waiting for the handshake.
    pub(super) fn queued(&self) -> usize {
        self.queue.len()
    }
}

impl Proxy {
    pub(super) fn peer_name(&self, token: Token) -> String {
        self.peers
            .get(&token)
            .map_or_else(|| format!("peer{token}"), Peer::name)
    }

    pub(super) fn peer_accept(&mut self) -> Token {
        let token = self.alloc_token();
        self.peers.insert(token, Peer::new(None, Link::Accepted));
        info!("ic-proxy-server: new peer {token} to the server");

        self.effects.push(Effect::StartRead(token));
        token
    }

    fn should_connect(&self, id: PeerId) -> bool {
        !self.quitting && id.dbid != self.me.dbid && id < self.me.peer_id()
    }

    /// Finds the peer registered for `id`, creating one if there is none. A
    /// new peer is dialed right away when this node is the one to connect.
    pub(super) fn peer_blessed_lookup(&mut self, id: PeerId) -> Token {
        if let Some(&token) = self.peer_registry.get(&id) {
            return token;
        }

        let token = self.alloc_token();
        self.peers.insert(token, Peer::new(Some(id), Link::Idle));
        self.peer_registry.insert(id, token);
        info!("{}: registered", self.peer_name(token));

        self.peer_maybe_connect(token);
        token
    }

    pub(super) fn peer_maybe_connect(&mut self, token: Token) {
        let Some(peer) = self.peers.get(&token) else {
            return;
        };
        let Some(id) = peer.id else {
            return;
        };
        if peer.link != Link::Idle || peer.legacy || peer.closing || !self.should_connect(id) {
            return;
        }

        let addr = match self.addrs.addr_of(id.dbid) {
            Ok(addr) => addr,
            Err(e) => {
                debug!("{}: not connecting: {e}", peer.name());
                return;
            }
        };

        info!("{}: connecting to {addr}", peer.name());
        if let Some(peer) = self.peers.get_mut(&token) {
            peer.link = Link::Connecting;
        }
        self.effects.push(Effect::Connect { conn: token, addr });
    }

    pub(super) fn peer_on_connected(&mut self, token: Token, result: io::Result<()>) {
        let Some(peer) = self.peers.get_mut(&token) else {
            if result.is_ok() {
                // dropped while connecting
                self.effects.push(Effect::Close(token));
            }
            return;
        };

        if let Err(e) = result {
            warn!("{}: fail to connect: {e}", peer.name());
            peer.link = Link::Idle;
            if self.quitting {
                self.peer_close(token);
            }
            return;
        }
        if peer.legacy || peer.closing {
            info!("{}: superseded while connecting", peer.name());
            self.peer_close(token);
            return;
        }

        peer.link = Link::Connected;
        info!("{}: connected", peer.name());

        let Some(id) = peer.id else {
            return;
        };
        let key = Self::handshake_key(self.me, id);
        match Packet::message(&mut self.pool, MessageType::Hello, &key) {
            Ok(hello) => {
                peer.sending += 1;
                self.write(token, hello, 0, Completion::PeerHello(token));
                self.effects.push(Effect::StartRead(token));
            }
            Err(e) => {
                warn!("{}: fail to build HELLO: {e}", peer.name());
                self.peer_lost(token);
            }
        }
    }

    /// Addressing of the handshake messages `me` sends to `id`.
    fn handshake_key(me: NodeIdentity, id: PeerId) -> Key {
        Key {
            session_id: 0,
            command_id: 0,
            send_slice: 0,
            recv_slice: 0,
            local: Endpoint::new(me.content_id, me.dbid, std::process::id() as i32),
            remote: Endpoint::new(id.content_id, id.dbid, 0),
        }
    }

    pub(super) fn peer_on_sent_hello(&mut self, token: Token, status: Status) {
        let Some(peer) = self.peers.get_mut(&token) else {
            return;
        };
        peer.sending -= 1;

        if let Err(kind) = status {
            warn!("{}: fail to send HELLO: {kind}", peer.name());
            self.peer_lost(token);
            return;
        }

        peer.sent_hello = true;
        info!("{}: sent HELLO", peer.name());
        // the ACK may have been read before the write completed
        self.peer_flush_queue(token);
    }

    pub(super) fn peer_read(&mut self, token: Token, data: &[u8]) {
        let Some(peer) = self.peers.get_mut(&token) else {
            return;
        };

        let mut packets = Vec::new();
        let res = peer.ibuf.push(&mut self.pool, data, |pool, bytes| {
            packets.push(Packet::from_wire(pool, bytes)?);
            Ok(())
        });

        for packet in packets {
            self.peer_on_packet(token, packet);
        }

        if let Err(e) = res {
            warn!("{}: invalid packet: {e}", self.peer_name(token));
            self.peer_lost(token);
        }
    }

    fn peer_on_packet(&mut self, token: Token, packet: Packet) {
        let Some(peer) = self.peers.get_mut(&token) else {
            self.free(packet);
            return;
        };

        if peer.closing {
            debug!("{}: closing, drop {packet}", peer.name());
            self.free(packet);
            return;
        }

        if peer.handshaking() {
            let expected = match peer.link {
                Link::Accepted => MessageType::Hello,
                _ => MessageType::HelloAck,
            };
            if !packet.is(expected) {
                warn!(
                    "{}: expect {expected}, but received {packet}",
                    peer.name()
                );
                self.free(packet);
                self.peer_lost(token);
                return;
            }

            if expected == MessageType::Hello {
                self.peer_on_hello(token, packet);
            } else {
                peer.received_hello_ack = true;
                info!("{}: received {packet}", peer.name());
                self.free(packet);
                self.peer_flush_queue(token);
            }
            return;
        }

        match packet.message_type() {
            MessageType::PeerQuit => {
                info!("{}: received {packet}", peer.name());
                self.free(packet);
                self.peer_lost(token);
            }
            MessageType::Hello | MessageType::HelloAck => {
                warn!("{}: unexpected {packet}, dropping it", peer.name());
                self.free(packet);
            }
            _ => {
                debug!("{}: received {packet}", peer.name());
                self.route(packet, None);
            }
        }
    }

    fn peer_on_hello(&mut self, token: Token, hello: Packet) {
        let header = *hello.header();
        let id = PeerId {
            content_id: header.src.content_id,
            dbid: header.src.dbid,
        };
        let ack_key = Key::from_c2p(&header).reverse();
        self.free(hello);

        let Some(peer) = self.peers.get_mut(&token) else {
            return;
        };
        peer.received_hello = true;
        peer.id = Some(id);
        info!("{}: received HELLO", peer.name());

        let previous = self.peer_registry.get(&id).copied().filter(|t| *t != token);
        if let Some(other) = previous {
            self.peer_supersede(other, token);
        }
        self.peer_registry.insert(id, token);

        let Some(peer) = self.peers.get_mut(&token) else {
            return;
        };
        match Packet::message(&mut self.pool, MessageType::HelloAck, &ack_key) {
            Ok(ack) => {
                peer.sending += 1;
                self.write(token, ack, 0, Completion::PeerHelloAck(token));
            }
            Err(e) => {
                warn!("{}: fail to build HELLO ACK: {e}", peer.name());
                self.peer_lost(token);
            }
        }
    }

    /// `newer` replaces `older` as the connection to the same node.
    fn peer_supersede(&mut self, older: Token, newer: Token) {
        let Some(old) = self.peers.get_mut(&older) else {
            return;
        };
        let queue = mem::take(&mut old.queue);

        if old.link == Link::Idle {
            info!("{}: replaced by the accepted connection", old.name());
            self.peers.remove(&older);
        } else {
            old.legacy = true;
            info!("{}: superseded by a newer connection", old.name());
        }

        if let Some(peer) = self.peers.get_mut(&newer) {
            if !queue.is_empty() {
                info!(
                    "{}: took over {} queued packets",
                    peer.name(),
                    queue.len()
                );
            }
            peer.queue.extend(queue);
        }
    }

    pub(super) fn peer_on_sent_hello_ack(&mut self, token: Token, status: Status) {
        let Some(peer) = self.peers.get_mut(&token) else {
            return;
        };
        peer.sending -= 1;

        if let Err(kind) = status {
            warn!("{}: fail to send HELLO ACK: {kind}", peer.name());
            self.peer_lost(token);
            return;
        }

        peer.sent_hello_ack = true;
        info!("{}: sent HELLO ACK", peer.name());
        self.peer_flush_queue(token);
    }

    /// Sends `packet` on the peer, or queues it until the handshake is done.
    pub(super) fn peer_route_data(
        &mut self,
        token: Token,
        packet: Packet,
        completion: Option<Completion>,
    ) {
        let Some(peer) = self.peers.get_mut(&token) else {
            self.discard(packet, completion);
            return;
        };

        if peer.is_ready() {
            self.peer_write(token, packet, completion);
        } else if peer.closing || peer.legacy || peer.shut != HalfClose::Open {
            self.discard(packet, completion);
        } else {
            debug!("{}: not ready, queue {packet}", peer.name());
            peer.queue.push_back(Delay { packet, completion });
        }
    }

    fn peer_write(&mut self, token: Token, packet: Packet, completion: Option<Completion>) {
        if let Some(peer) = self.peers.get_mut(&token) {
            peer.sending += 1;
        }
        self.write(
            token,
            packet,
            0,
            Completion::PeerData {
                peer: token,
                then: completion.map(Box::new),
            },
        );
    }

    fn peer_flush_queue(&mut self, token: Token) {
        let Some(peer) = self.peers.get_mut(&token) else {
            return;
        };
        if !peer.is_ready() {
            return;
        }

        if peer.queued() > 0 {
            info!("{}: flushing {} queued packets", peer.name(), peer.queued());
        }
        let queue = mem::take(&mut peer.queue);
        for Delay { packet, completion } in queue {
            self.peer_write(token, packet, completion);
        }
    }

    pub(super) fn peer_on_sent_data(
        &mut self,
        token: Token,
        then: Option<Box<Completion>>,
        status: Status,
    ) {
        if let Some(peer) = self.peers.get_mut(&token) {
            peer.sending -= 1;
        }

        if let Some(then) = then {
            self.complete(*then, status);
        }

        if let Err(kind) = status {
            warn!("{}: fail to send: {kind}", self.peer_name(token));
            self.peer_lost(token);
        }
    }

    pub(super) fn peer_eof(&mut self, token: Token, error: Option<io::Error>) {
        match error {
            Some(e) => warn!("{}: fail to receive: {e}", self.peer_name(token)),
            None => info!("{}: received EOF", self.peer_name(token)),
        }

        self.effects.push(Effect::StopRead(token));
        self.peer_lost(token);
    }

    /// The connection is unusable: the node's clients lose their remote end,
    /// unless a newer connection already took over.
    fn peer_lost(&mut self, token: Token) {
        let Some(peer) = self.peers.get_mut(&token) else {
            return;
        };
        if peer.closing {
            return;
        }
        // nothing more is written, the clients' BYEs fail right away
        peer.shut = HalfClose::Shutted;
        let peer = &*peer;

        let current = peer
            .id
            .filter(|id| !peer.legacy && self.peer_registry.get(id) == Some(&token));
        if let Some(id) = current {
            self.shutdown_by_dbid(id.dbid);
        }

        self.peer_close(token);
    }

    /// Tells a ready peer this node is going away; any other peer is closed.
    pub(super) fn peer_quit(&mut self, token: Token) {
        let Some(peer) = self.peers.get_mut(&token) else {
            return;
        };
        if peer.closing || peer.shut != HalfClose::Open {
            return;
        }
        if !peer.is_ready() {
            self.peer_close(token);
            return;
        }
        let Some(id) = peer.id else {
            self.peer_close(token);
            return;
        };

        info!("{}: sending PEER QUIT", peer.name());
        peer.shut = HalfClose::Shutting;

        let key = Self::handshake_key(self.me, id);
        match Packet::message(&mut self.pool, MessageType::PeerQuit, &key) {
            Ok(quit) => {
                if let Some(peer) = self.peers.get_mut(&token) {
                    peer.sending += 1;
                }
                self.write(token, quit, 0, Completion::PeerQuit(token));
            }
            Err(e) => {
                warn!("{}: fail to build PEER QUIT: {e}", self.peer_name(token));
                self.peer_close(token);
            }
        }
    }

    pub(super) fn peer_on_sent_quit(&mut self, token: Token, status: Status) {
        let Some(peer) = self.peers.get_mut(&token) else {
            return;
        };
        peer.sending -= 1;

        if let Err(kind) = status {
            warn!("{}: fail to send PEER QUIT: {kind}", peer.name());
            self.peer_close(token);
            return;
        }

        self.effects.push(Effect::Shutdown(token));
    }

    pub(super) fn peer_on_shutdown(&mut self, token: Token, result: io::Result<()>) {
        let Some(peer) = self.peers.get_mut(&token) else {
            return;
        };

        match result {
            Ok(()) => info!("{}: shutted down", peer.name()),
            Err(e) => warn!("{}: fail to shutdown: {e}", peer.name()),
        }
        peer.shut = HalfClose::Shutted;

        self.peer_close(token);
    }

    fn peer_close(&mut self, token: Token) {
        let Some(peer) = self.peers.get_mut(&token) else {
            return;
        };
        if peer.closing {
            return;
        }
        peer.closing = true;
        info!("{}: closing", peer.name());

        let queue = mem::take(&mut peer.queue);
        let has_socket = peer.link != Link::Idle;
        if let Some(id) = peer.id {
            if self.peer_registry.get(&id) == Some(&token) {
                self.peer_registry.remove(&id);
            }
        }

        for Delay { packet, completion } in queue {
            self.discard(packet, completion);
        }

        if let Some(mut peer) = self.peers.remove(&token) {
            peer.ibuf.release(&mut self.pool);
        }
        if has_socket {
            self.effects.push(Effect::Close(token));
        }

        self.check_quit();
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        packet::HEADER_SIZE,
        proxy::harness::{Harness, b2c, message_type},
    };

    use super::*;

    const ADDRS: &str = "1:-1:127.0.0.1:7000,2:0:127.0.0.1:7001,3:1:127.0.0.1:7002";

    fn flow(local: Endpoint, remote: Endpoint) -> Key {
        Key {
            session_id: 4,
            command_id: 2,
            send_slice: 1,
            recv_slice: 2,
            local,
            remote,
        }
    }

    /// HELLO as sent by the proxy of `(content_id, dbid)` to `to`.
    fn hello_from(h: &mut Harness, content_id: i16, dbid: u16, to: PeerId) -> Vec<u8> {
        let key = Key {
            session_id: 0,
            command_id: 0,
            send_slice: 0,
            recv_slice: 0,
            local: Endpoint::new(content_id, dbid, 4242),
            remote: Endpoint::new(to.content_id, to.dbid, 0),
        };
        h.wire(MessageType::Hello, &key, b"")
    }

    /// HELLO ACK of seg0,dbid2 answering this node's HELLO.
    fn hello_ack_from_seg0(h: &mut Harness) -> Vec<u8> {
        let id = PeerId {
            content_id: 0,
            dbid: 2,
        };
        let key = Proxy::handshake_key(h.proxy.identity(), id).reverse();
        h.wire(MessageType::HelloAck, &key, b"")
    }

    fn connect_token(h: &Harness, port: u16) -> Token {
        h.connects
            .iter()
            .find(|(_, addr)| addr.port() == port)
            .map(|(t, _)| *t)
            .unwrap()
    }

    #[test]
    fn dials_lower_nodes_only() {
        let mut h = Harness::new(2, 0, ADDRS);
        h.proxy.maintain();
        h.pump();

        // seg-1,dbid1 is lower, seg1,dbid3 dials us
        assert_eq!(h.connects.len(), 1);
        assert_eq!(h.connects[0].1.port(), 7000);

        // nothing new while the connect is pending
        h.proxy.maintain();
        h.pump();
        assert_eq!(h.connects.len(), 1);
    }

    #[test]
    fn failed_connect_is_retried() {
        let mut h = Harness::new(2, 0, ADDRS);
        h.proxy.maintain();
        h.pump();
        let conn = connect_token(&h, 7000);

        h.proxy
            .on_connected(conn, Err(io::ErrorKind::ConnectionRefused.into()));
        h.pump();
        h.proxy.maintain();
        h.pump();

        assert_eq!(h.connects.len(), 2);
        assert_eq!(h.connects[1].0, conn);
    }

    #[test]
    fn initiator_handshake_flushes_the_queue() {
        let mut h = Harness::new(3, 1, ADDRS);
        let client = flow(Endpoint::new(1, 3, 10), Endpoint::new(0, 2, 20));
        let backend = h.connect_backend(&client);
        h.take_written(backend);

        h.proxy.on_read(backend, &b2c(b"first"));
        h.pump();
        // EOF forces the partial DATA out
        h.proxy.on_eof(backend, None);
        h.pump();

        let conn = connect_token(&h, 7001);
        assert!(h.take_written(conn).is_empty());

        h.proxy.on_connected(conn, Ok(()));
        h.pump();
        let sent = h.take_written(conn);
        assert_eq!(sent.len(), 1);
        assert_eq!(message_type(&sent[0]), MessageType::Hello);
        assert!(h.reading.contains(&conn));

        let ack = hello_ack_from_seg0(&mut h);
        h.proxy.on_read(conn, &ack);
        h.pump();

        let sent = h.take_written(conn);
        let types: Vec<_> = sent.iter().map(|b| message_type(b)).collect();
        assert_eq!(types, vec![MessageType::Data, MessageType::Bye]);
        assert_eq!(&sent[0][HEADER_SIZE..], &b2c(b"first")[..]);
    }

    #[test]
    fn unexpected_packet_during_handshake_drops_the_peer() {
        let mut h = Harness::new(3, 1, ADDRS);
        h.proxy.maintain();
        h.pump();
        let conn = connect_token(&h, 7001);
        h.proxy.on_connected(conn, Ok(()));
        h.pump();

        let key = flow(Endpoint::new(0, 2, 1), Endpoint::new(1, 3, 1));
        let data = h.wire(MessageType::Data, &key, b"early");
        h.proxy.on_read(conn, &data);
        h.pump();

        assert!(h.closed.contains(&conn));
        assert_eq!(h.proxy.peer_count(), 1);
    }

    #[test]
    fn acceptor_takes_over_the_idle_peer_queue() {
        let mut h = Harness::new(2, 0, ADDRS);
        let me = h.proxy.identity().peer_id();

        // routed toward seg1,dbid3 before it connected: queued on an idle peer
        let key = flow(Endpoint::new(0, 2, 20), Endpoint::new(1, 3, 30));
        let data = h.wire(MessageType::Data, &key, b"queued");
        let packet = Packet::from_wire(&mut h.proxy.pool, &data).unwrap();
        h.proxy.route(packet, None);
        h.pump();
        assert_eq!(h.proxy.peer_count(), 1);
        assert!(h.connects.is_empty());

        let conn = h.proxy.on_peer_accepted();
        h.pump();
        let hello = hello_from(&mut h, 1, 3, me);
        h.proxy.on_read(conn, &hello);
        h.pump();

        assert_eq!(h.proxy.peer_count(), 1);
        let sent = h.take_written(conn);
        let types: Vec<_> = sent.iter().map(|b| message_type(b)).collect();
        assert_eq!(types, vec![MessageType::HelloAck, MessageType::Data]);
        assert_eq!(sent[1], data);
    }

    #[test]
    fn reconnect_marks_the_old_connection_legacy() {
        let mut h = Harness::new(2, 0, ADDRS);
        let me = h.proxy.identity().peer_id();
        let local = flow(Endpoint::new(0, 2, 20), Endpoint::new(1, 3, 30));
        let backend = h.connect_backend(&local);

        let old = h.proxy.on_peer_accepted();
        let hello = hello_from(&mut h, 1, 3, me);
        h.proxy.on_read(old, &hello);
        h.pump();

        let new = h.proxy.on_peer_accepted();
        h.proxy.on_read(new, &hello);
        h.pump();
        assert_eq!(h.proxy.peer_count(), 2);
        assert!(h.proxy.peers[&old].name().contains("legacy"));

        // losing the legacy connection does not affect the clients
        h.proxy.on_eof(old, None);
        h.pump();
        assert!(h.closed.contains(&old));
        assert!(!h.shut.contains(&backend));

        // losing the current one does
        h.proxy.on_eof(new, None);
        h.pump();
        assert!(h.closed.contains(&new));
        assert!(h.shut.contains(&backend));
    }

    #[test]
    fn peer_quit_shuts_down_the_node_clients() {
        let mut h = Harness::new(2, 0, ADDRS);
        let me = h.proxy.identity().peer_id();
        let local = flow(Endpoint::new(0, 2, 20), Endpoint::new(1, 3, 30));
        let backend = h.connect_backend(&local);
        let other = flow(Endpoint::new(0, 2, 21), Endpoint::new(-1, 1, 31));
        let untouched = h.connect_backend(&other);

        let conn = h.proxy.on_peer_accepted();
        let hello = hello_from(&mut h, 1, 3, me);
        h.proxy.on_read(conn, &hello);
        h.pump();

        let quit = h.wire(MessageType::PeerQuit, &local.reverse(), b"");
        h.proxy.on_read(conn, &quit);
        h.pump();

        assert!(h.closed.contains(&conn));
        assert!(h.shut.contains(&backend));
        assert!(!h.shut.contains(&untouched));
    }

    #[test]
    fn quit_says_goodbye_to_ready_peers() {
        let mut h = Harness::new(3, 1, ADDRS);
        h.proxy.maintain();
        h.pump();
        let ready = connect_token(&h, 7001);
        let pending = connect_token(&h, 7000);

        h.proxy.on_connected(ready, Ok(()));
        h.pump();
        let ack = hello_ack_from_seg0(&mut h);
        h.proxy.on_read(ready, &ack);
        h.pump();
        h.take_written(ready);

        h.proxy.quit(false);
        h.pump();

        let sent = h.take_written(ready);
        assert_eq!(sent.len(), 1);
        assert_eq!(message_type(&sent[0]), MessageType::PeerQuit);
        assert!(h.shut.contains(&ready));
        assert!(h.closed.contains(&ready));
        assert!(h.closed.contains(&pending));
        assert!(h.proxy.is_finished());
        assert_eq!(h.proxy.exit_code(), 0);
    }
}
