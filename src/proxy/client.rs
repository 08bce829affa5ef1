//! Client connections: the proxy side of one local backend flow.
//!
//! # Lifecycle
//!
//! 1. The backend connects to the Unix socket and sends one p2p HELLO whose
//!    addressing is the flow's [`Key`]. The proxy answers HELLO ACK, and only
//!    once the ACK is written registers the client under its key, so no peer
//!    can route DATA to it before the backend knows the handshake is done.
//! 2. From then on the backend speaks b2c frames. Incoming frames are
//!    coalesced into p2p DATA packets and routed; p2p DATA addressed to the
//!    flow is written to the backend minus its header.
//! 3. The two directions shut down independently. c2p (backend to proxy)
//!    ends with a BYE sent to the remote end; p2c (proxy to backend) ends
//!    with a half-close of the socket, triggered by the remote BYE. The
//!    client closes once both are done and no write is in flight.
//!
//! # Placeholders and successors
//!
//! DATA may arrive before its backend connects. The router then creates a
//! socket-less placeholder registered under the key, which only caches. The
//! real client replaces it on registration and replays the cache in order.
//!
//! Two statements of one query may reuse a key. If a backend registers while
//! the previous client of the same key is still shutting down, it is queued
//! as that client's successor and registered when the previous one goes.
use std::{collections::VecDeque, io, mem};

use log::{debug, info, warn};

use crate::packet::{
    Dialect, HEADER_SIZE, Header, InputBuffer, Key, Liveness, MessageType, OutputBuffer, Packet,
};

use super::{Completion, Effect, PAUSE_HIGH, Proxy, ProxyError, RESUME_LOW, Status, Token};

/// Progress of one direction of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum HalfClose {
    Open,
    Shutting,
    Shutted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pause {
    Running,
    /// Asked to pause; stops reading once the input buffer is drained.
    Pausing,
    Paused,
}

#[derive(Debug)]
pub(super) struct Client {
    key: Option<Key>,
    placeholder: bool,
    registered: bool,
    received_hello: bool,
    sent_hello_ack: bool,
    c2p: HalfClose,
    p2c: HalfClose,
    pause: Pause,
    /// A PAUSE was sent to the remote sender and not yet revoked.
    remote_pause: bool,
    closing: bool,
    /// DATA written to the backend, not yet completed.
    unconsumed: usize,
    /// Writes and routed messages in flight.
    sending: usize,
    ibuf: InputBuffer,
    obuf: OutputBuffer,
    successor: Option<Token>,
    cache: VecDeque<Packet>,
}

impl Client {
    fn new() -> Self {
        Self {
            key: None,
            placeholder: false,
            registered: false,
            received_hello: false,
            sent_hello_ack: false,
            c2p: HalfClose::Open,
            p2c: HalfClose::Open,
            pause: Pause::Running,
            remote_pause: false,
            closing: false,
            unconsumed: 0,
            sending: 0,
            // handshake messages are p2p packets
            ibuf: InputBuffer::new(Dialect::P2p),
            obuf: OutputBuffer::new(Dialect::P2p),
            successor: None,
            cache: VecDeque::new(),
        }
    }

    fn placeholder(key: Key) -> Self {
        Self {
            key: Some(key),
            placeholder: true,
            ..Self::new()
        }
    }

    pub(super) fn is_placeholder(&self) -> bool {
        self.placeholder
    }

    pub(super) fn name(&self) -> String {
        let suffix = if self.placeholder { ".placeholder" } else { "" };
        match &self.key {
            Some(key) => format!("client{suffix}{key}"),
            None => format!("client{suffix}"),
        }
    }

    fn in_data_phase(&self) -> bool {
        self.sent_hello_ack && self.registered && !self.placeholder
    }

    fn ready_to_close(&self) -> bool {
        self.sending == 0 && self.c2p == HalfClose::Shutted && self.p2c == HalfClose::Shutted
    }

    fn cache_p2c_packet(&mut self, packet: Packet) {
        self.cache.push_back(packet);
        debug!(
            "{}: cached a {} for future use, {} in the list",
            self.name(),
            self.cache.back().map(ToString::to_string).unwrap_or_default(),
            self.cache.len()
        );
    }
}

impl Proxy {
    pub(super) fn client_name(&self, token: Token) -> String {
        self.clients
            .get(&token)
            .map_or_else(|| format!("client{token}"), Client::name)
    }

    pub(super) fn client_accept(&mut self) -> Token {
        let token = self.alloc_token();
        self.clients.insert(token, Client::new());
        info!("ic-proxy-server: new client {token} to the server");

        self.effects.push(Effect::StartRead(token));
        token
    }

    /// Finds the client registered under `key`, creating a placeholder if
    /// there is none.
    pub(super) fn client_blessed_lookup(&mut self, key: Key) -> Token {
        if let Some(&token) = self.registry.get(&key) {
            return token;
        }

        let token = self.alloc_token();
        let mut client = Client::placeholder(key);
        client.registered = true;
        info!("{}: registered as a placeholder", client.name());

        self.clients.insert(token, client);
        self.registry.insert(key, token);
        token
    }

    pub(super) fn client_read(&mut self, token: Token, data: &[u8]) {
        let Some(client) = self.clients.get(&token) else {
            return;
        };

        if !client.received_hello {
            self.client_on_hello_data(token, data);
        } else if client.in_data_phase() {
            self.client_on_c2p_data(token, data);
        } else {
            warn!(
                "{}: dropping {} bytes received before the handshake is done",
                client.name(),
                data.len()
            );
        }
    }

    fn client_on_hello_data(&mut self, token: Token, data: &[u8]) {
        let Some(client) = self.clients.get_mut(&token) else {
            return;
        };

        let mut packets = Vec::new();
        let res = client.ibuf.push(&mut self.pool, data, |pool, bytes| {
            packets.push(Packet::from_wire(pool, bytes)?);
            Ok(())
        });

        if let Err(e) = res {
            warn!("{}: fail to receive HELLO: {e}", client.name());
            for packet in packets {
                self.free(packet);
            }
            self.effects.push(Effect::StopRead(token));
            self.client_shutdown_c2p(token);
            return;
        }

        let mut packets = packets.into_iter();
        if let Some(hello) = packets.next() {
            self.client_on_hello_pkt(token, hello);
        }
        for extra in packets {
            warn!(
                "{}: unexpected {extra} after HELLO, dropping it",
                self.client_name(token)
            );
            self.free(extra);
        }
    }

    fn client_on_hello_pkt(&mut self, token: Token, hello: Packet) {
        // only one HELLO is expected
        self.effects.push(Effect::StopRead(token));

        if !hello.is(MessageType::Hello) {
            warn!("{}: invalid {hello}", self.client_name(token));
            self.free(hello);
            self.client_shutdown_c2p(token);
            return;
        }

        let key = Key::from_c2p(hello.header());
        self.free(hello);

        let Some(client) = self.clients.get_mut(&token) else {
            return;
        };
        client.received_hello = true;
        client.key = Some(key);
        info!("{}: received HELLO from the backend", client.name());

        match Packet::message(&mut self.pool, MessageType::HelloAck, &key.reverse()) {
            Ok(ack) => {
                client.sending += 1;
                self.write(token, ack, 0, Completion::HelloAck(token));
            }
            Err(e) => {
                warn!("{}: fail to build HELLO ACK: {e}", self.client_name(token));
                self.client_shutdown_c2p(token);
            }
        }
    }

    pub(super) fn client_on_sent_hello_ack(&mut self, token: Token, status: Status) {
        let Some(client) = self.clients.get_mut(&token) else {
            return;
        };
        client.sending -= 1;

        if let Err(kind) = status {
            warn!("{}: fail to send HELLO ACK: {kind}", client.name());
            self.client_shutdown_c2p(token);
            return;
        }
        if client.c2p != HalfClose::Open {
            // the backend went away while the ACK was on its way
            self.client_maybe_close(token);
            return;
        }

        client.sent_hello_ack = true;
        self.client_register(token);
        self.client_maybe_start_read_data(token);
    }

    fn client_register(&mut self, token: Token) {
        let Some(client) = self.clients.get(&token) else {
            return;
        };
        let Some(key) = client.key else {
            return;
        };
        if client.registered {
            warn!("{}: double register", client.name());
            return;
        }

        let previous = self.registry.get(&key).copied().filter(|t| *t != token);
        if let Some(other) = previous {
            match self.clients.get(&other).map(Client::is_placeholder) {
                Some(false) => {
                    // the client of the previous statement with the same key
                    // is still shutting down
                    warn!(
                        "{}: delay the register as the previous client is still shutting down",
                        self.client_name(token)
                    );

                    let Some(prev) = self.clients.get_mut(&other) else {
                        return;
                    };
                    if prev.successor.is_some() {
                        warn!(
                            "{}: the previous client already has a successor",
                            self.client_name(token)
                        );
                        self.client_shutdown_c2p(token);
                        return;
                    }

                    prev.successor = Some(token);
                    return;
                }
                Some(true) => {
                    let Some(placeholder) = self.clients.remove(&other) else {
                        return;
                    };
                    info!(
                        "{}: replace my placeholder {}",
                        self.client_name(token),
                        placeholder.name()
                    );
                    if placeholder.cache.is_empty() {
                        info!(
                            "{}: no cached pkts in the placeholder",
                            self.client_name(token)
                        );
                    }

                    if let Some(client) = self.clients.get_mut(&token) {
                        let count = placeholder.cache.len();
                        client.cache.extend(placeholder.cache);
                        debug!(
                            "{}: cached {count} pkts for future use, {} in the list",
                            client.name(),
                            client.cache.len()
                        );
                    }
                }
                None => {}
            }
        }

        self.registry.insert(key, token);
        if let Some(client) = self.clients.get_mut(&token) {
            client.registered = true;
            info!(
                "{}: registered, {} in total",
                client.name(),
                self.registry.len()
            );
        }
    }

    fn client_unregister(&mut self, token: Token) {
        let Some(client) = self.clients.get_mut(&token) else {
            return;
        };
        let Some(key) = client.key else {
            return;
        };
        if !client.registered {
            return;
        }

        client.registered = false;
        let successor = client.successor.take();
        // packets cached while shutting down belong to the next statement
        let leftover = match successor {
            Some(_) => mem::take(&mut client.cache),
            None => VecDeque::new(),
        };

        if self.registry.get(&key) == Some(&token) {
            self.registry.remove(&key);
        }
        info!(
            "{}: unregistered, {} in total",
            self.client_name(token),
            self.registry.len()
        );

        let Some(successor) = successor else {
            return;
        };
        let name = self.client_name(token);
        match self.clients.get_mut(&successor) {
            Some(next) if next.c2p == HalfClose::Open => {
                info!("{name}: re-register my successor");
                for packet in leftover.into_iter().rev() {
                    next.cache.push_front(packet);
                }

                self.client_register(successor);
                self.client_maybe_start_read_data(successor);
            }
            _ => {
                for packet in leftover {
                    self.free(packet);
                }
            }
        }
    }

    fn client_maybe_start_read_data(&mut self, token: Token) {
        let Some(client) = self.clients.get_mut(&token) else {
            return;
        };
        // a delayed register does not start reading until it is done
        if !client.registered {
            return;
        }
        let Some(key) = client.key else {
            return;
        };

        info!("{}: start receiving DATA", client.name());

        // from now on the backend speaks b2c packets
        client.ibuf.clear();
        client.ibuf.switch_dialect(Dialect::B2c);

        let header = Header::new(MessageType::Data, &key);
        if let Err(e) = client.obuf.init_header(&mut self.pool, &header) {
            warn!("{}: fail to set up the obuf: {e}", client.name());
            self.client_shutdown_c2p(token);
            return;
        }

        // packets that arrived before the client
        self.client_handle_p2c_cache(token);

        if let Some(client) = self.clients.get(&token) {
            if client.c2p == HalfClose::Open && client.pause == Pause::Running {
                self.effects.push(Effect::StartRead(token));
            }
        }
    }

    fn client_on_c2p_data(&mut self, token: Token, data: &[u8]) {
        let Some(client) = self.clients.get_mut(&token) else {
            return;
        };

        if client.pause == Pause::Paused {
            debug!(
                "{}: paused already, but still received DATA[{} bytes] from the backend",
                client.name(),
                data.len()
            );
        }
        debug!(
            "{}: received DATA[{} bytes] from the backend",
            client.name(),
            data.len()
        );

        let Client { ibuf, obuf, .. } = client;
        let mut packets = Vec::new();
        let res = ibuf.push(&mut self.pool, data, |pool, frame| {
            obuf.push(pool, frame, |pool, bytes| {
                packets.push(Packet::from_wire(pool, bytes)?);
                Ok(())
            })
        });

        for packet in packets {
            self.route(packet, None);
        }

        if let Err(e) = res {
            warn!("{}: invalid DATA from the backend: {e}", self.client_name(token));
            self.effects.push(Effect::StopRead(token));
            self.client_shutdown_c2p(token);
            return;
        }

        // handle a pending PAUSE
        self.client_maybe_pause(token);
    }

    /// Flushes whatever the backend sent, complete or not, and routes it.
    fn client_flush_c2p(&mut self, token: Token, force: bool) -> Result<(), ProxyError> {
        let Some(client) = self.clients.get_mut(&token) else {
            return Ok(());
        };
        if !client.in_data_phase() {
            return Ok(());
        }

        if force && !client.ibuf.is_empty() {
            info!(
                "{}: the ibuf still contains {} bytes, flush before shutting down",
                client.name(),
                client.ibuf.len()
            );
        }

        let Client { ibuf, obuf, .. } = client;
        let mut packets = Vec::new();
        let mut res = Ok(());

        if force && !ibuf.is_empty() {
            res = ibuf.push(&mut self.pool, &[], |pool, frame| {
                obuf.push(pool, frame, |pool, bytes| {
                    packets.push(Packet::from_wire(pool, bytes)?);
                    Ok(())
                })
            });
        }
        if res.is_ok() {
            res = obuf.flush(&mut self.pool, |pool, bytes| {
                packets.push(Packet::from_wire(pool, bytes)?);
                Ok(())
            });
        }

        for packet in packets {
            self.route(packet, None);
        }
        Ok(res?)
    }

    pub(super) fn client_eof(&mut self, token: Token, error: Option<io::Error>) {
        let Some(client) = self.clients.get(&token) else {
            return;
        };

        let stage = if client.in_data_phase() { "DATA" } else { "HELLO" };
        match error {
            Some(e) => warn!("{}: fail to receive {stage}: {e}", client.name()),
            None => info!("{}: received EOF while waiting for {stage}", client.name()),
        }

        if let Err(e) = self.client_flush_c2p(token, true) {
            warn!("{}: fail to flush: {e}", self.client_name(token));
        }

        // stop reading from the backend and tell the other end
        self.effects.push(Effect::StopRead(token));
        self.client_shutdown_c2p(token);
    }

    pub(super) fn client_on_p2c_data(&mut self, token: Token, packet: Packet) {
        let Some(client) = self.clients.get_mut(&token) else {
            self.free(packet);
            return;
        };

        // a placeholder never sends, it only caches
        if client.placeholder {
            client.cache_p2c_packet(packet);
            return;
        }

        let Some(key) = client.key else {
            self.free(packet);
            return;
        };
        if !packet.header().is_to_client(&key) {
            warn!("{}: the {packet} is not to me", client.name());
            self.free(packet);
            return;
        }

        // a BYE after ours was handled ends the successor's statement
        if packet.is(MessageType::Bye) && client.p2c != HalfClose::Open {
            client.cache_p2c_packet(packet);
            return;
        }

        // control messages always apply to the current connection
        if !packet.is(MessageType::Data) {
            self.client_on_p2c_message(token, &packet);
            self.free(packet);
            return;
        }

        match packet.header().liveness(&key) {
            Liveness::OutOfDate => {
                debug!("{}: drop out-of-date {packet}", client.name());
                self.free(packet);
            }
            Liveness::Future => {
                debug!("{}: future {packet}", client.name());
                client.cache_p2c_packet(packet);
            }
            // a client and its successor share the key, so a packet of the
            // next statement looks live; only the state tells them apart
            Liveness::Live if client.p2c != HalfClose::Open || !client.registered => {
                client.cache_p2c_packet(packet);
            }
            Liveness::Live => {
                client.unconsumed += 1;
                client.sending += 1;
                self.write(token, packet, HEADER_SIZE, Completion::P2cData(token));
                self.client_maybe_request_pause(token);
            }
        }
    }

    fn client_on_p2c_message(&mut self, token: Token, packet: &Packet) {
        info!("{}: received {packet}", self.client_name(token));

        match packet.message_type() {
            MessageType::Bye => {
                self.client_maybe_resume(token);
                self.client_shutdown_p2c(token);
            }
            MessageType::Pause => {
                if let Some(client) = self.clients.get_mut(&token) {
                    // only stops reading once the b2c ibuf is drained
                    if client.pause == Pause::Running {
                        client.pause = Pause::Pausing;
                    }
                }
                self.client_maybe_pause(token);
            }
            MessageType::Resume => self.client_maybe_resume(token),
            other => warn!(
                "{}: unsupported message {other}",
                self.client_name(token)
            ),
        }
    }

    fn client_handle_p2c_cache(&mut self, token: Token) {
        let Some(client) = self.clients.get_mut(&token) else {
            return;
        };
        if client.placeholder || client.cache.is_empty() {
            return;
        }

        // detach first, replaying may cache again
        let cached = mem::take(&mut client.cache);
        let total = cached.len();
        info!(
            "{}: trying to consume the {total} cached pkts",
            client.name()
        );

        for packet in cached {
            self.client_on_p2c_data(token, packet);
        }

        if let Some(client) = self.clients.get(&token) {
            info!(
                "{}: consumed {} cached pkts",
                client.name(),
                total - client.cache.len().min(total)
            );
        }
    }

    pub(super) fn client_on_sent_p2c_data(&mut self, token: Token, status: Status) {
        let Some(client) = self.clients.get_mut(&token) else {
            return;
        };
        client.unconsumed -= 1;
        client.sending -= 1;

        // the backend errored out
        if status.is_err() {
            self.client_shutdown_c2p(token);
        }

        self.client_maybe_request_resume(token);
        self.client_maybe_close(token);
    }

    fn client_maybe_request_pause(&mut self, token: Token) {
        let Some(client) = self.clients.get_mut(&token) else {
            return;
        };
        debug!(
            "{}: {} unconsumed packets to the backend",
            client.name(),
            client.unconsumed
        );

        if client.unconsumed < PAUSE_HIGH || client.remote_pause {
            return;
        }
        let Some(key) = client.key else {
            return;
        };

        match Packet::message(&mut self.pool, MessageType::Pause, &key) {
            Ok(pause) => {
                // set now rather than on completion so that a fast sender
                // does not trigger a second PAUSE
                client.remote_pause = true;
                client.sending += 1;
                self.route(pause, Some(Completion::C2pPause(token)));
            }
            Err(e) => warn!("{}: fail to build PAUSE: {e}", client.name()),
        }
    }

    fn client_maybe_request_resume(&mut self, token: Token) {
        let Some(client) = self.clients.get_mut(&token) else {
            return;
        };
        debug!(
            "{}: {} unconsumed packets to the backend",
            client.name(),
            client.unconsumed
        );

        if client.unconsumed > RESUME_LOW || !client.remote_pause {
            return;
        }
        let Some(key) = client.key else {
            return;
        };

        match Packet::message(&mut self.pool, MessageType::Resume, &key) {
            Ok(resume) => {
                client.remote_pause = false;
                client.sending += 1;
                self.route(resume, Some(Completion::C2pResume(token)));
            }
            Err(e) => warn!("{}: fail to build RESUME: {e}", client.name()),
        }
    }

    pub(super) fn client_on_sent_c2p_message(&mut self, token: Token, status: Status) {
        if status.is_err() {
            self.client_shutdown_p2c(token);
        }

        if let Some(client) = self.clients.get_mut(&token) {
            client.sending -= 1;
        }
        self.client_maybe_close(token);
    }

    fn client_maybe_pause(&mut self, token: Token) {
        let Some(client) = self.clients.get_mut(&token) else {
            return;
        };
        if client.pause != Pause::Pausing || !client.ibuf.is_empty() {
            return;
        }

        client.pause = Pause::Paused;
        self.effects.push(Effect::StopRead(token));

        // flush unsent data
        if let Err(e) = self.client_flush_c2p(token, false) {
            warn!("{}: fail to flush: {e}", self.client_name(token));
        }
        info!("{}: paused", self.client_name(token));
    }

    fn client_maybe_resume(&mut self, token: Token) {
        let Some(client) = self.clients.get_mut(&token) else {
            return;
        };
        if client.pause == Pause::Running {
            return;
        }

        if client.pause == Pause::Paused && client.c2p == HalfClose::Open {
            self.effects.push(Effect::StartRead(token));
        }
        client.pause = Pause::Running;
        info!("{}: resumed", client.name());
    }

    pub(super) fn client_shutdown_c2p(&mut self, token: Token) {
        let Some(client) = self.clients.get_mut(&token) else {
            return;
        };
        if client.c2p != HalfClose::Open {
            self.client_maybe_close(token);
            return;
        }

        info!("{}: shutting down c2p", client.name());
        client.c2p = HalfClose::Shutting;

        if client.registered && !client.placeholder {
            if let Some(key) = client.key {
                match Packet::message(&mut self.pool, MessageType::Bye, &key) {
                    Ok(bye) => {
                        client.sending += 1;
                        self.route(bye, Some(Completion::C2pBye(token)));
                        return;
                    }
                    Err(e) => warn!("{}: fail to build BYE: {e}", client.name()),
                }
            }
        }

        if let Some(client) = self.clients.get_mut(&token) {
            client.c2p = HalfClose::Shutted;
            info!("{}: shutted down c2p", client.name());
        }
        self.client_shutdown_p2c(token);
    }

    pub(super) fn client_on_sent_c2p_bye(&mut self, token: Token, status: Status) {
        let Some(client) = self.clients.get_mut(&token) else {
            return;
        };

        if let Err(kind) = status {
            warn!("{}: fail to send BYE: {kind}", client.name());
        }
        info!("{}: shutted down c2p", client.name());

        client.sending -= 1;
        client.c2p = HalfClose::Shutted;
        self.client_maybe_close(token);
    }

    pub(super) fn client_shutdown_p2c(&mut self, token: Token) {
        let Some(client) = self.clients.get_mut(&token) else {
            return;
        };
        if client.p2c != HalfClose::Open {
            self.client_maybe_close(token);
            return;
        }

        info!("{}: shutting down p2c", client.name());
        if client.placeholder {
            client.p2c = HalfClose::Shutted;
            self.client_maybe_close(token);
            return;
        }

        client.p2c = HalfClose::Shutting;
        self.effects.push(Effect::Shutdown(token));
    }

    pub(super) fn client_on_shutdown_p2c(&mut self, token: Token, result: io::Result<()>) {
        let Some(client) = self.clients.get_mut(&token) else {
            return;
        };

        match result {
            Ok(()) => info!("{}: shutted down p2c", client.name()),
            Err(e) => warn!("{}: fail to shutdown p2c: {e}", client.name()),
        }

        client.p2c = HalfClose::Shutted;
        self.client_maybe_close(token);
    }

    fn client_maybe_close(&mut self, token: Token) {
        if self
            .clients
            .get(&token)
            .is_some_and(Client::ready_to_close)
        {
            self.client_close(token);
        }
    }

    fn client_close(&mut self, token: Token) {
        let Some(client) = self.clients.get_mut(&token) else {
            return;
        };
        if client.closing {
            return;
        }
        client.closing = true;

        self.client_unregister(token);

        info!("{}: closing", self.client_name(token));
        self.effects.push(Effect::Close(token));
        self.client_free(token);

        self.check_quit();
    }

    fn client_free(&mut self, token: Token) {
        let Some(mut client) = self.clients.remove(&token) else {
            return;
        };
        info!("{}: freeing", client.name());

        let name = client.name();
        for packet in client.cache.drain(..) {
            warn!("{name}: unhandled cached {packet}, dropping it");
            self.pool.free(packet.into_block());
        }

        client.ibuf.release(&mut self.pool);
        client.obuf.release(&mut self.pool);
    }

    /// Drops a placeholder and whatever it cached.
    pub(super) fn client_drop_placeholder(&mut self, token: Token) {
        let Some(key) = self.clients.get(&token).and_then(|c| c.key) else {
            return;
        };
        if self.registry.get(&key) == Some(&token) {
            self.registry.remove(&key);
        }
        self.client_free(token);
    }

    /// Shuts down every client talking to the node `dbid`, in both
    /// directions.
    pub(super) fn shutdown_by_dbid(&mut self, dbid: u16) {
        info!("ic-proxy-clients: shutting down all the clients by dbid {dbid}");

        let targets: Vec<Token> = self
            .registry
            .values()
            .copied()
            .filter(|t| {
                self.clients.get(t).is_some_and(|c| {
                    !c.placeholder && c.key.is_some_and(|k| k.remote.dbid == dbid)
                })
            })
            .collect();

        for token in targets {
            self.client_shutdown_c2p(token);
            self.client_shutdown_p2c(token);
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        packet::Endpoint,
        proxy::harness::{Harness, b2c, message_type},
    };

    use super::*;

    const ADDRS: &str = "1:-1:127.0.0.1:7000,2:0:127.0.0.1:7001,3:1:127.0.0.1:7002";

    /// A flow from seg0,dbid2 (this node) to seg1,dbid3.
    fn remote_flow() -> Key {
        Key {
            session_id: 4,
            command_id: 2,
            send_slice: 1,
            recv_slice: 2,
            local: Endpoint::new(0, 2, 10),
            remote: Endpoint::new(1, 3, 20),
        }
    }

    /// Delivers a packet the remote end of `key` sent.
    fn from_remote(h: &mut Harness, kind: MessageType, key: &Key, payload: &[u8]) {
        let bytes = h.wire(kind, &key.reverse(), payload);
        let packet = Packet::from_wire(&mut h.proxy.pool, &bytes).unwrap();
        h.proxy.route(packet, None);
        h.pump();
    }

    /// Accepts seg1,dbid3 as a peer and completes its handshake.
    fn accept_seg1(h: &mut Harness) -> Token {
        let conn = h.proxy.on_peer_accepted();
        let key = Key {
            session_id: 0,
            command_id: 0,
            send_slice: 0,
            recv_slice: 0,
            local: Endpoint::new(1, 3, 4242),
            remote: Endpoint::new(0, 2, 0),
        };
        let hello = h.wire(MessageType::Hello, &key, b"");
        h.proxy.on_read(conn, &hello);
        h.pump();
        conn
    }

    #[test]
    fn handshake_registers_and_starts_reading() {
        let mut h = Harness::new(2, 0, ADDRS);
        let key = remote_flow();
        let conn = h.connect_backend(&key);

        let sent = h.take_written(conn);
        assert_eq!(sent.len(), 1);
        assert_eq!(message_type(&sent[0]), MessageType::HelloAck);
        let ack = Header::decode(&sent[0]).unwrap();
        assert!(ack.is_to_client(&key));

        assert!(h.reading.contains(&conn));
        assert_eq!(h.proxy.client_count(), 1);
        assert_eq!(h.proxy.registry.get(&key), Some(&conn));
    }

    #[test]
    fn handshake_split_across_reads() {
        let mut h = Harness::new(2, 0, ADDRS);
        let key = remote_flow();
        let conn = h.proxy.on_client_accepted();
        h.pump();

        let hello = h.wire(MessageType::Hello, &key, b"");
        h.proxy.on_read(conn, &hello[..5]);
        h.pump();
        assert!(h.take_written(conn).is_empty());

        h.proxy.on_read(conn, &hello[5..]);
        h.pump();
        assert_eq!(h.take_written(conn).len(), 1);
        assert_eq!(h.proxy.registry.get(&key), Some(&conn));
    }

    #[test]
    fn bad_hello_closes_the_client() {
        let mut h = Harness::new(2, 0, ADDRS);
        let conn = h.proxy.on_client_accepted();
        h.pump();

        let data = h.wire(MessageType::Data, &remote_flow(), b"nope");
        h.proxy.on_read(conn, &data);
        h.pump();

        assert!(h.take_written(conn).is_empty());
        assert!(h.closed.contains(&conn));
        assert_eq!(h.proxy.client_count(), 0);
        assert_eq!(h.proxy.pool().in_use(), 0);
    }

    #[test]
    fn eof_during_hello_closes_the_client() {
        let mut h = Harness::new(2, 0, ADDRS);
        let conn = h.proxy.on_client_accepted();
        h.pump();

        h.proxy.on_eof(conn, None);
        h.pump();

        assert!(h.closed.contains(&conn));
        assert_eq!(h.proxy.client_count(), 0);
    }

    #[test]
    fn placeholder_cache_is_replayed_in_order() {
        let mut h = Harness::new(2, 0, ADDRS);
        let key = remote_flow();

        from_remote(&mut h, MessageType::Data, &key, b"p1");
        from_remote(&mut h, MessageType::Data, &key, b"p2");
        assert_eq!(h.proxy.placeholder_count(), 1);

        let conn = h.connect_backend(&key);
        let sent = h.take_written(conn);
        assert_eq!(sent.len(), 3);
        assert_eq!(message_type(&sent[0]), MessageType::HelloAck);
        assert_eq!(sent[1], b"p1");
        assert_eq!(sent[2], b"p2");

        assert_eq!(h.proxy.placeholder_count(), 0);
        assert_eq!(h.proxy.client_count(), 1);
    }

    #[test]
    fn stale_packets_are_dropped_and_future_ones_cached() {
        let mut h = Harness::new(2, 0, ADDRS);
        let key = remote_flow();
        let conn = h.connect_backend(&key);
        h.take_written(conn);

        let stale = Key {
            session_id: 3,
            ..key
        };
        from_remote(&mut h, MessageType::Data, &stale, b"old");
        let future = Key {
            session_id: 5,
            ..key
        };
        from_remote(&mut h, MessageType::Data, &future, b"new");

        assert!(h.take_written(conn).is_empty());
        assert_eq!(h.proxy.clients[&conn].cache.len(), 1);

        from_remote(&mut h, MessageType::Data, &key, b"now");
        assert_eq!(h.take_written(conn), vec![b"now".to_vec()]);
    }

    #[test]
    fn loopback_flow_end_to_end() {
        let mut h = Harness::new(2, 0, ADDRS);
        let sender = Key {
            remote: Endpoint::new(0, 2, 11),
            ..remote_flow()
        };
        let receiver = sender.reverse();
        let a = h.connect_backend(&sender);
        let b = h.connect_backend(&receiver);
        h.take_written(a);
        h.take_written(b);

        let frame = b2c(b"hello");
        h.proxy.on_read(a, &frame);
        h.pump();
        // coalesced until the buffer fills or is forced out
        assert!(h.take_written(b).is_empty());

        h.proxy.on_eof(a, None);
        h.pump();
        assert_eq!(h.take_written(b), vec![frame]);
        assert!(h.shut.contains(&b));
        assert!(!h.closed.contains(&a));

        h.proxy.on_eof(b, None);
        h.pump();
        assert!(h.shut.contains(&a));
        assert!(h.closed.contains(&a));
        assert!(h.closed.contains(&b));
        assert_eq!(h.proxy.client_count(), 0);
        assert_eq!(h.proxy.pool().in_use(), 0);
    }

    #[test]
    fn full_output_buffer_is_flushed_on_overflow() {
        let mut h = Harness::new(2, 0, ADDRS);
        let sender = Key {
            remote: Endpoint::new(0, 2, 11),
            ..remote_flow()
        };
        let a = h.connect_backend(&sender);
        let b = h.connect_backend(&sender.reverse());
        h.take_written(b);

        // 40 + 40 bytes do not fit in one 64 bytes payload
        let first = b2c(&[1; 36]);
        let second = b2c(&[2; 36]);
        h.proxy.on_read(a, &[first.clone(), second].concat());
        h.pump();

        assert_eq!(h.take_written(b), vec![first]);
    }

    #[test]
    fn oversized_frame_shuts_down_the_client() {
        let mut h = Harness::new(2, 0, ADDRS);
        let a = h.connect_backend(&remote_flow());

        h.proxy.on_read(a, &b2c(&[0; 80]));
        h.pump();

        assert!(!h.reading.contains(&a));
        // the BYE waits for the peer, p2c stays open for the remote end
        assert_eq!(h.proxy.peers.values().map(|p| p.queued()).sum::<usize>(), 1);
        assert!(!h.shut.contains(&a));
    }

    #[test]
    fn successor_waits_for_the_previous_client() {
        let mut h = Harness::new(2, 0, ADDRS);
        let key = remote_flow();
        let first = h.connect_backend(&key);
        assert_eq!(message_type(&h.take_written(first)[0]), MessageType::HelloAck);

        // c2p shutting: the BYE waits on the idle peer of seg1,dbid3
        h.proxy.on_eof(first, None);
        h.pump();

        let second = h.connect_backend(&key);
        assert_eq!(message_type(&h.take_written(second)[0]), MessageType::HelloAck);
        assert!(!h.reading.contains(&second));
        assert_eq!(h.proxy.registry.get(&key), Some(&first));

        // the remote BYE ends p2c; DATA of the next statement is kept
        from_remote(&mut h, MessageType::Bye, &key, b"");
        assert!(h.shut.contains(&first));
        from_remote(&mut h, MessageType::Data, &key, b"next");
        assert!(h.take_written(first).is_empty());

        // the peer connects, the BYE goes out and the first client closes
        accept_seg1(&mut h);
        assert!(h.closed.contains(&first));
        assert_eq!(h.proxy.registry.get(&key), Some(&second));
        assert!(h.reading.contains(&second));
        assert_eq!(h.take_written(second), vec![b"next".to_vec()]);
    }

    #[test]
    fn pause_and_resume_hysteresis() {
        let mut h = Harness::new(2, 0, ADDRS);
        let key = remote_flow();
        let backend = h.connect_backend(&key);
        let peer = accept_seg1(&mut h);
        h.take_written(peer);
        h.hold.insert(backend);

        for _ in 0..5 {
            let data = h.wire(MessageType::Data, &key.reverse(), b"x");
            h.proxy.on_read(peer, &data);
            h.pump();
        }
        let sent = h.take_written(peer);
        assert_eq!(sent.len(), 1);
        assert_eq!(message_type(&sent[0]), MessageType::Pause);

        // 5 -> 4 -> 3 unconsumed: still paused
        h.release_one(backend);
        h.release_one(backend);
        h.pump();
        assert!(h.take_written(peer).is_empty());

        h.release_one(backend);
        h.pump();
        let sent = h.take_written(peer);
        assert_eq!(sent.len(), 1);
        assert_eq!(message_type(&sent[0]), MessageType::Resume);

        h.release_one(backend);
        h.release_one(backend);
        h.pump();
        assert!(h.take_written(peer).is_empty());
    }

    #[test]
    fn pause_waits_for_the_input_buffer_to_drain() {
        let mut h = Harness::new(2, 0, ADDRS);
        let key = remote_flow();
        let backend = h.connect_backend(&key);

        let frame = b2c(b"partial");
        h.proxy.on_read(backend, &frame[..3]);
        h.pump();

        from_remote(&mut h, MessageType::Pause, &key, b"");
        assert!(h.reading.contains(&backend));

        h.proxy.on_read(backend, &frame[3..]);
        h.pump();
        assert!(!h.reading.contains(&backend));
        // the pending output went out when pausing
        assert_eq!(h.proxy.peers.values().map(|p| p.queued()).sum::<usize>(), 1);

        from_remote(&mut h, MessageType::Resume, &key, b"");
        assert!(h.reading.contains(&backend));
    }
}
