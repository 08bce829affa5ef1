//! Packet dispatch.
//!
//! A packet is routed by its destination:
//!
//! - `dst.dbid == src.dbid`: both ends live on this node. Delivery is deferred
//!   to the next loop turn through the loopback queue, since the receiving
//!   client may answer (PAUSE, RESUME, BYE) while the sender is still in the
//!   middle of its own update.
//! - `dst.dbid` is this node: delivered to the client registered under the
//!   packet's key, or to a placeholder created for it.
//! - anything else: handed to the peer of the destination node.
use std::{io, mem};

use log::{debug, warn};

use crate::packet::{Key, Packet};

use super::{Completion, Effect, PeerId, Proxy, Status, Token};

/// A packet waiting for its turn, with the completion to run once delivered.
#[derive(Debug)]
pub(super) struct Delay {
    pub(super) packet: Packet,
    pub(super) completion: Option<Completion>,
}

impl Proxy {
    pub(super) fn route(&mut self, packet: Packet, completion: Option<Completion>) {
        let header = *packet.header();

        if header.dst.dbid == header.src.dbid {
            debug!("ic-proxy-router: looping back {packet}");
            self.loopback.push_back(Delay { packet, completion });
        } else if header.dst.dbid == self.me.dbid {
            let token = self.client_blessed_lookup(Key::from_p2c(&header));
            debug!(
                "ic-proxy-router: routing {packet} to {}",
                self.client_name(token)
            );

            self.client_on_p2c_data(token, packet);
            if let Some(completion) = completion {
                self.complete(completion, Ok(()));
            }
        } else {
            let token = self.peer_blessed_lookup(PeerId {
                content_id: header.dst.content_id,
                dbid: header.dst.dbid,
            });
            debug!(
                "ic-proxy-router: routing {packet} to {}",
                self.peer_name(token)
            );

            self.peer_route_data(token, packet, completion);
        }
    }

    /// Delivers everything queued on the loopback path so far. Packets looped
    /// back while draining wait for the next call.
    pub fn run_deferred(&mut self) -> usize {
        let queue = mem::take(&mut self.loopback);
        let count = queue.len();

        for Delay { packet, completion } in queue {
            let token = self.client_blessed_lookup(Key::from_p2c(packet.header()));
            debug!(
                "ic-proxy-router: looped back {packet} to {}",
                self.client_name(token)
            );

            self.client_on_p2c_data(token, packet);
            if let Some(completion) = completion {
                self.complete(completion, Ok(()));
            }
        }

        count
    }

    pub fn has_deferred(&self) -> bool {
        !self.loopback.is_empty()
    }

    /// Sends `packet.as_bytes()[offset..]` on `conn`.
    pub(super) fn write(
        &mut self,
        conn: Token,
        packet: Packet,
        offset: usize,
        completion: Completion,
    ) {
        debug!("ic-proxy-router: sending {packet}");
        self.effects.push(Effect::Write {
            conn,
            packet,
            offset,
            completion,
        });
    }

    /// A write handed out by [`Effect::Write`] finished.
    pub fn on_written(&mut self, packet: Packet, completion: Completion, result: io::Result<()>) {
        let status = match result {
            Ok(()) => {
                debug!("ic-proxy-router: sent {packet}");
                Ok(())
            }
            Err(e) => {
                debug!("ic-proxy-router: fail to send {packet}: {e}");
                Err(e.kind())
            }
        };

        self.free(packet);
        self.complete(completion, status);
    }

    /// Drops a packet that cannot be delivered, failing its completion.
    pub(super) fn discard(&mut self, packet: Packet, completion: Option<Completion>) {
        warn!("ic-proxy-router: dropping undeliverable {packet}");
        self.free(packet);

        if let Some(completion) = completion {
            let status: Status = Err(io::ErrorKind::NotConnected);
            self.complete(completion, status);
        }
    }
}
