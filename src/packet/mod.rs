//! Packets and the buffers that carry them.
//!
//! # Overview
//!
//! Everything the proxy moves between backends and remote proxies is a
//! [`Packet`]: a fixed [`Header`] followed by an optional payload, stored in a
//! uniform-size [`Block`] borrowed from a [`PacketPool`]. A packet has exactly
//! one owner at a time and goes back to the pool exactly once.
//!
//! The header doubles as the addressing scheme. A [`Key`] names one
//! backend-to-backend flow from the local point of view and carries the
//! `(session, command)` epoch used to tell stale packets from early ones.
//!
//! Byte streams are turned into packets (and back) by the framing buffers in
//! [`iobuf`], which understand both the proxy-to-proxy dialect and the
//! length-prefixed dialect spoken by backends once their handshake is done.
//!
//! # See Also
//!
//! - [`proxy`](crate::proxy): the state machines consuming these packets.
pub mod iobuf;
pub mod key;
pub mod pool;
pub mod wire;

pub use iobuf::{B2C_HEADER_SIZE, Dialect, FramingError, InputBuffer, OutputBuffer};
pub use key::{Key, Liveness};
pub use pool::{Block, PacketPool, PoolError};
pub use wire::{Endpoint, HEADER_SIZE, Header, MessageType, Packet, WireError};

/// Default pool block size: 8 KiB of payload plus one header.
pub const DEFAULT_BLOCK_SIZE: usize = 8192 + HEADER_SIZE;
