//! On-wire packet layout.
//!
//! Every proxy packet starts with a fixed 34-byte header followed by
//! `len - HEADER_SIZE` payload bytes. Only DATA packets carry a payload; the
//! control messages are bare headers.
//!
//! # Binary Format
//!
//! The header is encoded with `bincode` using big-endian, fixed-width
//! integers, so the derived field order below *is* the wire layout:
//!
//! ```text
//! type:i32 len:u16 sessionId:i32 commandId:u32 sendSliceIdx:i16 recvSliceIdx:i16
//! srcContentId:i16 srcDbid:u16 srcPid:i32 dstContentId:i16 dstDbid:u16 dstPid:i32
//! ```
use std::fmt;

use bincode::{
    Decode, Encode,
    config::{BigEndian, Configuration, Fixint},
};
use thiserror::Error;

use super::{
    key::{Key, Liveness},
    pool::{Block, PacketPool, PoolError},
};

/// Encoded size of [`Header`].
pub const HEADER_SIZE: usize = 34;

/// Byte offset of the `len` field inside an encoded header.
pub(crate) const LEN_OFFSET: usize = 4;

#[derive(Debug, Error)]
pub enum WireError {
    #[error("unknown message type {0}")]
    UnknownType(i32),
    #[error("invalid packet length {len}, expected {min}..={max} bytes")]
    BadLength { len: usize, min: usize, max: usize },
    #[error("payload of {size} bytes does not fit in a {block_size} bytes block")]
    Oversized { size: usize, block_size: usize },
    #[error("failed to encode header: {0}")]
    Encode(#[from] bincode::error::EncodeError),
    #[error("failed to decode header: {0}")]
    Decode(#[from] bincode::error::DecodeError),
    #[error(transparent)]
    Pool(#[from] PoolError),
}

pub(crate) fn wire_config() -> Configuration<BigEndian, Fixint> {
    bincode::config::standard()
        .with_big_endian()
        .with_fixed_int_encoding()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum MessageType {
    Data = 0,
    Hello = 1,
    HelloAck = 2,
    Bye = 3,
    Pause = 4,
    Resume = 5,
    PeerQuit = 6,
}

impl TryFrom<i32> for MessageType {
    type Error = WireError;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(MessageType::Data),
            1 => Ok(MessageType::Hello),
            2 => Ok(MessageType::HelloAck),
            3 => Ok(MessageType::Bye),
            4 => Ok(MessageType::Pause),
            5 => Ok(MessageType::Resume),
            6 => Ok(MessageType::PeerQuit),
            other => Err(WireError::UnknownType(other)),
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageType::Data => "DATA",
            MessageType::Hello => "HELLO",
            MessageType::HelloAck => "HELLO ACK",
            MessageType::Bye => "BYE",
            MessageType::Pause => "PAUSE",
            MessageType::Resume => "RESUME",
            MessageType::PeerQuit => "PEER QUIT",
        };
        f.write_str(name)
    }
}

/// One side of a flow: which shard, which physical instance, which process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Encode, Decode)]
pub struct Endpoint {
    pub content_id: i16,
    pub dbid: u16,
    pub pid: i32,
}

impl Endpoint {
    pub fn new(content_id: i16, dbid: u16, pid: i32) -> Self {
        Self {
            content_id,
            dbid,
            pid,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "seg{}:dbid{}:p{}", self.content_id, self.dbid, self.pid)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Encode, Decode)]
pub struct Header {
    pub kind: i32,
    pub len: u16,
    pub session_id: i32,
    pub command_id: u32,
    pub send_slice: i16,
    pub recv_slice: i16,
    pub src: Endpoint,
    pub dst: Endpoint,
}

impl Header {
    /// Builds a payload-less header addressed from `key.local` to `key.remote`.
    pub fn new(kind: MessageType, key: &Key) -> Self {
        Self {
            kind: kind as i32,
            len: HEADER_SIZE as u16,
            session_id: key.session_id,
            command_id: key.command_id,
            send_slice: key.send_slice,
            recv_slice: key.recv_slice,
            src: key.local,
            dst: key.remote,
        }
    }

    pub fn message_type(&self) -> Result<MessageType, WireError> {
        MessageType::try_from(self.kind)
    }

    pub fn encode_into(&self, dst: &mut [u8]) -> Result<(), WireError> {
        bincode::encode_into_slice(*self, &mut dst[..HEADER_SIZE], wire_config())?;
        Ok(())
    }

    pub fn decode(src: &[u8]) -> Result<Self, WireError> {
        if src.len() < HEADER_SIZE {
            return Err(WireError::BadLength {
                len: src.len(),
                min: HEADER_SIZE,
                max: u16::MAX as usize,
            });
        }

        let (header, _) = bincode::decode_from_slice(&src[..HEADER_SIZE], wire_config())?;
        Ok(header)
    }

    /// The packet was sent by the backend identified by `key`.
    pub fn is_from_client(&self, key: &Key) -> bool {
        self.src.dbid == key.local.dbid
            && self.src.pid == key.local.pid
            && self.dst.dbid == key.remote.dbid
            && self.dst.pid == key.remote.pid
            && self.send_slice == key.send_slice
            && self.recv_slice == key.recv_slice
    }

    /// The packet is addressed to the backend identified by `key`.
    pub fn is_to_client(&self, key: &Key) -> bool {
        self.dst.dbid == key.local.dbid
            && self.dst.pid == key.local.pid
            && self.src.dbid == key.remote.dbid
            && self.src.pid == key.remote.pid
            && self.send_slice == key.send_slice
            && self.recv_slice == key.recv_slice
    }

    pub fn liveness(&self, key: &Key) -> Liveness {
        key.classify(self.session_id, self.command_id)
    }
}

/// Reads the `len` field straight from encoded header bytes.
pub(crate) fn peek_len(header: &[u8]) -> usize {
    u16::from_be_bytes([header[LEN_OFFSET], header[LEN_OFFSET + 1]]) as usize
}

/// Overwrites the `len` field of encoded header bytes.
pub(crate) fn poke_len(header: &mut [u8], len: u16) {
    header[LEN_OFFSET..LEN_OFFSET + 2].copy_from_slice(&len.to_be_bytes());
}

/// A decoded header plus the pool block holding the full wire bytes.
#[derive(Debug)]
pub struct Packet {
    header: Header,
    kind: MessageType,
    block: Block,
}

impl Packet {
    /// A control message (or empty DATA) for the flow identified by `key`.
    pub fn message(pool: &mut PacketPool, kind: MessageType, key: &Key) -> Result<Self, WireError> {
        let header = Header::new(kind, key);
        let mut block = pool.alloc()?;
        if let Err(e) = header.encode_into(block.as_mut_slice()) {
            pool.free(block);
            return Err(e);
        }

        Ok(Self {
            header,
            kind,
            block,
        })
    }

    /// A DATA packet carrying `payload`.
    pub fn data(pool: &mut PacketPool, key: &Key, payload: &[u8]) -> Result<Self, WireError> {
        let len = HEADER_SIZE + payload.len();
        if len > pool.block_size() || len > u16::MAX as usize {
            return Err(WireError::Oversized {
                size: payload.len(),
                block_size: pool.block_size(),
            });
        }

        let mut packet = Self::message(pool, MessageType::Data, key)?;
        packet.block.as_mut_slice()[HEADER_SIZE..len].copy_from_slice(payload);
        packet.header.len = len as u16;
        poke_len(packet.block.as_mut_slice(), len as u16);

        Ok(packet)
    }

    /// Copies one complete, self-describing packet out of `bytes`.
    pub fn from_wire(pool: &mut PacketPool, bytes: &[u8]) -> Result<Self, WireError> {
        let header = Header::decode(bytes)?;
        let len = header.len as usize;
        if len < HEADER_SIZE || len != bytes.len() || len > pool.block_size() {
            return Err(WireError::BadLength {
                len,
                min: HEADER_SIZE,
                max: bytes.len().min(pool.block_size()),
            });
        }
        let kind = header.message_type()?;

        let mut block = pool.alloc()?;
        block.as_mut_slice()[..len].copy_from_slice(bytes);

        Ok(Self {
            header,
            kind,
            block,
        })
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn message_type(&self) -> MessageType {
        self.kind
    }

    pub fn is(&self, kind: MessageType) -> bool {
        self.kind == kind
    }

    pub fn len(&self) -> usize {
        self.header.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == HEADER_SIZE
    }

    /// Full wire bytes, header included.
    pub fn as_bytes(&self) -> &[u8] {
        &self.block.as_slice()[..self.len()]
    }

    pub fn payload(&self) -> &[u8] {
        &self.as_bytes()[HEADER_SIZE..]
    }

    pub fn into_block(self) -> Block {
        self.block
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let h = &self.header;
        write!(
            f,
            "{} [con{},cmd{},slice[{}->{}] {} bytes {}->{}]",
            self.kind, h.session_id, h.command_id, h.send_slice, h.recv_slice, h.len, h.src, h.dst
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> Key {
        Key {
            session_id: 5,
            command_id: 3,
            send_slice: 1,
            recv_slice: 2,
            local: Endpoint::new(0, 2, 100),
            remote: Endpoint::new(1, 3, 200),
        }
    }

    #[test]
    fn header_encoded_size_and_len_offset() {
        let mut header = Header::new(MessageType::Pause, &key());
        header.len = 0x1234;

        let mut buf = [0_u8; HEADER_SIZE];
        header.encode_into(&mut buf).unwrap();

        assert_eq!(&buf[..4], &(MessageType::Pause as i32).to_be_bytes());
        assert_eq!(peek_len(&buf), 0x1234);
        assert_eq!(&buf[HEADER_SIZE - 4..], &200_i32.to_be_bytes());
        assert_eq!(Header::decode(&buf).unwrap(), header);
    }

    #[test]
    fn header_rejects_short_input() {
        let res = Header::decode(&[0_u8; HEADER_SIZE - 1]);
        assert!(matches!(res, Err(WireError::BadLength { .. })));
    }

    #[test]
    fn data_packet_layout() {
        let mut pool = PacketPool::new(HEADER_SIZE + 16, None);
        let packet = Packet::data(&mut pool, &key(), b"hello").unwrap();

        assert!(packet.is(MessageType::Data));
        assert_eq!(packet.len(), HEADER_SIZE + 5);
        assert_eq!(packet.payload(), b"hello");
        assert_eq!(peek_len(packet.as_bytes()), HEADER_SIZE + 5);
        assert!(packet.header().is_from_client(&key()));
        assert!(packet.header().is_to_client(&key().reverse()));
    }

    #[test]
    fn data_packet_oversized() {
        let mut pool = PacketPool::new(HEADER_SIZE + 4, None);
        let res = Packet::data(&mut pool, &key(), b"hello");

        assert!(matches!(res, Err(WireError::Oversized { size: 5, .. })));
        assert_eq!(pool.total(), 0);
    }

    #[test]
    fn from_wire_validates_type_and_length() {
        let mut pool = PacketPool::new(128, None);
        let packet = Packet::data(&mut pool, &key(), b"abc").unwrap();

        let copy = Packet::from_wire(&mut pool, packet.as_bytes()).unwrap();
        assert_eq!(copy.header(), packet.header());
        assert_eq!(copy.payload(), b"abc");

        let truncated = Packet::from_wire(&mut pool, &packet.as_bytes()[..HEADER_SIZE + 1]);
        assert!(matches!(truncated, Err(WireError::BadLength { .. })));

        let mut bogus = packet.as_bytes().to_vec();
        bogus[..4].copy_from_slice(&42_i32.to_be_bytes());
        let unknown = Packet::from_wire(&mut pool, &bogus);
        assert!(matches!(unknown, Err(WireError::UnknownType(42))));
    }

    #[test]
    fn packet_display() {
        let mut pool = PacketPool::new(128, None);
        let packet = Packet::data(&mut pool, &key(), &[0; 6]).unwrap();

        assert_eq!(
            packet.to_string(),
            "DATA [con5,cmd3,slice[1->2] 40 bytes seg0:dbid2:p100->seg1:dbid3:p200]"
        );
    }
}
