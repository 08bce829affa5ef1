//! Framing buffers.
//!
//! [`InputBuffer`] reassembles whole packets out of an arbitrarily split byte
//! stream; [`OutputBuffer`] coalesces payload chunks under one reusable header
//! until a flush is requested or the next chunk would not fit in a pool block.
//!
//! Both speak one of two [`Dialect`]s:
//!
//! - [`Dialect::P2p`]: proxy packets, the full [`Header`] carries the length.
//! - [`Dialect::B2c`]: backend packets, a bare big-endian `u32` length prefix
//!   (counting itself) followed by the backend's own payload.
//!
//! Callbacks receive the pool alongside the packet bytes so they can copy the
//! packet into a block of its own.
use std::cmp::min;

use log::{debug, warn};
use thiserror::Error;

use super::{
    pool::{Block, PacketPool, PoolError},
    wire::{HEADER_SIZE, Header, WireError, peek_len, poke_len},
};

/// Size of the length prefix of a backend packet.
pub const B2C_HEADER_SIZE: usize = 4;

#[derive(Debug, Error)]
pub enum FramingError {
    #[error("declared packet size {size} is out of range {min}..={max}")]
    BadLength { size: usize, min: usize, max: usize },
    #[error(
        "no enough buffer to store the data: the data size is {size} bytes, \
         but the buffer size is only {block_size} bytes, including a {header_size} bytes header"
    )]
    Oversized {
        size: usize,
        block_size: usize,
        header_size: usize,
    },
    #[error("the header must be initialized before pushing data")]
    NoHeader,
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error(transparent)]
    Wire(#[from] WireError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    P2p,
    B2c,
}

impl Dialect {
    pub fn header_size(self) -> usize {
        match self {
            Dialect::P2p => HEADER_SIZE,
            Dialect::B2c => B2C_HEADER_SIZE,
        }
    }

    fn packet_size(self, header: &[u8]) -> usize {
        match self {
            Dialect::P2p => peek_len(header),
            Dialect::B2c => u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize,
        }
    }

    fn set_packet_size(self, header: &mut [u8], size: usize) {
        match self {
            Dialect::P2p => poke_len(header, size as u16),
            Dialect::B2c => header[..B2C_HEADER_SIZE].copy_from_slice(&(size as u32).to_be_bytes()),
        }
    }

    fn checked_size(self, header: &[u8], block_size: usize) -> Result<usize, FramingError> {
        let size = self.packet_size(header);
        if size < self.header_size() || size > block_size {
            return Err(FramingError::BadLength {
                size,
                min: self.header_size(),
                max: block_size,
            });
        }
        Ok(size)
    }
}

/// Holds at most one partial packet between two reads.
#[derive(Debug)]
pub struct InputBuffer {
    dialect: Dialect,
    block: Option<Block>,
    len: usize,
}

impl InputBuffer {
    pub fn new(dialect: Dialect) -> Self {
        Self {
            dialect,
            block: None,
            len: 0,
        }
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    /// Bytes of the carried partial packet.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Changes the framing for the bytes still to come.
    pub fn switch_dialect(&mut self, dialect: Dialect) {
        debug_assert!(self.is_empty(), "switching dialect with buffered bytes");
        self.dialect = dialect;
    }

    /// Feeds one chunk of the stream, invoking `on_packet` for every complete
    /// packet in order. An empty `data` forces delivery of whatever is
    /// buffered, complete or not.
    pub fn push<F>(
        &mut self,
        pool: &mut PacketPool,
        data: &[u8],
        mut on_packet: F,
    ) -> Result<(), FramingError>
    where
        F: FnMut(&mut PacketPool, &[u8]) -> Result<(), FramingError>,
    {
        let header_size = self.dialect.header_size();
        let block_size = pool.block_size();
        let mut data = data;

        if data.is_empty() {
            if let Some(block) = self.block.as_ref() {
                if self.len > 0 {
                    let len = self.len;
                    self.len = 0;
                    on_packet(pool, &block.as_slice()[..len])?;
                }
            }
            return Ok(());
        }

        if let Some(block) = self.block.as_mut().filter(|_| self.len > 0) {
            let buf = block.as_mut_slice();

            if self.len < header_size {
                let delta = min(header_size - self.len, data.len());
                buf[self.len..self.len + delta].copy_from_slice(&data[..delta]);
                self.len += delta;
                data = &data[delta..];

                if self.len < header_size {
                    return Ok(());
                }
            }

            let size = self.dialect.checked_size(&buf[..header_size], block_size)?;
            let delta = min(size - self.len, data.len());
            buf[self.len..self.len + delta].copy_from_slice(&data[..delta]);
            self.len += delta;
            data = &data[delta..];

            if self.len < size {
                return Ok(());
            }

            self.len = 0;
            on_packet(pool, &buf[..size])?;
        }

        while data.len() >= header_size {
            let size = self.dialect.checked_size(&data[..header_size], block_size)?;
            if size > data.len() {
                break;
            }

            on_packet(pool, &data[..size])?;
            data = &data[size..];
        }

        if !data.is_empty() {
            if self.block.is_none() {
                self.block = Some(pool.alloc()?);
            }
            if let Some(block) = self.block.as_mut() {
                block.as_mut_slice()[..data.len()].copy_from_slice(data);
                self.len = data.len();
            }
        }

        Ok(())
    }

    /// Drops the carried bytes, returning how many there were.
    pub fn clear(&mut self) -> usize {
        let dropped = self.len;
        if dropped > 0 {
            warn!("ibuf: dropped {dropped} bytes");
        }
        self.len = 0;
        dropped
    }

    pub fn release(&mut self, pool: &mut PacketPool) {
        self.len = 0;
        if let Some(block) = self.block.take() {
            pool.free(block);
        }
    }
}

/// Assembles outgoing packets under one in-progress header.
#[derive(Debug)]
pub struct OutputBuffer {
    dialect: Dialect,
    block: Option<Block>,
    len: usize,
}

impl OutputBuffer {
    pub fn new(dialect: Dialect) -> Self {
        Self {
            dialect,
            block: None,
            len: 0,
        }
    }

    /// Allocates the buffer if needed and writes the header every flushed
    /// packet will carry. `header` is only used by the p2p dialect.
    pub fn init_header(
        &mut self,
        pool: &mut PacketPool,
        header: &Header,
    ) -> Result<(), FramingError> {
        if self.block.is_none() {
            self.block = Some(pool.alloc()?);
        }
        let Some(block) = self.block.as_mut() else {
            return Err(FramingError::NoHeader);
        };

        match self.dialect {
            Dialect::P2p => header.encode_into(block.as_mut_slice())?,
            Dialect::B2c => block.as_mut_slice()[..B2C_HEADER_SIZE].fill(0),
        }
        self.len = self.dialect.header_size();
        Ok(())
    }

    pub fn has_header(&self) -> bool {
        self.block.is_some()
    }

    /// Payload bytes waiting for a flush.
    pub fn pending(&self) -> usize {
        if self.block.is_some() {
            self.len - self.dialect.header_size()
        } else {
            0
        }
    }

    /// Appends `data` to the packet in progress. The packet is handed to
    /// `on_packet` first if `data` would overflow the block, or if `data` is
    /// empty (a forced flush).
    pub fn push<F>(
        &mut self,
        pool: &mut PacketPool,
        data: &[u8],
        mut on_packet: F,
    ) -> Result<(), FramingError>
    where
        F: FnMut(&mut PacketPool, &[u8]) -> Result<(), FramingError>,
    {
        let header_size = self.dialect.header_size();
        let Some(block) = self.block.as_mut() else {
            if data.is_empty() {
                return Ok(());
            }
            return Err(FramingError::NoHeader);
        };
        let block_size = block.len();

        if data.is_empty() || data.len() + self.len > block_size {
            if header_size + data.len() > block_size {
                return Err(FramingError::Oversized {
                    size: data.len(),
                    block_size,
                    header_size,
                });
            }

            if self.len == header_size {
                debug!("obuf: no data to flush");
            } else {
                let len = self.len;
                let buf = block.as_mut_slice();
                self.dialect.set_packet_size(buf, len);
                // the header is reused by the next packet
                self.len = header_size;
                on_packet(pool, &buf[..len])?;
            }
        }

        if !data.is_empty() {
            block.as_mut_slice()[self.len..self.len + data.len()].copy_from_slice(data);
            self.len += data.len();
        }

        Ok(())
    }

    pub fn flush<F>(&mut self, pool: &mut PacketPool, on_packet: F) -> Result<(), FramingError>
    where
        F: FnMut(&mut PacketPool, &[u8]) -> Result<(), FramingError>,
    {
        self.push(pool, &[], on_packet)
    }

    pub fn release(&mut self, pool: &mut PacketPool) {
        self.len = 0;
        if let Some(block) = self.block.take() {
            pool.free(block);
        }
    }
}
