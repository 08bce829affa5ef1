//! Fixed-size packet buffer pool.
//!
//! Every packet the proxy handles lives in a [`Block`] handed out by a
//! [`PacketPool`]. All blocks of a pool have the same size, so recycling is a
//! plain LIFO free-list: `free` pushes, `alloc` pops, and a new block is only
//! allocated when the free-list is empty.
//!
//! Blocks are move-only. Ownership travels producer -> buffer -> router ->
//! destination and the last owner hands the block back with
//! [`PacketPool::free`], so a block cannot be recycled twice.
//!
//! The pool grows without bound unless a capacity is configured, in which
//! case exhaustion surfaces as [`PoolError::Exhausted`] to the caller, who
//! treats it as a failure of the one connection it was serving.
use log::trace;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PoolError {
    #[error("packet pool exhausted: all {capacity} blocks are in use")]
    Exhausted { capacity: usize },
}

/// One uniform-size buffer owned by exactly one holder at a time.
#[derive(Debug)]
pub struct Block {
    bytes: Box<[u8]>,
}

impl Block {
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.bytes.as_ptr()
    }
}

#[derive(Debug)]
pub struct PacketPool {
    free: Vec<Block>,
    block_size: usize,
    capacity: Option<usize>,
    total: usize,
}

impl PacketPool {
    /// Creates an empty pool handing out blocks of `block_size` bytes.
    ///
    /// `capacity` caps the number of blocks that may exist at once; `None`
    /// lets the pool grow on demand.
    pub fn new(block_size: usize, capacity: Option<usize>) -> Self {
        assert!(block_size > 0);

        Self {
            free: Vec::new(),
            block_size,
            capacity,
            total: 0,
        }
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Pops a recycled block, or allocates a new one if none is free.
    pub fn alloc(&mut self) -> Result<Block, PoolError> {
        let block = match self.free.pop() {
            Some(block) => block,
            None => {
                if let Some(capacity) = self.capacity {
                    if self.total >= capacity {
                        return Err(PoolError::Exhausted { capacity });
                    }
                }

                self.total += 1;
                Block {
                    bytes: vec![0_u8; self.block_size].into_boxed_slice(),
                }
            }
        };

        trace!(
            "pkt-pool: allocated, {} free, {} total",
            self.free.len(),
            self.total
        );
        Ok(block)
    }

    /// Returns a block to the free-list.
    pub fn free(&mut self, block: Block) {
        debug_assert_eq!(block.len(), self.block_size);

        self.free.push(block);
        trace!(
            "pkt-pool: recycled, {} free, {} total",
            self.free.len(),
            self.total
        );
    }

    /// Number of blocks sitting in the free-list.
    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    /// Number of blocks ever allocated by this pool.
    pub fn total(&self) -> usize {
        self.total
    }

    /// Number of blocks currently held outside the pool.
    pub fn in_use(&self) -> usize {
        self.total - self.free.len()
    }
}
