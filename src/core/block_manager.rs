//! Free-list allocator for KV cache blocks.
//!
//! Each pipeline owns one `BlockManager`; blocks are never shared between
//! pipelines or between sequences.
//!
//! ## Example
//!
//! ```
//! use nano_spec::core::block_manager::BlockManager;
//!
//! let mut manager = BlockManager::new(4, 16);
//! let blocks = manager.allocate_many(3).unwrap();
//! assert_eq!(manager.num_free_blocks(), 1);
//!
//! manager.free_many(&blocks);
//! assert_eq!(manager.num_free_blocks(), 4);
//! ```

use std::collections::VecDeque;

use crate::error::{Error, Result};

/// Manages allocation and deallocation of KV cache blocks.
#[derive(Debug)]
pub struct BlockManager {
    /// Free block IDs.
    free_list: VecDeque<usize>,
    /// Number of tokens per block.
    block_size: usize,
    /// Total number of blocks.
    num_blocks: usize,
}

impl BlockManager {
    /// Create a manager for `num_blocks` blocks of `block_size` tokens.
    pub fn new(num_blocks: usize, block_size: usize) -> Self {
        Self {
            free_list: (0..num_blocks).collect(),
            block_size,
            num_blocks,
        }
    }

    /// Get the block size.
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Get the total number of blocks.
    pub fn num_blocks(&self) -> usize {
        self.num_blocks
    }

    /// Get the number of free blocks.
    pub fn num_free_blocks(&self) -> usize {
        self.free_list.len()
    }

    /// Get the number of used blocks.
    pub fn num_used_blocks(&self) -> usize {
        self.num_blocks - self.free_list.len()
    }

    /// Check if a specific number of blocks can be allocated.
    pub fn can_allocate(&self, num_blocks: usize) -> bool {
        self.free_list.len() >= num_blocks
    }

    /// Allocate `num_blocks` blocks, all or nothing.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfBlocks`] if not enough free blocks are available.
    pub fn allocate_many(&mut self, num_blocks: usize) -> Result<Vec<usize>> {
        if !self.can_allocate(num_blocks) {
            return Err(Error::OutOfBlocks);
        }
        Ok(self.free_list.drain(..num_blocks).collect())
    }

    /// Return blocks to the free list.
    pub fn free_many(&mut self, block_ids: &[usize]) {
        self.free_list.extend(block_ids.iter().copied());
    }

    /// Reset to the initial state with every block free.
    pub fn reset(&mut self) {
        self.free_list = (0..self.num_blocks).collect();
    }
}
