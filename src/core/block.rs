//! Block tables for KV cache accounting.
//!
//! The KV cache is divided into fixed-size blocks. Each sequence owns a
//! block table mapping its logical blocks to physical block ids handed out
//! by the [`BlockManager`](super::block_manager::BlockManager).

use crate::error::{Error, Result};

/// Default block size (tokens per block).
pub const DEFAULT_BLOCK_SIZE: usize = 16;

/// Maps a sequence's logical blocks to physical block ids.
///
/// Token at position `p` lives in logical block `p / block_size`.
///
/// # Example
///
/// ```
/// use nano_spec::core::block::BlockTable;
///
/// let mut table = BlockTable::new(16);
/// table.append_block(5);
/// table.append_block(12);
///
/// assert_eq!(table.get_block_id(1).unwrap(), 12);
/// assert_eq!(table.capacity(), 32);
/// ```
#[derive(Debug, Clone, Default)]
pub struct BlockTable {
    /// Physical block IDs in logical order.
    block_ids: Vec<usize>,
    /// Number of tokens per block.
    block_size: usize,
}

impl BlockTable {
    /// Create a new empty block table.
    pub fn new(block_size: usize) -> Self {
        Self {
            block_ids: Vec::new(),
            block_size,
        }
    }

    /// Create a new block table with default block size.
    pub fn with_default_size() -> Self {
        Self::new(DEFAULT_BLOCK_SIZE)
    }

    /// Get the block size.
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Get the physical block id backing a logical block.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the logical block is not allocated.
    pub fn get_block_id(&self, logical_block_idx: usize) -> Result<usize> {
        self.block_ids.get(logical_block_idx).copied().ok_or_else(|| {
            Error::Config(format!(
                "logical block {logical_block_idx} out of bounds ({} allocated)",
                self.block_ids.len()
            ))
        })
    }

    /// Add a new physical block to the table.
    pub fn append_block(&mut self, block_id: usize) {
        self.block_ids.push(block_id);
    }

    /// Number of blocks allocated to this sequence.
    pub fn num_blocks(&self) -> usize {
        self.block_ids.len()
    }

    /// Number of tokens the allocated blocks can hold.
    pub fn capacity(&self) -> usize {
        self.block_ids.len() * self.block_size
    }

    /// Check if the table is empty.
    pub fn is_empty(&self) -> bool {
        self.block_ids.is_empty()
    }

    /// Get all physical block IDs for this sequence.
    pub fn get_physical_block_ids(&self) -> &[usize] {
        &self.block_ids
    }

    /// Keep the first `num_blocks` blocks and return the rest.
    pub fn truncate(&mut self, num_blocks: usize) -> Vec<usize> {
        if num_blocks >= self.block_ids.len() {
            return Vec::new();
        }
        self.block_ids.split_off(num_blocks)
    }

    /// Remove and return every block.
    pub fn clear(&mut self) -> Vec<usize> {
        std::mem::take(&mut self.block_ids)
    }
}

/// Compute number of blocks needed for a sequence of given length.
///
/// # Example
///
/// ```
/// use nano_spec::core::block::compute_num_blocks;
///
/// assert_eq!(compute_num_blocks(35, 16), 3);
/// assert_eq!(compute_num_blocks(32, 16), 2);
/// assert_eq!(compute_num_blocks(0, 16), 0);
/// ```
pub fn compute_num_blocks(seq_len: usize, block_size: usize) -> usize {
    seq_len.div_ceil(block_size)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_table_basic() {
        let mut table = BlockTable::new(16);
        assert!(table.is_empty());

        table.append_block(5);
        table.append_block(12);
        table.append_block(3);

        assert_eq!(table.num_blocks(), 3);
        assert_eq!(table.capacity(), 48);
        assert_eq!(table.get_physical_block_ids(), &[5, 12, 3]);
        assert_eq!(table.get_block_id(2).unwrap(), 3);
        assert!(table.get_block_id(3).is_err());
    }

    #[test]
    fn test_block_table_truncate() {
        let mut table = BlockTable::new(4);
        for id in [7, 8, 9] {
            table.append_block(id);
        }

        assert!(table.truncate(5).is_empty());
        assert_eq!(table.truncate(1), vec![8, 9]);
        assert_eq!(table.get_physical_block_ids(), &[7]);
        assert_eq!(table.clear(), vec![7]);
        assert!(table.is_empty());
    }

    #[test]
    fn test_compute_num_blocks() {
        assert_eq!(compute_num_blocks(0, 16), 0);
        assert_eq!(compute_num_blocks(1, 16), 1);
        assert_eq!(compute_num_blocks(16, 16), 1);
        assert_eq!(compute_num_blocks(17, 16), 2);
        assert_eq!(compute_num_blocks(100, 16), 7);
    }
}
