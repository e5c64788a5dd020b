//! Core infrastructure for nano-spec.
//!
//! This module contains the fundamental building blocks:
//! - BlockTable and BlockManager for KV cache accounting
//! - Sequence for request tracking

pub mod block;
pub mod block_manager;
pub mod sequence;

pub use block::{compute_num_blocks, BlockTable};
pub use block_manager::BlockManager;
pub use sequence::{FinishReason, Sequence, SequenceId, SequenceStatus};
