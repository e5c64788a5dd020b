//! Causal language models driven by the pipelines.
//!
//! Pipelines only need next-token logits, so the model seam is narrow:
//! one forward pass over a token sequence returning a row of logits per
//! position.

pub mod bigram;

use candle_core::{Device, Result, Tensor};

pub use bigram::BigramModel;

/// A causal language model.
pub trait CausalLM: Send {
    /// Size of the output vocabulary.
    fn vocab_size(&self) -> usize;

    /// Device the model's tensors live on.
    fn device(&self) -> &Device;

    /// Forward pass over a full token sequence.
    ///
    /// # Arguments
    ///
    /// * `input_ids` - Token IDs `[seq_len]` (u32)
    ///
    /// # Returns
    ///
    /// Logits `[seq_len, vocab_size]`; row `i` scores the token following
    /// position `i` and depends only on positions `0..=i`.
    fn forward(&mut self, input_ids: &Tensor) -> Result<Tensor>;
}
