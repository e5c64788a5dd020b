//! Sequence tracking for inference requests.
//!
//! A sequence is the engine-side state of one request: its prompt, the
//! tokens generated so far, and the KV cache blocks it holds. On the draft
//! side the output ends with a tail of *assumed* tokens, proposals that the
//! main model has not verified yet.

use serde::{Deserialize, Serialize};

use crate::core::block::BlockTable;
use crate::error::{Error, Result};

/// Unique identifier for a sequence.
pub type SequenceId = u64;

/// Status of a sequence in the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SequenceStatus {
    /// Waiting in queue to be scheduled.
    Waiting,
    /// Admitted and holding cache blocks.
    Running,
    /// Finished generation.
    Finished,
}

impl SequenceStatus {
    /// Check if the sequence is active (waiting or running).
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Waiting | Self::Running)
    }

    /// Get the status name as a static string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "Waiting",
            Self::Running => "Running",
            Self::Finished => "Finished",
        }
    }
}

/// Reason for sequence completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FinishReason {
    /// End-of-sequence token generated.
    EndOfSequence,
    /// A configured stop token was generated.
    StopToken,
    /// Maximum token limit reached.
    MaxTokens,
    /// Aborted by user or system.
    Aborted,
}

/// A sequence represents a single inference request.
///
/// # Example
///
/// ```
/// use nano_spec::core::sequence::{Sequence, SequenceStatus};
///
/// let mut seq = Sequence::new(1, vec![1, 2, 3, 4]);
/// assert_eq!(seq.status(), SequenceStatus::Waiting);
///
/// seq.append_token(5);
/// seq.append_assumed_token(6);
/// assert_eq!(seq.committed_output(), &[5]);
/// assert_eq!(seq.assumed_token_ids(), &[6]);
/// assert_eq!(seq.total_len(), 6);
/// ```
#[derive(Debug, Clone)]
pub struct Sequence {
    /// Unique sequence identifier.
    seq_id: SequenceId,
    /// Prompt token IDs.
    prompt_token_ids: Vec<u32>,
    /// Generated token IDs, committed prefix then assumed tail.
    output_token_ids: Vec<u32>,
    /// Length of the unverified tail of `output_token_ids`.
    num_assumed_tokens: usize,
    /// Block table for KV cache mapping.
    block_table: BlockTable,
    /// Current status.
    status: SequenceStatus,
    /// Reason for finishing (if finished).
    finish_reason: Option<FinishReason>,
}

impl Sequence {
    /// Create a new sequence with the given prompt tokens.
    pub fn new(seq_id: SequenceId, prompt_token_ids: Vec<u32>) -> Self {
        Self {
            seq_id,
            prompt_token_ids,
            output_token_ids: Vec::new(),
            num_assumed_tokens: 0,
            block_table: BlockTable::with_default_size(),
            status: SequenceStatus::Waiting,
            finish_reason: None,
        }
    }

    /// Create a new sequence whose block table uses `block_size`.
    pub fn with_block_size(seq_id: SequenceId, prompt_token_ids: Vec<u32>, block_size: usize) -> Self {
        let mut seq = Self::new(seq_id, prompt_token_ids);
        seq.block_table = BlockTable::new(block_size);
        seq
    }

    // ========== Getters ==========

    /// Get the sequence ID.
    pub fn seq_id(&self) -> SequenceId {
        self.seq_id
    }

    /// Get the prompt token IDs.
    pub fn prompt_token_ids(&self) -> &[u32] {
        &self.prompt_token_ids
    }

    /// Get every output token, including the assumed tail.
    pub fn output_token_ids(&self) -> &[u32] {
        &self.output_token_ids
    }

    /// Output tokens that have been verified.
    pub fn committed_output(&self) -> &[u32] {
        &self.output_token_ids[..self.output_token_ids.len() - self.num_assumed_tokens]
    }

    /// Unverified draft tokens at the end of the output.
    pub fn assumed_token_ids(&self) -> &[u32] {
        &self.output_token_ids[self.output_token_ids.len() - self.num_assumed_tokens..]
    }

    /// Get all token IDs (prompt + output).
    pub fn all_token_ids(&self) -> Vec<u32> {
        let mut tokens = self.prompt_token_ids.clone();
        tokens.extend(&self.output_token_ids);
        tokens
    }

    /// Get the block table.
    pub fn block_table(&self) -> &BlockTable {
        &self.block_table
    }

    /// Get mutable access to the block table.
    pub fn block_table_mut(&mut self) -> &mut BlockTable {
        &mut self.block_table
    }

    /// Get the current status.
    pub fn status(&self) -> SequenceStatus {
        self.status
    }

    /// Get the finish reason (if finished).
    pub fn finish_reason(&self) -> Option<FinishReason> {
        self.finish_reason
    }

    // ========== Length queries ==========

    /// Get the prompt length.
    pub fn prompt_len(&self) -> usize {
        self.prompt_token_ids.len()
    }

    /// Get the output length, assumed tokens included.
    pub fn output_len(&self) -> usize {
        self.output_token_ids.len()
    }

    /// Number of unverified tokens.
    pub fn num_assumed_tokens(&self) -> usize {
        self.num_assumed_tokens
    }

    /// Number of verified output tokens.
    pub fn num_committed_tokens(&self) -> usize {
        self.output_token_ids.len() - self.num_assumed_tokens
    }

    /// Get the total length (prompt + output).
    pub fn total_len(&self) -> usize {
        self.prompt_len() + self.output_len()
    }

    // ========== Token operations ==========

    /// Append a verified token.
    ///
    /// Any assumed tail is dropped first; verified tokens never follow
    /// unverified ones.
    pub fn append_token(&mut self, token_id: u32) {
        self.discard_assumed_tokens();
        self.output_token_ids.push(token_id);
    }

    /// Append an unverified draft token.
    pub fn append_assumed_token(&mut self, token_id: u32) {
        self.output_token_ids.push(token_id);
        self.num_assumed_tokens += 1;
    }

    /// Drop the unverified tail.
    pub fn discard_assumed_tokens(&mut self) {
        let committed = self.num_committed_tokens();
        self.output_token_ids.truncate(committed);
        self.num_assumed_tokens = 0;
    }

    /// Replace the output with an externally verified one.
    pub fn sync_output(&mut self, committed: &[u32]) {
        self.output_token_ids.clear();
        self.output_token_ids.extend_from_slice(committed);
        self.num_assumed_tokens = 0;
    }

    /// Get the last token ID.
    pub fn last_token_id(&self) -> Option<u32> {
        self.output_token_ids
            .last()
            .copied()
            .or_else(|| self.prompt_token_ids.last().copied())
    }

    // ========== State transitions ==========

    /// Transition to running state.
    ///
    /// # Errors
    ///
    /// Returns error if the sequence is not waiting.
    pub fn set_running(&mut self) -> Result<()> {
        match self.status {
            SequenceStatus::Waiting => {
                self.status = SequenceStatus::Running;
                Ok(())
            }
            _ => Err(Error::InvalidStateTransition {
                from: self.status.as_str(),
                to: "Running",
            }),
        }
    }

    /// Transition back to waiting state (preemption).
    ///
    /// # Errors
    ///
    /// Returns error if the sequence is not running.
    pub fn set_waiting(&mut self) -> Result<()> {
        match self.status {
            SequenceStatus::Running => {
                self.status = SequenceStatus::Waiting;
                Ok(())
            }
            _ => Err(Error::InvalidStateTransition {
                from: self.status.as_str(),
                to: "Waiting",
            }),
        }
    }

    /// Mark the sequence as finished.
    pub fn set_finished(&mut self, reason: FinishReason) {
        self.status = SequenceStatus::Finished;
        self.finish_reason = Some(reason);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequence_creation() {
        let seq = Sequence::new(1, vec![10, 20, 30, 40]);

        assert_eq!(seq.seq_id(), 1);
        assert_eq!(seq.prompt_len(), 4);
        assert_eq!(seq.output_len(), 0);
        assert_eq!(seq.num_assumed_tokens(), 0);
        assert_eq!(seq.status(), SequenceStatus::Waiting);
    }

    #[test]
    fn test_assumed_tail() {
        let mut seq = Sequence::new(1, vec![1, 2, 3]);
        seq.append_token(10);
        seq.append_assumed_token(11);
        seq.append_assumed_token(12);

        assert_eq!(seq.output_len(), 3);
        assert_eq!(seq.num_committed_tokens(), 1);
        assert_eq!(seq.assumed_token_ids(), &[11, 12]);
        assert_eq!(seq.last_token_id(), Some(12));

        seq.discard_assumed_tokens();
        assert_eq!(seq.output_token_ids(), &[10]);
        assert_eq!(seq.num_assumed_tokens(), 0);
    }

    #[test]
    fn test_append_token_drops_assumed_tail() {
        let mut seq = Sequence::new(1, vec![1]);
        seq.append_assumed_token(5);
        seq.append_token(6);

        assert_eq!(seq.output_token_ids(), &[6]);
        assert_eq!(seq.num_assumed_tokens(), 0);
    }

    #[test]
    fn test_sync_output() {
        let mut seq = Sequence::new(1, vec![1]);
        seq.append_assumed_token(2);
        seq.append_assumed_token(3);

        seq.sync_output(&[2, 9]);
        assert_eq!(seq.committed_output(), &[2, 9]);
        assert!(seq.assumed_token_ids().is_empty());
        assert_eq!(seq.all_token_ids(), vec![1, 2, 9]);
    }

    #[test]
    fn test_state_transitions() {
        let mut seq = Sequence::new(1, vec![1, 2, 3]);

        assert!(seq.set_running().is_ok());
        assert!(seq.set_waiting().is_ok());
        assert!(seq.set_running().is_ok());

        seq.set_finished(FinishReason::MaxTokens);
        assert_eq!(seq.status(), SequenceStatus::Finished);
        assert_eq!(seq.finish_reason(), Some(FinishReason::MaxTokens));
        assert!(!seq.status().is_active());
    }

    #[test]
    fn test_invalid_state_transitions() {
        let mut seq = Sequence::new(1, vec![1, 2, 3]);

        assert!(seq.set_waiting().is_err());
        seq.set_running().unwrap();
        assert!(seq.set_running().is_err());
    }
}
