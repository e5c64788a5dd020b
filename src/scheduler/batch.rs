//! Continuous batching scheduler.
//!
//! The scheduler decides, every iteration, which sequences run. Running
//! sequences go first; waiting sequences are admitted in arrival order while
//! the sequence cap, the prompt-token budget and the KV cache allow.
//!
//! ## Scheduling Flow
//!
//! ```text
//!   add_sequence()                                  schedule(lookahead)
//!        │                                              │
//!        ▼                                              ▼
//!   ┌─────────┐   (blocks for prompt + lookahead)  ┌─────────────┐
//!   │ Waiting │ ─────────────────────────────────► │   Running   │
//!   │  Queue  │                                    │     Set     │
//!   └─────────┘ ◄───────────────────────────────── └─────────────┘
//!                 preempt newest when nothing can run
//! ```
//!
//! `lookahead` reserves room for tokens a step appends beyond the current
//! length: one for a draft proposal round, `k + 1` for a verification pass.
//!
//! ## Example
//!
//! ```
//! use nano_spec::scheduler::Scheduler;
//! use nano_spec::core::sequence::Sequence;
//! use nano_spec::SchedulerConfig;
//!
//! let mut scheduler = Scheduler::new(SchedulerConfig::default());
//! scheduler.add_sequence(Sequence::new(1, vec![1, 2, 3, 4]));
//! scheduler.add_sequence(Sequence::new(2, vec![5, 6, 7, 8]));
//!
//! let outputs = scheduler.schedule(1);
//! assert_eq!(outputs.prefill_sequences, vec![1, 2]);
//! ```

use std::collections::{HashMap, VecDeque};

use tracing::debug;

use crate::config::SchedulerConfig;
use crate::core::block::compute_num_blocks;
use crate::core::block_manager::BlockManager;
use crate::core::sequence::{Sequence, SequenceId, SequenceStatus};

/// Output of a scheduling step.
#[derive(Debug, Default)]
pub struct SchedulerOutputs {
    /// Sequences admitted this iteration.
    pub prefill_sequences: Vec<SequenceId>,
    /// Already running sequences scheduled this iteration.
    pub decode_sequences: Vec<SequenceId>,
    /// Running sequences skipped this iteration (cap or cache pressure).
    pub postponed_sequences: Vec<SequenceId>,
    /// Sequences moved back to the waiting queue.
    pub preempted_sequences: Vec<SequenceId>,
    /// Sequences that can never fit in the cache; removed from the scheduler.
    pub rejected_sequences: Vec<Sequence>,
    /// Total number of prefill tokens this iteration.
    pub num_prefill_tokens: usize,
    /// Total number of decode sequences this iteration.
    pub num_decode_tokens: usize,
}

impl SchedulerOutputs {
    /// Create empty scheduler outputs.
    pub fn new() -> Self {
        Self::default()
    }

    /// Check if there are any sequences to process.
    pub fn is_empty(&self) -> bool {
        self.prefill_sequences.is_empty() && self.decode_sequences.is_empty()
    }

    /// Total number of sequences to process.
    pub fn num_sequences(&self) -> usize {
        self.prefill_sequences.len() + self.decode_sequences.len()
    }

    /// Get all sequence IDs to process, decode first.
    pub fn scheduled_ids(&self) -> Vec<SequenceId> {
        let mut ids = self.decode_sequences.clone();
        ids.extend(&self.prefill_sequences);
        ids
    }
}

/// Continuous batching scheduler.
///
/// Owns the sequences of one pipeline and that pipeline's block manager.
pub struct Scheduler {
    /// Configuration.
    config: SchedulerConfig,
    /// Block manager for KV cache allocation.
    block_manager: BlockManager,
    /// All sequences (waiting and running).
    sequences: HashMap<SequenceId, Sequence>,
    /// Waiting sequences in admission order.
    waiting_queue: VecDeque<SequenceId>,
    /// Running sequences in admission order.
    running_ids: Vec<SequenceId>,
}

impl Scheduler {
    /// Create a new scheduler.
    pub fn new(config: SchedulerConfig) -> Self {
        let block_manager = BlockManager::new(config.num_blocks, config.block_size);
        Self {
            config,
            block_manager,
            sequences: HashMap::new(),
            waiting_queue: VecDeque::new(),
            running_ids: Vec::new(),
        }
    }

    /// Add a new sequence at the back of the waiting queue.
    pub fn add_sequence(&mut self, seq: Sequence) {
        let seq_id = seq.seq_id();
        self.waiting_queue.push_back(seq_id);
        self.sequences.insert(seq_id, seq);
    }

    /// Remove a sequence, freeing its blocks.
    pub fn remove_sequence(&mut self, seq_id: SequenceId) -> Option<Sequence> {
        let mut seq = self.sequences.remove(&seq_id)?;
        let block_ids = seq.block_table_mut().clear();
        self.block_manager.free_many(&block_ids);
        self.running_ids.retain(|&id| id != seq_id);
        self.waiting_queue.retain(|&id| id != seq_id);
        Some(seq)
    }

    /// Get a reference to a sequence.
    pub fn get_sequence(&self, seq_id: SequenceId) -> Option<&Sequence> {
        self.sequences.get(&seq_id)
    }

    /// Get a mutable reference to a sequence.
    pub fn get_sequence_mut(&mut self, seq_id: SequenceId) -> Option<&mut Sequence> {
        self.sequences.get_mut(&seq_id)
    }

    /// Schedule the next iteration.
    pub fn schedule(&mut self, lookahead: usize) -> SchedulerOutputs {
        let mut outputs = SchedulerOutputs::new();

        self.schedule_running(&mut outputs, lookahead);
        self.schedule_waiting(&mut outputs, lookahead);

        debug!(
            decode = outputs.decode_sequences.len(),
            prefill = outputs.prefill_sequences.len(),
            postponed = outputs.postponed_sequences.len(),
            free_blocks = self.block_manager.num_free_blocks(),
            "scheduled iteration"
        );
        outputs
    }

    /// Schedule running sequences, preempting when none of them can grow.
    fn schedule_running(&mut self, outputs: &mut SchedulerOutputs, lookahead: usize) {
        loop {
            outputs.decode_sequences.clear();
            outputs.postponed_sequences.clear();
            outputs.num_decode_tokens = 0;
            let mut blocked = Vec::new();

            for &seq_id in &self.running_ids {
                if outputs.num_sequences() >= self.config.max_num_seqs {
                    outputs.postponed_sequences.push(seq_id);
                    continue;
                }
                let Some(seq) = self.sequences.get_mut(&seq_id) else {
                    continue;
                };
                let blocks_needed =
                    compute_num_blocks(seq.total_len() + lookahead, self.config.block_size);
                let missing = blocks_needed.saturating_sub(seq.block_table().num_blocks());
                if missing > 0 {
                    match self.block_manager.allocate_many(missing) {
                        Ok(block_ids) => {
                            for block_id in block_ids {
                                seq.block_table_mut().append_block(block_id);
                            }
                        }
                        Err(_) => {
                            outputs.postponed_sequences.push(seq_id);
                            blocked.push(seq_id);
                            continue;
                        }
                    }
                }
                outputs.decode_sequences.push(seq_id);
                outputs.num_decode_tokens += 1;
            }

            if !outputs.decode_sequences.is_empty() || blocked.is_empty() {
                return;
            }

            if self.running_ids.len() == 1 {
                // Alone and still blocked: it outgrew the whole cache.
                let seq_id = self.running_ids[0];
                if let Some(seq) = self.remove_sequence(seq_id) {
                    outputs.rejected_sequences.push(seq);
                }
                outputs.postponed_sequences.clear();
                return;
            }

            self.preempt_newest(outputs);
        }
    }

    /// Move the most recently admitted sequence back to the waiting queue.
    fn preempt_newest(&mut self, outputs: &mut SchedulerOutputs) {
        let Some(seq_id) = self.running_ids.pop() else {
            return;
        };
        if let Some(seq) = self.sequences.get_mut(&seq_id) {
            let block_ids = seq.block_table_mut().clear();
            self.block_manager.free_many(&block_ids);
            let _ = seq.set_waiting();
        }
        self.waiting_queue.push_front(seq_id);
        outputs.preempted_sequences.push(seq_id);
        debug!(seq_id, "preempted sequence");
    }

    /// Admit waiting sequences in arrival order.
    fn schedule_waiting(&mut self, outputs: &mut SchedulerOutputs, lookahead: usize) {
        while outputs.num_sequences() < self.config.max_num_seqs {
            let Some(&seq_id) = self.waiting_queue.front() else {
                break;
            };
            let Some(seq) = self.sequences.get(&seq_id) else {
                self.waiting_queue.pop_front();
                continue;
            };

            let num_tokens = seq.total_len();
            if outputs.num_prefill_tokens + num_tokens > self.config.max_num_batched_tokens
                && !outputs.prefill_sequences.is_empty()
            {
                break;
            }

            let blocks_needed = compute_num_blocks(num_tokens + lookahead, self.config.block_size);
            if blocks_needed > self.block_manager.num_blocks() {
                self.waiting_queue.pop_front();
                if let Some(seq) = self.remove_sequence(seq_id) {
                    outputs.rejected_sequences.push(seq);
                }
                continue;
            }

            let Ok(block_ids) = self.block_manager.allocate_many(blocks_needed) else {
                break;
            };

            self.waiting_queue.pop_front();
            if let Some(seq) = self.sequences.get_mut(&seq_id) {
                for block_id in block_ids {
                    seq.block_table_mut().append_block(block_id);
                }
                let _ = seq.set_running();
            }
            self.running_ids.push(seq_id);
            outputs.prefill_sequences.push(seq_id);
            outputs.num_prefill_tokens += num_tokens;
        }
    }

    /// Free blocks a sequence no longer needs after its output shrank.
    pub fn release_surplus_blocks(&mut self, seq_id: SequenceId) {
        if let Some(seq) = self.sequences.get_mut(&seq_id) {
            if seq.status() != SequenceStatus::Running {
                return;
            }
            let needed = compute_num_blocks(seq.total_len(), self.config.block_size);
            let surplus = seq.block_table_mut().truncate(needed);
            self.block_manager.free_many(&surplus);
        }
    }

    /// Get number of waiting sequences.
    pub fn num_waiting(&self) -> usize {
        self.waiting_queue.len()
    }

    /// Get number of running sequences.
    pub fn num_running(&self) -> usize {
        self.running_ids.len()
    }

    /// Check if scheduler has any active sequences.
    pub fn has_unfinished_sequences(&self) -> bool {
        !self.sequences.is_empty()
    }

    /// Get block manager reference.
    pub fn block_manager(&self) -> &BlockManager {
        &self.block_manager
    }

    /// Get the configuration.
    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }
}
