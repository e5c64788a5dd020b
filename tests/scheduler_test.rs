//! Integration tests for Scheduler.

use nano_spec::core::sequence::{Sequence, SequenceId, SequenceStatus};
use nano_spec::scheduler::batch::Scheduler;
use nano_spec::SchedulerConfig;

fn test_config() -> SchedulerConfig {
    SchedulerConfig {
        max_num_seqs: 4,
        max_num_batched_tokens: 100,
        block_size: 4,
        num_blocks: 32,
    }
}

fn seq(id: SequenceId, prompt_len: usize) -> Sequence {
    Sequence::with_block_size(id, (0..prompt_len as u32).collect(), 4)
}

fn grow(scheduler: &mut Scheduler, id: SequenceId, n: usize) {
    let seq = scheduler.get_sequence_mut(id).unwrap();
    for i in 0..n {
        seq.append_token(i as u32);
    }
}

#[test]
fn test_scheduler_creation() {
    let scheduler = Scheduler::new(test_config());

    assert_eq!(scheduler.num_waiting(), 0);
    assert_eq!(scheduler.num_running(), 0);
    assert!(!scheduler.has_unfinished_sequences());
    assert_eq!(scheduler.block_manager().num_free_blocks(), 32);
}

#[test]
fn test_basic_scheduling() {
    let mut scheduler = Scheduler::new(test_config());
    scheduler.add_sequence(seq(1, 4));

    let outputs = scheduler.schedule(1);
    assert_eq!(outputs.prefill_sequences, vec![1]);
    assert!(outputs.decode_sequences.is_empty());
    assert_eq!(outputs.num_prefill_tokens, 4);
    assert_eq!(scheduler.num_running(), 1);
    assert_eq!(
        scheduler.get_sequence(1).unwrap().status(),
        SequenceStatus::Running
    );

    // Second iteration decodes
    let outputs = scheduler.schedule(1);
    assert_eq!(outputs.decode_sequences, vec![1]);
    assert!(outputs.prefill_sequences.is_empty());
}

#[test]
fn test_fifo_admission_under_seq_cap() {
    let config = SchedulerConfig {
        max_num_seqs: 2,
        ..test_config()
    };
    let mut scheduler = Scheduler::new(config);
    for id in 1..=3 {
        scheduler.add_sequence(seq(id, 4));
    }

    let outputs = scheduler.schedule(1);
    assert_eq!(outputs.prefill_sequences, vec![1, 2]);
    assert_eq!(scheduler.num_waiting(), 1);

    scheduler.remove_sequence(1);
    let outputs = scheduler.schedule(1);
    assert_eq!(outputs.decode_sequences, vec![2]);
    assert_eq!(outputs.prefill_sequences, vec![3]);
}

#[test]
fn test_prompt_token_budget() {
    let config = SchedulerConfig {
        max_num_batched_tokens: 6,
        ..test_config()
    };
    let mut scheduler = Scheduler::new(config);
    scheduler.add_sequence(seq(1, 8));
    scheduler.add_sequence(seq(2, 4));

    // The first prompt is admitted even though it alone exceeds the budget
    let outputs = scheduler.schedule(1);
    assert_eq!(outputs.prefill_sequences, vec![1]);

    let outputs = scheduler.schedule(1);
    assert_eq!(outputs.prefill_sequences, vec![2]);
}

#[test]
fn test_backpressure_postpones_running_sequence() {
    let config = SchedulerConfig {
        num_blocks: 3,
        ..test_config()
    };
    let mut scheduler = Scheduler::new(config);
    scheduler.add_sequence(seq(1, 4)); // 4 + 1 -> 2 blocks
    scheduler.add_sequence(seq(2, 3)); // 3 + 1 -> 1 block
    scheduler.schedule(1);
    assert_eq!(scheduler.block_manager().num_free_blocks(), 0);

    grow(&mut scheduler, 2, 1); // 4 + 1 -> needs a second block
    let outputs = scheduler.schedule(1);
    assert_eq!(outputs.decode_sequences, vec![1]);
    assert_eq!(outputs.postponed_sequences, vec![2]);
    assert!(outputs.preempted_sequences.is_empty());
}

#[test]
fn test_preempts_newest_when_nothing_can_run() {
    let config = SchedulerConfig {
        num_blocks: 4,
        ..test_config()
    };
    let mut scheduler = Scheduler::new(config);
    scheduler.add_sequence(seq(1, 4));
    scheduler.add_sequence(seq(2, 4));
    scheduler.schedule(1);
    assert_eq!(scheduler.block_manager().num_free_blocks(), 0);

    // Both now need a third block and none is free
    grow(&mut scheduler, 1, 4);
    grow(&mut scheduler, 2, 4);
    let outputs = scheduler.schedule(1);

    assert_eq!(outputs.preempted_sequences, vec![2]);
    assert_eq!(outputs.decode_sequences, vec![1]);
    assert_eq!(scheduler.num_waiting(), 1);
    let preempted = scheduler.get_sequence(2).unwrap();
    assert_eq!(preempted.status(), SequenceStatus::Waiting);
    assert!(preempted.block_table().is_empty());
    // Output survives preemption and is recomputed later
    assert_eq!(preempted.output_len(), 4);
}

#[test]
fn test_rejects_prompt_larger_than_cache() {
    let config = SchedulerConfig {
        num_blocks: 2,
        ..test_config()
    };
    let mut scheduler = Scheduler::new(config);
    scheduler.add_sequence(seq(1, 12));
    scheduler.add_sequence(seq(2, 3));

    let outputs = scheduler.schedule(1);
    assert_eq!(outputs.rejected_sequences.len(), 1);
    assert_eq!(outputs.rejected_sequences[0].seq_id(), 1);
    assert_eq!(outputs.prefill_sequences, vec![2]);
    assert!(scheduler.get_sequence(1).is_none());
}

#[test]
fn test_rejects_sequence_that_outgrew_cache() {
    let config = SchedulerConfig {
        num_blocks: 2,
        ..test_config()
    };
    let mut scheduler = Scheduler::new(config);
    scheduler.add_sequence(seq(1, 4));
    scheduler.schedule(1);

    grow(&mut scheduler, 1, 4);
    let outputs = scheduler.schedule(1);
    assert_eq!(outputs.rejected_sequences.len(), 1);
    assert!(outputs.is_empty());
    assert!(!scheduler.has_unfinished_sequences());
    assert_eq!(scheduler.block_manager().num_free_blocks(), 2);
}

#[test]
fn test_remove_sequence_frees_blocks() {
    let mut scheduler = Scheduler::new(test_config());
    scheduler.add_sequence(seq(1, 10));
    scheduler.schedule(1);
    assert_eq!(scheduler.block_manager().num_used_blocks(), 3);

    let removed = scheduler.remove_sequence(1).unwrap();
    assert_eq!(removed.seq_id(), 1);
    assert_eq!(scheduler.block_manager().num_used_blocks(), 0);
    assert!(scheduler.remove_sequence(1).is_none());
}

#[test]
fn test_assumed_tokens_count_towards_blocks() {
    let mut scheduler = Scheduler::new(test_config());
    scheduler.add_sequence(seq(1, 4));
    scheduler.schedule(1);

    let seq = scheduler.get_sequence_mut(1).unwrap();
    for token in [7, 8, 9, 10] {
        seq.append_assumed_token(token);
    }
    scheduler.schedule(1);
    // 8 tokens + 1 lookahead
    assert_eq!(scheduler.block_manager().num_used_blocks(), 3);

    scheduler.get_sequence_mut(1).unwrap().sync_output(&[7]);
    scheduler.release_surplus_blocks(1);
    assert_eq!(scheduler.block_manager().num_used_blocks(), 2);
}
