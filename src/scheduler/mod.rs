//! Batch scheduling for continuous batching.
//!
//! This module handles:
//! - FIFO admission under sequence, token and cache budgets
//! - Iteration-level scheduling of running sequences
//! - Backpressure and recompute preemption under cache pressure

pub mod batch;

pub use batch::{Scheduler, SchedulerOutputs};
