//! nano-spec: speculative decoding on top of continuous batching.
//!
//! This crate implements the generation core of an LLM inference server:
//! - Continuous batching with FIFO admission, KV block accounting and preemption
//! - Speculative decoding with a draft model proposing and a main model verifying
//! - Generation performance metrics that merge across pipelines

pub mod config;
pub mod error;
pub mod tokenizer;

pub mod core;
pub mod engine;
pub mod metrics;
pub mod model;
pub mod scheduler;
pub mod speculative;

pub use config::{GenerationConfig, ModelDesc, SchedulerConfig};
pub use engine::{
    ContinuousBatchingPipeline, GenerationHandle, GenerationResult, GenerationStatus, Pipeline,
    PromptInput, RequestId, Sampler, Streamer, StreamerStatus,
};
pub use error::{Error, Result};
pub use metrics::{MeanStdPair, PerfMetrics, RawPerfMetrics};
pub use model::{BigramModel, CausalLM};
pub use scheduler::{Scheduler, SchedulerOutputs};
pub use speculative::{
    AcceptanceMode, SpeculativeConfig, SpeculativeDecodingMetrics, SpeculativeDecodingPipeline,
};
pub use tokenizer::TextTokenizer;
