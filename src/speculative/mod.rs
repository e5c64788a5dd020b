//! Speculative decoding.
//!
//! A small draft model proposes several tokens per request; the larger main
//! model checks all of them in one forward pass and keeps the longest
//! agreeing prefix plus one token of its own.
//!
//! ## How it works
//!
//! 1. **Draft Phase**: The draft pipeline extends every request with up to
//!    K unverified ("assumed") tokens.
//!
//! 2. **Verify Phase**: The main pipeline runs committed tokens plus the
//!    assumed tail through the main model, yielding K+1 distributions.
//!
//! 3. **Acceptance**: Token matching (exact) or rejection sampling decides
//!    how much of the tail survives.
//!
//! ## Example
//!
//! ```text
//! Draft (K=4):     [prompt] -> t1 -> t2 -> t3 -> t4
//! Main verify:     [prompt, t1, t2, t3, t4] -> logits for all 5 positions
//! Token match:     Accept t1, t2, main picks t3' != t3 -> commit t1, t2, t3'
//! ```

pub mod config;
pub mod metrics;
pub mod pipeline;
pub mod sampler;
pub mod verify;

pub use config::{AcceptanceMode, SpeculativeConfig};
pub use metrics::{RequestAcceptance, SpeculativeDecodingMetrics};
pub use pipeline::SpeculativeDecodingPipeline;
pub use sampler::rejection_verify;
pub use verify::Verdict;
