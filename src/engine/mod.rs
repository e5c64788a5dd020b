//! Inference engine.
//!
//! This module contains:
//! - The [`Pipeline`] interface shared by plain and speculative generation
//! - [`ContinuousBatchingPipeline`], the single-model continuous batcher
//! - Generation handles, streamers and the token sampler

pub mod handle;
pub mod pipeline;
pub mod sampler;
pub mod streamer;

use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tracing::debug;

use crate::config::GenerationConfig;
use crate::core::sequence::{FinishReason, SequenceId};
use crate::error::{Error, Result};
use crate::metrics::PerfMetrics;
use crate::tokenizer::TextTokenizer;

pub use handle::{GenerationHandle, GenerationStatus};
pub use pipeline::{ContinuousBatchingPipeline, DraftProposal, ValidationOutcome, ValidationReport};
pub use sampler::Sampler;
pub use streamer::{Streamer, StreamerStatus};

/// Caller-assigned request identifier.
pub type RequestId = SequenceId;

/// Prompt of a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PromptInput {
    /// Already tokenized input.
    Tokens(Vec<u32>),
    /// Text, tokenized by the pipeline's tokenizer.
    Text(String),
}

impl From<Vec<u32>> for PromptInput {
    fn from(tokens: Vec<u32>) -> Self {
        PromptInput::Tokens(tokens)
    }
}

impl From<String> for PromptInput {
    fn from(text: String) -> Self {
        PromptInput::Text(text)
    }
}

impl From<&str> for PromptInput {
    fn from(text: &str) -> Self {
        PromptInput::Text(text.to_string())
    }
}

/// Final state of one request of a [`Pipeline::generate`] call.
#[derive(Debug, Clone, Serialize)]
pub struct GenerationResult {
    pub request_id: RequestId,
    /// Generated tokens.
    pub token_ids: Vec<u32>,
    /// Decoded tokens, when the pipeline has a tokenizer.
    pub text: Option<String>,
    pub status: GenerationStatus,
    pub finish_reason: Option<FinishReason>,
    pub perf_metrics: PerfMetrics,
}

/// A step-driven generation pipeline.
///
/// All methods take `&self`; submission and stepping may happen on
/// different threads.
pub trait Pipeline: Send + Sync {
    /// Submit a request.
    ///
    /// # Errors
    ///
    /// [`Error::DuplicateRequest`] if `request_id` is active, [`Error::Config`]
    /// for an invalid config, [`Error::Tokenization`] for empty input or
    /// text without a tokenizer.
    fn add_request(
        &self,
        request_id: RequestId,
        input: PromptInput,
        config: GenerationConfig,
    ) -> Result<GenerationHandle>;

    /// Advance every in-flight request by one iteration.
    fn step(&self) -> Result<()>;

    /// Whether any submitted request is still unfinished.
    fn has_non_finished_requests(&self) -> bool;

    /// A fresh request id that no active request holds.
    fn allocate_request_id(&self) -> RequestId;

    /// Tokenizer used for text prompts and results.
    fn tokenizer(&self) -> Option<Arc<dyn TextTokenizer>>;

    /// Aggregate metrics of every request that left the pipeline.
    fn perf_metrics(&self) -> PerfMetrics;

    /// Run `inputs` to completion.
    ///
    /// Steps while any request is unfinished, handing newly committed
    /// tokens to `streamer` after every step. A streamer returning
    /// [`StreamerStatus::Stop`] cancels every request of this call.
    fn generate(
        &self,
        inputs: Vec<PromptInput>,
        configs: Vec<GenerationConfig>,
        mut streamer: Option<&mut dyn Streamer>,
    ) -> Result<Vec<GenerationResult>> {
        if inputs.len() != configs.len() {
            return Err(Error::Config(format!(
                "{} inputs but {} generation configs",
                inputs.len(),
                configs.len()
            )));
        }

        let start = Instant::now();
        let mut handles = Vec::with_capacity(inputs.len());
        for (input, config) in inputs.into_iter().zip(configs) {
            let request_id = self.allocate_request_id();
            match self.add_request(request_id, input, config) {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    handles.iter().for_each(GenerationHandle::cancel);
                    while handles.iter().any(|handle| !handle.is_finished()) {
                        self.step()?;
                    }
                    return Err(e);
                }
            }
        }

        let mut streaming = streamer.is_some();
        while self.has_non_finished_requests() {
            self.step()?;

            if !streaming {
                continue;
            }
            let Some(streamer) = streamer.as_mut() else {
                continue;
            };
            for handle in &handles {
                let tokens = handle.read();
                if tokens.is_empty() {
                    continue;
                }
                if streamer.put(handle.request_id(), &tokens) == StreamerStatus::Stop {
                    debug!(request_id = handle.request_id(), "streamer stopped generation");
                    handles.iter().for_each(GenerationHandle::cancel);
                    streaming = false;
                    break;
                }
            }
        }
        if let Some(streamer) = streamer {
            streamer.end();
        }

        let generate_duration = start.elapsed();
        let tokenizer = self.tokenizer();
        handles
            .into_iter()
            .map(|handle| {
                let token_ids = handle.tokens();
                let mut perf_metrics = handle.perf_metrics().unwrap_or_default();
                let text = match &tokenizer {
                    Some(tokenizer) => {
                        let detokenize_start = Instant::now();
                        let text = tokenizer.decode(&token_ids)?;
                        perf_metrics
                            .raw_metrics
                            .detokenization_durations
                            .push(detokenize_start.elapsed());
                        Some(text)
                    }
                    None => None,
                };
                perf_metrics
                    .raw_metrics
                    .generate_durations
                    .push(generate_duration);
                perf_metrics.evaluate_statistics(None);

                Ok(GenerationResult {
                    request_id: handle.request_id(),
                    token_ids,
                    text,
                    status: handle.status(),
                    finish_reason: handle.finish_reason(),
                    perf_metrics,
                })
            })
            .collect()
    }
}
