//! Configuration types for nano-spec.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::tokenizer::TextTokenizer;

/// Scheduler sizing for one pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Maximum number of sequences to schedule per iteration.
    pub max_num_seqs: usize,
    /// Maximum prompt tokens admitted per iteration.
    pub max_num_batched_tokens: usize,
    /// Tokens per KV cache block.
    pub block_size: usize,
    /// Total number of KV cache blocks.
    pub num_blocks: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_num_seqs: 256,
            max_num_batched_tokens: 4096,
            block_size: 16,
            num_blocks: 1024,
        }
    }
}

impl SchedulerConfig {
    /// Check that the sizing describes a usable scheduler.
    pub fn validate(&self) -> Result<()> {
        if self.max_num_seqs == 0 {
            return Err(Error::Config("max_num_seqs must be positive".into()));
        }
        if self.max_num_batched_tokens == 0 {
            return Err(Error::Config("max_num_batched_tokens must be positive".into()));
        }
        if self.block_size == 0 || self.num_blocks == 0 {
            return Err(Error::Config(format!(
                "invalid cache geometry: {} blocks of {} tokens",
                self.num_blocks, self.block_size
            )));
        }
        Ok(())
    }

    /// Total number of tokens the cache can hold.
    pub fn cache_capacity(&self) -> usize {
        self.block_size * self.num_blocks
    }
}

/// Per-request generation configuration: stopping criteria and sampling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    /// Maximum tokens to generate.
    pub max_new_tokens: usize,
    /// Temperature for sampling (0.0 = greedy).
    pub temperature: f32,
    /// Top-k sampling (0 = disabled).
    pub top_k: usize,
    /// Top-p (nucleus) sampling (1.0 = disabled).
    pub top_p: f32,
    /// End-of-sequence token.
    pub eos_token_id: Option<u32>,
    /// Additional tokens that stop generation.
    pub stop_token_ids: Vec<u32>,
    /// Keep generating past the end-of-sequence token.
    pub ignore_eos: bool,
    /// Sampler seed; entropy when unset.
    pub seed: Option<u64>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_new_tokens: 256,
            temperature: 1.0,
            top_k: 0,
            top_p: 1.0,
            eos_token_id: None,
            stop_token_ids: Vec::new(),
            ignore_eos: false,
            seed: None,
        }
    }
}

impl GenerationConfig {
    /// Greedy decoding with default stopping criteria.
    pub fn greedy() -> Self {
        Self {
            temperature: 0.0,
            ..Default::default()
        }
    }

    /// Set the maximum tokens to generate.
    pub fn max_new_tokens(mut self, max_new_tokens: usize) -> Self {
        self.max_new_tokens = max_new_tokens;
        self
    }

    /// Set the sampling temperature.
    pub fn temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    /// Set top-k sampling.
    pub fn top_k(mut self, top_k: usize) -> Self {
        self.top_k = top_k;
        self
    }

    /// Set top-p sampling.
    pub fn top_p(mut self, top_p: f32) -> Self {
        self.top_p = top_p;
        self
    }

    /// Set the end-of-sequence token.
    pub fn eos_token_id(mut self, eos_token_id: u32) -> Self {
        self.eos_token_id = Some(eos_token_id);
        self
    }

    /// Add a stop token.
    pub fn stop_token(mut self, token_id: u32) -> Self {
        self.stop_token_ids.push(token_id);
        self
    }

    /// Set the sampler seed.
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Whether sampling reduces to argmax.
    pub fn is_greedy(&self) -> bool {
        self.temperature == 0.0
    }

    /// Whether `token_id` ends generation under this config.
    pub fn is_stop_token(&self, token_id: u32) -> bool {
        (!self.ignore_eos && self.eos_token_id == Some(token_id))
            || self.stop_token_ids.contains(&token_id)
    }

    /// Reject configurations no sampler can honour.
    pub fn validate(&self) -> Result<()> {
        if self.max_new_tokens == 0 {
            return Err(Error::Config("max_new_tokens must be positive".into()));
        }
        if !(self.temperature >= 0.0) {
            return Err(Error::Config(format!(
                "temperature must be non-negative, got {}",
                self.temperature
            )));
        }
        if !(self.top_p > 0.0 && self.top_p <= 1.0) {
            return Err(Error::Config(format!(
                "top_p must be in (0, 1], got {}",
                self.top_p
            )));
        }
        Ok(())
    }
}

/// Everything needed to build one pipeline around a model.
///
/// Consumed at construction; nothing here is read at steady state.
pub struct ModelDesc<M> {
    /// The model.
    pub model: M,
    /// Tokenizer for prompt strings and detokenized results.
    pub tokenizer: Option<Arc<dyn TextTokenizer>>,
    /// Scheduler sizing.
    pub scheduler_config: SchedulerConfig,
    /// Defaults for requests submitted without an explicit config.
    pub generation_config: GenerationConfig,
    /// Time spent loading the model, reported in perf metrics.
    pub load_time: Duration,
}

impl<M> ModelDesc<M> {
    /// Describe `model` with default scheduler and generation settings.
    pub fn new(model: M) -> Self {
        Self {
            model,
            tokenizer: None,
            scheduler_config: SchedulerConfig::default(),
            generation_config: GenerationConfig::default(),
            load_time: Duration::ZERO,
        }
    }

    /// Attach a tokenizer.
    pub fn tokenizer(mut self, tokenizer: Arc<dyn TextTokenizer>) -> Self {
        self.tokenizer = Some(tokenizer);
        self
    }

    /// Set the scheduler sizing.
    pub fn scheduler_config(mut self, config: SchedulerConfig) -> Self {
        self.scheduler_config = config;
        self
    }

    /// Set the default generation config.
    pub fn generation_config(mut self, config: GenerationConfig) -> Self {
        self.generation_config = config;
        self
    }

    /// Record the model load time.
    pub fn load_time(mut self, load_time: Duration) -> Self {
        self.load_time = load_time;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scheduler_config_validation() {
        assert!(SchedulerConfig::default().validate().is_ok());

        let config = SchedulerConfig {
            num_blocks: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let config = SchedulerConfig {
            max_num_seqs: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_generation_config_validation() {
        assert!(GenerationConfig::default().validate().is_ok());
        assert!(GenerationConfig::greedy().validate().is_ok());
        assert!(GenerationConfig::default().max_new_tokens(0).validate().is_err());
        assert!(GenerationConfig::default().temperature(-1.0).validate().is_err());
        assert!(GenerationConfig::default().temperature(f32::NAN).validate().is_err());
        assert!(GenerationConfig::default().top_p(0.0).validate().is_err());
    }

    #[test]
    fn test_stop_tokens() {
        let config = GenerationConfig::greedy().eos_token_id(2).stop_token(7);
        assert!(config.is_stop_token(2));
        assert!(config.is_stop_token(7));
        assert!(!config.is_stop_token(3));

        let config = GenerationConfig {
            ignore_eos: true,
            ..config
        };
        assert!(!config.is_stop_token(2));
        assert!(config.is_stop_token(7));
    }
}
