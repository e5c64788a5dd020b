//! Speculative decoding configuration.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::config::GenerationConfig;
use crate::error::{Error, Result};

/// How the main model decides whether to accept a draft token.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AcceptanceMode {
    /// Accept a draft token iff the main sampler picks the same token.
    /// Output is identical to plain decoding with the same config and seed.
    #[default]
    Greedy,
    /// Accept with probability `min(1, p/q)`, resampling from the residual
    /// on rejection. Applies to requests with `temperature > 0`; greedy
    /// requests fall back to token matching.
    RejectionSampling,
}

/// Configuration for speculative decoding.
///
/// Speculative decoding uses a small draft model to propose K tokens,
/// then verifies them with the larger main model in a single forward pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpeculativeConfig {
    /// Number of tokens to speculate per iteration (K).
    /// Higher values can improve throughput if acceptance rate is high,
    /// but may waste computation if many tokens are rejected.
    pub num_speculative_tokens: usize,

    /// Acceptance rule used during verification.
    pub acceptance: AcceptanceMode,

    /// Sampling used by the draft model. `max_new_tokens` and the stop
    /// criteria are always taken from the request.
    pub draft_generation_config: GenerationConfig,
}

impl Default for SpeculativeConfig {
    fn default() -> Self {
        Self {
            num_speculative_tokens: 4,
            acceptance: AcceptanceMode::Greedy,
            draft_generation_config: GenerationConfig::greedy(),
        }
    }
}

impl SpeculativeConfig {
    /// Default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of speculative tokens.
    pub fn num_tokens(mut self, k: usize) -> Self {
        self.num_speculative_tokens = k;
        self
    }

    /// Set the acceptance rule.
    pub fn acceptance(mut self, mode: AcceptanceMode) -> Self {
        self.acceptance = mode;
        self
    }

    /// Set the draft model's sampling.
    pub fn draft_generation_config(mut self, config: GenerationConfig) -> Self {
        self.draft_generation_config = config;
        self
    }

    /// Load from a JSON file; missing fields take their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the coordinator cannot run.
    pub fn validate(&self) -> Result<()> {
        if self.num_speculative_tokens == 0 {
            return Err(Error::Config(
                "num_speculative_tokens must be positive".to_string(),
            ));
        }
        let draft = &self.draft_generation_config;
        if !(draft.temperature >= 0.0) || !(draft.top_p > 0.0 && draft.top_p <= 1.0) {
            return Err(Error::Config(format!(
                "invalid draft sampling: temperature {}, top_p {}",
                draft.temperature, draft.top_p
            )));
        }
        Ok(())
    }

    /// The draft-side config mirroring `request`.
    pub fn draft_config_for(&self, request: &GenerationConfig) -> GenerationConfig {
        GenerationConfig {
            max_new_tokens: request.max_new_tokens,
            eos_token_id: request.eos_token_id,
            stop_token_ids: request.stop_token_ids.clone(),
            ignore_eos: request.ignore_eos,
            ..self.draft_generation_config.clone()
        }
    }
}
