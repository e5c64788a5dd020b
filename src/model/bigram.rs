//! Bigram reference model.
//!
//! The logits for the next token depend only on the current token, which
//! makes the model trivially causal and cheap enough to drive the pipelines
//! in tests and in the demo binary. A perturbed copy of a model makes a
//! plausible draft: mostly agreeing with the original, occasionally not.

use candle_core::{DType, Device, Module, Result, Tensor};
use candle_nn::Embedding;
use rand::{Rng, SeedableRng};

use super::CausalLM;

/// Logit assigned to the chosen successor in [`BigramModel::from_transitions`].
const TRANSITION_LOGIT: f32 = 10.0;

/// A model whose logits are a lookup on the previous token.
#[derive(Debug, Clone)]
pub struct BigramModel {
    /// Transition table `[vocab_size, vocab_size]`, wrapped as an embedding.
    table: Embedding,
    vocab_size: usize,
    device: Device,
}

impl BigramModel {
    /// Random transition logits drawn from `seed`.
    pub fn new(vocab_size: usize, seed: u64, device: &Device) -> Result<Self> {
        let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
        let logits: Vec<f32> = (0..vocab_size * vocab_size)
            .map(|_| rng.gen_range(-4.0f32..4.0))
            .collect();
        Self::from_logits(logits, vocab_size, device)
    }

    /// Deterministic transitions: `next(t)` gets a dominant logit after `t`.
    pub fn from_transitions(
        vocab_size: usize,
        device: &Device,
        next: impl Fn(u32) -> u32,
    ) -> Result<Self> {
        let mut logits = vec![0.0f32; vocab_size * vocab_size];
        for token in 0..vocab_size {
            let successor = next(token as u32) as usize;
            if successor >= vocab_size {
                candle_core::bail!("successor {successor} of token {token} outside vocabulary");
            }
            logits[token * vocab_size + successor] = TRANSITION_LOGIT;
        }
        Self::from_logits(logits, vocab_size, device)
    }

    fn from_logits(logits: Vec<f32>, vocab_size: usize, device: &Device) -> Result<Self> {
        if vocab_size == 0 {
            candle_core::bail!("vocabulary must not be empty");
        }
        let table = Tensor::from_vec(logits, (vocab_size, vocab_size), device)?;
        Ok(Self {
            table: Embedding::new(table, vocab_size),
            vocab_size,
            device: device.clone(),
        })
    }

    /// A copy with uniform noise in `[-noise, noise]` added to every logit.
    pub fn perturbed(&self, noise: f32, seed: u64) -> Result<Self> {
        if noise <= 0.0 {
            return Ok(self.clone());
        }
        let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
        let mut logits: Vec<f32> = self.table.embeddings().flatten_all()?.to_vec1()?;
        for logit in logits.iter_mut() {
            *logit += rng.gen_range(-noise..noise);
        }
        Self::from_logits(logits, self.vocab_size, &self.device)
    }

    /// The raw transition table.
    pub fn transitions(&self) -> &Tensor {
        self.table.embeddings()
    }
}

impl CausalLM for BigramModel {
    fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    fn device(&self) -> &Device {
        &self.device
    }

    fn forward(&mut self, input_ids: &Tensor) -> Result<Tensor> {
        let ids = input_ids.to_dtype(DType::U32)?;
        if let Some(&bad) = ids
            .to_vec1::<u32>()?
            .iter()
            .find(|&&id| id as usize >= self.vocab_size)
        {
            candle_core::bail!("token {bad} outside vocabulary of {}", self.vocab_size);
        }
        self.table.forward(&ids)
    }
}
