//! Token sampling strategies.
//!
//! - **Temperature**: Controls randomness (0 = greedy argmax)
//! - **Top-k**: Limits choices to k most likely tokens
//! - **Top-p (nucleus)**: Limits choices to tokens covering p probability mass
//!
//! ## Sampling Pipeline
//!
//! ```text
//! Logits [vocab_size]
//!     │
//!     ▼ Temperature scaling
//!     ▼ Top-k filtering (optional)
//!     ▼ Softmax
//!     ▼ Top-p filtering (optional)
//!     ▼ Renormalize
//! Distribution [vocab_size]  ──► weighted draw
//! ```
//!
//! The filtered distribution keeps the full vocabulary layout so that
//! rejection sampling can compare main and draft probabilities index by
//! index.

use candle_core::{IndexOp, Tensor, D};
use rand::distributions::Distribution;
use rand::SeedableRng;

use crate::config::GenerationConfig;
use crate::error::{Error, Result};

/// Token sampler with configurable sampling strategies.
#[derive(Debug, Clone)]
pub struct Sampler {
    /// Temperature for scaling logits.
    temperature: f32,
    /// Top-k value (0 = disabled).
    top_k: usize,
    /// Top-p value (1.0 = disabled).
    top_p: f32,
    /// Random number generator.
    rng: rand::rngs::StdRng,
}

impl Sampler {
    /// Creates a sampler for `config`, seeded from `config.seed` when set.
    pub fn new(config: &GenerationConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => rand::rngs::StdRng::seed_from_u64(seed),
            None => rand::rngs::StdRng::from_entropy(),
        };
        Self {
            temperature: config.temperature,
            top_k: config.top_k,
            top_p: config.top_p,
            rng,
        }
    }

    /// Creates a new sampler with a specific seed for reproducibility.
    pub fn with_seed(config: &GenerationConfig, seed: u64) -> Self {
        Self {
            temperature: config.temperature,
            top_k: config.top_k,
            top_p: config.top_p,
            rng: rand::rngs::StdRng::seed_from_u64(seed),
        }
    }

    /// Whether this sampler always picks the argmax.
    pub fn is_greedy(&self) -> bool {
        self.temperature == 0.0
    }

    /// Sample a token from logits.
    ///
    /// Accepts `[vocab_size]` or `[batch, vocab_size]` logits and returns one
    /// token per row.
    pub fn sample(&mut self, logits: &Tensor) -> Result<Vec<u32>> {
        let dims = logits.dims();

        match dims.len() {
            1 => Ok(vec![self.sample_single(logits)?]),
            2 => {
                let mut tokens = Vec::with_capacity(dims[0]);
                for i in 0..dims[0] {
                    tokens.push(self.sample_single(&logits.i(i)?)?);
                }
                Ok(tokens)
            }
            n => Err(Error::Tensor(candle_core::Error::Msg(format!(
                "expected 1D or 2D logits, got {n}D"
            )))),
        }
    }

    /// Sample a single token from 1D logits.
    pub fn sample_single(&mut self, logits: &Tensor) -> Result<u32> {
        if self.is_greedy() {
            return argmax(logits);
        }
        let probs = self.probabilities(logits)?;
        self.sample_from(&probs)
    }

    /// The distribution this sampler draws from, over the full vocabulary.
    ///
    /// For a greedy sampler this is one-hot on the argmax.
    pub fn probabilities(&self, logits: &Tensor) -> Result<Vec<f32>> {
        let vocab_size = logits.dim(0)?;

        if self.is_greedy() {
            let mut probs = vec![0.0f32; vocab_size];
            probs[argmax(logits)? as usize] = 1.0;
            return Ok(probs);
        }

        let logits = logits.to_dtype(candle_core::DType::F32)?;
        let logits = if self.temperature != 1.0 {
            (&logits / self.temperature as f64)?
        } else {
            logits
        };

        let mut logits_vec: Vec<f32> = logits.to_vec1()?;
        if self.top_k > 0 && self.top_k < vocab_size {
            apply_top_k(&mut logits_vec, self.top_k);
        }

        let masked = Tensor::from_vec(logits_vec, vocab_size, logits.device())?;
        let mut probs: Vec<f32> = candle_nn::ops::softmax(&masked, D::Minus1)?.to_vec1()?;

        if self.top_p < 1.0 {
            apply_top_p(&mut probs, self.top_p);
        }
        Ok(probs)
    }

    /// Draw a token index from an (unnormalized) distribution.
    pub fn sample_from(&mut self, probs: &[f32]) -> Result<u32> {
        let dist = rand::distributions::WeightedIndex::new(probs).map_err(|e| {
            Error::Tensor(candle_core::Error::Msg(format!(
                "failed to create distribution: {e}"
            )))
        })?;
        Ok(dist.sample(&mut self.rng) as u32)
    }

    /// The random stream, shared with rejection sampling.
    pub(crate) fn rng_mut(&mut self) -> &mut rand::rngs::StdRng {
        &mut self.rng
    }
}

/// Greedy decoding: the token with the highest logit.
pub fn argmax(logits: &Tensor) -> Result<u32> {
    Ok(logits.argmax(D::Minus1)?.to_scalar::<u32>()?)
}

/// Mask every logit outside the top `k` with negative infinity.
fn apply_top_k(logits: &mut [f32], k: usize) {
    let mut sorted: Vec<f32> = logits.to_vec();
    sorted.sort_by(|a, b| b.partial_cmp(a).unwrap_or(std::cmp::Ordering::Equal));
    let threshold = sorted[k - 1];

    let mut kept = 0;
    for logit in logits.iter_mut() {
        if *logit >= threshold && kept < k {
            kept += 1;
        } else {
            *logit = f32::NEG_INFINITY;
        }
    }
}

/// Zero out tokens beyond the smallest set covering `p` probability mass.
fn apply_top_p(probs: &mut [f32], p: f32) {
    let mut order: Vec<usize> = (0..probs.len()).collect();
    order.sort_by(|&a, &b| {
        probs[b]
            .partial_cmp(&probs[a])
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut cumulative = 0.0f32;
    let mut cutoff = order.len();
    for (rank, &idx) in order.iter().enumerate() {
        cumulative += probs[idx];
        if cumulative > p {
            // Include the token that pushed us over
            cutoff = rank + 1;
            break;
        }
    }

    for &idx in &order[cutoff..] {
        probs[idx] = 0.0;
    }
    let sum: f32 = probs.iter().sum();
    if sum > 0.0 {
        for prob in probs.iter_mut() {
            *prob /= sum;
        }
    }
}
