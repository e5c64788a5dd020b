//! Rejection sampling for speculative decoding.
//!
//! A draft token `x` drawn from the draft distribution `q` is accepted with
//! probability `min(1, p(x) / q(x))`, where `p` is the main model's
//! distribution. On rejection the replacement is drawn from the residual
//! `norm(max(0, p - q))`. The committed tokens are then distributed exactly
//! as if they had been sampled from `p` directly.
//!
//! ```text
//! Draft:   x1   x2   x3   x4
//! Accept:  ✓    ✓    ✗         -> commit x1, x2, resample from residual
//! ```

use rand::distributions::{Distribution, WeightedIndex};
use rand::Rng;

use super::verify::Verdict;
use crate::error::{Error, Result};

/// Rejection-sample a draft tail against the main distributions.
///
/// `draft_probs` holds one distribution per draft token and `target_probs`
/// one more, for the bonus token drawn when every proposal is accepted.
pub fn rejection_verify<R: Rng + ?Sized>(
    rng: &mut R,
    draft_tokens: &[u32],
    draft_probs: &[Vec<f32>],
    target_probs: &[Vec<f32>],
) -> Result<Verdict> {
    let k = draft_tokens.len();
    if draft_probs.len() != k || target_probs.len() != k + 1 {
        return Err(Error::Config(format!(
            "rejection sampling needs {k} draft and {} target distributions, got {} and {}",
            k + 1,
            draft_probs.len(),
            target_probs.len()
        )));
    }

    let mut tokens = Vec::with_capacity(k + 1);
    for (i, &token) in draft_tokens.iter().enumerate() {
        let (q, p) = (&draft_probs[i], &target_probs[i]);
        let idx = token as usize;
        if idx >= p.len() || idx >= q.len() {
            return Err(Error::Config(format!("draft token {token} outside vocabulary")));
        }

        let ratio = if q[idx] > 0.0 {
            (p[idx] / q[idx]).min(1.0)
        } else if p[idx] > 0.0 {
            1.0
        } else {
            0.0
        };
        if rng.gen::<f32>() < ratio {
            tokens.push(token);
            continue;
        }

        // Rejected: resample from the part of p that q under-covers
        let residual: Vec<f32> = p.iter().zip(q).map(|(&p, &q)| (p - q).max(0.0)).collect();
        let replacement = if residual.iter().sum::<f32>() > 0.0 {
            draw(rng, &residual)?
        } else {
            draw(rng, p)?
        };
        tokens.push(replacement);
        return Ok(Verdict {
            accepted: i,
            tokens,
        });
    }

    tokens.push(draw(rng, &target_probs[k])?);
    Ok(Verdict {
        accepted: k,
        tokens,
    })
}

fn draw<R: Rng + ?Sized>(rng: &mut R, weights: &[f32]) -> Result<u32> {
    let dist = WeightedIndex::new(weights)
        .map_err(|e| Error::Config(format!("invalid distribution: {e}")))?;
    Ok(dist.sample(rng) as u32)
}
