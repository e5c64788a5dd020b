//! Token-match verification of draft proposals.

use crate::error::Result;

/// Result of verifying one request's draft tail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    /// How many draft tokens were accepted.
    pub accepted: usize,
    /// Tokens to commit: the accepted draft prefix followed by one token
    /// chosen by the main model (corrective on a mismatch, bonus otherwise).
    pub tokens: Vec<u32>,
}

/// Accept the longest draft prefix the main model agrees with.
///
/// `pick(i)` chooses the main model's token at position `i`; it is called
/// for positions `0..=draft.len()` in order and stops at the first
/// disagreement, so every committed token costs exactly one pick.
pub fn match_prefix<F>(draft: &[u32], mut pick: F) -> Result<Verdict>
where
    F: FnMut(usize) -> Result<u32>,
{
    let mut tokens = Vec::with_capacity(draft.len() + 1);
    for (i, &proposed) in draft.iter().enumerate() {
        let chosen = pick(i)?;
        tokens.push(chosen);
        if chosen != proposed {
            return Ok(Verdict {
                accepted: i,
                tokens,
            });
        }
    }
    tokens.push(pick(draft.len())?);
    Ok(Verdict {
        accepted: draft.len(),
        tokens,
    })
}
