//! Tokenizer interface.
//!
//! Pipelines only need to turn prompt strings into token ids and back.
//! Main and draft pipelines must agree on the vocabulary, otherwise
//! comparing their token ids is meaningless.

use crate::error::{Error, Result};

/// Text to token-id conversion shared by a pipeline.
pub trait TextTokenizer: Send + Sync {
    /// Encode `text` into token ids.
    fn encode(&self, text: &str) -> Result<Vec<u32>>;

    /// Decode token ids back into text.
    fn decode(&self, token_ids: &[u32]) -> Result<String>;

    /// Number of entries in the vocabulary.
    fn vocab_size(&self) -> usize;
}

// `encode`/`decode` are inherent on the `TokenizerImpl` behind `Deref`.
impl TextTokenizer for tokenizers::Tokenizer {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let encoding = (**self)
            .encode(text, false)
            .map_err(|e| Error::Tokenization(e.to_string()))?;
        Ok(encoding.get_ids().to_vec())
    }

    fn decode(&self, token_ids: &[u32]) -> Result<String> {
        (**self)
            .decode(token_ids, true)
            .map_err(|e| Error::Tokenization(e.to_string()))
    }

    fn vocab_size(&self) -> usize {
        self.get_vocab_size(true)
    }
}

/// Check that two tokenizers can share token ids.
pub fn ensure_compatible(main: &dyn TextTokenizer, draft: &dyn TextTokenizer) -> Result<()> {
    if main.vocab_size() != draft.vocab_size() {
        return Err(Error::Config(format!(
            "draft tokenizer vocabulary ({}) differs from main tokenizer vocabulary ({})",
            draft.vocab_size(),
            main.vocab_size()
        )));
    }
    Ok(())
}
