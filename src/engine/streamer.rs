//! Incremental token delivery during `generate`.

use crate::core::sequence::SequenceId;

/// What the streamer wants after receiving tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamerStatus {
    /// Keep generating.
    Running,
    /// Cancel the remaining requests of this `generate` call.
    Stop,
}

/// Receives committed tokens, in order per request.
///
/// `put` may be called zero or more times per step.
pub trait Streamer {
    /// New tokens for `request_id`.
    fn put(&mut self, request_id: SequenceId, tokens: &[u32]) -> StreamerStatus;

    /// Generation is over.
    fn end(&mut self) {}
}

impl<F> Streamer for F
where
    F: FnMut(SequenceId, &[u32]) -> StreamerStatus,
{
    fn put(&mut self, request_id: SequenceId, tokens: &[u32]) -> StreamerStatus {
        self(request_id, tokens)
    }
}
