//! Caller-side handles on in-flight generations.
//!
//! A [`GenerationHandle`] shares one [`GenerationStream`] with the pipeline
//! that owns the request. The pipeline pushes committed tokens and the final
//! status; the caller polls, reads, or asks for cancellation. Cancellation is
//! honoured at the pipeline's next step.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;

use crate::core::sequence::{FinishReason, SequenceId};
use crate::metrics::PerfMetrics;

/// Lifecycle of a request as seen by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum GenerationStatus {
    /// Still producing tokens.
    Running,
    /// Stopped by a stopping criterion.
    Finished,
    /// Cancelled before finishing.
    Dropped,
    /// Failed; see [`GenerationHandle::error`].
    Failed,
}

#[derive(Debug)]
struct GenerationStream {
    tokens: Vec<u32>,
    read_cursor: usize,
    status: GenerationStatus,
    finish_reason: Option<FinishReason>,
    cancel_requested: bool,
    error: Option<String>,
    perf_metrics: Option<PerfMetrics>,
}

/// Handle to one request's generation.
#[derive(Debug, Clone)]
pub struct GenerationHandle {
    request_id: SequenceId,
    stream: Arc<Mutex<GenerationStream>>,
}

impl GenerationHandle {
    pub(crate) fn new(request_id: SequenceId) -> Self {
        Self {
            request_id,
            stream: Arc::new(Mutex::new(GenerationStream {
                tokens: Vec::new(),
                read_cursor: 0,
                status: GenerationStatus::Running,
                finish_reason: None,
                cancel_requested: false,
                error: None,
                perf_metrics: None,
            })),
        }
    }

    /// The request this handle belongs to.
    pub fn request_id(&self) -> SequenceId {
        self.request_id
    }

    /// Tokens committed since the previous `read`.
    pub fn read(&self) -> Vec<u32> {
        let mut stream = self.stream.lock();
        let new_tokens = stream.tokens[stream.read_cursor..].to_vec();
        stream.read_cursor = stream.tokens.len();
        new_tokens
    }

    /// Whether `read` would return anything.
    pub fn can_read(&self) -> bool {
        let stream = self.stream.lock();
        stream.read_cursor < stream.tokens.len()
    }

    /// Every token committed so far.
    pub fn tokens(&self) -> Vec<u32> {
        self.stream.lock().tokens.clone()
    }

    /// Current status.
    pub fn status(&self) -> GenerationStatus {
        self.stream.lock().status
    }

    /// Whether the request has left the `Running` state.
    pub fn is_finished(&self) -> bool {
        self.status() != GenerationStatus::Running
    }

    /// Why generation stopped, once it has.
    pub fn finish_reason(&self) -> Option<FinishReason> {
        self.stream.lock().finish_reason
    }

    /// Failure message of a failed request.
    pub fn error(&self) -> Option<String> {
        self.stream.lock().error.clone()
    }

    /// Timing of a completed request.
    pub fn perf_metrics(&self) -> Option<PerfMetrics> {
        self.stream.lock().perf_metrics.clone()
    }

    /// Ask the pipeline to drop this request at its next step.
    pub fn cancel(&self) {
        self.stream.lock().cancel_requested = true;
    }

    pub(crate) fn is_cancel_requested(&self) -> bool {
        self.stream.lock().cancel_requested
    }

    pub(crate) fn push_tokens(&self, tokens: &[u32]) {
        self.stream.lock().tokens.extend_from_slice(tokens);
    }

    pub(crate) fn set_finished(&self, reason: FinishReason, perf_metrics: PerfMetrics) {
        let mut stream = self.stream.lock();
        stream.status = GenerationStatus::Finished;
        stream.finish_reason = Some(reason);
        stream.perf_metrics = Some(perf_metrics);
    }

    pub(crate) fn set_dropped(&self) {
        let mut stream = self.stream.lock();
        if stream.status == GenerationStatus::Running {
            stream.status = GenerationStatus::Dropped;
            stream.finish_reason = Some(FinishReason::Aborted);
        }
    }

    pub(crate) fn set_failed(&self, error: impl Into<String>) {
        let mut stream = self.stream.lock();
        stream.status = GenerationStatus::Failed;
        stream.error = Some(error.into());
    }

    /// Whether two handles share the same stream.
    pub fn ptr_eq(&self, other: &GenerationHandle) -> bool {
        Arc::ptr_eq(&self.stream, &other.stream)
    }
}
