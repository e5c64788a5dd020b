//! Continuous batching pipeline for one model.
//!
//! The pipeline owns a model, a scheduler and the per-request sampling
//! state. Requests are submitted from any thread and parked on a
//! submission list; every tick moves them into the scheduler, drops
//! cancelled ones and runs the scheduled sequences.
//!
//! ## Pipeline Flow
//!
//! ```text
//!  add_request()          step() / validate_candidates()
//!       │                          │
//!       ▼                          ▼
//! ┌────────────┐   admit    ┌────────────┐  schedule  ┌─────────────┐
//! │ Submission │ ─────────► │ Scheduler  │ ─────────► │   Forward   │
//! │    list    │            │ (+blocks)  │            │ + verify    │
//! └────────────┘            └────────────┘            └─────────────┘
//!                                                            │
//!                                       commit tokens ◄──────┘
//!                                       to the handle
//! ```
//!
//! Besides plain decoding the pipeline exposes the hooks a speculative
//! coordinator needs: a draft-role pipeline proposes tokens with
//! [`ContinuousBatchingPipeline::propose_candidates`], a main-role pipeline
//! checks them with [`ContinuousBatchingPipeline::validate_candidates`], and
//! [`ContinuousBatchingPipeline::sync_request`] realigns a draft request
//! with the verified output.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use candle_core::Tensor;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::handle::GenerationHandle;
use super::sampler::{argmax, Sampler};
use super::{Pipeline, PromptInput, RequestId};
use crate::config::{GenerationConfig, ModelDesc};
use crate::core::sequence::{FinishReason, Sequence};
use crate::error::{Error, Result};
use crate::metrics::{PerfMetrics, RawPerfMetrics};
use crate::model::CausalLM;
use crate::scheduler::Scheduler;
use crate::speculative::config::AcceptanceMode;
use crate::speculative::sampler::rejection_verify;
use crate::speculative::verify::match_prefix;
use crate::tokenizer::TextTokenizer;

/// Unverified draft tokens of one request.
#[derive(Debug, Clone, Default)]
pub struct DraftProposal {
    /// Proposed tokens, oldest first.
    pub tokens: Vec<u32>,
    /// The draft distribution each token was drawn from.
    pub probs: Vec<Vec<f32>>,
}

/// What one verification did to one request.
#[derive(Debug, Clone)]
pub struct ValidationOutcome {
    pub request_id: RequestId,
    /// Handle of the request this outcome belongs to.
    pub handle: GenerationHandle,
    /// Draft tokens offered for verification.
    pub num_proposed: usize,
    /// Draft tokens accepted.
    pub num_accepted: usize,
    /// Tokens committed this step.
    pub committed: Vec<u32>,
    /// The full committed output after this step.
    pub output: Vec<u32>,
    /// Set when this step finished the request.
    pub finish_reason: Option<FinishReason>,
}

impl ValidationOutcome {
    /// Whether the request finished this step.
    pub fn is_finished(&self) -> bool {
        self.finish_reason.is_some()
    }
}

/// Result of one validation tick.
#[derive(Debug, Clone, Default)]
pub struct ValidationReport {
    /// One entry per request that ran this tick.
    pub outcomes: Vec<ValidationOutcome>,
    /// Handles of requests that left the pipeline this tick: finished,
    /// cancelled or failed.
    pub finished: Vec<GenerationHandle>,
}

/// A submitted request not yet seen by the scheduler.
struct PendingRequest {
    request_id: RequestId,
    prompt_token_ids: Vec<u32>,
    config: GenerationConfig,
    handle: GenerationHandle,
    tokenization_time: Duration,
    arrival: Instant,
}

/// Per-request state next to the scheduler's sequence.
struct ActiveRequest {
    config: GenerationConfig,
    sampler: Sampler,
    handle: GenerationHandle,
    arrival: Instant,
    raw_metrics: RawPerfMetrics,
    num_input_tokens: usize,
    /// Draft distributions of the sequence's assumed tokens.
    assumed_probs: Vec<Vec<f32>>,
}

struct PipelineState<M> {
    model: M,
    scheduler: Scheduler,
    requests: HashMap<RequestId, ActiveRequest>,
    perf_metrics: PerfMetrics,
}

#[derive(Default)]
struct Submissions {
    pending: Vec<PendingRequest>,
    /// Every request submitted and not yet finished.
    active: HashSet<RequestId>,
}

/// Continuous batching pipeline.
///
/// Lock order: `state` before `submissions`.
pub struct ContinuousBatchingPipeline<M> {
    state: Mutex<PipelineState<M>>,
    submissions: Mutex<Submissions>,
    tokenizer: Option<Arc<dyn TextTokenizer>>,
    default_config: GenerationConfig,
    vocab_size: usize,
    block_size: usize,
    load_time: Duration,
    next_request_id: AtomicU64,
}

impl<M: CausalLM> ContinuousBatchingPipeline<M> {
    /// Build a pipeline from a model description.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for invalid scheduler sizing, an invalid
    /// default generation config, or a tokenizer larger than the model's
    /// vocabulary.
    pub fn new(desc: ModelDesc<M>) -> Result<Self> {
        desc.scheduler_config.validate()?;
        desc.generation_config.validate()?;

        let vocab_size = desc.model.vocab_size();
        if let Some(tokenizer) = &desc.tokenizer {
            if tokenizer.vocab_size() > vocab_size {
                return Err(Error::Config(format!(
                    "tokenizer vocabulary ({}) exceeds model vocabulary ({vocab_size})",
                    tokenizer.vocab_size()
                )));
            }
        }

        info!(
            vocab_size,
            num_blocks = desc.scheduler_config.num_blocks,
            block_size = desc.scheduler_config.block_size,
            max_num_seqs = desc.scheduler_config.max_num_seqs,
            "continuous batching pipeline ready"
        );

        let block_size = desc.scheduler_config.block_size;
        Ok(Self {
            state: Mutex::new(PipelineState {
                model: desc.model,
                scheduler: Scheduler::new(desc.scheduler_config),
                requests: HashMap::new(),
                perf_metrics: PerfMetrics::with_load_time(desc.load_time),
            }),
            submissions: Mutex::new(Submissions::default()),
            tokenizer: desc.tokenizer,
            default_config: desc.generation_config,
            vocab_size,
            block_size,
            load_time: desc.load_time,
            next_request_id: AtomicU64::new(0),
        })
    }

    /// Model vocabulary size.
    pub fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    /// Config used by callers that do not bring their own.
    pub fn default_generation_config(&self) -> &GenerationConfig {
        &self.default_config
    }

    /// Model load time reported in metrics.
    pub fn load_time(&self) -> Duration {
        self.load_time
    }

    /// Replace the load time reported in metrics.
    pub fn set_load_time(&mut self, load_time: Duration) {
        self.load_time = load_time;
        self.state.get_mut().perf_metrics.load_time =
            PerfMetrics::with_load_time(load_time).load_time;
    }

    /// Number of submitted, unfinished requests.
    pub fn num_active_requests(&self) -> usize {
        self.submissions.lock().active.len()
    }

    /// Committed plus assumed output of a request, if it is scheduled.
    pub fn output_token_ids(&self, request_id: RequestId) -> Option<Vec<u32>> {
        let state = self.state.lock();
        state
            .scheduler
            .get_sequence(request_id)
            .map(|seq| seq.output_token_ids().to_vec())
    }

    /// Turn a prompt into token ids, timing any tokenizer call.
    pub(crate) fn tokenize(&self, input: PromptInput) -> Result<(Vec<u32>, Duration)> {
        match input {
            PromptInput::Tokens(ids) => Ok((ids, Duration::ZERO)),
            PromptInput::Text(text) => {
                let tokenizer = self.tokenizer.as_ref().ok_or_else(|| {
                    Error::Tokenization("pipeline has no tokenizer for text input".to_string())
                })?;
                let start = Instant::now();
                let ids = tokenizer.encode(&text)?;
                Ok((ids, start.elapsed()))
            }
        }
    }

    /// Submit an already tokenized request.
    pub(crate) fn add_tokenized(
        &self,
        request_id: RequestId,
        prompt_token_ids: Vec<u32>,
        tokenization_time: Duration,
        config: GenerationConfig,
    ) -> Result<GenerationHandle> {
        config.validate()?;
        if prompt_token_ids.is_empty() {
            return Err(Error::Tokenization("empty prompt".to_string()));
        }
        if let Some(&bad) = prompt_token_ids
            .iter()
            .find(|&&id| id as usize >= self.vocab_size)
        {
            return Err(Error::Config(format!(
                "prompt token {bad} outside vocabulary of {}",
                self.vocab_size
            )));
        }

        let mut submissions = self.submissions.lock();
        if !submissions.active.insert(request_id) {
            return Err(Error::DuplicateRequest(request_id));
        }
        let handle = GenerationHandle::new(request_id);
        debug!(
            request_id,
            prompt_len = prompt_token_ids.len(),
            "request submitted"
        );
        submissions.pending.push(PendingRequest {
            request_id,
            prompt_token_ids,
            config,
            handle: handle.clone(),
            tokenization_time,
            arrival: Instant::now(),
        });
        Ok(handle)
    }

    /// Draft role: extend every request's assumed tail up to `k` tokens.
    ///
    /// Runs up to `k` scheduling rounds, each appending one assumed token to
    /// every admitted request that still wants one. A request stops
    /// proposing once it holds `k` assumed tokens, reaches its
    /// `max_new_tokens` budget, or has proposed a stop token. Draft
    /// requests never finish on their own.
    ///
    /// Returns the full assumed tail of every request that has one.
    pub fn propose_candidates(&self, k: usize) -> HashMap<RequestId, DraftProposal> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        self.admit_submissions(state);
        self.drop_cancelled(state);

        let mut stalled = HashSet::new();
        for _ in 0..k {
            let outputs = state.scheduler.schedule(1);
            for seq in &outputs.rejected_sequences {
                self.fail_request(state, seq.seq_id(), "sequence does not fit in the KV cache");
            }

            let mut proposed_any = false;
            for request_id in outputs.scheduled_ids() {
                if stalled.contains(&request_id) {
                    continue;
                }
                match Self::propose_one(state, request_id, k) {
                    Ok(proposed) => proposed_any |= proposed,
                    Err(e) => {
                        warn!(request_id, error = %e, "draft proposal failed");
                        stalled.insert(request_id);
                    }
                }
            }
            if !proposed_any {
                break;
            }
        }

        let mut proposals = HashMap::new();
        for (&request_id, request) in &state.requests {
            let Some(seq) = state.scheduler.get_sequence(request_id) else {
                continue;
            };
            if seq.num_assumed_tokens() == 0 {
                continue;
            }
            proposals.insert(
                request_id,
                DraftProposal {
                    tokens: seq.assumed_token_ids().to_vec(),
                    probs: request.assumed_probs.clone(),
                },
            );
        }
        proposals
    }

    /// Append one assumed token to `request_id`; `Ok(false)` if it wants none.
    fn propose_one(state: &mut PipelineState<M>, request_id: RequestId, k: usize) -> Result<bool> {
        let PipelineState {
            model,
            scheduler,
            requests,
            ..
        } = state;
        let (Some(seq), Some(request)) = (
            scheduler.get_sequence_mut(request_id),
            requests.get_mut(&request_id),
        ) else {
            return Ok(false);
        };

        if seq.num_assumed_tokens() >= k || seq.output_len() >= request.config.max_new_tokens {
            return Ok(false);
        }
        if seq
            .assumed_token_ids()
            .last()
            .is_some_and(|&token| request.config.is_stop_token(token))
        {
            return Ok(false);
        }

        let tokens = seq.all_token_ids();
        let row = forward_rows(model, &tokens, tokens.len() - 1, 1)?.squeeze(0)?;
        let probs = request.sampler.probabilities(&row)?;
        let token = if request.sampler.is_greedy() {
            argmax(&row)?
        } else {
            request.sampler.sample_from(&probs)?
        };

        seq.append_assumed_token(token);
        request.assumed_probs.push(probs);
        request
            .raw_metrics
            .record_emission(Instant::now(), 1, request.arrival);
        Ok(true)
    }

    /// Main role: run one tick, verifying `proposals` where present.
    ///
    /// Every scheduled request gets one forward pass over its committed
    /// tokens plus its draft tail. Requests without a proposal take a plain
    /// decoding step. Per-request failures mark only that request failed.
    pub fn validate_candidates(
        &self,
        proposals: &HashMap<RequestId, DraftProposal>,
        mode: AcceptanceMode,
    ) -> ValidationReport {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        self.admit_submissions(state);

        let mut report = ValidationReport {
            finished: self.drop_cancelled(state),
            ..Default::default()
        };

        let lookahead = proposals
            .values()
            .map(|proposal| proposal.tokens.len())
            .max()
            .unwrap_or(0)
            + 1;
        let outputs = state.scheduler.schedule(lookahead);

        for seq in &outputs.rejected_sequences {
            let request_id = seq.seq_id();
            report.finished.extend(self.fail_request(
                state,
                request_id,
                "sequence does not fit in the KV cache",
            ));
        }

        for request_id in outputs.scheduled_ids() {
            let proposal = proposals.get(&request_id);
            match Self::validate_one(state, request_id, proposal, mode) {
                Ok(Some(outcome)) => {
                    if let Some(reason) = outcome.finish_reason {
                        report
                            .finished
                            .extend(self.finish_request(state, request_id, reason));
                    }
                    report.outcomes.push(outcome);
                }
                Ok(None) => {}
                Err(e) => {
                    report
                        .finished
                        .extend(self.fail_request(state, request_id, &e.to_string()));
                }
            }
        }
        report
    }

    fn validate_one(
        state: &mut PipelineState<M>,
        request_id: RequestId,
        proposal: Option<&DraftProposal>,
        mode: AcceptanceMode,
    ) -> Result<Option<ValidationOutcome>> {
        let PipelineState {
            model,
            scheduler,
            requests,
            ..
        } = state;
        let (Some(seq), Some(request)) = (
            scheduler.get_sequence_mut(request_id),
            requests.get_mut(&request_id),
        ) else {
            return Ok(None);
        };

        let draft: &[u32] = proposal.map(|p| p.tokens.as_slice()).unwrap_or(&[]);
        let context = seq.all_token_ids();
        let mut input = context.clone();
        input.extend_from_slice(draft);
        let rows = forward_rows(model, &input, context.len() - 1, draft.len() + 1)?;

        let sampler = &mut request.sampler;
        let verdict = match proposal {
            Some(proposal)
                if mode == AcceptanceMode::RejectionSampling
                    && !sampler.is_greedy()
                    && !draft.is_empty() =>
            {
                let target_probs = (0..=draft.len())
                    .map(|i| sampler.probabilities(&rows.get(i)?))
                    .collect::<Result<Vec<_>>>()?;
                rejection_verify(sampler.rng_mut(), draft, &proposal.probs, &target_probs)?
            }
            _ => match_prefix(draft, |i| sampler.sample_single(&rows.get(i)?))?,
        };

        let mut committed = Vec::with_capacity(verdict.tokens.len());
        let mut finish_reason = None;
        for token in verdict.tokens {
            seq.append_token(token);
            committed.push(token);
            finish_reason = stop_reason(&request.config, token, seq.output_len());
            if finish_reason.is_some() {
                break;
            }
        }
        // A stop inside the accepted prefix discards the rest of it
        let num_accepted = verdict.accepted.min(committed.len());

        request
            .raw_metrics
            .record_emission(Instant::now(), committed.len(), request.arrival);
        request.handle.push_tokens(&committed);
        debug!(
            request_id,
            proposed = draft.len(),
            accepted = num_accepted,
            committed = committed.len(),
            "validated request"
        );

        Ok(Some(ValidationOutcome {
            request_id,
            handle: request.handle.clone(),
            num_proposed: draft.len(),
            num_accepted,
            committed,
            output: seq.output_token_ids().to_vec(),
            finish_reason,
        }))
    }

    /// Draft role: replace a request's output with the verified one.
    ///
    /// Clears the assumed tail and frees blocks the shorter output no
    /// longer needs.
    pub fn sync_request(&self, request_id: RequestId, committed_output: &[u32]) -> Result<()> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        // A request submitted mid-step may not be admitted yet
        self.admit_submissions(state);
        let seq = state
            .scheduler
            .get_sequence_mut(request_id)
            .ok_or(Error::UnknownRequest(request_id))?;
        seq.sync_output(committed_output);
        state.scheduler.release_surplus_blocks(request_id);

        if let Some(request) = state.requests.get_mut(&request_id) {
            request.assumed_probs.clear();
            let published = request.handle.tokens().len();
            if committed_output.len() > published {
                request.handle.push_tokens(&committed_output[published..]);
            }
        }
        Ok(())
    }

    /// Drop a request wherever it is, marking its handle dropped.
    pub fn remove_request(&self, request_id: RequestId) -> Result<()> {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        let pending = {
            let mut submissions = self.submissions.lock();
            let index = submissions
                .pending
                .iter()
                .position(|p| p.request_id == request_id);
            index.map(|i| {
                submissions.active.remove(&request_id);
                submissions.pending.remove(i)
            })
        };
        if let Some(pending) = pending {
            pending.handle.set_dropped();
            debug!(request_id, "removed pending request");
            return Ok(());
        }

        if self.drop_request(state, request_id).is_some() {
            Ok(())
        } else {
            Err(Error::UnknownRequest(request_id))
        }
    }

    /// Move submitted requests into the scheduler.
    fn admit_submissions(&self, state: &mut PipelineState<M>) {
        let pending = std::mem::take(&mut self.submissions.lock().pending);
        for request in pending {
            let mut raw_metrics = RawPerfMetrics::default();
            raw_metrics
                .tokenization_durations
                .push(request.tokenization_time);

            let num_input_tokens = request.prompt_token_ids.len();
            state.scheduler.add_sequence(Sequence::with_block_size(
                request.request_id,
                request.prompt_token_ids,
                self.block_size,
            ));
            state.requests.insert(
                request.request_id,
                ActiveRequest {
                    sampler: Sampler::new(&request.config),
                    config: request.config,
                    handle: request.handle,
                    arrival: request.arrival,
                    raw_metrics,
                    num_input_tokens,
                    assumed_probs: Vec::new(),
                },
            );
        }
    }

    /// Drop every request whose handle asked for cancellation.
    fn drop_cancelled(&self, state: &mut PipelineState<M>) -> Vec<GenerationHandle> {
        let cancelled: Vec<RequestId> = state
            .requests
            .iter()
            .filter(|(_, request)| request.handle.is_cancel_requested())
            .map(|(&request_id, _)| request_id)
            .collect();
        cancelled
            .into_iter()
            .filter_map(|request_id| self.drop_request(state, request_id))
            .collect()
    }

    fn drop_request(
        &self,
        state: &mut PipelineState<M>,
        request_id: RequestId,
    ) -> Option<GenerationHandle> {
        let request = self.take_request(state, request_id)?;
        let handle = request.handle.clone();
        handle.set_dropped();
        let metrics = self.summarize(request);
        Self::accumulate(state, &metrics);
        debug!(request_id, "dropped request");
        Some(handle)
    }

    fn finish_request(
        &self,
        state: &mut PipelineState<M>,
        request_id: RequestId,
        reason: FinishReason,
    ) -> Option<GenerationHandle> {
        let request = self.take_request(state, request_id)?;
        let handle = request.handle.clone();
        let metrics = self.summarize(request);
        Self::accumulate(state, &metrics);
        debug!(
            request_id,
            ?reason,
            num_generated_tokens = metrics.num_generated_tokens,
            "request finished"
        );
        handle.set_finished(reason, metrics);
        Some(handle)
    }

    fn fail_request(
        &self,
        state: &mut PipelineState<M>,
        request_id: RequestId,
        error: &str,
    ) -> Option<GenerationHandle> {
        warn!(request_id, error, "request failed");
        let request = self.take_request(state, request_id)?;
        request.handle.set_failed(error);
        Some(request.handle)
    }

    /// Remove a request from the scheduler and the bookkeeping.
    fn take_request(&self, state: &mut PipelineState<M>, request_id: RequestId) -> Option<ActiveRequest> {
        state.scheduler.remove_sequence(request_id);
        self.submissions.lock().active.remove(&request_id);
        state.requests.remove(&request_id)
    }

    fn summarize(&self, request: ActiveRequest) -> PerfMetrics {
        let mut metrics = PerfMetrics::with_load_time(self.load_time);
        metrics.num_input_tokens = request.num_input_tokens;
        metrics.raw_metrics = request.raw_metrics;
        metrics.evaluate_statistics(Some(request.arrival));
        metrics
    }

    fn accumulate(state: &mut PipelineState<M>, metrics: &PerfMetrics) {
        match state.perf_metrics.try_merge(metrics) {
            Ok(merged) => state.perf_metrics = merged,
            Err(e) => warn!(error = %e, "skipping request metrics"),
        }
    }
}

impl<M: CausalLM> Pipeline for ContinuousBatchingPipeline<M> {
    fn add_request(
        &self,
        request_id: RequestId,
        input: PromptInput,
        config: GenerationConfig,
    ) -> Result<GenerationHandle> {
        let (prompt_token_ids, tokenization_time) = self.tokenize(input)?;
        self.add_tokenized(request_id, prompt_token_ids, tokenization_time, config)
    }

    fn step(&self) -> Result<()> {
        self.validate_candidates(&HashMap::new(), AcceptanceMode::Greedy);
        Ok(())
    }

    fn has_non_finished_requests(&self) -> bool {
        !self.submissions.lock().active.is_empty()
    }

    /// Next counter value not held by an active request.
    fn allocate_request_id(&self) -> RequestId {
        let submissions = self.submissions.lock();
        loop {
            let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
            if !submissions.active.contains(&request_id) {
                return request_id;
            }
        }
    }

    fn tokenizer(&self) -> Option<Arc<dyn TextTokenizer>> {
        self.tokenizer.clone()
    }

    fn perf_metrics(&self) -> PerfMetrics {
        self.state.lock().perf_metrics.clone()
    }
}

/// Logit rows `start..start + len` of a forward pass over `tokens`.
fn forward_rows<M: CausalLM>(model: &mut M, tokens: &[u32], start: usize, len: usize) -> Result<Tensor> {
    let input = Tensor::new(tokens, model.device())?;
    let logits = model.forward(&input)?;
    Ok(logits.narrow(0, start, len)?)
}

/// Why `token`, just committed as output token number `output_len`, ends generation.
fn stop_reason(config: &GenerationConfig, token: u32, output_len: usize) -> Option<FinishReason> {
    if !config.ignore_eos && config.eos_token_id == Some(token) {
        Some(FinishReason::EndOfSequence)
    } else if config.stop_token_ids.contains(&token) {
        Some(FinishReason::StopToken)
    } else if output_len >= config.max_new_tokens {
        Some(FinishReason::MaxTokens)
    } else {
        None
    }
}
