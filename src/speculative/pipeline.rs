//! Speculative decoding coordinator.
//!
//! Owns a main and a draft [`ContinuousBatchingPipeline`] and mirrors every
//! request into both. Each step the draft proposes up to K tokens per
//! request, the main pipeline verifies them in one forward pass per
//! request, and the draft is realigned with whatever was committed.
//!
//! ## Step
//!
//! ```text
//!  draft.propose_candidates(K) ──► {id: [t1..tK]}
//!                                       │
//!  main.validate_candidates ◄───────────┘   accept prefix + 1 token
//!            │
//!            ├──► draft.sync_request(id, committed)   (unfinished)
//!            └──► draft.remove_request(id)            (finished)
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::config::SpeculativeConfig;
use super::metrics::SpeculativeDecodingMetrics;
use crate::config::{GenerationConfig, ModelDesc};
use crate::engine::{
    ContinuousBatchingPipeline, GenerationHandle, Pipeline, PromptInput, RequestId,
    ValidationReport,
};
use crate::error::{Error, Result};
use crate::metrics::PerfMetrics;
use crate::model::CausalLM;
use crate::tokenizer::{ensure_compatible, TextTokenizer};

/// Both sides of one mirrored request.
///
/// Ids are reused once a request leaves, so a report entry only applies to
/// the request whose main handle it carries.
struct DraftGeneration {
    main: GenerationHandle,
    draft: GenerationHandle,
}

/// Speculative decoding pipeline.
///
/// Lock order: `draft_generations`, then either pipeline's internal locks.
pub struct SpeculativeDecodingPipeline<M, D> {
    main: ContinuousBatchingPipeline<M>,
    draft: ContinuousBatchingPipeline<D>,
    /// Every active request, keyed by id.
    draft_generations: Mutex<HashMap<RequestId, DraftGeneration>>,
    metrics: Mutex<SpeculativeDecodingMetrics>,
    config: SpeculativeConfig,
}

impl<M: CausalLM, D: CausalLM> SpeculativeDecodingPipeline<M, D> {
    /// Build both pipelines.
    ///
    /// # Errors
    ///
    /// [`Error::Config`] if the models or tokenizers disagree on the
    /// vocabulary, or if either description or `config` is invalid.
    pub fn new(
        main_desc: ModelDesc<M>,
        draft_desc: ModelDesc<D>,
        config: SpeculativeConfig,
    ) -> Result<Self> {
        config.validate()?;

        let main_vocab = main_desc.model.vocab_size();
        let draft_vocab = draft_desc.model.vocab_size();
        if main_vocab != draft_vocab {
            return Err(Error::Config(format!(
                "main and draft vocabularies differ: {main_vocab} vs {draft_vocab}"
            )));
        }
        if let (Some(main_tokenizer), Some(draft_tokenizer)) =
            (&main_desc.tokenizer, &draft_desc.tokenizer)
        {
            ensure_compatible(main_tokenizer.as_ref(), draft_tokenizer.as_ref())?;
        }

        // Both pipelines report the combined load time so their metrics merge
        let load_time = main_desc.load_time + draft_desc.load_time;
        let mut main = ContinuousBatchingPipeline::new(main_desc)?;
        let mut draft = ContinuousBatchingPipeline::new(draft_desc)?;
        main.set_load_time(load_time);
        draft.set_load_time(load_time);

        info!(
            num_speculative_tokens = config.num_speculative_tokens,
            acceptance = ?config.acceptance,
            vocab_size = main_vocab,
            "speculative decoding pipeline ready"
        );

        Ok(Self {
            main,
            draft,
            draft_generations: Mutex::new(HashMap::new()),
            metrics: Mutex::new(SpeculativeDecodingMetrics::default()),
            config,
        })
    }

    /// The speculative configuration.
    pub fn config(&self) -> &SpeculativeConfig {
        &self.config
    }

    /// The main (verifying) pipeline.
    pub fn main_pipeline(&self) -> &ContinuousBatchingPipeline<M> {
        &self.main
    }

    /// The draft (proposing) pipeline.
    pub fn draft_pipeline(&self) -> &ContinuousBatchingPipeline<D> {
        &self.draft
    }

    /// Snapshot of the speculative counters.
    pub fn get_speculative_decoding_metrics(&self) -> SpeculativeDecodingMetrics {
        self.metrics.lock().clone()
    }

    /// Number of requests mirrored into the draft pipeline.
    pub fn num_draft_generations(&self) -> usize {
        self.draft_generations.lock().len()
    }

    /// Remove a request from both pipelines.
    ///
    /// # Errors
    ///
    /// [`Error::UnknownRequest`] if the request is not active.
    pub fn cancel_request(&self, request_id: RequestId) -> Result<()> {
        let mut generations = self.draft_generations.lock();
        if generations.remove(&request_id).is_none() {
            return Err(Error::UnknownRequest(request_id));
        }
        if let Err(e) = self.main.remove_request(request_id) {
            debug!(request_id, error = %e, "main request already gone");
        }
        if let Err(e) = self.draft.remove_request(request_id) {
            debug!(request_id, error = %e, "draft request already gone");
        }
        debug!(request_id, "cancelled request");
        Ok(())
    }

    /// Realign the draft with a validation report.
    ///
    /// Entries whose handle no longer matches the active request were
    /// cancelled and re-added under the same id mid-step; they are skipped.
    fn reconcile(&self, report: &ValidationReport) {
        let mut generations = self.draft_generations.lock();
        for outcome in report.outcomes.iter().filter(|o| !o.is_finished()) {
            let request_id = outcome.request_id;
            match generations.get(&request_id) {
                Some(generation) if generation.main.ptr_eq(&outcome.handle) => {
                    if generation.draft.is_finished() {
                        continue;
                    }
                    if let Err(e) = self.draft.sync_request(request_id, &outcome.output) {
                        debug!(request_id, error = %e, "draft sync skipped");
                    }
                }
                _ => debug!(request_id, "stale outcome skipped"),
            }
        }
        for handle in &report.finished {
            let request_id = handle.request_id();
            let current = generations
                .get(&request_id)
                .is_some_and(|generation| generation.main.ptr_eq(handle));
            if !current {
                continue;
            }
            generations.remove(&request_id);
            if let Err(e) = self.draft.remove_request(request_id) {
                debug!(request_id, error = %e, "draft request already gone");
            }
        }
    }
}

impl<M: CausalLM, D: CausalLM> Pipeline for SpeculativeDecodingPipeline<M, D> {
    fn add_request(
        &self,
        request_id: RequestId,
        input: PromptInput,
        config: GenerationConfig,
    ) -> Result<GenerationHandle> {
        let mut generations = self.draft_generations.lock();
        if generations.contains_key(&request_id) {
            return Err(Error::DuplicateRequest(request_id));
        }

        // Tokenize once so both sides see the same ids
        let (prompt_token_ids, tokenization_time) = self.main.tokenize(input)?;
        let draft_config = self.config.draft_config_for(&config);
        let handle =
            self.main
                .add_tokenized(request_id, prompt_token_ids.clone(), tokenization_time, config)?;

        match self
            .draft
            .add_tokenized(request_id, prompt_token_ids, Duration::ZERO, draft_config)
        {
            Ok(draft_handle) => {
                generations.insert(
                    request_id,
                    DraftGeneration {
                        main: handle.clone(),
                        draft: draft_handle,
                    },
                );
                Ok(handle)
            }
            Err(e) => {
                if let Err(rollback) = self.main.remove_request(request_id) {
                    warn!(request_id, error = %rollback, "failed to roll back main request");
                }
                Err(e)
            }
        }
    }

    fn step(&self) -> Result<()> {
        let step_start = Instant::now();

        let proposals = self.draft.propose_candidates(self.config.num_speculative_tokens);
        let draft_duration = step_start.elapsed();

        let main_start = Instant::now();
        let report = self
            .main
            .validate_candidates(&proposals, self.config.acceptance);
        let main_duration = main_start.elapsed();

        {
            let mut metrics = self.metrics.lock();
            for outcome in &report.outcomes {
                if outcome.num_proposed > 0 {
                    metrics.record_verification(
                        outcome.request_id,
                        outcome.num_proposed,
                        outcome.num_accepted,
                    );
                }
            }
        }

        self.reconcile(&report);

        self.metrics
            .lock()
            .record_step_durations(draft_duration, main_duration, step_start.elapsed());
        Ok(())
    }

    fn has_non_finished_requests(&self) -> bool {
        self.main.has_non_finished_requests() || self.draft.has_non_finished_requests()
    }

    fn allocate_request_id(&self) -> RequestId {
        let generations = self.draft_generations.lock();
        loop {
            let request_id = self.main.allocate_request_id();
            if !generations.contains_key(&request_id) {
                return request_id;
            }
        }
    }

    fn tokenizer(&self) -> Option<Arc<dyn TextTokenizer>> {
        self.main.tokenizer()
    }

    /// Main and draft metrics merged.
    fn perf_metrics(&self) -> PerfMetrics {
        let main = self.main.perf_metrics();
        match main.try_merge(&self.draft.perf_metrics()) {
            Ok(merged) => merged,
            Err(e) => {
                warn!(error = %e, "reporting main pipeline metrics only");
                main
            }
        }
    }
}
