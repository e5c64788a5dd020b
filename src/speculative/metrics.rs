//! Speculative decoding statistics.

use std::collections::HashMap;
use std::time::Duration;

use serde::Serialize;

use crate::engine::RequestId;

/// Proposal and acceptance counts of one request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RequestAcceptance {
    pub num_proposed_tokens: u64,
    pub num_accepted_tokens: u64,
}

impl RequestAcceptance {
    /// Fraction of proposed tokens accepted, 0 when nothing was proposed.
    pub fn acceptance_rate(&self) -> f64 {
        if self.num_proposed_tokens == 0 {
            0.0
        } else {
            self.num_accepted_tokens as f64 / self.num_proposed_tokens as f64
        }
    }
}

/// Counters accumulated by the coordinator across steps.
///
/// Only verifications with at least one proposed token are counted.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SpeculativeDecodingMetrics {
    /// Draft tokens sent to verification.
    pub num_proposed_tokens: u64,
    /// Draft tokens the main model accepted.
    pub num_accepted_tokens: u64,
    /// Verification rounds.
    pub num_verifications: u64,
    /// `acceptance_histogram[n]` counts rounds that accepted exactly `n` tokens.
    pub acceptance_histogram: Vec<u64>,
    /// Per-request counts, kept after the request finishes.
    pub requests: HashMap<RequestId, RequestAcceptance>,
    /// Coordinator steps taken.
    pub num_steps: u64,
    /// Time spent proposing.
    pub draft_duration: Duration,
    /// Time spent verifying.
    pub main_duration: Duration,
    /// Time spent in `step` overall.
    pub total_duration: Duration,
}

impl SpeculativeDecodingMetrics {
    /// Record one verification round of `request_id`.
    pub fn record_verification(&mut self, request_id: RequestId, proposed: usize, accepted: usize) {
        self.num_proposed_tokens += proposed as u64;
        self.num_accepted_tokens += accepted as u64;
        self.num_verifications += 1;

        if self.acceptance_histogram.len() <= accepted {
            self.acceptance_histogram.resize(accepted + 1, 0);
        }
        self.acceptance_histogram[accepted] += 1;

        let entry = self.requests.entry(request_id).or_default();
        entry.num_proposed_tokens += proposed as u64;
        entry.num_accepted_tokens += accepted as u64;
    }

    /// Record the phase timings of one step.
    pub fn record_step_durations(&mut self, draft: Duration, main: Duration, total: Duration) {
        self.num_steps += 1;
        self.draft_duration += draft;
        self.main_duration += main;
        self.total_duration += total;
    }

    /// Fraction of all proposed tokens accepted.
    pub fn acceptance_rate(&self) -> f64 {
        if self.num_proposed_tokens == 0 {
            0.0
        } else {
            self.num_accepted_tokens as f64 / self.num_proposed_tokens as f64
        }
    }

    /// Acceptance rate of one request, if it was ever verified.
    pub fn request_acceptance_rate(&self, request_id: RequestId) -> Option<f64> {
        self.requests
            .get(&request_id)
            .map(RequestAcceptance::acceptance_rate)
    }

    /// Mean number of accepted tokens per verification round.
    pub fn mean_accepted_per_verification(&self) -> f64 {
        if self.num_verifications == 0 {
            0.0
        } else {
            self.num_accepted_tokens as f64 / self.num_verifications as f64
        }
    }
}
