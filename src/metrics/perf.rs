//! Generation performance metrics.
//!
//! [`RawPerfMetrics`] keeps every timing sample; [`PerfMetrics`] reduces
//! them to (mean, std) pairs in milliseconds on demand. Summaries are never
//! updated incrementally, so merging two snapshots is just concatenating
//! their samples and recomputing, which makes the merge associative and
//! commutative.
//!
//! A single step can commit several tokens (accepted draft tokens plus the
//! main model's own), so with a start time the per-step durations are
//! divided by the step's batch size to get time per token:
//!
//! ```text
//! 10 ms step emitting 5 tokens  ──►  TPOT sample = 2 ms
//! ```

use std::ops::{Add, AddAssign};
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::error::{Error, Result};

/// Mean and standard deviation of a metric, in milliseconds (or tokens/s
/// for throughput).
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct MeanStdPair {
    pub mean: f32,
    pub std: f32,
}

/// Raw timing samples.
///
/// `durations`, `batch_sizes` and `new_token_times` always have the same
/// length: one entry per emission step.
#[derive(Debug, Clone, Default)]
pub struct RawPerfMetrics {
    /// Whole `generate` call durations.
    pub generate_durations: Vec<Duration>,
    /// Prompt tokenization durations.
    pub tokenization_durations: Vec<Duration>,
    /// Result detokenization durations.
    pub detokenization_durations: Vec<Duration>,
    /// Latency from submission to first emitted token.
    pub times_to_first_token: Vec<Duration>,
    /// When each emission happened.
    pub new_token_times: Vec<Instant>,
    /// How many tokens each emission committed.
    pub batch_sizes: Vec<usize>,
    /// Per-emission durations; time per token once normalized.
    pub durations: Vec<Duration>,
}

impl RawPerfMetrics {
    /// Record an emission of `batch_size` tokens at `at` for a request
    /// submitted at `arrival`.
    pub fn record_emission(&mut self, at: Instant, batch_size: usize, arrival: Instant) {
        let previous = self.new_token_times.last().copied().unwrap_or(arrival);
        if self.new_token_times.is_empty() {
            self.times_to_first_token
                .push(at.saturating_duration_since(arrival));
        }
        self.durations.push(at.saturating_duration_since(previous));
        self.batch_sizes.push(batch_size);
        self.new_token_times.push(at);
    }

    /// Append every sample of `other`.
    fn extend(&mut self, other: &RawPerfMetrics) {
        self.generate_durations
            .extend_from_slice(&other.generate_durations);
        self.tokenization_durations
            .extend_from_slice(&other.tokenization_durations);
        self.detokenization_durations
            .extend_from_slice(&other.detokenization_durations);
        self.times_to_first_token
            .extend_from_slice(&other.times_to_first_token);
        self.new_token_times.extend_from_slice(&other.new_token_times);
        self.batch_sizes.extend_from_slice(&other.batch_sizes);
        self.durations.extend_from_slice(&other.durations);
    }
}

/// Summary statistics of one request or one pipeline run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PerfMetrics {
    /// Model load time in milliseconds; identifies the pipeline.
    pub load_time: f32,
    /// Time to first token.
    pub ttft: MeanStdPair,
    /// Time per output token.
    pub tpot: MeanStdPair,
    /// Tokens per second.
    pub throughput: MeanStdPair,
    /// Whole `generate` call duration.
    pub generate_duration: MeanStdPair,
    /// Tokenization duration.
    pub tokenization_duration: MeanStdPair,
    /// Detokenization duration.
    pub detokenization_duration: MeanStdPair,
    pub num_generated_tokens: usize,
    pub num_input_tokens: usize,
    #[serde(skip)]
    pub raw_metrics: RawPerfMetrics,
}

impl PerfMetrics {
    /// Empty metrics for a pipeline that took `load_time` to load.
    pub fn with_load_time(load_time: Duration) -> Self {
        Self {
            load_time: duration_ms(load_time) as f32,
            ..Default::default()
        }
    }

    /// Recompute every summary from the raw samples.
    ///
    /// With `start_time`, durations are first rebuilt from the emission
    /// timestamps: each becomes the time since the previous emission (or
    /// since `start_time`) divided by that emission's batch size, and
    /// `num_generated_tokens` becomes the sum of batch sizes.
    pub fn evaluate_statistics(&mut self, start_time: Option<Instant>) {
        if let Some(start) = start_time {
            let raw = &mut self.raw_metrics;
            if let Some(&first) = raw.new_token_times.first() {
                raw.times_to_first_token = vec![first.saturating_duration_since(start)];
            }

            let mut previous = start;
            let mut num_generated_tokens = 0;
            raw.durations = raw
                .new_token_times
                .iter()
                .zip(&raw.batch_sizes)
                .map(|(&at, &batch_size)| {
                    let elapsed = at.saturating_duration_since(previous);
                    previous = at;
                    num_generated_tokens += batch_size;
                    elapsed / batch_size.max(1) as u32
                })
                .collect();
            self.num_generated_tokens = num_generated_tokens;
        }

        let raw = &self.raw_metrics;
        self.tpot = calc_mean_and_std(&raw.durations);
        self.ttft = calc_mean_and_std(&raw.times_to_first_token);
        self.generate_duration = calc_mean_and_std(&raw.generate_durations);
        self.tokenization_duration = calc_mean_and_std(&raw.tokenization_durations);
        self.detokenization_duration = calc_mean_and_std(&raw.detokenization_durations);
        self.throughput = throughput_from_tpot(self.tpot);
    }

    /// Merge two snapshots of the same pipeline.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MetricsMismatch`] if the load times differ, which
    /// means the snapshots come from different pipelines.
    pub fn try_merge(&self, other: &PerfMetrics) -> Result<PerfMetrics> {
        if self.load_time != other.load_time {
            return Err(Error::MetricsMismatch {
                left: self.load_time,
                right: other.load_time,
            });
        }

        let mut merged = self.clone();
        merged.raw_metrics.extend(&other.raw_metrics);
        merged.num_generated_tokens = self.num_generated_tokens + other.num_generated_tokens;
        merged.num_input_tokens = self.num_input_tokens + other.num_input_tokens;
        merged.evaluate_statistics(None);
        Ok(merged)
    }
}

impl Add for &PerfMetrics {
    type Output = PerfMetrics;

    /// # Panics
    ///
    /// Panics if the operands have different load times.
    fn add(self, other: &PerfMetrics) -> PerfMetrics {
        self.try_merge(other).unwrap_or_else(|e| panic!("{e}"))
    }
}

impl Add for PerfMetrics {
    type Output = PerfMetrics;

    /// # Panics
    ///
    /// Panics if the operands have different load times.
    fn add(self, other: PerfMetrics) -> PerfMetrics {
        &self + &other
    }
}

impl AddAssign<&PerfMetrics> for PerfMetrics {
    fn add_assign(&mut self, other: &PerfMetrics) {
        *self = &*self + other;
    }
}

fn duration_ms(duration: Duration) -> f64 {
    duration.as_secs_f64() * 1000.0
}

/// Mean and standard deviation of `durations`, in milliseconds.
fn calc_mean_and_std(durations: &[Duration]) -> MeanStdPair {
    if durations.is_empty() {
        return MeanStdPair::default();
    }
    let n = durations.len() as f64;
    let (sum, sum_sq) = durations.iter().fold((0.0, 0.0), |(sum, sum_sq), &d| {
        let ms = duration_ms(d);
        (sum + ms, sum_sq + ms * ms)
    });
    let mean = sum / n;
    let variance = (sum_sq / n - mean * mean).max(0.0);
    MeanStdPair {
        mean: mean as f32,
        std: variance.sqrt() as f32,
    }
}

/// Tokens per second, with first-order error propagation.
fn throughput_from_tpot(tpot: MeanStdPair) -> MeanStdPair {
    if tpot.mean <= 0.0 {
        return MeanStdPair::default();
    }
    MeanStdPair {
        mean: 1000.0 / tpot.mean,
        std: (tpot.std * 1000.0) / (tpot.mean * tpot.mean),
    }
}
