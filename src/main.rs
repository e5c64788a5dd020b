use std::path::PathBuf;
use std::time::Instant;

use anyhow::{Context, Result};
use candle_core::Device;
use clap::{Parser, ValueEnum};
use rand::{Rng, SeedableRng};
use tracing::info;

use nano_spec::{
    AcceptanceMode, BigramModel, ContinuousBatchingPipeline, GenerationConfig, ModelDesc,
    Pipeline, PromptInput, SpeculativeConfig, SpeculativeDecodingPipeline,
};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Acceptance {
    /// Accept draft tokens the main sampler agrees with
    Greedy,
    /// Accept with probability min(1, p/q)
    Rejection,
}

impl From<Acceptance> for AcceptanceMode {
    fn from(acceptance: Acceptance) -> Self {
        match acceptance {
            Acceptance::Greedy => AcceptanceMode::Greedy,
            Acceptance::Rejection => AcceptanceMode::RejectionSampling,
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "nano-spec")]
#[command(about = "Compare plain and speculative generation on bigram reference models")]
struct Args {
    /// Vocabulary size of the reference models
    #[arg(long, default_value = "64")]
    vocab_size: usize,

    /// Number of concurrent requests
    #[arg(short = 'n', long, default_value = "4")]
    num_requests: usize,

    /// Prompt length in tokens
    #[arg(long, default_value = "4")]
    prompt_len: usize,

    /// Maximum tokens to generate per request
    #[arg(long, default_value = "32")]
    max_tokens: usize,

    /// Tokens proposed per step (K)
    #[arg(short = 'k', long, default_value = "4")]
    num_speculative_tokens: usize,

    /// Noise added to the main model's logits to derive the draft model
    #[arg(long, default_value = "0.5")]
    draft_noise: f32,

    /// Sampling temperature (0 = greedy)
    #[arg(short, long, default_value = "0.0")]
    temperature: f32,

    /// Seed for models, prompts and samplers
    #[arg(long, default_value = "0")]
    seed: u64,

    /// Acceptance rule
    #[arg(long, value_enum, default_value = "greedy")]
    acceptance: Acceptance,

    /// Speculative config JSON file; overrides -k and --acceptance
    #[arg(long)]
    config: Option<PathBuf>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let args = Args::parse();

    let spec_config = match &args.config {
        Some(path) => SpeculativeConfig::from_json_file(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => SpeculativeConfig::new()
            .num_tokens(args.num_speculative_tokens)
            .acceptance(args.acceptance.into()),
    };

    let device = Device::Cpu;
    let load_start = Instant::now();
    let main_model = BigramModel::new(args.vocab_size, args.seed, &device)?;
    let main_load_time = load_start.elapsed();
    let draft_start = Instant::now();
    let draft_model = main_model.perturbed(args.draft_noise, args.seed.wrapping_add(1))?;
    let draft_load_time = draft_start.elapsed();

    let mut rng = rand::rngs::StdRng::seed_from_u64(args.seed);
    let prompts: Vec<Vec<u32>> = (0..args.num_requests)
        .map(|_| {
            (0..args.prompt_len.max(1))
                .map(|_| rng.gen_range(0..args.vocab_size as u32))
                .collect()
        })
        .collect();
    let generation_config = GenerationConfig::default()
        .max_new_tokens(args.max_tokens)
        .temperature(args.temperature)
        .seed(args.seed);
    let configs = vec![generation_config; prompts.len()];
    let inputs = || -> Vec<PromptInput> { prompts.iter().cloned().map(PromptInput::from).collect() };

    let plain = ContinuousBatchingPipeline::new(
        ModelDesc::new(main_model.clone()).load_time(main_load_time),
    )?;
    let plain_start = Instant::now();
    let plain_results = plain.generate(inputs(), configs.clone(), None)?;
    let plain_elapsed = plain_start.elapsed();
    info!(elapsed_ms = plain_elapsed.as_millis() as u64, "plain generation done");

    let speculative = SpeculativeDecodingPipeline::new(
        ModelDesc::new(main_model).load_time(main_load_time),
        ModelDesc::new(draft_model).load_time(draft_load_time),
        spec_config,
    )?;
    let spec_start = Instant::now();
    let spec_results = speculative.generate(inputs(), configs, None)?;
    let spec_elapsed = spec_start.elapsed();
    info!(elapsed_ms = spec_elapsed.as_millis() as u64, "speculative generation done");

    let outputs_match = plain_results
        .iter()
        .zip(&spec_results)
        .all(|(a, b)| a.token_ids == b.token_ids);

    let summary = serde_json::json!({
        "outputs_match": outputs_match,
        "plain": {
            "elapsed_ms": plain_elapsed.as_secs_f64() * 1000.0,
            "perf_metrics": plain.perf_metrics(),
        },
        "speculative": {
            "elapsed_ms": spec_elapsed.as_secs_f64() * 1000.0,
            "perf_metrics": speculative.perf_metrics(),
            "speculative_metrics": speculative.get_speculative_decoding_metrics(),
            "acceptance_rate": speculative.get_speculative_decoding_metrics().acceptance_rate(),
        },
        "results": spec_results,
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
