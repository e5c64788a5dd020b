//! Integration tests for SpeculativeDecodingPipeline.

use std::sync::Arc;

use candle_core::Device;
use nano_spec::core::sequence::FinishReason;
use nano_spec::{
    AcceptanceMode, BigramModel, ContinuousBatchingPipeline, Error, GenerationConfig,
    GenerationStatus, ModelDesc, Pipeline, PromptInput, SchedulerConfig, SpeculativeConfig,
    SpeculativeDecodingPipeline, StreamerStatus, TextTokenizer,
};

const VOCAB_SIZE: usize = 32;

fn random_model(seed: u64) -> BigramModel {
    BigramModel::new(VOCAB_SIZE, seed, &Device::Cpu).unwrap()
}

fn chain_model(vocab_size: usize, next: impl Fn(u32) -> u32) -> BigramModel {
    BigramModel::from_transitions(vocab_size, &Device::Cpu, next).unwrap()
}

fn speculative(
    main: BigramModel,
    draft: BigramModel,
    config: SpeculativeConfig,
) -> SpeculativeDecodingPipeline<BigramModel, BigramModel> {
    SpeculativeDecodingPipeline::new(ModelDesc::new(main), ModelDesc::new(draft), config).unwrap()
}

fn prompts() -> Vec<Vec<u32>> {
    vec![vec![3, 17], vec![0], vec![29, 4, 8], vec![11]]
}

fn inputs() -> Vec<PromptInput> {
    prompts().into_iter().map(PromptInput::from).collect()
}

fn plain_outputs(model: BigramModel, configs: Vec<GenerationConfig>) -> Vec<Vec<u32>> {
    let pipeline = ContinuousBatchingPipeline::new(ModelDesc::new(model)).unwrap();
    pipeline
        .generate(inputs(), configs, None)
        .unwrap()
        .into_iter()
        .map(|result| result.token_ids)
        .collect()
}

#[test]
fn test_greedy_output_matches_plain_decoding() {
    let main = random_model(1);
    let draft = main.perturbed(1.5, 2).unwrap();
    let configs = vec![GenerationConfig::greedy().max_new_tokens(20); 4];
    let expected = plain_outputs(main.clone(), configs.clone());

    for k in [1, 3, 5] {
        let pipeline = speculative(
            main.clone(),
            draft.clone(),
            SpeculativeConfig::new().num_tokens(k),
        );
        let results = pipeline.generate(inputs(), configs.clone(), None).unwrap();
        for (result, expected) in results.iter().zip(&expected) {
            assert_eq!(&result.token_ids, expected, "k = {k}");
            assert_eq!(result.status, GenerationStatus::Finished);
        }

        let metrics = pipeline.get_speculative_decoding_metrics();
        assert!(metrics.num_proposed_tokens > 0);
        assert!(metrics.num_accepted_tokens <= metrics.num_proposed_tokens);
        assert_eq!(pipeline.num_draft_generations(), 0);
    }
}

#[test]
fn test_seeded_sampling_matches_plain_decoding() {
    let main = random_model(5);
    let draft = main.perturbed(1.0, 6).unwrap();
    let configs: Vec<GenerationConfig> = (0..4)
        .map(|seed| {
            GenerationConfig::default()
                .max_new_tokens(16)
                .temperature(0.8)
                .seed(seed)
        })
        .collect();
    let expected = plain_outputs(main.clone(), configs.clone());

    let pipeline = speculative(main, draft, SpeculativeConfig::new().num_tokens(4));
    let results = pipeline.generate(inputs(), configs, None).unwrap();
    for (result, expected) in results.iter().zip(&expected) {
        assert_eq!(&result.token_ids, expected);
    }
}

#[test]
fn test_identical_draft_is_always_accepted() {
    let main = random_model(9);
    let pipeline = speculative(
        main.clone(),
        main,
        SpeculativeConfig::new().num_tokens(4),
    );

    let results = pipeline
        .generate(
            inputs(),
            vec![GenerationConfig::greedy().max_new_tokens(20); 4],
            None,
        )
        .unwrap();
    assert!(results.iter().all(|result| result.token_ids.len() == 20));

    let metrics = pipeline.get_speculative_decoding_metrics();
    assert!(metrics.num_proposed_tokens > 0);
    assert_eq!(metrics.num_accepted_tokens, metrics.num_proposed_tokens);
    assert_eq!(metrics.acceptance_rate(), 1.0);
    // Five tokens per verification: 20 tokens take 4 steps
    assert_eq!(metrics.num_steps, 4);
}

#[test]
fn test_first_mismatch_commits_main_token() {
    let main = chain_model(10, |t| (t + 1) % 10);
    let draft = chain_model(10, |t| if t == 2 { 9 } else { (t + 1) % 10 });
    let pipeline = speculative(main, draft, SpeculativeConfig::new().num_tokens(4));

    let handle = pipeline
        .add_request(0, vec![0].into(), GenerationConfig::greedy().max_new_tokens(16))
        .unwrap();
    pipeline.step().unwrap();

    // Draft proposed [1, 2, 9, 0]; main agrees on two and corrects the third
    assert_eq!(handle.tokens(), vec![1, 2, 3]);
    let metrics = pipeline.get_speculative_decoding_metrics();
    assert_eq!(metrics.num_proposed_tokens, 4);
    assert_eq!(metrics.num_accepted_tokens, 2);
    assert_eq!(metrics.num_verifications, 1);
    assert_eq!(metrics.request_acceptance_rate(0), Some(0.5));

    // The draft continues from the verified output
    assert_eq!(
        pipeline.draft_pipeline().output_token_ids(0),
        Some(vec![1, 2, 3])
    );
}

#[test]
fn test_budget_and_stop_tokens_cut_the_commit() {
    let model = chain_model(10, |t| (t + 1) % 10);
    let pipeline = speculative(
        model.clone(),
        model,
        SpeculativeConfig::new().num_tokens(4),
    );

    let budget = pipeline
        .add_request(0, vec![0].into(), GenerationConfig::greedy().max_new_tokens(3))
        .unwrap();
    let stopped = pipeline
        .add_request(
            1,
            vec![0].into(),
            GenerationConfig::greedy().max_new_tokens(8).stop_token(2),
        )
        .unwrap();
    pipeline.step().unwrap();

    assert_eq!(budget.tokens(), vec![1, 2, 3]);
    assert_eq!(budget.finish_reason(), Some(FinishReason::MaxTokens));
    assert_eq!(stopped.tokens(), vec![1, 2]);
    assert_eq!(stopped.finish_reason(), Some(FinishReason::StopToken));
    assert!(!pipeline.has_non_finished_requests());
    assert_eq!(pipeline.num_draft_generations(), 0);
}

#[test]
fn test_rejection_sampling_runs_to_completion() {
    let main = random_model(21);
    let draft = main.perturbed(0.5, 22).unwrap();
    let pipeline = speculative(
        main,
        draft,
        SpeculativeConfig::new()
            .num_tokens(3)
            .acceptance(AcceptanceMode::RejectionSampling)
            .draft_generation_config(GenerationConfig::default().temperature(1.0).seed(3)),
    );

    let configs: Vec<GenerationConfig> = (0..4)
        .map(|seed| {
            GenerationConfig::default()
                .max_new_tokens(12)
                .temperature(1.0)
                .seed(seed)
        })
        .collect();
    let results = pipeline.generate(inputs(), configs, None).unwrap();

    for result in &results {
        assert_eq!(result.token_ids.len(), 12);
        assert!(result.token_ids.iter().all(|&t| (t as usize) < VOCAB_SIZE));
        assert_eq!(result.finish_reason, Some(FinishReason::MaxTokens));
    }
    let metrics = pipeline.get_speculative_decoding_metrics();
    assert!(metrics.num_proposed_tokens > 0);
    assert!(metrics.num_accepted_tokens <= metrics.num_proposed_tokens);
}

#[test]
fn test_small_cache_keeps_output_exact() {
    let main = random_model(13);
    let draft = main.perturbed(1.0, 14).unwrap();
    let scheduler_config = SchedulerConfig {
        block_size: 4,
        num_blocks: 12,
        ..Default::default()
    };
    let configs = vec![GenerationConfig::greedy().max_new_tokens(16); 4];
    let expected = plain_outputs(main.clone(), configs.clone());

    let pipeline = SpeculativeDecodingPipeline::new(
        ModelDesc::new(main).scheduler_config(scheduler_config.clone()),
        ModelDesc::new(draft).scheduler_config(scheduler_config),
        SpeculativeConfig::new().num_tokens(4),
    )
    .unwrap();
    let results = pipeline.generate(inputs(), configs, None).unwrap();
    for (result, expected) in results.iter().zip(&expected) {
        assert_eq!(&result.token_ids, expected);
    }
}

#[test]
fn test_request_lifecycle() {
    let main = random_model(3);
    let pipeline = speculative(main.clone(), main, SpeculativeConfig::new());
    assert!(!pipeline.has_non_finished_requests());

    let config = GenerationConfig::greedy().max_new_tokens(8);
    let handle = pipeline.add_request(4, vec![1].into(), config.clone()).unwrap();
    assert!(pipeline.has_non_finished_requests());
    assert_eq!(pipeline.num_draft_generations(), 1);
    assert!(matches!(
        pipeline.add_request(4, vec![1].into(), config.clone()),
        Err(Error::DuplicateRequest(4))
    ));

    pipeline.cancel_request(4).unwrap();
    assert_eq!(handle.status(), GenerationStatus::Dropped);
    assert!(!pipeline.has_non_finished_requests());
    assert_eq!(pipeline.num_draft_generations(), 0);
    assert!(matches!(
        pipeline.cancel_request(4),
        Err(Error::UnknownRequest(4))
    ));

    // The id is free again
    assert!(pipeline.add_request(4, vec![1].into(), config).is_ok());
}

#[test]
fn test_generate_skips_caller_assigned_ids() {
    let main = random_model(3);
    let pipeline = speculative(main.clone(), main, SpeculativeConfig::new());
    let config = GenerationConfig::greedy().max_new_tokens(4);
    pipeline.add_request(0, vec![1].into(), config.clone()).unwrap();
    pipeline.add_request(1, vec![2].into(), config.clone()).unwrap();

    let results = pipeline
        .generate(vec![vec![5].into()], vec![config], None)
        .unwrap();
    assert_eq!(results[0].request_id, 2);
    assert_eq!(results[0].token_ids.len(), 4);
    assert_eq!(results[0].status, GenerationStatus::Finished);
    assert_eq!(pipeline.num_draft_generations(), 0);
}

#[test]
fn test_invalid_request_leaves_no_trace() {
    let main = random_model(3);
    let pipeline = speculative(main.clone(), main, SpeculativeConfig::new());

    assert!(matches!(
        pipeline.add_request(0, vec![].into(), GenerationConfig::greedy()),
        Err(Error::Tokenization(_))
    ));
    assert!(matches!(
        pipeline.add_request(1, vec![0].into(), GenerationConfig::greedy().top_p(0.0)),
        Err(Error::Config(_))
    ));
    assert!(!pipeline.has_non_finished_requests());
    assert_eq!(pipeline.num_draft_generations(), 0);
}

#[test]
fn test_cancel_through_handle() {
    let main = random_model(7);
    let pipeline = speculative(main.clone(), main, SpeculativeConfig::new().num_tokens(2));
    let config = GenerationConfig::greedy().max_new_tokens(30);
    let keep = pipeline.add_request(0, vec![1].into(), config.clone()).unwrap();
    let cancel = pipeline.add_request(1, vec![2].into(), config).unwrap();

    pipeline.step().unwrap();
    cancel.cancel();
    pipeline.step().unwrap();

    assert_eq!(cancel.status(), GenerationStatus::Dropped);
    assert_eq!(keep.status(), GenerationStatus::Running);
    assert_eq!(pipeline.num_draft_generations(), 1);
    assert_eq!(pipeline.main_pipeline().num_active_requests(), 1);
    assert_eq!(pipeline.draft_pipeline().num_active_requests(), 1);
}

#[test]
fn test_draft_map_tracks_active_requests() {
    let main = random_model(17);
    let draft = main.perturbed(1.0, 18).unwrap();
    let pipeline = speculative(main, draft, SpeculativeConfig::new().num_tokens(3));

    std::thread::scope(|scope| {
        let pipeline = &pipeline;
        let adder = scope.spawn(move || {
            for id in 0..30u64 {
                let config = GenerationConfig::greedy()
                    .max_new_tokens(4 + (id as usize % 7))
                    .eos_token_id(0);
                pipeline
                    .add_request(id, vec![(id % VOCAB_SIZE as u64) as u32].into(), config)
                    .unwrap();
            }
        });
        let canceller = scope.spawn(move || {
            for id in (0..30u64).step_by(3) {
                // The request may not exist yet, or may have finished already
                let _ = pipeline.cancel_request(id);
            }
        });
        for _ in 0..10 {
            pipeline.step().unwrap();
        }
        adder.join().unwrap();
        canceller.join().unwrap();
    });

    while pipeline.has_non_finished_requests() {
        pipeline.step().unwrap();
        assert_eq!(
            pipeline.num_draft_generations(),
            pipeline.main_pipeline().num_active_requests()
        );
    }
    assert_eq!(pipeline.num_draft_generations(), 0);
    assert_eq!(pipeline.draft_pipeline().num_active_requests(), 0);
}

#[test]
fn test_streamer_stop_cancels_both_sides() {
    let main = random_model(23);
    let pipeline = speculative(main.clone(), main, SpeculativeConfig::new().num_tokens(2));
    let mut puts = 0;
    let mut streamer = |_id: u64, _tokens: &[u32]| {
        puts += 1;
        StreamerStatus::Stop
    };

    let results = pipeline
        .generate(
            inputs(),
            vec![GenerationConfig::greedy().max_new_tokens(50); 4],
            Some(&mut streamer),
        )
        .unwrap();

    assert_eq!(puts, 1);
    assert!(results
        .iter()
        .all(|result| result.status == GenerationStatus::Dropped));
    assert!(!pipeline.has_non_finished_requests());
    assert_eq!(pipeline.num_draft_generations(), 0);
}

#[test]
fn test_perf_metrics_merge_both_pipelines() {
    let main = random_model(31);
    let draft = main.perturbed(1.0, 32).unwrap();
    let pipeline = speculative(main, draft, SpeculativeConfig::new().num_tokens(3));

    let results = pipeline
        .generate(
            inputs(),
            vec![GenerationConfig::greedy().max_new_tokens(10); 4],
            None,
        )
        .unwrap();

    let main_metrics = pipeline.main_pipeline().perf_metrics();
    assert_eq!(main_metrics.num_generated_tokens, 40);
    assert_eq!(main_metrics.num_input_tokens, 7);
    assert_eq!(
        main_metrics.load_time,
        pipeline.draft_pipeline().perf_metrics().load_time
    );
    assert_eq!(
        pipeline.main_pipeline().load_time(),
        pipeline.draft_pipeline().load_time()
    );

    let merged = pipeline.perf_metrics();
    assert!(merged.num_generated_tokens >= 40);
    assert_eq!(merged.num_input_tokens, 14);
    assert!(merged.throughput.mean > 0.0);
    assert!(results.iter().all(|result| result.perf_metrics.ttft.mean >= 0.0));
}

#[test]
fn test_construction_checks_vocabularies() {
    let result = SpeculativeDecodingPipeline::new(
        ModelDesc::new(random_model(0)),
        ModelDesc::new(BigramModel::new(VOCAB_SIZE + 1, 0, &Device::Cpu).unwrap()),
        SpeculativeConfig::new(),
    );
    assert!(matches!(result, Err(Error::Config(_))));

    let result = SpeculativeDecodingPipeline::new(
        ModelDesc::new(random_model(0)),
        ModelDesc::new(random_model(1)),
        SpeculativeConfig::new().num_tokens(0),
    );
    assert!(matches!(result, Err(Error::Config(_))));

    let result = SpeculativeDecodingPipeline::new(
        ModelDesc::new(random_model(0)).tokenizer(Arc::new(FixedVocab(VOCAB_SIZE))),
        ModelDesc::new(random_model(1)).tokenizer(Arc::new(FixedVocab(VOCAB_SIZE - 1))),
        SpeculativeConfig::new(),
    );
    assert!(matches!(result, Err(Error::Config(_))));
}

/// Tokenizer that maps every character to token 0.
struct FixedVocab(usize);

impl TextTokenizer for FixedVocab {
    fn encode(&self, text: &str) -> nano_spec::Result<Vec<u32>> {
        Ok(vec![0; text.chars().count()])
    }

    fn decode(&self, token_ids: &[u32]) -> nano_spec::Result<String> {
        Ok("x".repeat(token_ids.len()))
    }

    fn vocab_size(&self) -> usize {
        self.0
    }
}

#[test]
fn test_text_prompt_is_tokenized_once() {
    let tokenizer: Arc<dyn TextTokenizer> = Arc::new(FixedVocab(VOCAB_SIZE));
    let main = random_model(41);
    let pipeline = SpeculativeDecodingPipeline::new(
        ModelDesc::new(main.clone()).tokenizer(tokenizer.clone()),
        ModelDesc::new(main).tokenizer(tokenizer),
        SpeculativeConfig::new(),
    )
    .unwrap();

    let results = pipeline
        .generate(
            vec!["abc".into()],
            vec![GenerationConfig::greedy().max_new_tokens(5)],
            None,
        )
        .unwrap();
    assert_eq!(results[0].token_ids.len(), 5);
    assert_eq!(results[0].text.as_deref(), Some("xxxxx"));
    assert_eq!(
        results[0].perf_metrics.raw_metrics.tokenization_durations.len(),
        1
    );
}
