//! Forward-pass and generation benchmarks
//!
//! Compares RNN and transformer stacks at a few hidden sizes, with and
//! without an arena, and measures per-strategy sampling cost.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::hint::black_box;

use hyperion::inference::{GenerationParams, Sampler, SamplingMethod};
use hyperion::model::InferenceConfig;
use hyperion::quant::{encode_range, BitWidth};
use hyperion::tokenizer::{Tokenizer, BOS};
use hyperion::{
    generate, Activation, Arena, ArenaConfig, Layer, LayerKind, Model, ModelType, QuantizedBuffer,
    WordTokenizer,
};

fn vocab() -> WordTokenizer {
    let words: Vec<String> = (0..252).map(|i| format!("w{i}")).collect();
    WordTokenizer::from_vocab_str(&words.join("\n")).unwrap_or_default()
}

fn weights(len: usize) -> QuantizedBuffer {
    let data: Vec<f32> = (0..len).map(|i| ((i * 7) % 17) as f32 / 17.0 - 0.5).collect();
    encode_range(&data, BitWidth::B4).unwrap_or_else(|_| QuantizedBuffer::empty(BitWidth::B4))
}

fn push(model: &mut Model<'_>, kind: LayerKind, d_in: usize, d_out: usize, act: Activation, w: usize) {
    let biases = if kind == LayerKind::LayerNorm { 0 } else { d_out };
    if let Ok(layer) = Layer::new(kind, d_in, d_out, act, weights(w), vec![0.0; biases]) {
        model.push_layer(layer);
    }
}

fn build(tok: &WordTokenizer, model_type: ModelType, hidden: usize) -> Option<Model<'_>> {
    let v = tok.vocab_size();
    let mut model = Model::new(model_type, hidden, 32, tok)
        .ok()?
        .with_config(InferenceConfig::default().with_n_heads(4));
    push(&mut model, LayerKind::Embedding, v, hidden, Activation::None, v * hidden);
    match model_type {
        ModelType::Rnn => {
            push(&mut model, LayerKind::Rnn, hidden, hidden, Activation::Tanh, hidden * hidden);
        }
        ModelType::Transformer => {
            push(&mut model, LayerKind::Attention, hidden, hidden, Activation::None, 3 * hidden * hidden);
            push(&mut model, LayerKind::LayerNorm, hidden, hidden, Activation::None, 0);
            push(&mut model, LayerKind::Dense, hidden, hidden, Activation::Gelu, hidden * hidden);
        }
    }
    push(&mut model, LayerKind::Output, hidden, v, Activation::None, hidden * v);
    Some(model)
}

fn bench_forward(c: &mut Criterion) {
    let mut group = c.benchmark_group("forward");
    let tok = vocab();
    let tokens: Vec<u32> = std::iter::once(BOS).chain(4..20).collect();
    group.throughput(Throughput::Elements(tokens.len() as u64));

    for model_type in [ModelType::Rnn, ModelType::Transformer] {
        for hidden in [32, 64, 128] {
            let id = format!("{model_type:?}/{hidden}");
            if let Some(mut model) = build(&tok, model_type, hidden) {
                group.bench_function(BenchmarkId::new("plain", &id), |bencher| {
                    bencher.iter(|| black_box(model.forward(&tokens).ok()));
                });
            }
            let arena = Arena::new(ArenaConfig::default());
            if let Some(model) = build(&tok, model_type, hidden) {
                let mut model = model.with_arena(&arena);
                group.bench_function(BenchmarkId::new("arena", &id), |bencher| {
                    bencher.iter(|| black_box(model.forward(&tokens).ok()));
                });
            }
        }
    }
    group.finish();
}

fn bench_sampling(c: &mut Criterion) {
    let mut group = c.benchmark_group("sampling");
    let logits: Vec<f32> = (0..4096).map(|i| ((i * 31) % 97) as f32 / 10.0).collect();

    for method in [
        SamplingMethod::Greedy,
        SamplingMethod::Temperature,
        SamplingMethod::TopK,
        SamplingMethod::TopP,
    ] {
        let params = GenerationParams::default().with_sampling_method(method);
        let mut sampler = Sampler::new(42);
        group.bench_function(BenchmarkId::from_parameter(method), |bencher| {
            bencher.iter(|| black_box(sampler.sample(&logits, &params).ok()));
        });
    }
    group.finish();
}

fn bench_generate(c: &mut Criterion) {
    let tok = vocab();
    let Some(mut model) = build(&tok, ModelType::Transformer, 64) else {
        return;
    };
    let params = GenerationParams::default()
        .with_max_tokens(32)
        .with_sampling_method(SamplingMethod::TopK)
        .with_seed(7);
    c.bench_function("generate_32_tokens", |bencher| {
        bencher.iter(|| black_box(generate(&mut model, &params).ok()));
    });
}

criterion_group!(benches, bench_forward, bench_sampling, bench_generate);
criterion_main!(benches);
