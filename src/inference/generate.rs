//! Autoregressive generation
//!
//! Each step forwards the most recent `context_size` tokens, samples one
//! token and appends it. Generation stops at EOS (which is not appended) or
//! when the sequence reaches `max_tokens`.

use super::{GenerationParams, Sampler};
use crate::error::HyperionResult;
use crate::model::Model;
use crate::tokenizer::{BOS, EOS};

/// Generate a token sequence, prompt included
///
/// An empty prompt starts from `[BOS]`. A prompt already at or beyond
/// `max_tokens` is returned unchanged.
///
/// # Errors
///
/// Propagates the first forward-pass or sampling error.
pub fn generate(model: &mut Model<'_>, params: &GenerationParams) -> HyperionResult<Vec<u32>> {
    let params = params.style.apply(params);
    let mut sampler = Sampler::new(params.seed);
    let _guard = trace_enter!("generate", max_tokens = params.max_tokens);

    let mut tokens = if params.prompt.is_empty() {
        vec![BOS]
    } else {
        params.prompt.clone()
    };

    let context = model.context_size();
    while tokens.len() < params.max_tokens {
        let start = tokens.len().saturating_sub(context);
        let logits = model.forward(&tokens[start..])?;
        let next = sampler.sample(&logits, &params)?;
        if next == EOS {
            trace_event!(length = tokens.len(), "end of sequence");
            break;
        }
        tokens.push(next);
    }

    trace_event!(length = tokens.len(), "generation complete");
    Ok(tokens)
}

/// Encode `prompt`, generate, and decode the whole sequence
///
/// The prompt replaces any `params.prompt` tokens.
///
/// # Errors
///
/// See [`generate`].
pub fn generate_text(
    model: &mut Model<'_>,
    prompt: &str,
    params: &GenerationParams,
) -> HyperionResult<String> {
    let tokenizer = model.tokenizer();
    let params = params.clone().with_prompt(tokenizer.encode(prompt));
    let tokens = generate(model, &params)?;
    Ok(tokenizer.decode(&tokens))
}
