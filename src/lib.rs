//! # Hyperion
//!
//! On-device inference for small quantized language models.
//!
//! ## Overview
//!
//! Hyperion keeps weights at 1 to 16 bits per value and dequantizes them one
//! layer at a time, so a model fits in a few hundred kilobytes:
//! - Sub-byte quantization codecs (asymmetric, symmetric, logarithmic,
//!   binary, ternary) with mixed-precision planning
//! - CSR sparse matrices, plain and 4-bit quantized
//! - A checksummed binary model container
//! - RNN and transformer forward passes with seeded sampling
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use hyperion::{generate_text, load_model, GenerationParams, WordTokenizer};
//!
//! let tokenizer = WordTokenizer::from_vocab_file("vocab.txt")?;
//! let mut model = load_model("tiny.hmod", &tokenizer)?;
//! let params = GenerationParams::default().with_seed(42);
//! println!("{}", generate_text(&mut model, "once upon a", &params)?);
//! ```
//!
//! ## Features
//!
//! - `tracing`: spans and debug events via `tracing`
//! - `cli`: the `hyperion-cli` binary (clap, serde, serde_json)

#![warn(missing_docs)]
#![deny(clippy::unwrap_used)]

#[macro_use]
pub mod trace;

pub mod error;
pub mod format;
pub mod inference;
pub mod memory;
pub mod model;
pub mod quant;
pub mod simd;
pub mod sparse;
pub mod tokenizer;

#[cfg(feature = "cli")]
pub mod cli;

pub use error::{HyperionError, HyperionResult};
pub use format::{load_model, save_model, verify, ModelHeader, ModelMetadata, VerificationResult};
pub use inference::{generate, generate_text, GenerationParams, GenerationStyle, Sampler, SamplingMethod};
pub use memory::{Arena, ArenaConfig};
pub use model::{Activation, InferenceConfig, Layer, LayerKind, Model, ModelType};
pub use quant::{decode, encode, BitWidth, QuantizedBuffer, Scheme};
pub use sparse::{CsrMatrix, QuantizedCsrMatrix};
pub use tokenizer::{Tokenizer, WordTokenizer};
