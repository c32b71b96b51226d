//! Layer graph and forward pass
//!
//! A [`Model`] is an ordered list of quantized [`Layer`]s evaluated over two
//! flip-flopping activation buffers. Two evaluation paths exist:
//!
//! - **RNN**: only the last input token is embedded (at position 0) and
//!   carried through the stack; attention layers pass their input through.
//! - **Transformer**: every position is embedded and processed; attention
//!   is causal multi-head self-attention and the output layer projects the
//!   final position only.
//!
//! Weights are stored `[input x output]` row-major and dequantized into a
//! scratch matrix per layer, from the model's [`Arena`] when one is
//! attached.
//!
//! `forward` takes `&mut self`, so one pass runs per model at a time.

pub mod attention;

pub use attention::{causal_mask, causal_self_attention, Projections};

use std::fmt;

use crate::error::{HyperionError, HyperionResult};
use crate::memory::Arena;
use crate::quant::QuantizedBuffer;
use crate::simd;
use crate::tokenizer::{Tokenizer, UNKNOWN};

/// Layer kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "cli", derive(serde::Deserialize), serde(rename_all = "lowercase"))]
#[repr(u32)]
pub enum LayerKind {
    /// Token id to vector lookup
    Embedding = 0,
    /// Fully connected
    Dense = 1,
    /// Recurrent cell, evaluated like a dense layer
    Rnn = 2,
    /// Self-attention
    Attention = 3,
    /// Layer normalization
    LayerNorm = 4,
    /// Final projection to vocabulary logits
    Output = 5,
}

impl LayerKind {
    /// Whether this kind may carry no weights
    #[must_use]
    pub const fn allows_empty_weights(self) -> bool {
        matches!(self, Self::Attention | Self::LayerNorm)
    }
}

impl TryFrom<u32> for LayerKind {
    type Error = HyperionError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Embedding),
            1 => Ok(Self::Dense),
            2 => Ok(Self::Rnn),
            3 => Ok(Self::Attention),
            4 => Ok(Self::LayerNorm),
            5 => Ok(Self::Output),
            _ => Err(HyperionError::Format(format!("invalid layer kind: {value}"))),
        }
    }
}

impl fmt::Display for LayerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Embedding => "embedding",
            Self::Dense => "dense",
            Self::Rnn => "rnn",
            Self::Attention => "attention",
            Self::LayerNorm => "layernorm",
            Self::Output => "output",
        };
        f.write_str(name)
    }
}

/// Element-wise activation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "cli", derive(serde::Deserialize), serde(rename_all = "lowercase"))]
#[repr(u32)]
pub enum Activation {
    /// Identity
    #[default]
    None = 0,
    /// max(0, x)
    Relu = 1,
    /// Logistic, saturated to 0/1 outside ±10
    Sigmoid = 2,
    /// Hyperbolic tangent
    Tanh = 3,
    /// GELU, tanh approximation
    Gelu = 4,
}

/// sqrt(2 / pi)
const GELU_COEFF: f32 = 0.797_884_56;

impl Activation {
    /// Apply to one value
    #[must_use]
    pub fn apply(self, x: f32) -> f32 {
        match self {
            Self::None => x,
            Self::Relu => x.max(0.0),
            Self::Sigmoid => {
                if x < -10.0 {
                    0.0
                } else if x > 10.0 {
                    1.0
                } else {
                    1.0 / (1.0 + (-x).exp())
                }
            }
            Self::Tanh => x.tanh(),
            Self::Gelu => 0.5 * x * (1.0 + (GELU_COEFF * (x + 0.044_715 * x * x * x)).tanh()),
        }
    }

    /// Apply in place
    pub fn apply_slice(self, xs: &mut [f32]) {
        if self != Self::None {
            for x in xs {
                *x = self.apply(*x);
            }
        }
    }
}

impl TryFrom<u32> for Activation {
    type Error = HyperionError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::None),
            1 => Ok(Self::Relu),
            2 => Ok(Self::Sigmoid),
            3 => Ok(Self::Tanh),
            4 => Ok(Self::Gelu),
            _ => Err(HyperionError::Format(format!("invalid activation: {value}"))),
        }
    }
}

/// Evaluation path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "cli", derive(serde::Deserialize), serde(rename_all = "lowercase"))]
#[repr(u32)]
pub enum ModelType {
    /// Last-token recurrent stack
    Rnn = 0,
    /// Full-sequence transformer stack
    Transformer = 1,
}

impl TryFrom<u32> for ModelType {
    type Error = HyperionError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Rnn),
            1 => Ok(Self::Transformer),
            _ => Err(HyperionError::Format(format!("invalid model type: {value}"))),
        }
    }
}

/// One quantized layer
#[derive(Debug, Clone, PartialEq)]
pub struct Layer {
    kind: LayerKind,
    input_size: usize,
    output_size: usize,
    activation: Activation,
    weights: QuantizedBuffer,
    biases: Vec<f32>,
}

impl Layer {
    /// Create a layer, checking weight and bias sizes against its shape
    ///
    /// Weights hold `input * output` elements. Attention may instead hold
    /// `3 * input * output` (separate Q/K/V) or nothing when
    /// `input == output`. Layer norm needs `input == output`, ignores its
    /// weights and takes `gamma` and optionally `beta` from the biases.
    ///
    /// # Errors
    ///
    /// Dimension error for a zero size or any size mismatch.
    pub fn new(
        kind: LayerKind,
        input_size: usize,
        output_size: usize,
        activation: Activation,
        weights: QuantizedBuffer,
        biases: Vec<f32>,
    ) -> HyperionResult<Self> {
        if input_size == 0 || output_size == 0 {
            return Err(HyperionError::Dimension(format!(
                "{kind} layer sizes must be non-zero, got {input_size}x{output_size}"
            )));
        }

        let square = input_size * output_size;
        let weights_ok = match kind {
            LayerKind::Attention => {
                (weights.is_empty() && input_size == output_size)
                    || weights.len() == square
                    || weights.len() == 3 * square
            }
            LayerKind::LayerNorm => input_size == output_size,
            _ => weights.len() == square,
        };
        if !weights_ok {
            return Err(HyperionError::Dimension(format!(
                "{kind} layer {input_size}x{output_size} cannot hold {} weights",
                weights.len()
            )));
        }

        let biases_ok = match kind {
            LayerKind::LayerNorm => {
                biases.is_empty() || biases.len() == output_size || biases.len() == 2 * output_size
            }
            LayerKind::Attention => biases.is_empty() || biases.len() == output_size,
            _ => biases.is_empty() || biases.len() == output_size,
        };
        if !biases_ok {
            return Err(HyperionError::dimension(
                "bias length",
                output_size,
                biases.len(),
            ));
        }

        Ok(Self {
            kind,
            input_size,
            output_size,
            activation,
            weights,
            biases,
        })
    }

    /// Kind
    #[must_use]
    pub const fn kind(&self) -> LayerKind {
        self.kind
    }

    /// Input width
    #[must_use]
    pub const fn input_size(&self) -> usize {
        self.input_size
    }

    /// Output width
    #[must_use]
    pub const fn output_size(&self) -> usize {
        self.output_size
    }

    /// Activation
    #[must_use]
    pub const fn activation(&self) -> Activation {
        self.activation
    }

    /// Quantized weights
    #[must_use]
    pub const fn weights(&self) -> &QuantizedBuffer {
        &self.weights
    }

    /// Biases (gamma/beta for layer norm)
    #[must_use]
    pub fn biases(&self) -> &[f32] {
        &self.biases
    }

    /// Weight plus bias element count
    #[must_use]
    pub fn parameter_count(&self) -> usize {
        self.weights.len() + self.biases.len()
    }

    fn add_bias(&self, y: &mut [f32]) {
        if self.biases.len() == y.len() {
            for (v, b) in y.iter_mut().zip(&self.biases) {
                *v += b;
            }
        }
    }
}

/// Forward-pass settings
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InferenceConfig {
    /// Attention heads; must divide every attention layer's width
    pub n_heads: usize,
    /// Layer norm epsilon
    pub layer_norm_eps: f32,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            n_heads: 1,
            layer_norm_eps: 1e-5,
        }
    }
}

impl InferenceConfig {
    /// Set attention heads
    #[must_use]
    pub const fn with_n_heads(mut self, n_heads: usize) -> Self {
        self.n_heads = n_heads;
        self
    }

    /// Set layer norm epsilon
    #[must_use]
    pub const fn with_layer_norm_eps(mut self, eps: f32) -> Self {
        self.layer_norm_eps = eps;
        self
    }
}

/// A quantized layer stack bound to a tokenizer
pub struct Model<'a> {
    model_type: ModelType,
    hidden_size: usize,
    context_size: usize,
    layers: Vec<Layer>,
    tokenizer: &'a dyn Tokenizer,
    arena: Option<&'a Arena>,
    config: InferenceConfig,
    activations: [Vec<f32>; 2],
    scratch: Vec<f32>,
}

impl fmt::Debug for Model<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Model")
            .field("model_type", &self.model_type)
            .field("hidden_size", &self.hidden_size)
            .field("context_size", &self.context_size)
            .field("layers", &self.layers.len())
            .field("vocab_size", &self.tokenizer.vocab_size())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

fn split_buffers(bufs: &mut [Vec<f32>; 2], current: usize) -> (&[f32], &mut Vec<f32>) {
    let [a, b] = bufs;
    if current == 0 {
        (a.as_slice(), b)
    } else {
        (b.as_slice(), a)
    }
}

/// Dequantize `layer`'s weights into scratch memory and run `f` on them
fn with_weights<R>(
    layer: &Layer,
    arena: Option<&Arena>,
    scratch: &mut Vec<f32>,
    f: impl FnOnce(&[f32]) -> HyperionResult<R>,
) -> HyperionResult<R> {
    let n = layer.weights.len();
    match arena {
        Some(arena) => {
            let mut buf = arena.alloc(n)?;
            let result = layer
                .weights
                .decode_into(buf.as_mut_slice())
                .and_then(|()| f(buf.as_slice()));
            arena.release(buf);
            result
        }
        None => {
            scratch.resize(n, 0.0);
            layer.weights.decode_into(&mut scratch[..n])?;
            f(&scratch[..n])
        }
    }
}

impl<'a> Model<'a> {
    /// Create an empty model
    ///
    /// # Errors
    ///
    /// Dimension error for a zero hidden or context size.
    pub fn new(
        model_type: ModelType,
        hidden_size: usize,
        context_size: usize,
        tokenizer: &'a dyn Tokenizer,
    ) -> HyperionResult<Self> {
        if hidden_size == 0 || context_size == 0 {
            return Err(HyperionError::Dimension(format!(
                "hidden ({hidden_size}) and context ({context_size}) sizes must be non-zero"
            )));
        }
        Ok(Self {
            model_type,
            hidden_size,
            context_size,
            layers: Vec::new(),
            tokenizer,
            arena: None,
            config: InferenceConfig::default(),
            activations: [Vec::new(), Vec::new()],
            scratch: Vec::new(),
        })
    }

    /// Draw weight scratch buffers from `arena`
    #[must_use]
    pub fn with_arena(mut self, arena: &'a Arena) -> Self {
        self.arena = Some(arena);
        self
    }

    /// Replace the inference settings
    #[must_use]
    pub fn with_config(mut self, config: InferenceConfig) -> Self {
        self.config = config;
        self
    }

    /// Append a layer
    pub fn push_layer(&mut self, layer: Layer) {
        self.layers.push(layer);
    }

    /// Evaluation path
    #[must_use]
    pub const fn model_type(&self) -> ModelType {
        self.model_type
    }

    /// Hidden width
    #[must_use]
    pub const fn hidden_size(&self) -> usize {
        self.hidden_size
    }

    /// Maximum tokens per forward pass
    #[must_use]
    pub const fn context_size(&self) -> usize {
        self.context_size
    }

    /// Layers in evaluation order
    #[must_use]
    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    /// Bound tokenizer
    #[must_use]
    pub fn tokenizer(&self) -> &'a dyn Tokenizer {
        self.tokenizer
    }

    /// Inference settings
    #[must_use]
    pub const fn config(&self) -> &InferenceConfig {
        &self.config
    }

    /// Total weights and biases
    #[must_use]
    pub fn parameter_count(&self) -> usize {
        self.layers.iter().map(Layer::parameter_count).sum()
    }

    /// Run the layer stack and return next-token logits
    ///
    /// Input beyond `context_size` tokens is truncated to the first
    /// `context_size`. Ids outside the vocabulary read as [`UNKNOWN`].
    ///
    /// # Errors
    ///
    /// Dimension error for empty input, a layer whose input width does not
    /// match the running width, or final logits that do not match the
    /// vocabulary size. Quantization and allocation errors propagate.
    pub fn forward(&mut self, tokens: &[u32]) -> HyperionResult<Vec<f32>> {
        if tokens.is_empty() {
            return Err(HyperionError::Dimension("forward needs at least one token".into()));
        }
        let _guard = trace_enter!("forward", tokens = tokens.len());

        let vocab = self.tokenizer.vocab_size();
        let window = &tokens[..tokens.len().min(self.context_size)];
        let ids: Vec<usize> = match self.model_type {
            ModelType::Rnn => window[window.len() - 1..].to_vec(),
            ModelType::Transformer => window.to_vec(),
        }
        .into_iter()
        .map(|t| if (t as usize) < vocab { t as usize } else { UNKNOWN as usize })
        .collect();

        let model_type = self.model_type;
        let config = self.config;
        let arena = self.arena;
        let Self {
            layers,
            activations,
            scratch,
            hidden_size,
            ..
        } = self;

        let mut seq = ids.len();
        let mut width = *hidden_size;
        let mut current = 0;
        activations[current].clear();
        activations[current].resize(seq * width, 0.0);

        for (index, layer) in layers.iter().enumerate() {
            let (input, output) = split_buffers(activations, current);
            let _layer_guard = trace_enter!("layer", index = index, kind = %layer.kind);

            let check_width = |width: usize| {
                if layer.input_size == width {
                    Ok(())
                } else {
                    Err(HyperionError::Dimension(format!(
                        "layer {index} ({}) expects width {}, got {width}",
                        layer.kind, layer.input_size
                    )))
                }
            };

            match layer.kind {
                LayerKind::Embedding => {
                    let out = layer.output_size;
                    output.clear();
                    output.resize(seq * out, 0.0);
                    for (row, &id) in output.chunks_exact_mut(out).zip(&ids) {
                        let id = if id < layer.input_size { id } else { UNKNOWN as usize };
                        for (j, v) in row.iter_mut().enumerate() {
                            *v = layer.weights.value(id * out + j).unwrap_or(0.0);
                        }
                    }
                    width = out;
                }
                LayerKind::Dense | LayerKind::Rnn => {
                    check_width(width)?;
                    let (d_in, d_out) = (layer.input_size, layer.output_size);
                    output.clear();
                    output.resize(seq * d_out, 0.0);
                    with_weights(layer, arena, scratch, |w| {
                        for (x, y) in input.chunks_exact(d_in).zip(output.chunks_exact_mut(d_out)) {
                            simd::vecmat_into(x, w, d_in, d_out, y);
                            layer.add_bias(y);
                            layer.activation.apply_slice(y);
                        }
                        Ok(())
                    })?;
                    width = d_out;
                }
                LayerKind::Attention => match model_type {
                    ModelType::Rnn => {
                        output.clear();
                        output.extend_from_slice(&input[..seq * width]);
                    }
                    ModelType::Transformer => {
                        check_width(width)?;
                        let (d_in, d_out) = (layer.input_size, layer.output_size);
                        let attended = with_weights(layer, arena, scratch, |w| {
                            let projections = Projections::from_weights(w, d_in, d_out)?;
                            causal_self_attention(
                                &input[..seq * d_in],
                                seq,
                                d_in,
                                d_out,
                                projections,
                                config.n_heads,
                            )
                        })?;
                        output.clear();
                        output.extend_from_slice(&attended);
                        for y in output.chunks_exact_mut(d_out) {
                            layer.add_bias(y);
                            layer.activation.apply_slice(y);
                        }
                        width = d_out;
                    }
                },
                LayerKind::LayerNorm => {
                    check_width(width)?;
                    let n = layer.input_size;
                    let gamma = (layer.biases.len() >= n).then(|| &layer.biases[..n]);
                    let beta = (layer.biases.len() >= 2 * n).then(|| &layer.biases[n..2 * n]);
                    output.clear();
                    output.resize(seq * n, 0.0);
                    for (x, y) in input.chunks_exact(n).zip(output.chunks_exact_mut(n)) {
                        simd::layer_norm_into(x, gamma, beta, config.layer_norm_eps, y);
                    }
                }
                LayerKind::Output => {
                    check_width(width)?;
                    let (d_in, d_out) = (layer.input_size, layer.output_size);
                    let last = &input[(seq - 1) * d_in..seq * d_in];
                    output.clear();
                    output.resize(d_out, 0.0);
                    with_weights(layer, arena, scratch, |w| {
                        simd::vecmat_into(last, w, d_in, d_out, output);
                        Ok(())
                    })?;
                    layer.add_bias(output);
                    seq = 1;
                    width = d_out;
                }
            }
            current ^= 1;
        }

        if width != vocab {
            return Err(HyperionError::dimension("logits", vocab, width));
        }
        let final_state = &activations[current];
        let logits = final_state[(seq - 1) * width..seq * width].to_vec();
        trace_event!(logits = logits.len(), "forward complete");
        Ok(logits)
    }
}
