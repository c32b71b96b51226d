//! Token sampling and autoregressive generation
//!
//! # Modules
//!
//! - [`sampling`] - Seeded sampler with greedy, top-k, top-p and
//!   temperature strategies
//! - [`generate`] - Generation loop over a [`Model`](crate::model::Model)
//!
//! # Example
//!
//! ```rust,ignore
//! use hyperion::inference::{generate_text, GenerationParams, SamplingMethod};
//!
//! let params = GenerationParams::default()
//!     .with_sampling_method(SamplingMethod::TopK)
//!     .with_top_k(5)
//!     .with_seed(42);
//! let text = generate_text(&mut model, "once upon", &params)?;
//! ```

pub mod generate;
pub mod sampling;

pub use generate::{generate, generate_text};
pub use sampling::Sampler;

use std::fmt;

use crate::error::HyperionError;

/// Strategy used to pick the next token
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "cli", derive(clap::ValueEnum, serde::Serialize))]
#[repr(u32)]
pub enum SamplingMethod {
    /// Highest probability, first maximum wins
    #[default]
    Greedy = 0,
    /// Inverse-CDF draw over the full distribution
    Temperature = 1,
    /// Draw among the `top_k` most likely tokens
    TopK = 2,
    /// Draw within the smallest set holding `top_p` of the mass
    TopP = 3,
}

impl TryFrom<u32> for SamplingMethod {
    type Error = HyperionError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Greedy),
            1 => Ok(Self::Temperature),
            2 => Ok(Self::TopK),
            3 => Ok(Self::TopP),
            _ => Err(HyperionError::Format(format!(
                "invalid sampling method: {value}"
            ))),
        }
    }
}

impl fmt::Display for SamplingMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Greedy => "greedy",
            Self::Temperature => "temperature",
            Self::TopK => "top-k",
            Self::TopP => "top-p",
        };
        f.write_str(name)
    }
}

/// Preset that overrides sampling fields before generation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "cli", derive(clap::ValueEnum, serde::Serialize))]
pub enum GenerationStyle {
    /// Leave parameters as given
    #[default]
    Neutral,
    /// Near-deterministic
    Formal,
    /// Wide, hot sampling
    Creative,
    /// Short output, narrow sampling
    Concise,
    /// Long output, nucleus sampling
    Descriptive,
}

impl GenerationStyle {
    /// Return `params` adjusted for this style
    #[must_use]
    pub fn apply(self, params: &GenerationParams) -> GenerationParams {
        let mut p = params.clone();
        match self {
            Self::Neutral => {}
            Self::Formal => {
                p.temperature = 0.5;
                p.top_k = 1;
                p.top_p = 0.0;
            }
            Self::Creative => {
                p.temperature = 1.2;
                p.top_k = 50;
                p.top_p = 0.95;
            }
            Self::Concise => {
                p.max_tokens = p.max_tokens.min(20);
                p.temperature = 0.6;
                p.top_k = 5;
                p.top_p = 0.8;
            }
            Self::Descriptive => {
                p.max_tokens = p.max_tokens.max(100);
                p.temperature = 0.9;
                p.top_k = 0;
                p.top_p = 0.9;
            }
        }
        p
    }
}

/// Generation settings
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationParams {
    /// Cap on the total sequence length, prompt included
    pub max_tokens: usize,
    /// Next-token strategy
    pub sampling_method: SamplingMethod,
    /// Logit divisor; values `<= 0` mean 1
    pub temperature: f32,
    /// Candidates for top-k
    pub top_k: usize,
    /// Mass for top-p
    pub top_p: f32,
    /// Sampler seed, 0 for a clock-derived seed
    pub seed: u32,
    /// Starting tokens; `[BOS]` when empty
    pub prompt: Vec<u32>,
    /// Preset applied before generating
    pub style: GenerationStyle,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            max_tokens: 50,
            sampling_method: SamplingMethod::Greedy,
            temperature: 0.7,
            top_k: 50,
            top_p: 0.9,
            seed: 0,
            prompt: Vec::new(),
            style: GenerationStyle::Neutral,
        }
    }
}

impl GenerationParams {
    /// Set the length cap
    #[must_use]
    pub const fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    /// Set the strategy
    #[must_use]
    pub const fn with_sampling_method(mut self, method: SamplingMethod) -> Self {
        self.sampling_method = method;
        self
    }

    /// Set the temperature
    #[must_use]
    pub const fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    /// Set top-k
    #[must_use]
    pub const fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = top_k;
        self
    }

    /// Set top-p
    #[must_use]
    pub const fn with_top_p(mut self, top_p: f32) -> Self {
        self.top_p = top_p;
        self
    }

    /// Set the seed
    #[must_use]
    pub const fn with_seed(mut self, seed: u32) -> Self {
        self.seed = seed;
        self
    }

    /// Set the prompt tokens
    #[must_use]
    pub fn with_prompt(mut self, prompt: Vec<u32>) -> Self {
        self.prompt = prompt;
        self
    }

    /// Set the style
    #[must_use]
    pub const fn with_style(mut self, style: GenerationStyle) -> Self {
        self.style = style;
        self
    }
}
