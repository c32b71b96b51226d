//! Command-line argument parsing for hyperion-cli
//!
//! Uses clap derive macros; every structure is unit-testable.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

use crate::inference::{GenerationParams, GenerationStyle, SamplingMethod};

/// hyperion: on-device quantized model inference
#[derive(Parser, Debug, Clone)]
#[command(name = "hyperion-cli")]
#[command(version)]
#[command(about = "On-device quantized model inference", long_about = None)]
#[command(propagate_version = true)]
pub struct Args {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Command,

    /// Verbose output (show timing info)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Quiet mode (suppress non-essential output)
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Output as JSON (machine-readable)
    #[arg(long, global = true)]
    pub json: bool,
}

/// Available commands
#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Show a container's header and metadata
    Info(InfoArgs),

    /// Check magic, version and checksum
    Verify(VerifyArgs),

    /// Generate text from a model
    Generate(GenerateArgs),

    /// Quantize a JSON layer description into a container
    Pack(PackArgs),

    /// Show the mixed-precision plan for a JSON layer description
    Plan(PlanArgs),
}

/// Arguments for info command
#[derive(Parser, Debug, Clone)]
pub struct InfoArgs {
    /// Model container
    pub model: PathBuf,
}

/// Arguments for verify command
#[derive(Parser, Debug, Clone)]
pub struct VerifyArgs {
    /// Model container
    pub model: PathBuf,
}

/// Arguments for generate command
#[derive(Parser, Debug, Clone)]
pub struct GenerateArgs {
    /// Model container
    pub model: PathBuf,

    /// Vocabulary file, one token per line
    #[arg(long)]
    pub vocab: PathBuf,

    /// Prompt text (default: start from BOS)
    #[arg(short, long, default_value = "")]
    pub prompt: String,

    /// Maximum sequence length, prompt included
    #[arg(short = 'n', long, default_value = "50")]
    pub max_tokens: usize,

    /// Sampling strategy
    #[arg(short, long, default_value = "greedy")]
    pub method: SamplingMethod,

    /// Sampling temperature
    #[arg(long, default_value = "0.7")]
    pub temperature: f32,

    /// Candidates for top-k sampling
    #[arg(long, default_value = "50")]
    pub top_k: usize,

    /// Probability mass for top-p sampling
    #[arg(long, default_value = "0.9")]
    pub top_p: f32,

    /// Sampler seed (0 = from clock)
    #[arg(long, default_value = "0")]
    pub seed: u32,

    /// Style preset
    #[arg(long, default_value = "neutral")]
    pub style: GenerationStyle,

    /// Attention heads for transformer models
    #[arg(long, default_value = "1")]
    pub heads: usize,

    /// Cap on scratch memory in bytes
    #[arg(long)]
    pub arena_limit: Option<usize>,
}

impl GenerateArgs {
    /// Generation parameters described by these flags
    #[must_use]
    pub fn params(&self) -> GenerationParams {
        GenerationParams::default()
            .with_max_tokens(self.max_tokens)
            .with_sampling_method(self.method)
            .with_temperature(self.temperature)
            .with_top_k(self.top_k)
            .with_top_p(self.top_p)
            .with_seed(self.seed)
            .with_style(self.style)
    }
}

/// Code width for packed weights
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BitsArg {
    /// 4-bit codes
    #[default]
    #[value(name = "4")]
    Four,
    /// 8-bit codes
    #[value(name = "8")]
    Eight,
    /// Let the precision planner choose
    Auto,
}

/// Arguments for pack command
#[derive(Parser, Debug, Clone)]
pub struct PackArgs {
    /// JSON layer description
    pub input: PathBuf,

    /// Output container
    #[arg(short, long)]
    pub output: PathBuf,

    /// Vocabulary file; its size must match the output layer
    #[arg(long)]
    pub vocab: PathBuf,

    /// Weight code width
    #[arg(short, long, default_value = "4")]
    pub bits: BitsArg,

    /// Memory budget for `--bits auto`, as a fraction of fp32
    #[arg(long, default_value = "0.25")]
    pub budget: f32,

    /// Model name
    #[arg(long, default_value = "")]
    pub name: String,

    /// Model author
    #[arg(long, default_value = "")]
    pub author: String,

    /// Model description
    #[arg(long, default_value = "")]
    pub description: String,
}

/// Arguments for plan command
#[derive(Parser, Debug, Clone)]
pub struct PlanArgs {
    /// JSON layer description
    pub input: PathBuf,

    /// Memory budget as a fraction of fp32
    #[arg(long, default_value = "0.25")]
    pub budget: f32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    // -------------------------------------------------------------------------
    // Args parsing tests
    // -------------------------------------------------------------------------

    #[test]
    fn test_args_command_factory_valid() {
        Args::command().debug_assert();
    }

    #[test]
    fn test_parse_generate_minimal() {
        let args = Args::try_parse_from(["hyperion-cli", "generate", "m.hmod", "--vocab", "v.txt"])
            .expect("test parse should succeed");
        match args.command {
            Command::Generate(g) => {
                assert_eq!(g.model, PathBuf::from("m.hmod"));
                assert_eq!(g.max_tokens, 50);
                assert_eq!(g.method, SamplingMethod::Greedy);
                assert_eq!(g.style, GenerationStyle::Neutral);
                assert!(g.prompt.is_empty());
            }
            _ => panic!("Expected Generate command"),
        }
    }

    #[test]
    fn test_parse_generate_all_options() {
        let args = Args::try_parse_from([
            "hyperion-cli",
            "generate",
            "m.hmod",
            "--vocab",
            "v.txt",
            "--prompt",
            "hello there",
            "-n",
            "12",
            "--method",
            "top-p",
            "--temperature",
            "1.1",
            "--top-k",
            "7",
            "--top-p",
            "0.8",
            "--seed",
            "42",
            "--style",
            "creative",
            "--heads",
            "2",
            "--arena-limit",
            "65536",
        ])
        .expect("test parse should succeed");
        let Command::Generate(g) = args.command else {
            panic!("Expected Generate command");
        };
        let params = g.params();
        assert_eq!(params.max_tokens, 12);
        assert_eq!(params.sampling_method, SamplingMethod::TopP);
        assert_eq!(params.top_k, 7);
        assert_eq!(params.seed, 42);
        assert_eq!(params.style, GenerationStyle::Creative);
        assert_eq!(g.heads, 2);
        assert_eq!(g.arena_limit, Some(65536));
    }

    #[test]
    fn test_parse_pack_bits() {
        let args = Args::try_parse_from([
            "hyperion-cli",
            "pack",
            "layers.json",
            "-o",
            "out.hmod",
            "--vocab",
            "v.txt",
            "--bits",
            "auto",
        ])
        .expect("test parse should succeed");
        let Command::Pack(p) = args.command else {
            panic!("Expected Pack command");
        };
        assert_eq!(p.bits, BitsArg::Auto);
        assert!((p.budget - 0.25).abs() < f32::EPSILON);
    }

    #[test]
    fn test_global_flags() {
        let args = Args::try_parse_from(["hyperion-cli", "verify", "m.hmod", "--json", "-q"])
            .expect("test parse should succeed");
        assert!(args.json);
        assert!(args.quiet);
        assert!(!args.verbose);
    }

    #[test]
    fn test_missing_vocab_rejected() {
        assert!(Args::try_parse_from(["hyperion-cli", "generate", "m.hmod"]).is_err());
    }
}
