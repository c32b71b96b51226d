//! Command implementations for hyperion-cli
//!
//! Each command is a plain function returning a [`CommandResult`]; `run`
//! dispatches on the parsed [`Args`].

use std::fs;
use std::io::{self, Write as IoWrite};
use std::path::Path;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::format::{self, ModelMetadata, VerificationResult};
use crate::inference::generate_text;
use crate::memory::{Arena, ArenaConfig};
use crate::model::{Activation, InferenceConfig, Layer, LayerKind, Model, ModelType};
use crate::quant::{encode_range, BitWidth, PlannerConfig, PrecisionPlanner, QuantizedBuffer};
use crate::tokenizer::{Tokenizer, WordTokenizer};

use super::args::{Args, BitsArg, Command, GenerateArgs, InfoArgs, PackArgs, PlanArgs, VerifyArgs};

/// CLI error type
#[derive(Debug, thiserror::Error)]
pub enum CliError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Library error
    #[error("{0}")]
    Hyperion(#[from] crate::HyperionError),

    /// JSON input or output error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid argument
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// File not found
    #[error("File not found: {0}")]
    FileNotFound(String),
}

/// CLI result type
pub type CliResult<T> = Result<T, CliError>;

/// Timing information
#[derive(Debug, Clone, Default, Serialize)]
pub struct Timings {
    /// Model load time in milliseconds
    pub model_load_ms: f64,
    /// Generation time in milliseconds
    pub generate_ms: f64,
    /// Total time in milliseconds
    pub total_ms: f64,
}

/// Command execution result
#[derive(Debug)]
pub struct CommandResult {
    /// Whether the command succeeded
    pub success: bool,
    /// Output message
    pub message: String,
    /// Timings (if applicable)
    pub timings: Option<Timings>,
}

impl CommandResult {
    /// Create a success result
    #[must_use]
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            timings: None,
        }
    }

    /// Create a failure result
    #[must_use]
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            timings: None,
        }
    }

    /// Add timings to result
    #[must_use]
    pub fn with_timings(mut self, timings: Timings) -> Self {
        self.timings = Some(timings);
        self
    }
}

/// One layer of a JSON model description
#[derive(Debug, Clone, Deserialize)]
pub struct LayerSpec {
    /// Layer kind
    pub kind: LayerKind,
    /// Input width
    pub input: usize,
    /// Output width
    pub output: usize,
    /// Activation
    #[serde(default)]
    pub activation: Activation,
    /// Row-major `[input x output]` weights
    #[serde(default)]
    pub weights: Vec<f32>,
    /// Biases
    #[serde(default)]
    pub biases: Vec<f32>,
}

/// JSON model description consumed by `pack` and `plan`
#[derive(Debug, Clone, Deserialize)]
pub struct ModelSpec {
    /// Evaluation path
    pub model_type: ModelType,
    /// Hidden width
    pub hidden_size: usize,
    /// Context window
    pub context_size: usize,
    /// Layers in evaluation order
    pub layers: Vec<LayerSpec>,
}

/// Printable summary of a container
#[derive(Debug, Clone, Serialize)]
pub struct InfoReport {
    /// Version as `major.minor`
    pub version: String,
    /// Domain
    pub domain: String,
    /// Weight quantization
    pub quantization: String,
    /// Parameter count
    pub parameter_count: u64,
    /// Capability bits
    pub capabilities: u32,
    /// Metadata length in bytes
    pub metadata_length: u32,
    /// Weights length in bytes
    pub weights_length: u64,
    /// Stored checksum
    pub checksum: u32,
    /// Model name
    pub name: String,
    /// Author
    pub author: String,
    /// Description
    pub description: String,
    /// Vocabulary size
    pub vocab_size: u32,
    /// Layer count
    pub layer_count: u32,
    /// Hidden size
    pub hidden_size: u32,
    /// Context size
    pub context_size: u32,
}

/// Output of the generate command
#[derive(Debug, Clone, Serialize)]
pub struct GenerateReport {
    /// Decoded text
    pub text: String,
    /// Timings
    pub timings: Timings,
}

/// One row of the plan command's output
#[derive(Debug, Clone, Serialize)]
pub struct PlanRow {
    /// Layer index in the description
    pub layer: usize,
    /// Layer kind
    pub kind: String,
    /// Weight count
    pub weights: usize,
    /// Chosen code width in bits
    pub bits: u32,
    /// Quantization sensitivity
    pub sensitivity: f32,
}

/// Run CLI with parsed arguments
///
/// # Errors
///
/// Returns the first I/O, library or argument error.
pub fn run(args: Args) -> CliResult<CommandResult> {
    match &args.command {
        Command::Info(a) => run_info(a, &args),
        Command::Verify(a) => run_verify(a, &args),
        Command::Generate(a) => run_generate(a, &args),
        Command::Pack(a) => run_pack(a, &args),
        Command::Plan(a) => run_plan(a, &args),
    }
}

fn require_file(path: &Path) -> CliResult<()> {
    if path.exists() {
        Ok(())
    } else {
        Err(CliError::FileNotFound(path.display().to_string()))
    }
}

fn emit(text: &str, global: &Args) -> CliResult<()> {
    if !global.quiet {
        println!("{text}");
        io::stdout().flush()?;
    }
    Ok(())
}

/// Run info command
///
/// # Errors
///
/// Missing file or a container that does not parse.
pub fn run_info(args: &InfoArgs, global: &Args) -> CliResult<CommandResult> {
    require_file(&args.model)?;
    let file = format::read(&args.model, false)?;
    let h = &file.header;
    let m = &file.metadata;
    let report = InfoReport {
        version: format!("{}.{}", h.version_major, h.version_minor),
        domain: format!("{:?}", h.domain),
        quantization: format!("{:?}", h.quantization),
        parameter_count: h.parameter_count,
        capabilities: h.capabilities.bits(),
        metadata_length: h.metadata_length,
        weights_length: h.weights_length,
        checksum: h.checksum,
        name: m.name.clone(),
        author: m.author.clone(),
        description: m.description.clone(),
        vocab_size: m.vocab_size,
        layer_count: m.layer_count(),
        hidden_size: m.hidden_size(),
        context_size: m.context_size(),
    };

    let text = if global.json {
        serde_json::to_string_pretty(&report)?
    } else {
        format!(
            "Name:          {}\n\
             Author:        {}\n\
             Version:       {}\n\
             Domain:        {}\n\
             Quantization:  {}\n\
             Parameters:    {}\n\
             Layers:        {} (hidden {}, context {})\n\
             Vocabulary:    {}\n\
             Weights:       {} bytes\n\
             Checksum:      {:#010x}",
            report.name,
            report.author,
            report.version,
            report.domain,
            report.quantization,
            report.parameter_count,
            report.layer_count,
            report.hidden_size,
            report.context_size,
            report.vocab_size,
            report.weights_length,
            report.checksum,
        )
    };
    emit(&text, global)?;
    Ok(CommandResult::success(report.name))
}

fn describe(result: &VerificationResult) -> String {
    if result.success {
        return "OK".into();
    }
    let mut problems = Vec::new();
    if result.invalid_magic {
        problems.push("invalid magic".to_string());
    }
    if result.version_mismatch {
        problems.push("unsupported version".to_string());
    }
    if result.checksum_mismatch {
        problems.push(format!(
            "checksum mismatch (stored {:#010x}, computed {:#010x})",
            result.expected_checksum, result.actual_checksum
        ));
    }
    format!("FAILED: {}", problems.join(", "))
}

/// Run verify command
///
/// # Errors
///
/// Missing file or I/O errors; a corrupt file is a failed result, not an
/// error.
pub fn run_verify(args: &VerifyArgs, global: &Args) -> CliResult<CommandResult> {
    require_file(&args.model)?;
    let result = format::verify(&args.model)?;
    let summary = describe(&result);
    let text = if global.json {
        serde_json::to_string_pretty(&result)?
    } else {
        format!("{}: {summary}", args.model.display())
    };
    emit(&text, global)?;

    Ok(if result.success {
        CommandResult::success(summary)
    } else {
        CommandResult::failure(summary)
    })
}

/// Run generate command
///
/// # Errors
///
/// Missing files, load failures and forward-pass errors.
pub fn run_generate(args: &GenerateArgs, global: &Args) -> CliResult<CommandResult> {
    let start = Instant::now();
    let mut timings = Timings::default();
    require_file(&args.model)?;
    require_file(&args.vocab)?;
    if args.heads == 0 {
        return Err(CliError::InvalidArgument("--heads must be at least 1".into()));
    }

    if global.verbose {
        eprintln!("[INFO] Loading model: {}", args.model.display());
    }
    let load_start = Instant::now();
    let tokenizer = WordTokenizer::from_vocab_file(&args.vocab)?;
    let arena = Arena::new(ArenaConfig::default().with_byte_limit(args.arena_limit));
    let mut model = format::load_model(&args.model, &tokenizer)?
        .with_config(InferenceConfig::default().with_n_heads(args.heads))
        .with_arena(&arena);
    timings.model_load_ms = load_start.elapsed().as_secs_f64() * 1000.0;

    let gen_start = Instant::now();
    let text = generate_text(&mut model, &args.prompt, &args.params())?;
    timings.generate_ms = gen_start.elapsed().as_secs_f64() * 1000.0;
    timings.total_ms = start.elapsed().as_secs_f64() * 1000.0;

    if global.verbose {
        let stats = arena.stats();
        eprintln!("[INFO] Load: {:.1}ms", timings.model_load_ms);
        eprintln!("[INFO] Generate: {:.1}ms", timings.generate_ms);
        eprintln!(
            "[INFO] Arena: peak {} bytes, hit rate {:.1}%",
            stats.peak_bytes,
            stats.hit_rate()
        );
    }

    let output = if global.json {
        serde_json::to_string_pretty(&GenerateReport {
            text: text.clone(),
            timings: timings.clone(),
        })?
    } else {
        text.clone()
    };
    emit(&output, global)?;
    Ok(CommandResult::success(text).with_timings(timings))
}

fn read_spec(path: &Path) -> CliResult<ModelSpec> {
    require_file(path)?;
    let spec: ModelSpec = serde_json::from_str(&fs::read_to_string(path)?)?;
    if spec.layers.is_empty() {
        return Err(CliError::InvalidArgument(format!(
            "{} describes no layers",
            path.display()
        )));
    }
    Ok(spec)
}

/// Widths per layer; weightless layers get `None`
fn plan_widths(spec: &ModelSpec, bits: BitsArg, budget: f32) -> (Vec<Option<BitWidth>>, Vec<PlanRow>) {
    let weighted: Vec<(usize, &[f32])> = spec
        .layers
        .iter()
        .enumerate()
        .filter(|(_, l)| !l.weights.is_empty())
        .map(|(i, l)| (i, l.weights.as_slice()))
        .collect();

    let mut widths = vec![None; spec.layers.len()];
    let mut rows = Vec::with_capacity(weighted.len());
    let fixed = match bits {
        BitsArg::Four => Some(BitWidth::B4),
        BitsArg::Eight => Some(BitWidth::B8),
        BitsArg::Auto => None,
    };

    let config = PlannerConfig {
        default_bit_width: fixed,
        memory_budget: budget,
        auto_assign: fixed.is_none(),
        ..PlannerConfig::default()
    };
    let mut planner = PrecisionPlanner::new(config);
    let layers: Vec<&[f32]> = weighted.iter().map(|(_, w)| *w).collect();
    let plans = planner.plan(&layers, None);

    for ((index, weights), plan) in weighted.iter().zip(plans) {
        widths[*index] = Some(plan.bit_width);
        rows.push(PlanRow {
            layer: *index,
            kind: spec.layers[*index].kind.to_string(),
            weights: weights.len(),
            bits: plan.bit_width.bits(),
            sensitivity: plan.sensitivity,
        });
    }
    (widths, rows)
}

/// Run pack command
///
/// # Errors
///
/// Missing or malformed input, layer size mismatches and write failures.
pub fn run_pack(args: &PackArgs, global: &Args) -> CliResult<CommandResult> {
    let spec = read_spec(&args.input)?;
    require_file(&args.vocab)?;
    let tokenizer = WordTokenizer::from_vocab_file(&args.vocab)?;
    let (widths, _) = plan_widths(&spec, args.bits, args.budget);

    let mut model = Model::new(spec.model_type, spec.hidden_size, spec.context_size, &tokenizer)?;
    for (layer, width) in spec.layers.iter().zip(&widths) {
        let weights = match width {
            Some(bw) => encode_range(&layer.weights, *bw)?,
            None => QuantizedBuffer::empty(BitWidth::B4),
        };
        model.push_layer(Layer::new(
            layer.kind,
            layer.input,
            layer.output,
            layer.activation,
            weights,
            layer.biases.clone(),
        )?);
    }

    let output_width = model.layers().last().map_or(0, Layer::output_size);
    if output_width != tokenizer.vocab_size() {
        return Err(CliError::InvalidArgument(format!(
            "last layer produces {output_width} logits but the vocabulary has {} tokens",
            tokenizer.vocab_size()
        )));
    }

    let metadata = ModelMetadata {
        name: args.name.clone(),
        author: args.author.clone(),
        description: args.description.clone(),
        ..ModelMetadata::default()
    };
    let header = format::save_model(&args.output, &model, &metadata)?;

    let summary = format!(
        "{}: {} layers, {} parameters, {:?}, {} weight bytes",
        args.output.display(),
        model.layers().len(),
        header.parameter_count,
        header.quantization,
        header.weights_length
    );
    emit(&summary, global)?;
    Ok(CommandResult::success(summary))
}

/// Run plan command
///
/// # Errors
///
/// Missing or malformed input.
pub fn run_plan(args: &PlanArgs, global: &Args) -> CliResult<CommandResult> {
    let spec = read_spec(&args.input)?;
    let (_, rows) = plan_widths(&spec, BitsArg::Auto, args.budget);

    let text = if global.json {
        serde_json::to_string_pretty(&rows)?
    } else {
        let mut lines = vec![format!(
            "{:>5}  {:<10} {:>8} {:>5} {:>12}",
            "layer", "kind", "weights", "bits", "sensitivity"
        )];
        lines.extend(rows.iter().map(|r| {
            format!(
                "{:>5}  {:<10} {:>8} {:>5} {:>12.6}",
                r.layer, r.kind, r.weights, r.bits, r.sensitivity
            )
        }));
        lines.join("\n")
    };
    emit(&text, global)?;
    Ok(CommandResult::success(format!("{} layers planned", rows.len())))
}
