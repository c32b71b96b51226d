//! Mixed-precision assignment
//!
//! Picks a per-layer bit width from a magnitude-based sensitivity score,
//! then greedily narrows the least sensitive layers until the plan fits a
//! memory budget. The result is a heuristic, not a globally optimal
//! assignment.

use super::{encode, encode_asymmetric, BitWidth, LayerQuantParams, QuantizedBuffer, Scheme};
use crate::error::{HyperionError, HyperionResult};

/// Activation variance above which a layer keeps at least 4 bits
pub const HIGH_VARIANCE: f32 = 0.5;

/// Planner configuration
#[derive(Debug, Clone, PartialEq)]
pub struct PlannerConfig {
    /// Scheme used by [`PrecisionPlanner::quantize_layers`]
    pub scheme: Scheme,
    /// Fixed width for every layer, `None` for mixed precision
    pub default_bit_width: Option<BitWidth>,
    /// Fraction of the fp32 footprint the plan may use
    pub memory_budget: f32,
    /// Tolerated accuracy loss; recorded for callers
    pub accuracy_threshold: f32,
    /// Assign widths automatically from sensitivity
    pub auto_assign: bool,
    /// Momentum for running activation statistics
    pub momentum: f32,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            scheme: Scheme::Asymmetric,
            default_bit_width: Some(BitWidth::B8),
            memory_budget: 0.25,
            accuracy_threshold: 0.01,
            auto_assign: true,
            momentum: 0.9,
        }
    }
}

/// Planned precision for one layer
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LayerPlan {
    /// Assigned width
    pub bit_width: BitWidth,
    /// Mean absolute weight
    pub sensitivity: f32,
    /// Packed size of the layer's codes at `bit_width`
    pub bytes: usize,
    /// Accuracy threshold the plan was made under
    pub accuracy_threshold: f32,
}

fn packed_bytes(width: BitWidth, len: usize) -> usize {
    (len * width.bits() as usize).div_ceil(8)
}

/// Running activation statistics for one layer
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct RunningStats {
    /// Running mean
    pub mean: f32,
    /// Running variance
    pub variance: f32,
    observed: bool,
}

/// Per-layer precision planner
#[derive(Debug, Clone, Default)]
pub struct PrecisionPlanner {
    config: PlannerConfig,
    plans: Vec<LayerPlan>,
    running: Vec<RunningStats>,
    original_bytes: usize,
    quantized_bytes: usize,
}

/// Mean absolute value; 0 for an empty layer
#[must_use]
pub fn sensitivity(weights: &[f32]) -> f32 {
    if weights.is_empty() {
        return 0.0;
    }
    weights.iter().map(|w| w.abs()).sum::<f32>() / weights.len() as f32
}

fn tier(sensitivity: f32) -> BitWidth {
    if sensitivity > 0.75 {
        BitWidth::B8
    } else if sensitivity > 0.4 {
        BitWidth::B4
    } else if sensitivity > 0.2 {
        BitWidth::B3
    } else {
        BitWidth::B2
    }
}

/// Assign a width to every layer
///
/// Widths start from sensitivity tiers (`> 0.75` → 8, `> 0.4` → 4,
/// `> 0.2` → 3, else 2). While the total exceeds `budget * Σ 32·len` bits,
/// the least sensitive layer still above 2 bits is narrowed one step. A
/// budget that works out below one bit falls back to half the fp32 size;
/// a budget `<= 0` skips narrowing. When calibration samples are given and
/// their mean square exceeds [`HIGH_VARIANCE`], every layer is raised to at
/// least 4 bits afterwards.
///
/// `accuracy_threshold` is stored on every plan entry; it does not
/// influence the assignment.
#[must_use]
pub fn select_bit_widths(
    layers: &[&[f32]],
    memory_budget: f32,
    accuracy_threshold: f32,
    calibration: Option<&[&[f32]]>,
) -> Vec<LayerPlan> {
    let mut plans: Vec<LayerPlan> = layers
        .iter()
        .map(|w| {
            let s = sensitivity(w);
            LayerPlan {
                bit_width: tier(s),
                sensitivity: s,
                bytes: 0,
                accuracy_threshold,
            }
        })
        .collect();

    if memory_budget > 0.0 {
        let full_bits: f64 = layers.iter().map(|w| 32.0 * w.len() as f64).sum();
        let mut target = f64::from(memory_budget) * full_bits;
        if target < 1.0 {
            target = full_bits / 2.0;
        }

        let used = |plans: &[LayerPlan]| -> f64 {
            plans
                .iter()
                .zip(layers)
                .map(|(p, w)| f64::from(p.bit_width.bits()) * w.len() as f64)
                .sum()
        };

        while used(&plans) > target {
            let candidate = plans
                .iter()
                .enumerate()
                .filter(|(_, p)| p.bit_width.downgrade().is_some())
                .min_by(|(_, a), (_, b)| a.sensitivity.total_cmp(&b.sensitivity))
                .map(|(i, _)| i);
            let Some(i) = candidate else { break };
            if let Some(narrower) = plans[i].bit_width.downgrade() {
                plans[i].bit_width = narrower;
            }
        }
    }

    if let Some(samples) = calibration {
        let (sum_sq, count) = samples
            .iter()
            .flat_map(|s| s.iter())
            .fold((0.0f64, 0usize), |(sq, c), &x| {
                (sq + f64::from(x) * f64::from(x), c + 1)
            });
        if count > 0 && (sum_sq / count as f64) > f64::from(HIGH_VARIANCE) {
            for plan in &mut plans {
                if plan.bit_width < BitWidth::B4 {
                    plan.bit_width = BitWidth::B4;
                }
            }
        }
    }

    for (plan, w) in plans.iter_mut().zip(layers) {
        plan.bytes = packed_bytes(plan.bit_width, w.len());
    }
    trace_event!(layers = plans.len(), "precision plan selected");
    plans
}

impl PrecisionPlanner {
    /// Create a planner
    #[must_use]
    pub fn new(config: PlannerConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    /// Configuration
    #[must_use]
    pub const fn config(&self) -> &PlannerConfig {
        &self.config
    }

    /// Current plan, one entry per layer
    #[must_use]
    pub fn plans(&self) -> &[LayerPlan] {
        &self.plans
    }

    /// Recorded sensitivity of `layer`
    #[must_use]
    pub fn sensitivity(&self, layer: usize) -> Option<f32> {
        self.plans.get(layer).map(|p| p.sensitivity)
    }

    /// Running statistics of `layer`
    #[must_use]
    pub fn running_stats(&self, layer: usize) -> Option<RunningStats> {
        self.running.get(layer).copied()
    }

    /// Build the plan for `layers`
    pub fn plan(&mut self, layers: &[&[f32]], calibration: Option<&[&[f32]]>) -> &[LayerPlan] {
        self.plans = if self.config.auto_assign {
            select_bit_widths(
                layers,
                self.config.memory_budget,
                self.config.accuracy_threshold,
                calibration,
            )
        } else {
            let width = self.config.default_bit_width.unwrap_or(BitWidth::B8);
            layers
                .iter()
                .map(|w| LayerPlan {
                    bit_width: width,
                    sensitivity: sensitivity(w),
                    bytes: packed_bytes(width, w.len()),
                    accuracy_threshold: self.config.accuracy_threshold,
                })
                .collect()
        };
        &self.plans
    }

    /// Quantize every layer with its planned width
    ///
    /// Plans first when no plan of matching length exists.
    ///
    /// # Errors
    ///
    /// Propagates codec errors, e.g. for an empty layer.
    pub fn quantize_layers(
        &mut self,
        layers: &[&[f32]],
    ) -> HyperionResult<Vec<(QuantizedBuffer, LayerQuantParams)>> {
        if self.plans.len() != layers.len() {
            self.plan(layers, None);
        }

        self.original_bytes = 0;
        self.quantized_bytes = 0;
        let mut out = Vec::with_capacity(layers.len());
        for (weights, plan) in layers.iter().zip(&self.plans) {
            let buffer = match self.config.scheme {
                Scheme::Logarithmic => {
                    let width = plan.bit_width.max(BitWidth::B2).min(BitWidth::B8);
                    encode(weights, width, Scheme::Logarithmic)?
                }
                _ => encode_asymmetric(weights, plan.bit_width)?,
            };
            self.original_bytes += weights.len() * 4;
            self.quantized_bytes += buffer.packed_bytes().len();
            let params = buffer.params();
            out.push((buffer, params));
        }
        trace_event!(
            original = self.original_bytes,
            quantized = self.quantized_bytes,
            "layers quantized"
        );
        Ok(out)
    }

    /// Byte totals from the last [`quantize_layers`](Self::quantize_layers)
    #[must_use]
    pub const fn byte_totals(&self) -> (usize, usize) {
        (self.original_bytes, self.quantized_bytes)
    }

    /// Fold a batch of activations into the running statistics of `layer`
    ///
    /// # Errors
    ///
    /// Returns a quantization error for an empty batch.
    pub fn update_running_stats(&mut self, layer: usize, activations: &[f32]) -> HyperionResult<()> {
        if activations.is_empty() {
            return Err(HyperionError::Quantization(
                "empty activation batch".into(),
            ));
        }
        if self.running.len() <= layer {
            self.running.resize(layer + 1, RunningStats::default());
        }

        let n = activations.len() as f32;
        let mean = activations.iter().sum::<f32>() / n;
        let variance = activations.iter().map(|x| (x - mean) * (x - mean)).sum::<f32>() / n;

        let m = self.config.momentum;
        let stats = &mut self.running[layer];
        if stats.observed {
            stats.mean = m * stats.mean + (1.0 - m) * mean;
            stats.variance = m * stats.variance + (1.0 - m) * variance;
        } else {
            stats.mean = mean;
            stats.variance = variance;
            stats.observed = true;
        }
        Ok(())
    }

    /// Dynamic asymmetric quantization of an activation tensor
    ///
    /// # Errors
    ///
    /// Fails on empty input.
    pub fn quantize_activations(
        &self,
        activations: &[f32],
        bit_width: BitWidth,
    ) -> HyperionResult<QuantizedBuffer> {
        encode_asymmetric(activations, bit_width)
    }

    /// Estimated `(quantized_bytes, compression_ratio)` for `original_bytes`
    ///
    /// Uses the default width, or the mean planned width in mixed mode.
    #[must_use]
    pub fn memory_savings(&self, original_bytes: usize) -> (usize, f32) {
        let avg_bits = match self.config.default_bit_width {
            Some(width) => width.bits() as f32,
            None if !self.plans.is_empty() => {
                self.plans.iter().map(|p| p.bit_width.bits() as f32).sum::<f32>()
                    / self.plans.len() as f32
            }
            None => 32.0,
        };
        let quantized = (original_bytes as f32 * avg_bits / 32.0).ceil() as usize;
        (quantized, 32.0 / avg_bits)
    }
}
