//! Sample statistics and calibration for quantization

use super::{clipped_min_max, BitWidth, CLIP_PERCENTILE};
use crate::error::{HyperionError, HyperionResult};

/// Distribution summary of a sample set
#[derive(Debug, Clone, PartialEq, Default)]
pub struct QuantStats {
    /// Minimum value
    pub min: f32,
    /// Maximum value
    pub max: f32,
    /// Mean
    pub mean: f32,
    /// Population variance, `E[x²] - E[x]²`
    pub variance: f32,
    /// 1st percentile
    pub percentile_1: f32,
    /// 99th percentile
    pub percentile_99: f32,
    /// Normalized histogram over `[min, max]`, empty when not requested
    pub histogram: Vec<f32>,
}

impl QuantStats {
    /// Compute statistics, with a `bins`-bucket histogram when `bins > 0`
    ///
    /// # Errors
    ///
    /// Returns a quantization error for empty input.
    pub fn compute(samples: &[f32], bins: usize) -> HyperionResult<Self> {
        if samples.is_empty() {
            return Err(HyperionError::Quantization(
                "cannot compute statistics of an empty input".into(),
            ));
        }

        let n = samples.len() as f64;
        let (min, max, sum, sum_sq) = samples.iter().fold(
            (f32::INFINITY, f32::NEG_INFINITY, 0.0f64, 0.0f64),
            |(lo, hi, s, sq), &x| {
                let v = f64::from(x);
                (lo.min(x), hi.max(x), s + v, sq + v * v)
            },
        );
        let mean = sum / n;
        let variance = (sum_sq / n - mean * mean).max(0.0);
        let (percentile_1, percentile_99) = clipped_min_max(samples, CLIP_PERCENTILE);

        let mut histogram = Vec::new();
        if bins > 0 {
            histogram = vec![0.0f32; bins];
            let range = max - min;
            for &x in samples {
                let bucket = if range > 0.0 {
                    (((x - min) / range) * (bins - 1) as f32) as usize
                } else {
                    0
                };
                histogram[bucket.min(bins - 1)] += 1.0;
            }
            let total = samples.len() as f32;
            for h in &mut histogram {
                *h /= total;
            }
        }

        Ok(Self {
            min,
            max,
            mean: mean as f32,
            variance: variance as f32,
            percentile_1,
            percentile_99,
            histogram,
        })
    }

    /// Value range covered by the samples
    #[must_use]
    pub fn range(&self) -> f32 {
        self.max - self.min
    }
}

/// Derive `(scale, zero_point)` from the global range of several sample sets
///
/// No percentile clipping is applied. A degenerate range gives `(1.0, 0)`.
///
/// # Errors
///
/// Returns a quantization error when every sample set is empty.
pub fn calibrate(samples: &[&[f32]], bit_width: BitWidth) -> HyperionResult<(f32, i32)> {
    let mut values = samples.iter().flat_map(|s| s.iter().copied()).peekable();
    if values.peek().is_none() {
        return Err(HyperionError::Quantization(
            "calibration needs at least one sample".into(),
        ));
    }

    let (min, max) = values.fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), x| {
        (lo.min(x), hi.max(x))
    });
    let range = max - min;
    if range <= 0.0 || !range.is_finite() {
        return Ok((1.0, 0));
    }

    let top = (bit_width.levels() - 1) as f32;
    let scale = range / top;
    let zero_point = (-min / scale).round().clamp(0.0, top) as i32;
    trace_event!(scale, zero_point, "calibrated");
    Ok((scale, zero_point))
}
