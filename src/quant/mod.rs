//! Multi-scheme quantization codec
//!
//! Converts `f32` samples to packed 1/2/3/4/8/16-bit codes and back.
//!
//! # Schemes
//!
//! | Scheme        | Codes                      | Decode                                  |
//! |---------------|----------------------------|-----------------------------------------|
//! | Asymmetric    | `round(x/s) + zp`, clipped | `s * (q - zp) + offset`                 |
//! | Symmetric     | `round(x/s) + 2^(b-1)`     | `s * (q - zp)`                          |
//! | Logarithmic   | sign bit 7, index 0..127   | `±2^(offset + idx * s)`                 |
//! | Binary        | 1 bit, set for `x >= 0`    | `±s`                                    |
//! | Ternary       | 2 bits, {0, +1, -1}        | `{0, s, -s}`                            |
//!
//! Asymmetric encoding clips min/max to the 1st/99th percentile before
//! deriving the scale. Buffers produced from an explicit min/max range
//! (packed model layers, quantized CSR values) use `zp = 0` and carry the
//! range floor in `offset`.
//!
//! # Example
//!
//! ```rust,ignore
//! use hyperion::quant::{encode, decode, BitWidth, Scheme};
//!
//! let buf = encode(&weights, BitWidth::B4, Scheme::Asymmetric)?;
//! let approx = decode(&buf);
//! ```

pub mod packing;
pub mod planner;
pub mod stats;

pub use packing::PackedCodes;
pub use planner::{select_bit_widths, LayerPlan, PlannerConfig, PrecisionPlanner, RunningStats};
pub use stats::{calibrate, QuantStats};

use std::fmt;

use crate::error::{HyperionError, HyperionResult};
use crate::simd;

/// Epsilon added to magnitudes before taking log2
pub const LOG_EPSILON: f32 = 1e-8;

/// Percentile clipped from each tail by asymmetric encoding
pub const CLIP_PERCENTILE: f32 = 1.0;

/// Sign flag for logarithmic codes
const LOG_SIGN_BIT: u32 = 0x80;

/// Supported code widths
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum BitWidth {
    /// 1 bit (binary)
    B1 = 1,
    /// 2 bits
    B2 = 2,
    /// 3 bits
    B3 = 3,
    /// 4 bits, two codes per byte
    B4 = 4,
    /// 8 bits, one code per byte
    B8 = 8,
    /// 16 bits, little-endian
    B16 = 16,
}

impl BitWidth {
    /// All widths from narrowest to widest
    pub const ALL: [Self; 6] = [Self::B1, Self::B2, Self::B3, Self::B4, Self::B8, Self::B16];

    /// Bits per code
    #[must_use]
    pub const fn bits(self) -> u32 {
        self as u32
    }

    /// Number of representable levels (`2^bits`)
    #[must_use]
    pub const fn levels(self) -> u32 {
        1 << self.bits()
    }

    /// Bytes needed to hold `count` codes
    #[must_use]
    pub const fn packed_len(self, count: usize) -> usize {
        packing::packed_len(count, self.bits())
    }

    /// Next narrower tier used by the precision planner (8 → 4 → 3 → 2)
    #[must_use]
    pub const fn downgrade(self) -> Option<Self> {
        match self {
            Self::B16 => Some(Self::B8),
            Self::B8 => Some(Self::B4),
            Self::B4 => Some(Self::B3),
            Self::B3 => Some(Self::B2),
            Self::B2 | Self::B1 => None,
        }
    }
}

impl TryFrom<u32> for BitWidth {
    type Error = HyperionError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::B1),
            2 => Ok(Self::B2),
            3 => Ok(Self::B3),
            4 => Ok(Self::B4),
            8 => Ok(Self::B8),
            16 => Ok(Self::B16),
            other => Err(HyperionError::Quantization(format!(
                "unsupported bit width: {other}"
            ))),
        }
    }
}

impl fmt::Display for BitWidth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-bit", self.bits())
    }
}

/// Quantization scheme
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Scheme {
    /// Affine with percentile-clipped range
    Asymmetric,
    /// Zero-centred, biased unsigned storage
    Symmetric,
    /// Sign plus log2-magnitude index
    Logarithmic,
    /// Sign bit only, scale = mean |x|
    Binary,
    /// {-1, 0, +1} against a magnitude threshold
    Ternary {
        /// Samples with `|x| <= threshold` become 0
        threshold: f32,
    },
}

impl Scheme {
    /// Bits actually stored per element for a requested width
    #[must_use]
    pub const fn stored_bits(self, width: BitWidth) -> u32 {
        match self {
            Self::Logarithmic => 8,
            Self::Binary => 1,
            Self::Ternary { .. } => 2,
            Self::Asymmetric | Self::Symmetric => width.bits(),
        }
    }

    fn check_width(self, width: BitWidth) -> HyperionResult<()> {
        let ok = match self {
            Self::Asymmetric => true,
            Self::Symmetric => width != BitWidth::B1,
            Self::Logarithmic => matches!(
                width,
                BitWidth::B2 | BitWidth::B3 | BitWidth::B4 | BitWidth::B8
            ),
            Self::Binary => width == BitWidth::B1,
            Self::Ternary { .. } => width == BitWidth::B2,
        };
        if ok {
            Ok(())
        } else {
            Err(HyperionError::Quantization(format!(
                "{width} is not supported by the {self:?} scheme"
            )))
        }
    }
}

/// Per-layer quantization parameters
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LayerQuantParams {
    /// Scale (step for logarithmic)
    pub scale: f32,
    /// Zero point
    pub zero_point: i32,
    /// Code width
    pub bit_width: BitWidth,
    /// Minimum exponent for logarithmic buffers, 0 otherwise
    pub log_offset: f32,
}

/// Packed quantized samples plus everything needed to decode them
#[derive(Debug, Clone, PartialEq)]
pub struct QuantizedBuffer {
    bit_width: BitWidth,
    scheme: Scheme,
    scale: f32,
    zero_point: i32,
    offset: f32,
    codes: PackedCodes,
}

impl QuantizedBuffer {
    /// Assemble a buffer from already-packed bytes
    ///
    /// # Errors
    ///
    /// Fails when the width is invalid for the scheme, or `bytes` has the
    /// wrong length for `element_count` elements.
    pub fn from_raw_parts(
        bit_width: BitWidth,
        scheme: Scheme,
        scale: f32,
        zero_point: i32,
        offset: f32,
        bytes: Vec<u8>,
        element_count: usize,
    ) -> HyperionResult<Self> {
        scheme.check_width(bit_width)?;
        let codes = PackedCodes::from_bytes(scheme.stored_bits(bit_width), element_count, bytes)?;
        Ok(Self {
            bit_width,
            scheme,
            scale,
            zero_point,
            offset,
            codes,
        })
    }

    /// A zero-element buffer, for layers that carry no weights
    #[must_use]
    pub fn empty(bit_width: BitWidth) -> Self {
        Self {
            bit_width,
            scheme: Scheme::Asymmetric,
            scale: 1.0,
            zero_point: 0,
            offset: 0.0,
            codes: PackedCodes::empty(bit_width.bits()),
        }
    }

    /// Requested code width
    #[must_use]
    pub const fn bit_width(&self) -> BitWidth {
        self.bit_width
    }

    /// Scheme
    #[must_use]
    pub const fn scheme(&self) -> Scheme {
        self.scheme
    }

    /// Scale (step for logarithmic)
    #[must_use]
    pub const fn scale(&self) -> f32 {
        self.scale
    }

    /// Zero point
    #[must_use]
    pub const fn zero_point(&self) -> i32 {
        self.zero_point
    }

    /// Additive offset (range floor, or minimum exponent for logarithmic)
    #[must_use]
    pub const fn offset(&self) -> f32 {
        self.offset
    }

    /// Number of encoded elements
    #[must_use]
    pub const fn len(&self) -> usize {
        self.codes.len()
    }

    /// Check if empty
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.codes.is_empty()
    }

    /// Packed bytes
    #[must_use]
    pub fn packed_bytes(&self) -> &[u8] {
        self.codes.as_bytes()
    }

    /// Raw code at `index`
    #[must_use]
    pub fn code(&self, index: usize) -> Option<u32> {
        self.codes.get(index)
    }

    /// Parameters in the per-layer form
    #[must_use]
    pub fn params(&self) -> LayerQuantParams {
        LayerQuantParams {
            scale: self.scale,
            zero_point: self.zero_point,
            bit_width: self.bit_width,
            log_offset: if self.scheme == Scheme::Logarithmic {
                self.offset
            } else {
                0.0
            },
        }
    }

    /// Dequantize a single code
    #[must_use]
    pub fn decode_code(&self, code: u32) -> f32 {
        match self.scheme {
            Scheme::Asymmetric | Scheme::Symmetric => {
                self.scale * (code as i64 - i64::from(self.zero_point)) as f32 + self.offset
            }
            Scheme::Logarithmic => {
                let sign = if code & LOG_SIGN_BIT != 0 { -1.0 } else { 1.0 };
                let index = (code & !LOG_SIGN_BIT) as f32;
                sign * self.scale.mul_add(index, self.offset).exp2()
            }
            Scheme::Binary => {
                if code != 0 {
                    self.scale
                } else {
                    -self.scale
                }
            }
            Scheme::Ternary { .. } => match code {
                1 => self.scale,
                2 => -self.scale,
                _ => 0.0,
            },
        }
    }

    /// Dequantize element `index`
    #[must_use]
    pub fn value(&self, index: usize) -> Option<f32> {
        self.codes.get(index).map(|c| self.decode_code(c))
    }

    /// Dequantize into a caller-provided slice
    ///
    /// # Errors
    ///
    /// Returns a dimension error if `out.len() != self.len()`.
    pub fn decode_into(&self, out: &mut [f32]) -> HyperionResult<()> {
        if out.len() != self.len() {
            return Err(HyperionError::dimension(
                "decode output length",
                self.len(),
                out.len(),
            ));
        }
        for (o, code) in out.iter_mut().zip(self.codes.iter()) {
            *o = self.decode_code(code);
        }
        Ok(())
    }
}

// ============================================================================
// Encoding
// ============================================================================

/// Encode `samples` with the given width and scheme
///
/// # Errors
///
/// Returns a quantization error for empty input or a width the scheme does
/// not support.
pub fn encode(samples: &[f32], bit_width: BitWidth, scheme: Scheme) -> HyperionResult<QuantizedBuffer> {
    if samples.is_empty() {
        return Err(HyperionError::Quantization(
            "cannot quantize an empty input".into(),
        ));
    }
    scheme.check_width(bit_width)?;
    trace_event!(
        elements = samples.len(),
        bits = bit_width.bits(),
        "quantize"
    );

    match scheme {
        Scheme::Asymmetric => encode_asymmetric(samples, bit_width),
        Scheme::Symmetric => encode_symmetric(samples, bit_width),
        Scheme::Logarithmic => encode_log(samples, bit_width),
        Scheme::Binary => encode_binary(samples),
        Scheme::Ternary { threshold } => encode_ternary(samples, threshold),
    }
}

/// Decode a buffer back to `f32`
#[must_use]
pub fn decode(buffer: &QuantizedBuffer) -> Vec<f32> {
    buffer.codes.iter().map(|c| buffer.decode_code(c)).collect()
}

fn non_empty(samples: &[f32]) -> HyperionResult<()> {
    if samples.is_empty() {
        Err(HyperionError::Quantization(
            "cannot quantize an empty input".into(),
        ))
    } else {
        Ok(())
    }
}

/// Min/max after clipping `percentile` percent from each tail
pub(crate) fn clipped_min_max(samples: &[f32], percentile: f32) -> (f32, f32) {
    let mut sorted = samples.to_vec();
    sorted.sort_by(f32::total_cmp);

    let n = sorted.len();
    let mut low = (percentile * n as f32 / 100.0) as usize;
    let mut high = ((100.0 - percentile) * n as f32 / 100.0) as usize;
    if low >= n {
        low = 0;
    }
    if high >= n {
        high = n - 1;
    }
    (sorted[low], sorted[high])
}

fn degenerate(samples: &[f32], bit_width: BitWidth, value: f32) -> HyperionResult<QuantizedBuffer> {
    Ok(QuantizedBuffer {
        bit_width,
        scheme: Scheme::Asymmetric,
        scale: 1.0,
        zero_point: 0,
        offset: value,
        codes: PackedCodes::zeroed(bit_width.bits(), samples.len())?,
    })
}

/// Asymmetric affine encoding with 1st/99th percentile clipping
///
/// # Errors
///
/// Fails on empty input.
pub fn encode_asymmetric(samples: &[f32], bit_width: BitWidth) -> HyperionResult<QuantizedBuffer> {
    non_empty(samples)?;
    let (min, max) = clipped_min_max(samples, CLIP_PERCENTILE);
    let range = max - min;
    if range <= 0.0 || !range.is_finite() {
        return degenerate(samples, bit_width, min);
    }

    let top = i64::from(bit_width.levels() - 1);
    let scale = range / top as f32;
    let zero_point = ((-min / scale).round() as i64).clamp(0, top);

    let codes = PackedCodes::from_codes(
        bit_width.bits(),
        samples.len(),
        samples
            .iter()
            .map(|&x| ((x / scale).round() as i64 + zero_point).clamp(0, top) as u32),
    )?;

    Ok(QuantizedBuffer {
        bit_width,
        scheme: Scheme::Asymmetric,
        scale,
        zero_point: zero_point as i32,
        offset: 0.0,
        codes,
    })
}

/// Affine encoding over the full min/max range with the floor as offset
///
/// `value = code * scale + min`. No clipping; used where every stored value
/// must stay inside the representable range.
///
/// # Errors
///
/// Fails on empty input.
pub fn encode_range(samples: &[f32], bit_width: BitWidth) -> HyperionResult<QuantizedBuffer> {
    non_empty(samples)?;
    let min = samples.iter().copied().fold(f32::INFINITY, f32::min);
    let max = samples.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let range = max - min;
    if range <= 0.0 || !range.is_finite() {
        return degenerate(samples, bit_width, min);
    }

    let top = (bit_width.levels() - 1) as f32;
    let scale = range / top;
    let codes = PackedCodes::from_codes(
        bit_width.bits(),
        samples.len(),
        samples
            .iter()
            .map(|&x| ((x - min) / scale).clamp(0.0, top).round() as u32),
    )?;

    Ok(QuantizedBuffer {
        bit_width,
        scheme: Scheme::Asymmetric,
        scale,
        zero_point: 0,
        offset: min,
        codes,
    })
}

/// Symmetric encoding around zero
///
/// # Errors
///
/// Fails on empty input or 1-bit width.
pub fn encode_symmetric(samples: &[f32], bit_width: BitWidth) -> HyperionResult<QuantizedBuffer> {
    non_empty(samples)?;
    Scheme::Symmetric.check_width(bit_width)?;

    let bias = 1i64 << (bit_width.bits() - 1);
    let max_level = bias - 1;
    let max_abs = samples.iter().fold(0.0f32, |m, &x| m.max(x.abs()));

    if max_abs < LOG_EPSILON {
        let codes = PackedCodes::from_codes(
            bit_width.bits(),
            samples.len(),
            std::iter::repeat(bias as u32).take(samples.len()),
        )?;
        return Ok(QuantizedBuffer {
            bit_width,
            scheme: Scheme::Symmetric,
            scale: 1.0,
            zero_point: bias as i32,
            offset: 0.0,
            codes,
        });
    }

    let scale = max_abs / max_level as f32;
    let codes = PackedCodes::from_codes(
        bit_width.bits(),
        samples.len(),
        samples.iter().map(|&x| {
            let q = ((x / scale).round() as i64).clamp(-max_level - 1, max_level);
            (q + bias) as u32
        }),
    )?;

    Ok(QuantizedBuffer {
        bit_width,
        scheme: Scheme::Symmetric,
        scale,
        zero_point: bias as i32,
        offset: 0.0,
        codes,
    })
}

/// Logarithmic encoding: sign in bit 7, log2-magnitude index below it
///
/// # Errors
///
/// Fails on empty input or widths outside 2..=8.
pub fn encode_log(samples: &[f32], bit_width: BitWidth) -> HyperionResult<QuantizedBuffer> {
    non_empty(samples)?;
    Scheme::Logarithmic.check_width(bit_width)?;

    let exponent = |x: f32| (x.abs() + LOG_EPSILON).log2();
    let (min_exp, max_exp) = samples
        .iter()
        .fold((f32::MAX, f32::MIN), |(lo, hi), &x| {
            let e = exponent(x);
            (lo.min(e), hi.max(e))
        });

    let levels = bit_width.levels().min(LOG_SIGN_BIT);
    let range = (max_exp - min_exp).max(LOG_EPSILON);
    let step = range / (levels - 1) as f32;
    let top = i64::from(levels - 1);

    let codes = PackedCodes::from_codes(
        8,
        samples.len(),
        samples.iter().map(|&x| {
            let index = (((exponent(x) - min_exp) / step).round() as i64).clamp(0, top) as u32;
            if x < 0.0 {
                index | LOG_SIGN_BIT
            } else {
                index
            }
        }),
    )?;

    Ok(QuantizedBuffer {
        bit_width,
        scheme: Scheme::Logarithmic,
        scale: step,
        zero_point: 0,
        offset: min_exp,
        codes,
    })
}

/// Binary encoding: one sign bit per sample, scale = mean |x|
///
/// # Errors
///
/// Fails on empty input.
pub fn encode_binary(samples: &[f32]) -> HyperionResult<QuantizedBuffer> {
    non_empty(samples)?;
    let scale = samples.iter().map(|x| x.abs()).sum::<f32>() / samples.len() as f32;
    let codes = PackedCodes::from_codes(
        1,
        samples.len(),
        samples.iter().map(|&x| u32::from(x >= 0.0)),
    )?;

    Ok(QuantizedBuffer {
        bit_width: BitWidth::B1,
        scheme: Scheme::Binary,
        scale,
        zero_point: 0,
        offset: 0.0,
        codes,
    })
}

/// Ternary encoding against a magnitude threshold
///
/// Scale is the mean magnitude of the samples that survive the threshold,
/// or 1.0 when none do.
///
/// # Errors
///
/// Fails on empty input.
pub fn encode_ternary(samples: &[f32], threshold: f32) -> HyperionResult<QuantizedBuffer> {
    non_empty(samples)?;
    let (sum, count) = samples
        .iter()
        .filter(|x| x.abs() > threshold)
        .fold((0.0f32, 0usize), |(s, c), x| (s + x.abs(), c + 1));
    let scale = if count > 0 { sum / count as f32 } else { 1.0 };

    let codes = PackedCodes::from_codes(
        2,
        samples.len(),
        samples.iter().map(|&x| {
            if x > threshold {
                1
            } else if x < -threshold {
                2
            } else {
                0
            }
        }),
    )?;

    Ok(QuantizedBuffer {
        bit_width: BitWidth::B2,
        scheme: Scheme::Ternary { threshold },
        scale,
        zero_point: 0,
        offset: 0.0,
        codes,
    })
}

// ============================================================================
// Fused / Compound Operations
// ============================================================================

/// Quantize then immediately dequantize, returning floats
///
/// Simulates quantization noise without packing.
///
/// # Errors
///
/// Fails on empty input or a non-positive scale.
pub fn fake_quantize(
    samples: &[f32],
    bit_width: BitWidth,
    scale: f32,
    zero_point: i32,
) -> HyperionResult<Vec<f32>> {
    non_empty(samples)?;
    if !(scale > 0.0 && scale.is_finite()) {
        return Err(HyperionError::Quantization(format!(
            "fake quantization needs a positive scale, got {scale}"
        )));
    }

    let top = i64::from(bit_width.levels() - 1);
    let zp = i64::from(zero_point);
    Ok(samples
        .iter()
        .map(|&x| {
            let q = ((x / scale).round() as i64 + zp).clamp(0, top);
            scale * (q - zp) as f32
        })
        .collect())
}

/// Multiply two quantized matrices and requantize the product at 8 bits
///
/// `a` is `m x k`, `b` is `k x n`, both row-major.
///
/// # Errors
///
/// Returns a dimension error when the buffers do not match the shapes.
pub fn quantized_matmul(
    a: &QuantizedBuffer,
    b: &QuantizedBuffer,
    m: usize,
    n: usize,
    k: usize,
) -> HyperionResult<QuantizedBuffer> {
    if m == 0 || n == 0 || k == 0 {
        return Err(HyperionError::Dimension(format!(
            "matmul dimensions must be non-zero: {m}x{k} @ {k}x{n}"
        )));
    }
    if a.len() != m * k {
        return Err(HyperionError::dimension("left operand", m * k, a.len()));
    }
    if b.len() != k * n {
        return Err(HyperionError::dimension("right operand", k * n, b.len()));
    }

    let product = simd::matmul(&decode(a), &decode(b), m, k, n);
    encode_asymmetric(&product, BitWidth::B8)
}
