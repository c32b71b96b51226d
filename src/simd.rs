//! SIMD-accelerated kernels via trueno
//!
//! Vector and matrix primitives used by the forward pass, the sparse codec
//! and the sampler. Everything here is data-parallel within one thread.
//!
//! # Operations
//!
//! - Dot product, sum, max, argmax
//! - Row-major matrix-vector and matrix-matrix products
//! - Numerically stable softmax
//! - Layer normalization
//! - Lane-chunked gather dot for CSR rows
//!
//! Results may differ from a scalar left-to-right loop by floating-point
//! summation order. Callers compare within an epsilon.

use trueno::{Matrix, Vector};

/// Lane count used by the chunked gather kernels
pub const LANES: usize = 8;

// ============================================================================
// Vector Operations
// ============================================================================

/// SIMD-accelerated dot product
#[must_use]
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len(), "dot product requires equal lengths");

    let va = Vector::from_slice(a);
    let vb = Vector::from_slice(b);
    va.dot(&vb).unwrap_or(0.0)
}

/// SIMD-accelerated sum
#[must_use]
pub fn sum(a: &[f32]) -> f32 {
    if a.is_empty() {
        return 0.0;
    }
    let va = Vector::from_slice(a);
    va.sum().unwrap_or(0.0)
}

/// Arithmetic mean, zero for an empty slice
#[must_use]
pub fn mean(a: &[f32]) -> f32 {
    if a.is_empty() {
        return 0.0;
    }
    sum(a) / a.len() as f32
}

/// SIMD-accelerated max
#[must_use]
pub fn max(a: &[f32]) -> f32 {
    if a.is_empty() {
        return f32::NEG_INFINITY;
    }
    let va = Vector::from_slice(a);
    va.max().unwrap_or(f32::NEG_INFINITY)
}

/// Index of the first maximum element
///
/// Scalar on purpose: tie-breaking must be stable for greedy decoding.
#[must_use]
pub fn argmax(a: &[f32]) -> usize {
    let mut best = 0;
    for (i, &v) in a.iter().enumerate().skip(1) {
        if v > a[best] {
            best = i;
        }
    }
    best
}

// ============================================================================
// Matrix Operations
// ============================================================================

/// SIMD-accelerated matrix-vector multiplication
///
/// Computes y = A @ x where A is (rows x cols) and x is (cols,)
#[must_use]
pub fn matvec(a: &[f32], x: &[f32], rows: usize, cols: usize) -> Vec<f32> {
    debug_assert_eq!(a.len(), rows * cols, "A dimensions mismatch");
    debug_assert_eq!(x.len(), cols, "x dimension mismatch");

    let Ok(ma) = Matrix::from_vec(rows, cols, a.to_vec()) else {
        return vec![0.0; rows];
    };
    let vx = Vector::from_slice(x);
    ma.matvec(&vx)
        .map_or_else(|_| vec![0.0; rows], |v| v.as_slice().to_vec())
}

/// Vector-matrix product for `[in x out]` weight layout
///
/// Computes y[j] = Σ_k x[k] * w[k * out + j].
pub fn vecmat_into(x: &[f32], w: &[f32], inputs: usize, outputs: usize, y: &mut [f32]) {
    debug_assert_eq!(x.len(), inputs, "x dimension mismatch");
    debug_assert_eq!(w.len(), inputs * outputs, "W dimensions mismatch");
    debug_assert_eq!(y.len(), outputs, "y dimension mismatch");

    y.fill(0.0);
    for (k, &xk) in x.iter().enumerate() {
        if xk == 0.0 {
            continue;
        }
        let row = &w[k * outputs..(k + 1) * outputs];
        for (yj, &wkj) in y.iter_mut().zip(row) {
            *yj = xk.mul_add(wkj, *yj);
        }
    }
}

/// SIMD-accelerated matrix multiplication
///
/// Computes C = A @ B where A is (rows x inner) and B is (inner x cols)
#[must_use]
#[allow(clippy::many_single_char_names)]
pub fn matmul(a: &[f32], b: &[f32], rows: usize, inner: usize, cols: usize) -> Vec<f32> {
    debug_assert_eq!(a.len(), rows * inner, "A dimensions mismatch");
    debug_assert_eq!(b.len(), inner * cols, "B dimensions mismatch");

    let Ok(ma) = Matrix::from_vec(rows, inner, a.to_vec()) else {
        return vec![0.0; rows * cols];
    };
    let Ok(mb) = Matrix::from_vec(inner, cols, b.to_vec()) else {
        return vec![0.0; rows * cols];
    };
    ma.matmul(&mb)
        .map_or_else(|_| vec![0.0; rows * cols], |mc| mc.as_slice().to_vec())
}

// ============================================================================
// Sparse Gather
// ============================================================================

/// Dot product of a CSR row with a dense vector, accumulated in `LANES` lanes
///
/// `values[i]` multiplies `x[cols[i]]`. Column indices must be in range.
#[must_use]
pub fn gather_dot(values: &[f32], cols: &[i32], x: &[f32]) -> f32 {
    debug_assert_eq!(values.len(), cols.len());

    let mut lanes = [0.0f32; LANES];
    let mut value_chunks = values.chunks_exact(LANES);
    let mut col_chunks = cols.chunks_exact(LANES);

    for (vals, idx) in value_chunks.by_ref().zip(col_chunks.by_ref()) {
        for lane in 0..LANES {
            lanes[lane] = vals[lane].mul_add(x[idx[lane] as usize], lanes[lane]);
        }
    }

    let mut tail = 0.0f32;
    for (&v, &c) in value_chunks.remainder().iter().zip(col_chunks.remainder()) {
        tail = v.mul_add(x[c as usize], tail);
    }

    sum(&lanes) + tail
}

// ============================================================================
// Activation / Normalization
// ============================================================================

/// Numerically stable softmax in place
///
/// Subtracts the max before exponentiating. A zero sum leaves the
/// exponentials unnormalized.
pub fn softmax_in_place(x: &mut [f32]) {
    if x.is_empty() {
        return;
    }

    let max_val = max(x);
    let mut total = 0.0f32;
    for v in x.iter_mut() {
        *v = (*v - max_val).exp();
        total += *v;
    }

    if total > 0.0 {
        for v in x.iter_mut() {
            *v /= total;
        }
    }
}

/// Layer normalization of one row into `out`
///
/// LayerNorm(x) = (x - mean(x)) / sqrt(var(x) + eps) * gamma + beta.
/// Missing gamma/beta mean identity scale and zero shift.
pub fn layer_norm_into(
    x: &[f32],
    gamma: Option<&[f32]>,
    beta: Option<&[f32]>,
    eps: f32,
    out: &mut [f32],
) {
    debug_assert_eq!(x.len(), out.len(), "output dimension mismatch");

    let m = mean(x);
    let var = x.iter().map(|&v| (v - m) * (v - m)).sum::<f32>() / x.len().max(1) as f32;
    let inv_std = 1.0 / (var + eps).sqrt();

    for (i, (o, &xi)) in out.iter_mut().zip(x).enumerate() {
        let norm = (xi - m) * inv_std;
        let g = gamma.map_or(1.0, |g| g[i]);
        let b = beta.map_or(0.0, |b| b[i]);
        *o = norm.mul_add(g, b);
    }
}
