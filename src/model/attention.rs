//! Causal multi-head self-attention
//!
//! Attention(Q, K, V) = softmax(QK^T / sqrt(d_head) + mask) V
//!
//! Q, K and V are projections of the layer input with `[in x out]`
//! row-major weights, split into `n_heads` contiguous slices of the `out`
//! dimension. Head outputs are concatenated back into `out` columns. There
//! is no output projection.

use crate::error::{HyperionError, HyperionResult};
use crate::simd;

/// Projection weights for one attention layer
#[derive(Debug, Clone, Copy)]
pub enum Projections<'w> {
    /// Separate query, key and value matrices
    Separate {
        /// Query weights
        query: &'w [f32],
        /// Key weights
        key: &'w [f32],
        /// Value weights
        value: &'w [f32],
    },
    /// One matrix shared by Q, K and V
    Shared(&'w [f32]),
    /// Q = K = V = X
    Identity,
}

impl<'w> Projections<'w> {
    /// Interpret a dequantized weight buffer
    ///
    /// `3 * in * out` elements split into Wq, Wk, Wv; `in * out` is a shared
    /// projection; no weights with `in == out` is the identity.
    ///
    /// # Errors
    ///
    /// Dimension error for any other size.
    pub fn from_weights(weights: &'w [f32], d_in: usize, d_out: usize) -> HyperionResult<Self> {
        let square = d_in * d_out;
        match weights.len() {
            0 if d_in == d_out => Ok(Self::Identity),
            n if n == square => Ok(Self::Shared(weights)),
            n if n == 3 * square => Ok(Self::Separate {
                query: &weights[..square],
                key: &weights[square..2 * square],
                value: &weights[2 * square..],
            }),
            n => Err(HyperionError::Dimension(format!(
                "attention weights: expected {square} or {} elements for {d_in}x{d_out}, got {n}",
                3 * square
            ))),
        }
    }
}

/// Additive causal mask; position `i` sees positions `<= i`
#[must_use]
pub fn causal_mask(seq_len: usize) -> Vec<f32> {
    let mut mask = vec![0.0_f32; seq_len * seq_len];
    for i in 0..seq_len {
        for j in (i + 1)..seq_len {
            mask[i * seq_len + j] = f32::NEG_INFINITY;
        }
    }
    mask
}

fn project(x: &[f32], w: &[f32], seq_len: usize, d_in: usize, d_out: usize) -> Vec<f32> {
    let mut out = vec![0.0; seq_len * d_out];
    for (row, y) in x.chunks_exact(d_in).zip(out.chunks_exact_mut(d_out)) {
        simd::vecmat_into(row, w, d_in, d_out, y);
    }
    out
}

/// Causal self-attention over `seq_len` rows of `d_in` features
///
/// Returns `seq_len x d_out`.
///
/// # Errors
///
/// Dimension error when `x` is not `seq_len * d_in` long, `n_heads` is zero
/// or does not divide `d_out`.
pub fn causal_self_attention(
    x: &[f32],
    seq_len: usize,
    d_in: usize,
    d_out: usize,
    projections: Projections<'_>,
    n_heads: usize,
) -> HyperionResult<Vec<f32>> {
    if x.len() != seq_len * d_in {
        return Err(HyperionError::dimension("attention input", seq_len * d_in, x.len()));
    }
    if n_heads == 0 || d_out % n_heads != 0 {
        return Err(HyperionError::Dimension(format!(
            "{n_heads} heads do not divide width {d_out}"
        )));
    }

    let (q, k, v) = match projections {
        Projections::Separate { query, key, value } => (
            project(x, query, seq_len, d_in, d_out),
            project(x, key, seq_len, d_in, d_out),
            project(x, value, seq_len, d_in, d_out),
        ),
        Projections::Shared(w) => {
            let p = project(x, w, seq_len, d_in, d_out);
            (p.clone(), p.clone(), p)
        }
        Projections::Identity => (x.to_vec(), x.to_vec(), x.to_vec()),
    };

    let d_head = d_out / n_heads;
    let scale = 1.0 / (d_head as f32).sqrt();
    let mask = causal_mask(seq_len);
    let mut out = vec![0.0_f32; seq_len * d_out];
    let mut scores = vec![0.0_f32; seq_len];

    for h in 0..n_heads {
        let cols = h * d_head..(h + 1) * d_head;
        for i in 0..seq_len {
            let qi = &q[i * d_out..(i + 1) * d_out][cols.clone()];
            for (j, s) in scores.iter_mut().enumerate() {
                let kj = &k[j * d_out..(j + 1) * d_out][cols.clone()];
                *s = simd::dot(qi, kj).mul_add(scale, mask[i * seq_len + j]);
            }
            simd::softmax_in_place(&mut scores);

            let oi = &mut out[i * d_out..(i + 1) * d_out][cols.clone()];
            for (j, &p) in scores.iter().enumerate().take(i + 1) {
                let vj = &v[j * d_out..(j + 1) * d_out][cols.clone()];
                for (o, &vv) in oi.iter_mut().zip(vj) {
                    *o = p.mul_add(vv, *o);
                }
            }
        }
    }

    Ok(out)
}
