//! Compressed sparse row matrices
//!
//! [`CsrMatrix`] keeps `f32` values; [`QuantizedCsrMatrix`] stores them as
//! 4-bit codes against one global `(scale, floor)` pair and decodes inline
//! during [`QuantizedCsrMatrix::matvec`].
//!
//! Memory accounting counts value storage, `i32` column indices and `i32`
//! row pointers.

use crate::error::{HyperionError, HyperionResult};
use crate::quant::{encode_range, BitWidth, QuantizedBuffer};
use crate::simd;

fn check_shape(dense: &[f32], rows: usize, cols: usize) -> HyperionResult<()> {
    if rows == 0 || cols == 0 {
        return Err(HyperionError::Dimension(format!(
            "sparse matrix dimensions must be non-zero, got {rows}x{cols}"
        )));
    }
    if dense.len() != rows * cols {
        return Err(HyperionError::dimension(
            "dense matrix length",
            rows * cols,
            dense.len(),
        ));
    }
    Ok(())
}

/// Collect `(values, col_indices, row_ptr)` for entries with `|v| >= threshold`
fn compress(dense: &[f32], rows: usize, cols: usize, threshold: f32) -> (Vec<f32>, Vec<i32>, Vec<i32>) {
    let mut values = Vec::new();
    let mut col_indices = Vec::new();
    let mut row_ptr = Vec::with_capacity(rows + 1);
    row_ptr.push(0);

    for row in dense.chunks_exact(cols) {
        for (c, &v) in row.iter().enumerate() {
            if v.abs() >= threshold {
                values.push(v);
                col_indices.push(c as i32);
            }
        }
        row_ptr.push(values.len() as i32);
    }
    (values, col_indices, row_ptr)
}

fn row_range(row_ptr: &[i32], row: usize) -> std::ops::Range<usize> {
    row_ptr[row] as usize..row_ptr[row + 1] as usize
}

/// Sparse matrix in CSR layout
#[derive(Debug, Clone, PartialEq)]
pub struct CsrMatrix {
    rows: usize,
    cols: usize,
    values: Vec<f32>,
    col_indices: Vec<i32>,
    row_ptr: Vec<i32>,
}

impl CsrMatrix {
    /// Build from a row-major dense matrix, keeping entries with `|v| >= threshold`
    ///
    /// # Errors
    ///
    /// Dimension error for a zero dimension or `dense.len() != rows * cols`.
    pub fn from_dense(dense: &[f32], rows: usize, cols: usize, threshold: f32) -> HyperionResult<Self> {
        check_shape(dense, rows, cols)?;
        let (values, col_indices, row_ptr) = compress(dense, rows, cols, threshold);
        trace_event!(rows, cols, nnz = values.len(), "csr built");
        Ok(Self {
            rows,
            cols,
            values,
            col_indices,
            row_ptr,
        })
    }

    /// Row count
    #[must_use]
    pub const fn rows(&self) -> usize {
        self.rows
    }

    /// Column count
    #[must_use]
    pub const fn cols(&self) -> usize {
        self.cols
    }

    /// Number of stored entries
    #[must_use]
    pub fn nnz(&self) -> usize {
        self.values.len()
    }

    /// Stored values in row-major order
    #[must_use]
    pub fn values(&self) -> &[f32] {
        &self.values
    }

    /// Column index of each stored value
    #[must_use]
    pub fn col_indices(&self) -> &[i32] {
        &self.col_indices
    }

    /// Row pointers, `rows + 1` entries
    #[must_use]
    pub fn row_ptr(&self) -> &[i32] {
        &self.row_ptr
    }

    /// Expand back to a row-major dense matrix
    #[must_use]
    pub fn to_dense(&self) -> Vec<f32> {
        let mut dense = vec![0.0; self.rows * self.cols];
        for row in 0..self.rows {
            for i in row_range(&self.row_ptr, row) {
                dense[row * self.cols + self.col_indices[i] as usize] = self.values[i];
            }
        }
        dense
    }

    fn check_input(&self, x: &[f32]) -> HyperionResult<()> {
        if x.len() != self.cols {
            return Err(HyperionError::dimension("matvec input", self.cols, x.len()));
        }
        Ok(())
    }

    /// `y = A x`
    ///
    /// # Errors
    ///
    /// Dimension error if `x.len() != cols`.
    pub fn matvec(&self, x: &[f32]) -> HyperionResult<Vec<f32>> {
        self.check_input(x)?;
        Ok((0..self.rows)
            .map(|row| {
                row_range(&self.row_ptr, row)
                    .map(|i| self.values[i] * x[self.col_indices[i] as usize])
                    .sum()
            })
            .collect())
    }

    /// `y = A x` with lane-chunked accumulation
    ///
    /// Equal to [`matvec`](Self::matvec) within floating-point epsilon; the
    /// summation order differs, so results are not bit-identical.
    ///
    /// # Errors
    ///
    /// Dimension error if `x.len() != cols`.
    pub fn matvec_simd(&self, x: &[f32]) -> HyperionResult<Vec<f32>> {
        self.check_input(x)?;
        Ok((0..self.rows)
            .map(|row| {
                let r = row_range(&self.row_ptr, row);
                simd::gather_dot(&self.values[r.clone()], &self.col_indices[r], x)
            })
            .collect())
    }

    /// Bytes used by values, column indices and row pointers
    #[must_use]
    pub fn memory_usage(&self) -> usize {
        self.nnz() * 4 + self.nnz() * 4 + (self.rows + 1) * 4
    }

    /// Dense bytes over sparse bytes
    #[must_use]
    pub fn compression_ratio(&self) -> f32 {
        (self.rows * self.cols * 4) as f32 / self.memory_usage() as f32
    }

    /// Fraction of entries not stored
    #[must_use]
    pub fn sparsity(&self) -> f32 {
        1.0 - self.nnz() as f32 / (self.rows * self.cols) as f32
    }
}

/// CSR matrix with 4-bit quantized values
#[derive(Debug, Clone, PartialEq)]
pub struct QuantizedCsrMatrix {
    rows: usize,
    cols: usize,
    values: QuantizedBuffer,
    col_indices: Vec<i32>,
    row_ptr: Vec<i32>,
}

impl QuantizedCsrMatrix {
    /// Build from a dense matrix, quantizing the kept values to 4 bits
    ///
    /// # Errors
    ///
    /// Dimension error for a zero dimension or length mismatch.
    pub fn from_dense(dense: &[f32], rows: usize, cols: usize, threshold: f32) -> HyperionResult<Self> {
        check_shape(dense, rows, cols)?;
        let (raw, col_indices, row_ptr) = compress(dense, rows, cols, threshold);
        let values = if raw.is_empty() {
            QuantizedBuffer::empty(BitWidth::B4)
        } else {
            encode_range(&raw, BitWidth::B4)?
        };
        Ok(Self {
            rows,
            cols,
            values,
            col_indices,
            row_ptr,
        })
    }

    /// Quantize an existing CSR matrix
    ///
    /// # Errors
    ///
    /// Propagates codec errors.
    pub fn from_csr(csr: &CsrMatrix) -> HyperionResult<Self> {
        let values = if csr.values.is_empty() {
            QuantizedBuffer::empty(BitWidth::B4)
        } else {
            encode_range(&csr.values, BitWidth::B4)?
        };
        Ok(Self {
            rows: csr.rows,
            cols: csr.cols,
            values,
            col_indices: csr.col_indices.clone(),
            row_ptr: csr.row_ptr.clone(),
        })
    }

    /// Row count
    #[must_use]
    pub const fn rows(&self) -> usize {
        self.rows
    }

    /// Column count
    #[must_use]
    pub const fn cols(&self) -> usize {
        self.cols
    }

    /// Number of stored entries
    #[must_use]
    pub fn nnz(&self) -> usize {
        self.col_indices.len()
    }

    /// Global value scale
    #[must_use]
    pub fn scale(&self) -> f32 {
        self.values.scale()
    }

    /// Smallest stored value
    #[must_use]
    pub fn floor(&self) -> f32 {
        self.values.offset()
    }

    /// `y = A x`, decoding each value as it is used
    ///
    /// # Errors
    ///
    /// Dimension error if `x.len() != cols`.
    pub fn matvec(&self, x: &[f32]) -> HyperionResult<Vec<f32>> {
        if x.len() != self.cols {
            return Err(HyperionError::dimension("matvec input", self.cols, x.len()));
        }
        Ok((0..self.rows)
            .map(|row| {
                row_range(&self.row_ptr, row)
                    .map(|i| {
                        let v = self.values.value(i).unwrap_or(0.0);
                        v * x[self.col_indices[i] as usize]
                    })
                    .sum()
            })
            .collect())
    }

    /// Expand to a dense matrix of dequantized values
    #[must_use]
    pub fn to_dense(&self) -> Vec<f32> {
        let mut dense = vec![0.0; self.rows * self.cols];
        for row in 0..self.rows {
            for i in row_range(&self.row_ptr, row) {
                dense[row * self.cols + self.col_indices[i] as usize] =
                    self.values.value(i).unwrap_or(0.0);
            }
        }
        dense
    }

    /// Bytes used by packed codes, column indices and row pointers
    #[must_use]
    pub fn memory_usage(&self) -> usize {
        (self.nnz() + 1) / 2 + self.nnz() * 4 + (self.rows + 1) * 4
    }

    /// Dense bytes over sparse bytes
    #[must_use]
    pub fn compression_ratio(&self) -> f32 {
        (self.rows * self.cols * 4) as f32 / self.memory_usage() as f32
    }
}
