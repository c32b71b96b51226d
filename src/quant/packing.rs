//! Bit-packed code arrays
//!
//! Codes of `bits` width are laid out LSB-first in a byte vector. For 4-bit
//! codes this puts element `2i` in the low nibble and `2i + 1` in the high
//! nibble of byte `i`; 16-bit codes come out little-endian. Every encoder
//! and decoder in the crate goes through this type, so there is exactly one
//! nibble order.

use crate::error::{HyperionError, HyperionResult};

/// Widest supported code
pub const MAX_CODE_BITS: u32 = 16;

/// Number of bytes needed for `count` codes of `bits` width
#[must_use]
pub const fn packed_len(count: usize, bits: u32) -> usize {
    (count * bits as usize + 7) / 8
}

/// Fixed-width unsigned codes packed into bytes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackedCodes {
    bytes: Vec<u8>,
    bits: u32,
    len: usize,
}

impl PackedCodes {
    /// Create a zeroed array of `len` codes
    ///
    /// # Errors
    ///
    /// Returns a quantization error if `bits` is 0 or above 16.
    pub fn zeroed(bits: u32, len: usize) -> HyperionResult<Self> {
        check_bits(bits)?;
        Ok(Self {
            bytes: vec![0; packed_len(len, bits)],
            bits,
            len,
        })
    }

    /// Zero-length array; widths outside 1..=16 are clamped
    #[must_use]
    pub fn empty(bits: u32) -> Self {
        Self {
            bytes: Vec::new(),
            bits: bits.clamp(1, MAX_CODE_BITS),
            len: 0,
        }
    }

    /// Wrap existing packed bytes
    ///
    /// # Errors
    ///
    /// Returns a quantization error for an unsupported width and a dimension
    /// error when `bytes` is not exactly `packed_len(len, bits)` long.
    pub fn from_bytes(bits: u32, len: usize, bytes: Vec<u8>) -> HyperionResult<Self> {
        check_bits(bits)?;
        let expected = packed_len(len, bits);
        if bytes.len() != expected {
            return Err(HyperionError::dimension(
                "packed byte length",
                expected,
                bytes.len(),
            ));
        }
        Ok(Self { bytes, bits, len })
    }

    /// Pack a sequence of codes
    ///
    /// # Errors
    ///
    /// Fails if any code does not fit in `bits`.
    pub fn from_codes<I>(bits: u32, len: usize, codes: I) -> HyperionResult<Self>
    where
        I: IntoIterator<Item = u32>,
    {
        let mut packed = Self::zeroed(bits, len)?;
        let mut written = 0;
        for (i, code) in codes.into_iter().enumerate() {
            packed.set(i, code)?;
            written += 1;
        }
        if written != len {
            return Err(HyperionError::dimension("code count", len, written));
        }
        Ok(packed)
    }

    /// Code width in bits
    #[must_use]
    pub const fn bits(&self) -> u32 {
        self.bits
    }

    /// Number of codes
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Check if empty
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Raw packed bytes
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Consume into the raw packed bytes
    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    const fn mask(&self) -> u32 {
        (1u32 << self.bits) - 1
    }

    /// Read code `index`, `None` when out of bounds
    #[must_use]
    pub fn get(&self, index: usize) -> Option<u32> {
        if index >= self.len {
            return None;
        }
        let bit = index * self.bits as usize;
        let byte = bit / 8;
        let shift = (bit % 8) as u32;

        // shift + bits <= 23, so three bytes always cover the code
        let mut window = 0u32;
        for k in 0..3 {
            if let Some(&b) = self.bytes.get(byte + k) {
                window |= u32::from(b) << (8 * k);
            }
        }
        Some((window >> shift) & self.mask())
    }

    /// Write code `index`
    ///
    /// # Errors
    ///
    /// Dimension error for an out-of-range index, quantization error for a
    /// code wider than the array.
    pub fn set(&mut self, index: usize, code: u32) -> HyperionResult<()> {
        if index >= self.len {
            return Err(HyperionError::Dimension(format!(
                "code index {index} out of bounds for length {}",
                self.len
            )));
        }
        if code > self.mask() {
            return Err(HyperionError::Quantization(format!(
                "code {code} does not fit in {} bits",
                self.bits
            )));
        }

        let bit = index * self.bits as usize;
        let byte = bit / 8;
        let shift = (bit % 8) as u32;
        let window_mask = self.mask() << shift;
        let window_val = code << shift;

        for k in 0..3 {
            let m = ((window_mask >> (8 * k)) & 0xFF) as u8;
            if m == 0 {
                continue;
            }
            if let Some(b) = self.bytes.get_mut(byte + k) {
                let v = ((window_val >> (8 * k)) & 0xFF) as u8;
                *b = (*b & !m) | (v & m);
            }
        }
        Ok(())
    }

    /// Iterate over all codes in order
    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        (0..self.len).filter_map(move |i| self.get(i))
    }
}

fn check_bits(bits: u32) -> HyperionResult<()> {
    if bits == 0 || bits > MAX_CODE_BITS {
        return Err(HyperionError::Quantization(format!(
            "unsupported code width: {bits} bits"
        )));
    }
    Ok(())
}
