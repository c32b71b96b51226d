//! CRC-32 over container metadata and weights
//!
//! IEEE polynomial, reflected (`0xEDB88320`), initial value and final XOR
//! `0xFFFFFFFF`. Matches zlib's `crc32`.

use std::io::{self, Read};

const POLYNOMIAL: u32 = 0xEDB8_8320;

const TABLE: [u32; 256] = {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u32;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 1 != 0 {
                (crc >> 1) ^ POLYNOMIAL
            } else {
                crc >> 1
            };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
};

/// Streaming CRC-32 state
#[derive(Debug, Clone)]
pub struct Crc32 {
    state: u32,
}

impl Crc32 {
    /// Fresh checksum
    #[must_use]
    pub const fn new() -> Self {
        Self { state: u32::MAX }
    }

    /// Feed bytes
    pub fn update(&mut self, data: &[u8]) {
        self.state = data.iter().fold(self.state, |crc, &b| {
            (crc >> 8) ^ TABLE[((crc ^ u32::from(b)) & 0xFF) as usize]
        });
    }

    /// Feed `count` zero bytes
    pub fn update_zeros(&mut self, mut count: usize) {
        const ZEROS: [u8; 256] = [0; 256];
        while count > 0 {
            let n = count.min(ZEROS.len());
            self.update(&ZEROS[..n]);
            count -= n;
        }
    }

    /// Current checksum; does not consume the state
    #[must_use]
    pub const fn finalize(&self) -> u32 {
        !self.state
    }
}

impl Default for Crc32 {
    fn default() -> Self {
        Self::new()
    }
}

/// One-shot CRC-32
#[must_use]
pub fn crc32(data: &[u8]) -> u32 {
    let mut crc = Crc32::new();
    crc.update(data);
    crc.finalize()
}

/// Checksum exactly `len` bytes from `reader` in fixed-size chunks
///
/// Returns the number of bytes actually consumed, which is short of `len`
/// only when the reader hit end of file.
///
/// # Errors
///
/// Propagates I/O errors other than end of file.
pub fn update_from_reader<R: Read>(
    crc: &mut Crc32,
    reader: &mut R,
    len: u64,
    chunk: usize,
) -> io::Result<u64> {
    let mut buf = vec![0u8; chunk.max(1)];
    let mut remaining = len;
    while remaining > 0 {
        let want = remaining.min(buf.len() as u64) as usize;
        let n = match reader.read(&mut buf[..want]) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        crc.update(&buf[..n]);
        remaining -= n as u64;
    }
    Ok(len - remaining)
}
