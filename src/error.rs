//! Error types for Hyperion

use thiserror::Error;

/// Result type alias for Hyperion operations
pub type HyperionResult<T> = Result<T, HyperionError>;

/// Errors that can occur while encoding, loading or running a model
#[derive(Debug, Error)]
pub enum HyperionError {
    /// Bad magic, unsupported major version or truncated container
    #[error("format error: {0}")]
    Format(String),

    /// Stored checksum disagrees with the recomputed one
    #[error("checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    Checksum {
        /// Checksum stored in the header
        expected: u32,
        /// Checksum recomputed over metadata and weights
        actual: u32,
    },

    /// Unsupported bit width, empty input or invalid parameters
    #[error("quantization error: {0}")]
    Quantization(String),

    /// Matrix or layer size mismatch
    #[error("dimension error: {0}")]
    Dimension(String),

    /// Buffer allocation refused by the arena
    #[error("allocation error: {0}")]
    Allocation(String),

    /// Vocabulary loading or lookup failure
    #[error("tokenizer error: {0}")]
    Tokenizer(String),

    /// I/O error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl HyperionError {
    /// Shorthand for a dimension mismatch between two sizes
    pub(crate) fn dimension(what: &str, expected: usize, actual: usize) -> Self {
        Self::Dimension(format!("{what}: expected {expected}, got {actual}"))
    }
}
