//! Hyperion model container
//!
//! A 48-byte header, a fixed metadata record and an opaque weights blob,
//! all little-endian:
//!
//! ```text
//! ┌──────────────────────────┐
//! │ Header (48 bytes)        │  magic 0x484D4F44, version, domain, quant,
//! │                          │  lengths, capabilities, CRC-32
//! ├──────────────────────────┤
//! │ Metadata (metadata_len)  │  name, author, description, sizes,
//! │                          │  10 reserved u32 slots
//! ├──────────────────────────┤
//! │ Weights (weights_len)    │  see [`package`]
//! └──────────────────────────┘
//! ```
//!
//! The checksum covers the metadata block (zero-extended to its declared
//! length) followed by the weights.

pub mod checksum;
pub mod package;

pub use checksum::{crc32, Crc32};
pub use package::{load_model, save_model, PackedLayer, PackedModel};

use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::Path;

use crate::error::{HyperionError, HyperionResult};

/// Magic number 0x484D4F44, stored little-endian (bytes `44 4F 4D 48`)
pub const MAGIC: u32 = 0x484D_4F44;

/// Current major version; files with a larger major are rejected
pub const VERSION_MAJOR: u16 = 1;

/// Current minor version
pub const VERSION_MINOR: u16 = 0;

/// Header size in bytes
pub const HEADER_SIZE: usize = 48;

/// Size of the metadata record in bytes
pub const METADATA_SIZE: usize = 308;

/// Chunk size for streaming metadata and checksums
pub const IO_CHUNK: usize = 4096;

const NAME_LEN: usize = 64;
const AUTHOR_LEN: usize = 64;
const DESCRIPTION_LEN: usize = 128;
const RESERVED_SLOTS: usize = 10;

/// Reserved metadata slot holding the layer count
pub const RESERVED_LAYER_COUNT: usize = 0;
/// Reserved metadata slot holding the hidden size
pub const RESERVED_HIDDEN_SIZE: usize = 1;
/// Reserved metadata slot holding the context size
pub const RESERVED_CONTEXT_SIZE: usize = 2;
/// Reserved metadata slot holding the block count
pub const RESERVED_BLOCK_COUNT: usize = 3;
/// Reserved metadata slot holding extra flags
pub const RESERVED_EXTRA_FLAGS: usize = 4;

/// Model domain
///
/// Codes this crate does not know are kept as [`ModelDomain::Other`] so a
/// newer container still reads; callers decide whether they can use it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelDomain {
    /// Text generation / embedding
    Text,
    /// Audio
    Audio,
    /// Image
    Image,
    /// Multimodal
    Multimodal,
    /// Unrecognized code
    Other(u32),
}

impl ModelDomain {
    /// Wire code
    #[must_use]
    pub const fn code(self) -> u32 {
        match self {
            Self::Text => 1,
            Self::Audio => 2,
            Self::Image => 3,
            Self::Multimodal => 4,
            Self::Other(code) => code,
        }
    }
}

impl From<u32> for ModelDomain {
    fn from(value: u32) -> Self {
        match value {
            1 => Self::Text,
            2 => Self::Audio,
            3 => Self::Image,
            4 => Self::Multimodal,
            other => Self::Other(other),
        }
    }
}

/// Weight quantization recorded in the header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuantizationKind {
    /// Not recorded
    Unknown,
    /// 32-bit float
    Fp32,
    /// 8-bit integer codes
    Int8,
    /// 4-bit integer codes
    Int4,
    /// Unrecognized code
    Other(u32),
}

impl QuantizationKind {
    /// Wire code
    #[must_use]
    pub const fn code(self) -> u32 {
        match self {
            Self::Unknown => 0,
            Self::Fp32 => 32,
            Self::Int8 => 8,
            Self::Int4 => 4,
            Self::Other(code) => code,
        }
    }
}

impl From<u32> for QuantizationKind {
    fn from(value: u32) -> Self {
        match value {
            0 => Self::Unknown,
            32 => Self::Fp32,
            8 => Self::Int8,
            4 => Self::Int4,
            other => Self::Other(other),
        }
    }
}

/// Capability bit set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct Capabilities(u32);

impl Capabilities {
    /// Text generation
    pub const TEXT_GENERATION: Self = Self(1 << 0);
    /// Text embedding
    pub const TEXT_EMBEDDING: Self = Self(1 << 1);
    /// Audio
    pub const AUDIO: Self = Self(1 << 2);
    /// Vision
    pub const VISION: Self = Self(1 << 3);
    /// Reasoning
    pub const REASONING: Self = Self(1 << 4);
    /// Hybrid local/remote execution
    pub const HYBRID_READY: Self = Self(1 << 5);

    const KNOWN_BITS: u32 = 0x3F;

    /// Keep every bit, including ones this version does not define
    #[must_use]
    pub const fn from_bits_retain(bits: u32) -> Self {
        Self(bits)
    }

    /// Bits outside the defined capabilities
    #[must_use]
    pub const fn unknown_bits(self) -> u32 {
        self.0 & !Self::KNOWN_BITS
    }

    /// Empty set
    #[must_use]
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Raw bits
    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Whether every bit of `other` is set
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Union
    #[must_use]
    pub const fn with(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
}

impl std::ops::BitOr for Capabilities {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.with(rhs)
    }
}

/// Read a little-endian u16
fn read_u16_le(data: &[u8]) -> u16 {
    u16::from_le_bytes([data[0], data[1]])
}

/// Read a little-endian u32
pub(crate) fn read_u32_le(data: &[u8]) -> u32 {
    u32::from_le_bytes([data[0], data[1], data[2], data[3]])
}

/// Read a little-endian u64
fn read_u64_le(data: &[u8]) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&data[..8]);
    u64::from_le_bytes(bytes)
}

/// Container header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelHeader {
    /// Magic number
    pub magic: u32,
    /// Major version
    pub version_major: u16,
    /// Minor version
    pub version_minor: u16,
    /// Domain
    pub domain: ModelDomain,
    /// Weight quantization
    pub quantization: QuantizationKind,
    /// Parameter count
    pub parameter_count: u64,
    /// Declared metadata length in bytes
    pub metadata_length: u32,
    /// Capability bits
    pub capabilities: Capabilities,
    /// Weights blob length in bytes
    pub weights_length: u64,
    /// CRC-32 of metadata and weights
    pub checksum: u32,
    /// Reserved
    pub reserved: u32,
}

impl Default for ModelHeader {
    fn default() -> Self {
        Self::new(ModelDomain::Text, QuantizationKind::Unknown)
    }
}

impl ModelHeader {
    /// Header for a new container; lengths and checksum are filled by [`write`]
    #[must_use]
    pub const fn new(domain: ModelDomain, quantization: QuantizationKind) -> Self {
        Self {
            magic: MAGIC,
            version_major: VERSION_MAJOR,
            version_minor: VERSION_MINOR,
            domain,
            quantization,
            parameter_count: 0,
            metadata_length: 0,
            capabilities: Capabilities::empty(),
            weights_length: 0,
            checksum: 0,
            reserved: 0,
        }
    }

    /// Parse a header
    ///
    /// Magic and major version are checked before any other field.
    ///
    /// # Errors
    ///
    /// Format error for a short buffer, bad magic or unsupported major
    /// version. Unrecognized domain, quantization and capability values are
    /// kept as read.
    pub fn parse(data: &[u8]) -> HyperionResult<Self> {
        if data.len() < HEADER_SIZE {
            return Err(HyperionError::Format(format!(
                "header too short: {} bytes",
                data.len()
            )));
        }

        let magic = read_u32_le(&data[0..4]);
        if magic != MAGIC {
            return Err(HyperionError::Format(format!("invalid magic: {magic:#010x}")));
        }
        let version_major = read_u16_le(&data[4..6]);
        if version_major > VERSION_MAJOR {
            return Err(HyperionError::Format(format!(
                "unsupported format version: {version_major}"
            )));
        }

        Ok(Self {
            magic,
            version_major,
            version_minor: read_u16_le(&data[6..8]),
            domain: ModelDomain::from(read_u32_le(&data[8..12])),
            quantization: QuantizationKind::from(read_u32_le(&data[12..16])),
            parameter_count: read_u64_le(&data[16..24]),
            metadata_length: read_u32_le(&data[24..28]),
            capabilities: Capabilities::from_bits_retain(read_u32_le(&data[28..32])),
            weights_length: read_u64_le(&data[32..40]),
            checksum: read_u32_le(&data[40..44]),
            reserved: read_u32_le(&data[44..48]),
        })
    }

    /// Serialize to the 48-byte wire form
    #[must_use]
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut bytes = [0u8; HEADER_SIZE];
        bytes[0..4].copy_from_slice(&self.magic.to_le_bytes());
        bytes[4..6].copy_from_slice(&self.version_major.to_le_bytes());
        bytes[6..8].copy_from_slice(&self.version_minor.to_le_bytes());
        bytes[8..12].copy_from_slice(&self.domain.code().to_le_bytes());
        bytes[12..16].copy_from_slice(&self.quantization.code().to_le_bytes());
        bytes[16..24].copy_from_slice(&self.parameter_count.to_le_bytes());
        bytes[24..28].copy_from_slice(&self.metadata_length.to_le_bytes());
        bytes[28..32].copy_from_slice(&self.capabilities.bits().to_le_bytes());
        bytes[32..40].copy_from_slice(&self.weights_length.to_le_bytes());
        bytes[40..44].copy_from_slice(&self.checksum.to_le_bytes());
        bytes[44..48].copy_from_slice(&self.reserved.to_le_bytes());
        bytes
    }

    /// Magic matches and the major version is supported
    #[must_use]
    pub const fn is_compatible(&self) -> bool {
        self.magic == MAGIC && self.version_major <= VERSION_MAJOR
    }
}

/// Descriptive metadata record
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ModelMetadata {
    /// Model name (at most 63 bytes stored)
    pub name: String,
    /// Author (at most 63 bytes stored)
    pub author: String,
    /// Description (at most 127 bytes stored)
    pub description: String,
    /// Vocabulary size
    pub vocab_size: u32,
    /// Context window
    pub context_window: u32,
    /// Embedding size
    pub embedding_size: u32,
    /// Reserved slots; see the `RESERVED_*` indices
    pub reserved: [u32; RESERVED_SLOTS],
}

fn write_fixed_str(out: &mut [u8], s: &str) {
    // keep a trailing NUL and cut on a char boundary
    let mut end = s.len().min(out.len() - 1);
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    out[..end].copy_from_slice(&s.as_bytes()[..end]);
}

fn read_fixed_str(data: &[u8]) -> String {
    let end = data.iter().position(|&b| b == 0).unwrap_or(data.len());
    String::from_utf8_lossy(&data[..end]).into_owned()
}

impl ModelMetadata {
    /// Parse a record; bytes beyond `data.len()` read as zero
    #[must_use]
    pub fn parse(data: &[u8]) -> Self {
        let mut full = [0u8; METADATA_SIZE];
        let n = data.len().min(METADATA_SIZE);
        full[..n].copy_from_slice(&data[..n]);

        let strings_end = NAME_LEN + AUTHOR_LEN + DESCRIPTION_LEN;
        let mut reserved = [0u32; RESERVED_SLOTS];
        for (i, slot) in reserved.iter_mut().enumerate() {
            let off = strings_end + 12 + i * 4;
            *slot = read_u32_le(&full[off..off + 4]);
        }

        Self {
            name: read_fixed_str(&full[..NAME_LEN]),
            author: read_fixed_str(&full[NAME_LEN..NAME_LEN + AUTHOR_LEN]),
            description: read_fixed_str(&full[NAME_LEN + AUTHOR_LEN..strings_end]),
            vocab_size: read_u32_le(&full[strings_end..strings_end + 4]),
            context_window: read_u32_le(&full[strings_end + 4..strings_end + 8]),
            embedding_size: read_u32_le(&full[strings_end + 8..strings_end + 12]),
            reserved,
        }
    }

    /// Serialize to the 308-byte record
    #[must_use]
    pub fn to_bytes(&self) -> [u8; METADATA_SIZE] {
        let mut bytes = [0u8; METADATA_SIZE];
        let strings_end = NAME_LEN + AUTHOR_LEN + DESCRIPTION_LEN;
        write_fixed_str(&mut bytes[..NAME_LEN], &self.name);
        write_fixed_str(&mut bytes[NAME_LEN..NAME_LEN + AUTHOR_LEN], &self.author);
        write_fixed_str(&mut bytes[NAME_LEN + AUTHOR_LEN..strings_end], &self.description);
        bytes[strings_end..strings_end + 4].copy_from_slice(&self.vocab_size.to_le_bytes());
        bytes[strings_end + 4..strings_end + 8].copy_from_slice(&self.context_window.to_le_bytes());
        bytes[strings_end + 8..strings_end + 12].copy_from_slice(&self.embedding_size.to_le_bytes());
        for (i, slot) in self.reserved.iter().enumerate() {
            let off = strings_end + 12 + i * 4;
            bytes[off..off + 4].copy_from_slice(&slot.to_le_bytes());
        }
        bytes
    }

    /// Layer count stored in the reserved slots
    #[must_use]
    pub const fn layer_count(&self) -> u32 {
        self.reserved[RESERVED_LAYER_COUNT]
    }

    /// Hidden size stored in the reserved slots
    #[must_use]
    pub const fn hidden_size(&self) -> u32 {
        self.reserved[RESERVED_HIDDEN_SIZE]
    }

    /// Context size stored in the reserved slots
    #[must_use]
    pub const fn context_size(&self) -> u32 {
        self.reserved[RESERVED_CONTEXT_SIZE]
    }
}

/// Checksum of a metadata record zero-extended to `metadata_length`, then weights
#[must_use]
pub fn container_checksum(metadata: Option<&ModelMetadata>, metadata_length: u32, weights: &[u8]) -> u32 {
    let mut crc = Crc32::new();
    let declared = metadata_length as usize;
    let mut copied = 0;
    if let Some(meta) = metadata {
        copied = declared.min(METADATA_SIZE);
        crc.update(&meta.to_bytes()[..copied]);
    }
    crc.update_zeros(declared - copied);
    crc.update(weights);
    crc.finalize()
}

/// Write a container to `path`
///
/// Fills in the magic, defaults an all-zero version to the current one,
/// defaults the metadata length to 308 when metadata is present, and sets
/// the weights length and checksum. Returns the header as written. A
/// partially written file is removed.
///
/// # Errors
///
/// Returns I/O errors from creating or writing the file.
pub fn write<P: AsRef<Path>>(
    path: P,
    header: &ModelHeader,
    metadata: Option<&ModelMetadata>,
    weights: &[u8],
) -> HyperionResult<ModelHeader> {
    let path = path.as_ref();
    let _guard = trace_enter!("container_write");

    let mut out = header.clone();
    out.magic = MAGIC;
    if out.version_major == 0 && out.version_minor == 0 {
        out.version_major = VERSION_MAJOR;
        out.version_minor = VERSION_MINOR;
    }
    out.metadata_length = match metadata {
        Some(_) if header.metadata_length == 0 => METADATA_SIZE as u32,
        Some(_) => header.metadata_length,
        None => 0,
    };
    out.weights_length = weights.len() as u64;
    out.checksum = container_checksum(metadata, out.metadata_length, weights);

    let result = (|| -> io::Result<()> {
        let mut file = BufWriter::new(File::create(path)?);
        file.write_all(&out.to_bytes())?;
        if let Some(meta) = metadata {
            let declared = out.metadata_length as usize;
            let copied = declared.min(METADATA_SIZE);
            file.write_all(&meta.to_bytes()[..copied])?;
            io::copy(&mut io::repeat(0).take((declared - copied) as u64), &mut file)?;
        }
        file.write_all(weights)?;
        file.flush()
    })();

    if let Err(e) = result {
        trace_warn!(error = %e, "container write failed, removing partial file");
        let _ = fs::remove_file(path);
        return Err(e.into());
    }

    trace_event!(
        weights = out.weights_length,
        checksum = out.checksum,
        "container written"
    );
    Ok(out)
}

/// A container read from disk
#[derive(Debug, Clone, PartialEq)]
pub struct ModelFile {
    /// Header
    pub header: ModelHeader,
    /// Metadata, zeroed when the file declares none
    pub metadata: ModelMetadata,
    /// Weights, when requested
    pub weights: Option<Vec<u8>>,
}

fn truncated(what: &str) -> impl FnOnce(io::Error) -> HyperionError + '_ {
    move |e| {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            HyperionError::Format(format!("truncated {what}"))
        } else {
            HyperionError::Io(e)
        }
    }
}

fn read_header<R: Read>(reader: &mut R) -> HyperionResult<[u8; HEADER_SIZE]> {
    let mut raw = [0u8; HEADER_SIZE];
    reader.read_exact(&mut raw).map_err(truncated("header"))?;
    Ok(raw)
}

/// Read a container
///
/// The weights are skipped with a seek when `load_weights` is false.
/// Metadata beyond the 308-byte record is read and discarded.
///
/// # Errors
///
/// Format error for bad magic, an unsupported version or a file shorter
/// than its header declares. Allocation error when the weight buffer cannot
/// be reserved.
pub fn read<P: AsRef<Path>>(path: P, load_weights: bool) -> HyperionResult<ModelFile> {
    let _guard = trace_enter!("container_read");
    let mut file = BufReader::new(File::open(path)?);
    let file_len = file.get_ref().metadata()?.len();
    let header = ModelHeader::parse(&read_header(&mut file)?)?;

    let declared = HEADER_SIZE as u64 + u64::from(header.metadata_length);
    if declared.saturating_add(header.weights_length) > file_len {
        return Err(HyperionError::Format(format!(
            "truncated container: declares {} weight bytes, file holds {}",
            header.weights_length,
            file_len.saturating_sub(declared)
        )));
    }

    let mut meta_bytes = [0u8; METADATA_SIZE];
    let mut chunk = vec![0u8; IO_CHUNK];
    let mut offset = 0usize;
    let mut remaining = header.metadata_length as usize;
    while remaining > 0 {
        let n = remaining.min(IO_CHUNK);
        file.read_exact(&mut chunk[..n]).map_err(truncated("metadata"))?;
        if offset < METADATA_SIZE {
            let keep = n.min(METADATA_SIZE - offset);
            meta_bytes[offset..offset + keep].copy_from_slice(&chunk[..keep]);
        }
        offset += n;
        remaining -= n;
    }
    let metadata = ModelMetadata::parse(&meta_bytes);

    let weights = if load_weights {
        let len = usize::try_from(header.weights_length).map_err(|_| {
            HyperionError::Format(format!("weights too large: {}", header.weights_length))
        })?;
        let mut buf = Vec::new();
        buf.try_reserve_exact(len).map_err(|e| {
            HyperionError::Allocation(format!("weights buffer of {len} bytes: {e}"))
        })?;
        (&mut file).take(len as u64).read_to_end(&mut buf)?;
        if buf.len() != len {
            return Err(HyperionError::Format("truncated weights".into()));
        }
        Some(buf)
    } else {
        let skip = i64::try_from(header.weights_length).map_err(|_| {
            HyperionError::Format(format!("weights too large: {}", header.weights_length))
        })?;
        file.seek(SeekFrom::Current(skip))?;
        None
    };

    trace_event!(
        metadata = header.metadata_length,
        weights = header.weights_length,
        "container read"
    );
    Ok(ModelFile {
        header,
        metadata,
        weights,
    })
}

/// Outcome of [`verify`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "cli", derive(serde::Serialize))]
pub struct VerificationResult {
    /// No problems found
    pub success: bool,
    /// Magic did not match
    pub invalid_magic: bool,
    /// Major version newer than supported
    pub version_mismatch: bool,
    /// Stored checksum disagrees, or the file is shorter than declared
    pub checksum_mismatch: bool,
    /// Checksum stored in the header
    pub expected_checksum: u32,
    /// Checksum over the bytes actually present
    pub actual_checksum: u32,
}

/// Check magic, version and checksum without building a model
///
/// A bad magic returns immediately. A version mismatch is reported but
/// the checksum is still computed.
///
/// # Errors
///
/// Returns I/O errors, or a format error if the header itself is short.
pub fn verify<P: AsRef<Path>>(path: P) -> HyperionResult<VerificationResult> {
    let _guard = trace_enter!("container_verify");
    let mut file = BufReader::new(File::open(path)?);
    let raw = read_header(&mut file)?;
    let mut result = VerificationResult::default();

    if read_u32_le(&raw[0..4]) != MAGIC {
        result.invalid_magic = true;
        return Ok(result);
    }
    result.version_mismatch = read_u16_le(&raw[4..6]) > VERSION_MAJOR;

    let metadata_length = u64::from(read_u32_le(&raw[24..28]));
    let weights_length = read_u64_le(&raw[32..40]);
    let expected = read_u32_le(&raw[40..44]);
    result.expected_checksum = expected;

    let mut crc = Crc32::new();
    let read = checksum::update_from_reader(&mut crc, &mut file, metadata_length, IO_CHUNK)?
        + checksum::update_from_reader(&mut crc, &mut file, weights_length, IO_CHUNK)?;

    result.actual_checksum = crc.finalize();
    result.checksum_mismatch =
        read != metadata_length + weights_length || result.actual_checksum != expected;
    result.success = !result.version_mismatch && !result.checksum_mismatch;

    if result.checksum_mismatch {
        trace_warn!(expected, actual = result.actual_checksum, "checksum mismatch");
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_metadata() -> ModelMetadata {
        let mut meta = ModelMetadata {
            name: "tiny-rnn".into(),
            author: "hyperion".into(),
            description: "two layer test model".into(),
            vocab_size: 9,
            context_window: 16,
            embedding_size: 4,
            ..ModelMetadata::default()
        };
        meta.reserved[RESERVED_LAYER_COUNT] = 2;
        meta.reserved[RESERVED_HIDDEN_SIZE] = 4;
        meta
    }

    // =========================================================================
    // Header Tests
    // =========================================================================

    #[test]
    fn test_header_layout() {
        let mut header = ModelHeader::new(ModelDomain::Text, QuantizationKind::Int4);
        header.parameter_count = 0x0102_0304_0506_0708;
        header.weights_length = 77;
        let bytes = header.to_bytes();
        assert_eq!(&bytes[0..4], b"DOMH");
        assert_eq!(read_u32_le(&bytes[12..16]), 4);
        assert_eq!(bytes[16], 0x08);
        assert_eq!(read_u64_le(&bytes[32..40]), 77);
        assert_eq!(ModelHeader::parse(&bytes).expect("parse"), header);
    }

    #[test]
    fn test_header_rejects_bad_magic() {
        let mut bytes = ModelHeader::default().to_bytes();
        bytes[0] ^= 0xFF;
        assert!(matches!(
            ModelHeader::parse(&bytes),
            Err(HyperionError::Format(_))
        ));
    }

    #[test]
    fn test_header_rejects_newer_major() {
        let mut header = ModelHeader::default();
        header.version_major = 2;
        assert!(!header.is_compatible());
        assert!(ModelHeader::parse(&header.to_bytes()).is_err());
    }

    #[test]
    fn test_header_short() {
        assert!(ModelHeader::parse(&[0u8; 20]).is_err());
    }

    #[test]
    fn test_enum_conversions() {
        assert_eq!(ModelDomain::from(3), ModelDomain::Image);
        assert_eq!(ModelDomain::from(0), ModelDomain::Other(0));
        assert_eq!(ModelDomain::Other(9).code(), 9);
        assert_eq!(QuantizationKind::from(8), QuantizationKind::Int8);
        assert_eq!(QuantizationKind::from(16), QuantizationKind::Other(16));
        assert_eq!(QuantizationKind::Fp32.code(), 32);
        let caps = Capabilities::from_bits_retain(0x41);
        assert_eq!(caps.bits(), 0x41);
        assert_eq!(caps.unknown_bits(), 0x40);
        assert!(caps.contains(Capabilities::TEXT_GENERATION));
    }

    #[test]
    fn test_header_keeps_unrecognized_values() {
        let mut header = ModelHeader::new(ModelDomain::Text, QuantizationKind::Int8);
        header.domain = ModelDomain::Other(77);
        header.quantization = QuantizationKind::Other(3);
        header.capabilities = Capabilities::from_bits_retain(0x8000_0001);
        let raw = header.to_bytes();
        assert_eq!(read_u32_le(&raw[8..12]), 77);

        let parsed = ModelHeader::parse(&raw).expect("parse");
        assert_eq!(parsed.domain, ModelDomain::Other(77));
        assert_eq!(parsed.quantization, QuantizationKind::Other(3));
        assert_eq!(parsed.capabilities.bits(), 0x8000_0001);
        assert_eq!(parsed.to_bytes(), raw);
    }

    #[test]
    fn test_capabilities() {
        let caps = Capabilities::TEXT_GENERATION | Capabilities::HYBRID_READY;
        assert_eq!(caps.bits(), 0b10_0001);
        assert!(caps.contains(Capabilities::TEXT_GENERATION));
        assert!(!caps.contains(Capabilities::AUDIO));
    }

    // =========================================================================
    // Metadata Tests
    // =========================================================================

    #[test]
    fn test_metadata_record() {
        let meta = sample_metadata();
        let bytes = meta.to_bytes();
        assert_eq!(bytes.len(), METADATA_SIZE);
        assert_eq!(&bytes[..8], b"tiny-rnn");
        assert_eq!(bytes[8], 0);
        let back = ModelMetadata::parse(&bytes);
        assert_eq!(back, meta);
        assert_eq!(back.layer_count(), 2);
        assert_eq!(back.hidden_size(), 4);
    }

    #[test]
    fn test_metadata_long_name_truncated() {
        let meta = ModelMetadata {
            name: "x".repeat(100),
            ..ModelMetadata::default()
        };
        let back = ModelMetadata::parse(&meta.to_bytes());
        assert_eq!(back.name.len(), 63);
    }

    #[test]
    fn test_metadata_short_record_zero_tail() {
        let bytes = sample_metadata().to_bytes();
        let back = ModelMetadata::parse(&bytes[..64]);
        assert_eq!(back.name, "tiny-rnn");
        assert_eq!(back.vocab_size, 0);
    }

    // =========================================================================
    // File Tests
    // =========================================================================

    #[test]
    fn test_write_read_verify() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("model.hmod");
        let weights: Vec<u8> = (0..=255).collect();
        let meta = sample_metadata();

        let mut header = ModelHeader::new(ModelDomain::Text, QuantizationKind::Int4);
        header.version_major = 0;
        let written = write(&path, &header, Some(&meta), &weights).expect("write");
        assert_eq!(written.version_major, VERSION_MAJOR);
        assert_eq!(written.metadata_length, METADATA_SIZE as u32);
        assert_eq!(
            fs::metadata(&path).expect("stat").len(),
            (HEADER_SIZE + METADATA_SIZE + 256) as u64
        );

        let file = read(&path, true).expect("read");
        assert_eq!(file.header, written);
        assert_eq!(file.metadata, meta);
        assert_eq!(file.weights.as_deref(), Some(weights.as_slice()));

        let skipped = read(&path, false).expect("read");
        assert!(skipped.weights.is_none());

        let result = verify(&path).expect("verify");
        assert!(result.success);
    }

    #[test]
    fn test_extended_metadata_length() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("long-meta.hmod");
        let mut header = ModelHeader::default();
        header.metadata_length = 5000;
        write(&path, &header, Some(&sample_metadata()), &[1, 2, 3]).expect("write");

        let file = read(&path, true).expect("read");
        assert_eq!(file.metadata, sample_metadata());
        assert_eq!(file.weights, Some(vec![1, 2, 3]));
        assert!(verify(&path).expect("verify").success);
    }

    #[test]
    fn test_verify_detects_flipped_weight() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("corrupt.hmod");
        write(&path, &ModelHeader::default(), Some(&sample_metadata()), &[9; 64]).expect("write");

        let mut bytes = fs::read(&path).expect("read");
        let last = bytes.len() - 1;
        bytes[last] ^= 0x01;
        fs::write(&path, &bytes).expect("rewrite");

        let result = verify(&path).expect("verify");
        assert!(result.checksum_mismatch);
        assert!(!result.success);
    }

    #[test]
    fn test_verify_bad_magic_returns_early() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("magic.hmod");
        fs::write(&path, [0u8; HEADER_SIZE]).expect("write");
        let result = verify(&path).expect("verify");
        assert!(result.invalid_magic);
        assert!(!result.checksum_mismatch);
        assert!(!result.success);
    }

    #[test]
    fn test_truncated_weights() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("short.hmod");
        write(&path, &ModelHeader::default(), None, &[7; 100]).expect("write");
        let bytes = fs::read(&path).expect("read");
        fs::write(&path, &bytes[..bytes.len() - 10]).expect("truncate");

        assert!(matches!(read(&path, true), Err(HyperionError::Format(_))));
        assert!(verify(&path).expect("verify").checksum_mismatch);
    }

    #[test]
    fn test_oversized_weights_length_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("huge.hmod");
        write(&path, &ModelHeader::default(), None, &[1; 16]).expect("write");
        let mut bytes = fs::read(&path).expect("read");
        bytes[32..40].copy_from_slice(&(1u64 << 48).to_le_bytes());
        fs::write(&path, &bytes).expect("patch");

        assert!(matches!(read(&path, true), Err(HyperionError::Format(_))));
        assert!(matches!(read(&path, false), Err(HyperionError::Format(_))));
    }

    #[test]
    fn test_write_version_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("v.hmod");

        let mut header = ModelHeader {
            version_major: 0,
            version_minor: 0,
            ..ModelHeader::default()
        };
        let out = write(&path, &header, None, &[]).expect("write");
        assert_eq!((out.version_major, out.version_minor), (VERSION_MAJOR, VERSION_MINOR));

        header.version_minor = 5;
        let out = write(&path, &header, None, &[]).expect("write");
        assert_eq!((out.version_major, out.version_minor), (0, 5));
        let back = read(&path, false).expect("read");
        assert_eq!((back.header.version_major, back.header.version_minor), (0, 5));
    }

    #[test]
    fn test_write_failure_leaves_no_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("missing-dir").join("model.hmod");
        assert!(write(&path, &ModelHeader::default(), None, &[]).is_err());
        assert!(!path.exists());
    }
}
