//! Packed layer stack stored in a container's weights blob
//!
//! All fields are little-endian:
//!
//! ```text
//! model_type u32 | layer_count u32 | hidden_size u32 | context_size u32
//! repeated layer_count times:
//!   kind u32 | input u32 | output u32 | activation u32
//!   scale f32 | floor f32 | weight_bytes u32 | bias_bytes u32
//!   weights[weight_bytes] | biases[bias_bytes]
//! ```
//!
//! Weight codes are 4-bit (container quantization `int4` or `unknown`) or
//! 8-bit (`int8`), low nibble first, and decode as `code * scale + floor`.

use std::path::Path;

use crate::error::{HyperionError, HyperionResult};
use crate::model::{Activation, Layer, LayerKind, Model, ModelType};
use crate::quant::{decode, encode_range, BitWidth, QuantizedBuffer, Scheme};
use crate::tokenizer::Tokenizer;

use super::{
    Capabilities, ModelDomain, ModelHeader, ModelMetadata, QuantizationKind,
    RESERVED_CONTEXT_SIZE, RESERVED_HIDDEN_SIZE, RESERVED_LAYER_COUNT,
};

const MODEL_HEADER_BYTES: usize = 16;
const LAYER_HEADER_BYTES: usize = 32;

/// Little-endian reader over the weights blob
struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    const fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn bytes(&mut self, n: usize, what: &str) -> HyperionResult<&'a [u8]> {
        let end = self.pos.checked_add(n).filter(|&end| end <= self.data.len());
        match end {
            Some(end) => {
                let out = &self.data[self.pos..end];
                self.pos = end;
                Ok(out)
            }
            None => Err(HyperionError::Format(format!(
                "truncated packed model: {what} needs {n} bytes at offset {}, {} left",
                self.pos,
                self.data.len() - self.pos
            ))),
        }
    }

    fn u32(&mut self, what: &str) -> HyperionResult<u32> {
        let b = self.bytes(4, what)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn f32(&mut self, what: &str) -> HyperionResult<f32> {
        self.u32(what).map(f32::from_bits)
    }
}

/// One layer as stored on disk
#[derive(Debug, Clone, PartialEq)]
pub struct PackedLayer {
    /// Layer kind
    pub kind: LayerKind,
    /// Input width
    pub input_size: u32,
    /// Output width
    pub output_size: u32,
    /// Activation
    pub activation: Activation,
    /// Code step
    pub scale: f32,
    /// Value of code 0
    pub floor: f32,
    /// Packed weight codes
    pub weights: Vec<u8>,
    /// Biases (gamma then beta for layer norm)
    pub biases: Vec<f32>,
}

impl PackedLayer {
    fn bias_len_ok(&self) -> bool {
        let out = self.output_size as usize;
        match self.kind {
            LayerKind::LayerNorm => [0, out, 2 * out].contains(&self.biases.len()),
            LayerKind::Attention => self.biases.is_empty() || self.biases.len() == out,
            _ => self.biases.len() == out,
        }
    }

    /// Element count implied by the stored byte length
    fn element_count(&self, bit_width: BitWidth) -> HyperionResult<usize> {
        let square = self.input_size as usize * self.output_size as usize;
        let bytes = self.weights.len();
        if bytes == 0 {
            return if self.kind.allows_empty_weights() {
                Ok(0)
            } else {
                Err(HyperionError::Format(format!(
                    "{} layer has no weights",
                    self.kind
                )))
            };
        }
        if bytes == bit_width.packed_len(square) {
            Ok(square)
        } else if self.kind == LayerKind::Attention && bytes == bit_width.packed_len(3 * square) {
            Ok(3 * square)
        } else {
            Err(HyperionError::Format(format!(
                "{} layer {}x{}: {bytes} weight bytes do not match {bit_width} codes",
                self.kind, self.input_size, self.output_size
            )))
        }
    }

    /// Rebuild the in-memory layer
    ///
    /// # Errors
    ///
    /// Format error for a weight or bias length the layer cannot hold.
    pub fn to_layer(&self, bit_width: BitWidth) -> HyperionResult<Layer> {
        if !self.bias_len_ok() {
            return Err(HyperionError::Format(format!(
                "{} layer with {} outputs cannot take {} biases",
                self.kind,
                self.output_size,
                self.biases.len()
            )));
        }
        let count = self.element_count(bit_width)?;
        let weights = if count == 0 {
            QuantizedBuffer::empty(bit_width)
        } else {
            QuantizedBuffer::from_raw_parts(
                bit_width,
                Scheme::Asymmetric,
                self.scale,
                0,
                self.floor,
                self.weights.clone(),
                count,
            )?
        };
        Layer::new(
            self.kind,
            self.input_size as usize,
            self.output_size as usize,
            self.activation,
            weights,
            self.biases.clone(),
        )
    }

    /// Pack an in-memory layer at `bit_width`
    ///
    /// Linear buffers already at that width keep their codes with the zero
    /// point folded into the floor. Anything else is dequantized and
    /// re-encoded over its min/max range.
    ///
    /// # Errors
    ///
    /// Size overflow of the u32 fields, or quantization errors from
    /// re-encoding.
    pub fn from_layer(layer: &Layer, bit_width: BitWidth) -> HyperionResult<Self> {
        let to_u32 = |n: usize, what: &str| {
            u32::try_from(n).map_err(|_| HyperionError::Format(format!("{what} too large: {n}")))
        };
        let w = layer.weights();
        let (scale, floor, weights) = if w.is_empty() {
            (1.0, 0.0, Vec::new())
        } else if matches!(w.scheme(), Scheme::Asymmetric | Scheme::Symmetric)
            && w.bit_width() == bit_width
        {
            let floor = w.offset() - w.zero_point() as f32 * w.scale();
            (w.scale(), floor, w.packed_bytes().to_vec())
        } else {
            let requantized = encode_range(&decode(w), bit_width)?;
            (
                requantized.scale(),
                requantized.offset(),
                requantized.packed_bytes().to_vec(),
            )
        };

        Ok(Self {
            kind: layer.kind(),
            input_size: to_u32(layer.input_size(), "input size")?,
            output_size: to_u32(layer.output_size(), "output size")?,
            activation: layer.activation(),
            scale,
            floor,
            weights,
            biases: stored_biases(layer),
        })
    }
}

/// Biases as written; kinds that must carry one per output get zeros
fn stored_biases(layer: &Layer) -> Vec<f32> {
    let biases = layer.biases();
    let optional = matches!(layer.kind(), LayerKind::LayerNorm | LayerKind::Attention);
    if biases.is_empty() && !optional {
        vec![0.0; layer.output_size()]
    } else {
        biases.to_vec()
    }
}

/// A whole layer stack as stored on disk
#[derive(Debug, Clone, PartialEq)]
pub struct PackedModel {
    /// Evaluation path
    pub model_type: ModelType,
    /// Hidden width
    pub hidden_size: u32,
    /// Context window
    pub context_size: u32,
    /// Layers in evaluation order
    pub layers: Vec<PackedLayer>,
}

impl PackedModel {
    /// Serialize to the weights blob layout
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let body: usize = self
            .layers
            .iter()
            .map(|l| LAYER_HEADER_BYTES + l.weights.len() + l.biases.len() * 4)
            .sum();
        let mut out = Vec::with_capacity(MODEL_HEADER_BYTES + body);
        let put = |out: &mut Vec<u8>, v: u32| out.extend_from_slice(&v.to_le_bytes());

        put(&mut out, self.model_type as u32);
        put(&mut out, self.layers.len() as u32);
        put(&mut out, self.hidden_size);
        put(&mut out, self.context_size);
        for layer in &self.layers {
            put(&mut out, layer.kind as u32);
            put(&mut out, layer.input_size);
            put(&mut out, layer.output_size);
            put(&mut out, layer.activation as u32);
            put(&mut out, layer.scale.to_bits());
            put(&mut out, layer.floor.to_bits());
            put(&mut out, layer.weights.len() as u32);
            put(&mut out, (layer.biases.len() * 4) as u32);
            out.extend_from_slice(&layer.weights);
            for b in &layer.biases {
                put(&mut out, b.to_bits());
            }
        }
        out
    }

    /// Parse a weights blob
    ///
    /// Trailing bytes after the last layer are ignored.
    ///
    /// # Errors
    ///
    /// Format error for truncation, a zero layer count, an unknown enum code
    /// or a bias length that is not a whole number of floats.
    pub fn decode(data: &[u8]) -> HyperionResult<Self> {
        let mut cur = Cursor::new(data);
        let model_type = ModelType::try_from(cur.u32("model type")?)?;
        let layer_count = cur.u32("layer count")?;
        let hidden_size = cur.u32("hidden size")?;
        let context_size = cur.u32("context size")?;
        if layer_count == 0 {
            return Err(HyperionError::Format("packed model has no layers".into()));
        }

        let mut layers = Vec::with_capacity((layer_count as usize).min(data.len() / LAYER_HEADER_BYTES));
        for index in 0..layer_count {
            let kind = LayerKind::try_from(cur.u32("layer kind")?)?;
            let input_size = cur.u32("input size")?;
            let output_size = cur.u32("output size")?;
            let activation = Activation::try_from(cur.u32("activation")?)?;
            let scale = cur.f32("scale")?;
            let floor = cur.f32("floor")?;
            let weight_bytes = cur.u32("weight length")? as usize;
            let bias_bytes = cur.u32("bias length")? as usize;
            if bias_bytes % 4 != 0 {
                return Err(HyperionError::Format(format!(
                    "layer {index}: bias length {bias_bytes} is not a multiple of 4"
                )));
            }
            let weights = cur.bytes(weight_bytes, "weights")?.to_vec();
            let biases = cur
                .bytes(bias_bytes, "biases")?
                .chunks_exact(4)
                .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                .collect();
            layers.push(PackedLayer {
                kind,
                input_size,
                output_size,
                activation,
                scale,
                floor,
                weights,
                biases,
            });
        }

        Ok(Self {
            model_type,
            hidden_size,
            context_size,
            layers,
        })
    }

    /// Pack a model, choosing 8-bit codes if any layer is wider than 4 bits
    ///
    /// # Errors
    ///
    /// See [`PackedLayer::from_layer`].
    pub fn from_model(model: &Model<'_>) -> HyperionResult<(Self, BitWidth)> {
        let bit_width = if model
            .layers()
            .iter()
            .any(|l| !l.weights().is_empty() && l.weights().bit_width() > BitWidth::B4)
        {
            BitWidth::B8
        } else {
            BitWidth::B4
        };
        let to_u32 = |n: usize| {
            u32::try_from(n).map_err(|_| HyperionError::Format(format!("size too large: {n}")))
        };
        let layers = model
            .layers()
            .iter()
            .map(|l| PackedLayer::from_layer(l, bit_width))
            .collect::<HyperionResult<Vec<_>>>()?;
        Ok((
            Self {
                model_type: model.model_type(),
                hidden_size: to_u32(model.hidden_size())?,
                context_size: to_u32(model.context_size())?,
                layers,
            },
            bit_width,
        ))
    }

    /// Build a model bound to `tokenizer`
    ///
    /// # Errors
    ///
    /// Dimension error for zero sizes, format error for bad layer data.
    pub fn into_model<'a>(
        &self,
        tokenizer: &'a dyn Tokenizer,
        bit_width: BitWidth,
    ) -> HyperionResult<Model<'a>> {
        let mut model = Model::new(
            self.model_type,
            self.hidden_size as usize,
            self.context_size as usize,
            tokenizer,
        )?;
        for layer in &self.layers {
            model.push_layer(layer.to_layer(bit_width)?);
        }
        Ok(model)
    }
}

fn code_width(quantization: QuantizationKind) -> HyperionResult<BitWidth> {
    match quantization {
        QuantizationKind::Int4 | QuantizationKind::Unknown => Ok(BitWidth::B4),
        QuantizationKind::Int8 => Ok(BitWidth::B8),
        QuantizationKind::Fp32 => Err(HyperionError::Format(
            "fp32 packed models are not supported".into(),
        )),
        QuantizationKind::Other(code) => Err(HyperionError::Format(format!(
            "unsupported quantization code {code}"
        ))),
    }
}

/// Load a text model container and bind it to `tokenizer`
///
/// # Errors
///
/// Checksum error when the stored CRC disagrees, format error for a bad
/// header, a non-text domain, fp32 quantization or a malformed layer stack,
/// and I/O errors.
pub fn load_model<'a, P: AsRef<Path>>(
    path: P,
    tokenizer: &'a dyn Tokenizer,
) -> HyperionResult<Model<'a>> {
    let _guard = trace_enter!("load_model");
    let path = path.as_ref();
    let check = super::verify(path)?;
    if check.invalid_magic {
        return Err(HyperionError::Format("bad magic".into()));
    }
    if check.version_mismatch {
        return Err(HyperionError::Format("unsupported major version".into()));
    }
    if check.checksum_mismatch {
        return Err(HyperionError::Checksum {
            expected: check.expected_checksum,
            actual: check.actual_checksum,
        });
    }

    let file = super::read(path, true)?;
    if file.header.domain != ModelDomain::Text {
        return Err(HyperionError::Format(format!(
            "expected a text model, got {:?}",
            file.header.domain
        )));
    }
    let bit_width = code_width(file.header.quantization)?;
    let weights = file.weights.unwrap_or_default();

    let packed = PackedModel::decode(&weights)?;
    let model = packed.into_model(tokenizer, bit_width)?;
    trace_event!(
        layers = model.layers().len(),
        parameters = model.parameter_count(),
        bits = bit_width.bits(),
        "model loaded"
    );
    Ok(model)
}

/// Write `model` as a text container
///
/// The layer count, hidden and context sizes are recorded in the metadata's
/// reserved slots alongside `metadata`'s descriptive fields. Returns the
/// header as written.
///
/// # Errors
///
/// I/O errors, or see [`PackedModel::from_model`].
pub fn save_model<P: AsRef<Path>>(
    path: P,
    model: &Model<'_>,
    metadata: &ModelMetadata,
) -> HyperionResult<ModelHeader> {
    let _guard = trace_enter!("save_model");
    let (packed, bit_width) = PackedModel::from_model(model)?;
    let blob = packed.encode();

    let mut meta = metadata.clone();
    meta.reserved[RESERVED_LAYER_COUNT] = packed.layers.len() as u32;
    meta.reserved[RESERVED_HIDDEN_SIZE] = packed.hidden_size;
    meta.reserved[RESERVED_CONTEXT_SIZE] = packed.context_size;
    meta.vocab_size = model.tokenizer().vocab_size() as u32;
    meta.context_window = packed.context_size;
    meta.embedding_size = packed.hidden_size;

    let quantization = if bit_width == BitWidth::B8 {
        QuantizationKind::Int8
    } else {
        QuantizationKind::Int4
    };
    let mut header = ModelHeader::new(ModelDomain::Text, quantization);
    header.parameter_count = model.parameter_count() as u64;
    header.capabilities = Capabilities::TEXT_GENERATION;

    super::write(path, &header, Some(&meta), &blob)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tokenizer::{WordTokenizer, BOS};

    fn dense_blob() -> Vec<u8> {
        PackedModel {
            model_type: ModelType::Rnn,
            hidden_size: 2,
            context_size: 4,
            layers: vec![PackedLayer {
                kind: LayerKind::Dense,
                input_size: 2,
                output_size: 2,
                activation: Activation::Relu,
                scale: 0.5,
                floor: 0.0,
                weights: vec![0x12, 0x34],
                biases: vec![0.1, 0.2],
            }],
        }
        .encode()
    }

    fn ramp(n: usize) -> Vec<f32> {
        (0..n).map(|i| (i % 10) as f32 / 10.0).collect()
    }

    // =========================================================================
    // Blob Tests
    // =========================================================================

    #[test]
    fn test_blob_layout() {
        let blob = dense_blob();
        assert_eq!(blob.len(), 16 + 32 + 2 + 8);
        assert_eq!(&blob[0..4], &0u32.to_le_bytes());
        assert_eq!(&blob[4..8], &1u32.to_le_bytes());
        assert_eq!(&blob[48..50], &[0x12, 0x34]);
    }

    #[test]
    fn test_decode_blob() {
        let packed = PackedModel::decode(&dense_blob()).expect("decode");
        assert_eq!(packed.layers.len(), 1);
        let layer = &packed.layers[0];
        assert_eq!(layer.kind, LayerKind::Dense);
        assert_eq!(layer.activation, Activation::Relu);
        assert_eq!(layer.biases, vec![0.1, 0.2]);

        let codes = crate::quant::PackedCodes::from_bytes(4, 4, layer.weights.clone()).expect("codes");
        assert_eq!(codes.iter().collect::<Vec<_>>(), vec![2, 1, 4, 3]);

        let built = layer.to_layer(BitWidth::B4).expect("layer");
        assert_eq!(built.weights().value(0), Some(1.0));
        assert_eq!(built.weights().value(2), Some(2.0));
    }

    #[test]
    fn test_truncated_blob() {
        let blob = dense_blob();
        for cut in [3, 16, 40, blob.len() - 1] {
            assert!(matches!(
                PackedModel::decode(&blob[..cut]),
                Err(HyperionError::Format(_))
            ));
        }
    }

    #[test]
    fn test_zero_layers_rejected() {
        let mut blob = dense_blob();
        blob[4..8].copy_from_slice(&0u32.to_le_bytes());
        assert!(matches!(
            PackedModel::decode(&blob),
            Err(HyperionError::Format(_))
        ));
    }

    #[test]
    fn test_bias_length_checked() {
        let mut packed = PackedModel::decode(&dense_blob()).expect("decode");
        packed.layers[0].biases.pop();
        assert!(packed.layers[0].to_layer(BitWidth::B4).is_err());
    }

    #[test]
    fn test_weightless_dense_rejected() {
        let mut packed = PackedModel::decode(&dense_blob()).expect("decode");
        packed.layers[0].weights.clear();
        assert!(matches!(
            packed.layers[0].to_layer(BitWidth::B4),
            Err(HyperionError::Format(_))
        ));
    }

    // =========================================================================
    // File Tests
    // =========================================================================

    #[test]
    fn test_save_and_load_model() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("tiny.hmod");
        let tok = WordTokenizer::from_vocab_str("a\nb\nc\nd\ne").expect("vocab");
        let vocab = tok.vocab_size();

        let mut model = Model::new(ModelType::Rnn, 4, 8, &tok).expect("model");
        for (kind, d_in, d_out) in [
            (LayerKind::Embedding, vocab, 4),
            (LayerKind::Output, 4, vocab),
        ] {
            let w = encode_range(&ramp(d_in * d_out), BitWidth::B4).expect("encode");
            model.push_layer(
                Layer::new(kind, d_in, d_out, Activation::None, w, vec![0.0; d_out]).expect("layer"),
            );
        }
        let expected = model.forward(&[BOS, 5, 7]).expect("forward");

        let meta = ModelMetadata {
            name: "tiny".into(),
            ..ModelMetadata::default()
        };
        let header = save_model(&path, &model, &meta).expect("save");
        assert_eq!(header.quantization, QuantizationKind::Int4);

        let info = super::super::read(&path, false).expect("read");
        assert_eq!(info.metadata.layer_count(), 2);
        assert_eq!(info.metadata.hidden_size(), 4);
        assert_eq!(info.metadata.vocab_size, vocab as u32);

        let mut loaded = load_model(&path, &tok).expect("load");
        assert_eq!(loaded.layers().len(), 2);
        let logits = loaded.forward(&[BOS, 5, 7]).expect("forward");
        for (a, b) in logits.iter().zip(&expected) {
            assert!((a - b).abs() < 1e-5);
        }
    }

    #[test]
    fn test_save_and_load_without_biases() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nobias.hmod");
        let tok = WordTokenizer::from_vocab_str("x\ny\nz").expect("vocab");
        let vocab = tok.vocab_size();

        let mut model = Model::new(ModelType::Rnn, 4, 8, &tok).expect("model");
        for (kind, d_in, d_out) in [
            (LayerKind::Embedding, vocab, 4),
            (LayerKind::Output, 4, vocab),
        ] {
            let w = encode_range(&ramp(d_in * d_out), BitWidth::B4).expect("encode");
            model.push_layer(
                Layer::new(kind, d_in, d_out, Activation::None, w, Vec::new()).expect("layer"),
            );
        }
        let expected = model.forward(&[BOS, 4, 6]).expect("forward");
        save_model(&path, &model, &ModelMetadata::default()).expect("save");

        let mut loaded = load_model(&path, &tok).expect("load");
        assert_eq!(loaded.layers()[0].biases(), &[0.0; 4]);
        assert_eq!(loaded.layers()[1].biases().len(), vocab);
        let logits = loaded.forward(&[BOS, 4, 6]).expect("forward");
        for (a, b) in logits.iter().zip(&expected) {
            assert!((a - b).abs() < 1e-5);
        }
    }

    #[test]
    fn test_load_rejects_other_domain() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("audio.hmod");
        let header = ModelHeader::new(ModelDomain::Audio, QuantizationKind::Int4);
        super::super::write(&path, &header, None, &dense_blob()).expect("write");
        let tok = WordTokenizer::new();
        assert!(matches!(
            load_model(&path, &tok),
            Err(HyperionError::Format(_))
        ));
    }

    #[test]
    fn test_unrecognized_header_values_read_but_domain_enforced() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("future.hmod");
        let mut header = ModelHeader::new(ModelDomain::Other(12), QuantizationKind::Other(2));
        header.capabilities = Capabilities::from_bits_retain(0x100);
        super::super::write(&path, &header, None, &dense_blob()).expect("write");

        let file = super::super::read(&path, true).expect("read");
        assert_eq!(file.header.domain, ModelDomain::Other(12));
        assert_eq!(file.header.quantization, QuantizationKind::Other(2));
        assert_eq!(file.header.capabilities.unknown_bits(), 0x100);

        let tok = WordTokenizer::new();
        assert!(matches!(
            load_model(&path, &tok),
            Err(HyperionError::Format(_))
        ));
    }

    #[test]
    fn test_load_accepts_extra_capability_bits() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("caps.hmod");
        let mut header = ModelHeader::new(ModelDomain::Text, QuantizationKind::Int4);
        header.capabilities = Capabilities::from_bits_retain(0x4000_0001);
        super::super::write(&path, &header, None, &dense_blob()).expect("write");
        let tok = WordTokenizer::new();
        assert!(load_model(&path, &tok).is_ok());
    }

    #[test]
    fn test_load_rejects_fp32() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("fp32.hmod");
        let header = ModelHeader::new(ModelDomain::Text, QuantizationKind::Fp32);
        super::super::write(&path, &header, None, &dense_blob()).expect("write");
        let tok = WordTokenizer::new();
        assert!(load_model(&path, &tok).is_err());
    }

    #[test]
    fn test_load_unknown_quant_as_int4() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("unknown.hmod");
        let header = ModelHeader::new(ModelDomain::Text, QuantizationKind::Unknown);
        super::super::write(&path, &header, None, &dense_blob()).expect("write");
        let tok = WordTokenizer::new();
        let model = load_model(&path, &tok).expect("load");
        assert_eq!(model.layers()[0].weights().bit_width(), BitWidth::B4);
        assert_eq!(model.hidden_size(), 2);
    }
}
