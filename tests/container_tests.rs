//! Container integration tests
//!
//! Write, read and verify real files through `tempfile` directories.

use std::fs;
use std::path::PathBuf;

use hyperion::format::{self, ModelDomain, ModelHeader, ModelMetadata, QuantizationKind, HEADER_SIZE, METADATA_SIZE};
use hyperion::HyperionError;
use tempfile::TempDir;

fn metadata() -> ModelMetadata {
    ModelMetadata {
        name: "tiny".into(),
        author: "tests".into(),
        description: "container fixture".into(),
        vocab_size: 9,
        context_window: 8,
        embedding_size: 4,
        ..ModelMetadata::default()
    }
}

fn write_fixture(header: &ModelHeader) -> (TempDir, PathBuf, Vec<u8>) {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("model.hmod");
    let weights: Vec<u8> = (0..=255u8).cycle().take(10_000).collect();
    format::write(&path, header, Some(&metadata()), &weights).expect("write");
    (dir, path, weights)
}

// ============================================================================
// Round Trip
// ============================================================================

#[test]
fn test_write_then_read_round_trip() {
    let header = ModelHeader::new(ModelDomain::Text, QuantizationKind::Int4);
    let (_dir, path, weights) = write_fixture(&header);

    let file = format::read(&path, true).expect("read");
    assert_eq!(file.header.metadata_length as usize, METADATA_SIZE);
    assert_eq!(file.header.weights_length, weights.len() as u64);
    assert_eq!(file.metadata, metadata());
    assert_eq!(file.weights.as_deref(), Some(weights.as_slice()));

    let on_disk = fs::metadata(&path).expect("stat").len() as usize;
    assert_eq!(on_disk, HEADER_SIZE + METADATA_SIZE + weights.len());
}

#[test]
fn test_read_without_weights() {
    let header = ModelHeader::new(ModelDomain::Text, QuantizationKind::Int8);
    let (_dir, path, _) = write_fixture(&header);
    let file = format::read(&path, false).expect("read");
    assert!(file.weights.is_none());
    assert_eq!(file.metadata.name, "tiny");
}

#[test]
fn test_write_then_verify_succeeds() {
    let header = ModelHeader::new(ModelDomain::Text, QuantizationKind::Int4);
    let (_dir, path, _) = write_fixture(&header);
    let result = format::verify(&path).expect("verify");
    assert!(result.success);
    assert_eq!(result.expected_checksum, result.actual_checksum);
}

// ============================================================================
// Corruption And Version Gate
// ============================================================================

#[test]
fn test_flipped_weight_byte_detected() {
    let header = ModelHeader::new(ModelDomain::Text, QuantizationKind::Int4);
    let (_dir, path, _) = write_fixture(&header);

    let mut bytes = fs::read(&path).expect("read bytes");
    bytes[HEADER_SIZE + METADATA_SIZE + 17] ^= 0x01;
    fs::write(&path, &bytes).expect("rewrite");

    let result = format::verify(&path).expect("verify");
    assert!(!result.success);
    assert!(result.checksum_mismatch);
    assert!(!result.invalid_magic);
}

#[test]
fn test_flipped_metadata_byte_detected() {
    let header = ModelHeader::new(ModelDomain::Text, QuantizationKind::Int4);
    let (_dir, path, _) = write_fixture(&header);

    let mut bytes = fs::read(&path).expect("read bytes");
    bytes[HEADER_SIZE + 2] ^= 0x20;
    fs::write(&path, &bytes).expect("rewrite");
    assert!(format::verify(&path).expect("verify").checksum_mismatch);
}

#[test]
fn test_major_version_two_rejected() {
    let mut header = ModelHeader::new(ModelDomain::Text, QuantizationKind::Int4);
    header.version_major = 2;
    let (_dir, path, _) = write_fixture(&header);

    assert!(matches!(
        format::read(&path, true),
        Err(HyperionError::Format(_))
    ));
    let result = format::verify(&path).expect("verify");
    assert!(result.version_mismatch);
    assert!(!result.checksum_mismatch);
    assert!(!result.success);
}

#[test]
fn test_truncated_weights() {
    let header = ModelHeader::new(ModelDomain::Text, QuantizationKind::Int4);
    let (_dir, path, _) = write_fixture(&header);

    let bytes = fs::read(&path).expect("read bytes");
    fs::write(&path, &bytes[..bytes.len() - 100]).expect("truncate");

    assert!(matches!(
        format::read(&path, true),
        Err(HyperionError::Format(_))
    ));
    assert!(format::verify(&path).expect("verify").checksum_mismatch);
}

#[test]
fn test_bad_magic_short_circuits() {
    let header = ModelHeader::new(ModelDomain::Text, QuantizationKind::Int4);
    let (_dir, path, _) = write_fixture(&header);

    let mut bytes = fs::read(&path).expect("read bytes");
    bytes[0] = b'X';
    fs::write(&path, &bytes).expect("rewrite");

    let result = format::verify(&path).expect("verify");
    assert!(result.invalid_magic);
    assert!(!result.checksum_mismatch);
    assert!(format::read(&path, false).is_err());
}

#[test]
fn test_missing_file_is_io_error() {
    let dir = tempfile::tempdir().expect("tempdir");
    assert!(matches!(
        format::verify(dir.path().join("absent.hmod")),
        Err(HyperionError::Io(_))
    ));
}
