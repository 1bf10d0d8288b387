//! Model Format Detector & Metadata Extractor (C1).
//!
//! Classifies a filesystem path into one of the recognized [`ModelFormat`]
//! tags and best-effort extracts structural metadata. Detection is a layered
//! decision: directory shape, then extension, then magic bytes, then sibling
//! files. Any layer failing to match falls through to the next; if none
//! match the result is `ModelFormat::Unknown`, never an error, unless the
//! path itself cannot be read.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Closed enumeration of recognized model container formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelFormat {
    Mlmodel,
    Mlpackage,
    Tflite,
    Onnx,
    Ort,
    Safetensors,
    Gguf,
    Ggml,
    Pte,
    Bin,
    Unknown,
}

impl ModelFormat {
    /// The canonical file extension used when laying out installed artifacts.
    pub fn extension(&self) -> &'static str {
        match self {
            ModelFormat::Mlmodel => "mlmodel",
            ModelFormat::Mlpackage => "mlpackage",
            ModelFormat::Tflite => "tflite",
            ModelFormat::Onnx => "onnx",
            ModelFormat::Ort => "ort",
            ModelFormat::Safetensors => "safetensors",
            ModelFormat::Gguf => "gguf",
            ModelFormat::Ggml => "ggml",
            ModelFormat::Pte => "pte",
            ModelFormat::Bin => "bin",
            ModelFormat::Unknown => "bin",
        }
    }

    fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "mlmodel" => Some(ModelFormat::Mlmodel),
            "mlpackage" => Some(ModelFormat::Mlpackage),
            "tflite" => Some(ModelFormat::Tflite),
            "onnx" => Some(ModelFormat::Onnx),
            "ort" => Some(ModelFormat::Ort),
            "safetensors" => Some(ModelFormat::Safetensors),
            "gguf" => Some(ModelFormat::Gguf),
            "ggml" => Some(ModelFormat::Ggml),
            "pte" => Some(ModelFormat::Pte),
            "bin" => Some(ModelFormat::Bin),
            _ => None,
        }
    }
}

/// Inferred tokenizer family, derived from sibling files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TokenizerTag {
    HuggingFace,
    SentencePiece,
    WordPiece,
    Bpe,
}

/// Best-effort structural metadata. Every field may be absent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelMetadata {
    pub author: Option<String>,
    pub description: Option<String>,
    pub version: Option<String>,
    pub model_type: Option<String>,
    pub architecture: Option<String>,
    pub quantization: Option<String>,
    pub context_length: Option<u64>,
    pub parameter_count: Option<u64>,
    pub input_shapes: Vec<String>,
    pub min_memory_bytes: Option<u64>,
    pub tokenizer: Option<TokenizerTag>,
}

/// Result of classifying a path.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectionResult {
    pub format: ModelFormat,
    pub metadata: ModelMetadata,
}

const GGUF_MAGIC: &[u8; 4] = b"GGUF";
// Protobuf messages have no fixed magic, but ONNX model protos begin their
// first field (ir_version, field 1, varint) with byte 0x08 in the overwhelming
// majority of exporter output; treated here as a soft sentinel, never the
// sole basis for a false-positive rejection of an unreadable file.
const ONNX_SENTINEL: u8 = 0x08;
// FlatBuffer files store a 4-byte identifier at offset 4; TFLite's is "TFL3".
const TFLITE_IDENTIFIER: &[u8; 4] = b"TFL3";

/// Classify a path and extract what structural metadata is available.
///
/// Never returns an I/O error for a path that exists but doesn't match any
/// known format — it returns `ModelFormat::Unknown` instead. Returns an
/// error only if `path` cannot be read at all (e.g. missing, permission
/// denied).
pub fn detect(path: impl AsRef<Path>) -> Result<DetectionResult> {
    let path = path.as_ref();
    let file_type = fs::symlink_metadata(path)?.file_type();

    // Layer 1: directory shape.
    if file_type.is_dir() {
        if path.join("Manifest.json").exists() {
            debug!(layer = "directory-shape", path = %path.display(), "detected mlpackage");
            return Ok(DetectionResult {
                format: ModelFormat::Mlpackage,
                metadata: extract_sibling_metadata(path),
            });
        }
        debug!(layer = "directory-shape", path = %path.display(), "unrecognized directory");
        return Ok(DetectionResult {
            format: ModelFormat::Unknown,
            metadata: ModelMetadata::default(),
        });
    }

    // Layer 2: extension.
    if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
        if ext.eq_ignore_ascii_case("mlmodel") {
            debug!(layer = "extension", path = %path.display(), "detected mlmodel");
            return Ok(DetectionResult {
                format: ModelFormat::Mlmodel,
                metadata: extract_sibling_metadata(path),
            });
        }
    }

    // Layer 3: magic bytes.
    if let Some(format) = detect_magic_bytes(path)? {
        debug!(layer = "magic-bytes", path = %path.display(), format = ?format, "detected by magic bytes");
        return Ok(DetectionResult {
            format,
            metadata: extract_sibling_metadata(path),
        });
    }

    // Fall back to extension for formats with no reliable magic (safetensors,
    // ggml, pte, bin) or where magic-byte detection was inconclusive.
    if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
        if let Some(format) = ModelFormat::from_extension(ext) {
            debug!(layer = "extension", path = %path.display(), format = ?format, "detected by extension");
            return Ok(DetectionResult {
                format,
                metadata: extract_sibling_metadata(path),
            });
        }
    }

    debug!(layer = "none", path = %path.display(), "format unknown");
    Ok(DetectionResult {
        format: ModelFormat::Unknown,
        metadata: ModelMetadata::default(),
    })
}

fn detect_magic_bytes(path: &Path) -> Result<Option<ModelFormat>> {
    use std::io::Read;
    let mut file = match fs::File::open(path) {
        Ok(f) => f,
        Err(_) => return Ok(None),
    };
    let mut header = [0u8; 8];
    let read = file.read(&mut header).unwrap_or(0);
    if read < 4 {
        return Ok(None);
    }
    if &header[0..4] == GGUF_MAGIC {
        return Ok(Some(ModelFormat::Gguf));
    }
    if read >= 8 && &header[4..8] == TFLITE_IDENTIFIER {
        return Ok(Some(ModelFormat::Tflite));
    }
    if header[0] == ONNX_SENTINEL
        && path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("onnx"))
    {
        return Ok(Some(ModelFormat::Onnx));
    }
    Ok(None)
}

/// Layer 4: sibling files contribute tokenizer inference and nothing else
/// the binary artifact can't self-describe.
fn extract_sibling_metadata(path: &Path) -> ModelMetadata {
    let dir: PathBuf = if path.is_dir() {
        path.to_path_buf()
    } else {
        path.parent().map(Path::to_path_buf).unwrap_or_default()
    };

    let mut metadata = ModelMetadata::default();
    let Ok(entries) = fs::read_dir(&dir) else {
        return metadata;
    };

    for entry in entries.flatten() {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name == "tokenizer.json" {
            metadata.tokenizer = Some(TokenizerTag::HuggingFace);
        } else if name.starts_with("sentencepiece") {
            metadata.tokenizer = Some(TokenizerTag::SentencePiece);
        } else if name == "vocab.txt" {
            metadata.tokenizer.get_or_insert(TokenizerTag::WordPiece);
        } else if name.ends_with(".bpe") {
            metadata.tokenizer.get_or_insert(TokenizerTag::Bpe);
        }
    }
    metadata
}

/// Parse GGUF's two fixed header fields: the four-byte magic and a
/// little-endian u32 version. Used by both detection and by the download
/// engine's format validation after extraction.
pub fn read_gguf_version(path: impl AsRef<Path>) -> Result<Option<u32>> {
    use std::io::Read;
    let mut file = fs::File::open(path)?;
    let mut header = [0u8; 8];
    if file.read_exact(&mut header).is_err() {
        return Ok(None);
    }
    if &header[0..4] != GGUF_MAGIC {
        return Ok(None);
    }
    Ok(Some(u32::from_le_bytes([
        header[4], header[5], header[6], header[7],
    ])))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_file(dir: &Path, name: &str, bytes: &[u8]) -> PathBuf {
        let path = dir.join(name);
        let mut f = fs::File::create(&path).unwrap();
        f.write_all(bytes).unwrap();
        path
    }

    #[test]
    fn detects_gguf_by_magic_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let mut bytes = GGUF_MAGIC.to_vec();
        bytes.extend_from_slice(&3u32.to_le_bytes());
        let path = write_file(dir.path(), "model.weights", &bytes);

        let result = detect(&path).unwrap();
        assert_eq!(result.format, ModelFormat::Gguf);
        assert_eq!(read_gguf_version(&path).unwrap(), Some(3));
    }

    #[test]
    fn detects_tflite_by_flatbuffer_identifier() {
        let dir = tempfile::tempdir().unwrap();
        let mut bytes = vec![0u8, 0, 0, 0];
        bytes.extend_from_slice(TFLITE_IDENTIFIER);
        let path = write_file(dir.path(), "model.bin", &bytes);

        let result = detect(&path).unwrap();
        assert_eq!(result.format, ModelFormat::Tflite);
    }

    #[test]
    fn detects_mlpackage_directory_shape() {
        let dir = tempfile::tempdir().unwrap();
        let pkg = dir.path().join("model.mlpackage");
        fs::create_dir_all(&pkg).unwrap();
        write_file(&pkg, "Manifest.json", b"{}");

        let result = detect(&pkg).unwrap();
        assert_eq!(result.format, ModelFormat::Mlpackage);
    }

    #[test]
    fn unreadable_magic_bytes_falls_back_to_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(dir.path(), "weights.safetensors", b"not-real-safetensors");

        let result = detect(&path).unwrap();
        assert_eq!(result.format, ModelFormat::Safetensors);
    }

    #[test]
    fn unknown_bytes_short_file_is_unknown_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(dir.path(), "mystery.dat", b"ab");

        let result = detect(&path).unwrap();
        assert_eq!(result.format, ModelFormat::Unknown);
    }

    #[test]
    fn infers_tokenizer_tag_from_siblings() {
        let dir = tempfile::tempdir().unwrap();
        let mut bytes = GGUF_MAGIC.to_vec();
        bytes.extend_from_slice(&1u32.to_le_bytes());
        let path = write_file(dir.path(), "model.gguf", &bytes);
        write_file(dir.path(), "tokenizer.json", b"{}");

        let result = detect(&path).unwrap();
        assert_eq!(result.metadata.tokenizer, Some(TokenizerTag::HuggingFace));
    }

    #[test]
    fn missing_path_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("does-not-exist.gguf");
        assert!(detect(&missing).is_err());
    }
}
