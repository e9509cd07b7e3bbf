//! Weights-file inspection.
//!
//! Collects the few facts about a GGUF file the service logs when an engine
//! is built. Architecture and quantization are guessed from the filename;
//! a full implementation would parse the GGUF header.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

#[derive(Error, Debug)]
pub enum ModelLoaderError {
    #[error("Model file not found: {0}")]
    FileNotFound(String),

    #[error("Model path is not a regular file: {0}")]
    NotAFile(String),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Metadata extracted from a weights file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelMetadata {
    /// Model family (e.g. "llama", "qwen2"), or "unknown".
    pub architecture: String,

    /// Quantization tag such as "Q4_K_M", or "unknown".
    pub quantization: String,

    /// File size in bytes.
    pub file_size: u64,
}

const ARCHITECTURES: &[(&str, &str)] = &[
    ("tinyllama", "llama"),
    ("llama", "llama"),
    ("qwen", "qwen2"),
    ("mistral", "llama"),
    ("phi", "phi"),
    ("gemma", "gemma"),
];

/// Inspect the weights file at `path`.
pub fn load_metadata(path: &Path) -> Result<ModelMetadata, ModelLoaderError> {
    if !path.exists() {
        return Err(ModelLoaderError::FileNotFound(path.display().to_string()));
    }

    let meta = std::fs::metadata(path)?;
    if !meta.is_file() {
        return Err(ModelLoaderError::NotAFile(path.display().to_string()));
    }

    let stem = path
        .file_stem()
        .and_then(|n| n.to_str())
        .unwrap_or("")
        .to_lowercase();

    let architecture = ARCHITECTURES
        .iter()
        .find(|(needle, _)| stem.contains(needle))
        .map(|(_, arch)| arch.to_string())
        .unwrap_or_else(|| "unknown".to_string());

    let metadata = ModelMetadata {
        architecture,
        quantization: quantization_tag(&stem).unwrap_or_else(|| "unknown".to_string()),
        file_size: meta.len(),
    };

    info!(
        arch = metadata.architecture,
        quant = metadata.quantization,
        bytes = metadata.file_size,
        "Inspected model file"
    );

    Ok(metadata)
}

/// Find a llama.cpp quantization tag (`q4_k_m`, `q8_0`, `f16`, ...) in a
/// lowercase filename stem.
fn quantization_tag(stem: &str) -> Option<String> {
    stem.split(['.', '-'])
        .find(|part| {
            let mut chars = part.chars();
            matches!(chars.next(), Some('q') | Some('f'))
                && chars.next().is_some_and(|c| c.is_ascii_digit())
                && part.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        })
        .map(|part| part.to_uppercase())
}
