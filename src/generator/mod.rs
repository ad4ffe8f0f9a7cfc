//! Embedding generators
//!
//! A generator turns the images under an input directory into a lazy stream
//! of [`EmbeddingRow`]s, one per image group that resolves to a gene. Two
//! strategies are provided:
//!
//! - [`SyntheticEmbeddingGenerator`]: random vectors, no model required
//! - [`ModelEmbeddingGenerator`]: batched inference with a trained scorer
//!
//! The runner only sees the [`EmbeddingGenerator`] trait.

pub mod model;
pub mod synthetic;

use std::path::{Path, PathBuf};

use crate::error::{EmbeddingError, Result};
use crate::provenance::DatasetAttributes;

pub use model::{ModelEmbeddingGenerator, ModelGeneratorConfig};
pub use synthetic::SyntheticEmbeddingGenerator;

/// One generated record: gene, embedding and per-label probabilities
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingRow {
    pub gene: String,
    pub embedding: Vec<f32>,
    pub probabilities: Vec<f32>,
}

/// A file the generator created or fetched that must be recorded as provenance
#[derive(Debug, Clone)]
pub struct RegistrableArtifact {
    pub description: DatasetAttributes,
    pub path: PathBuf,
}

/// Lazy, single-pass stream of generated rows
pub type EmbeddingStream<'a> = Box<dyn Iterator<Item = Result<EmbeddingRow>> + 'a>;

/// A way of producing an embedding for each gene
pub trait EmbeddingGenerator {
    /// Width of every embedding this generator yields
    fn dimensions(&self) -> usize;

    /// Start generation; the returned stream is consumed once
    fn generate(&mut self) -> Result<EmbeddingStream<'_>>;

    /// Artifacts created during generation
    ///
    /// Fails with [`EmbeddingError::State`] until `generate` has been called.
    fn datasets_needing_registration(&self) -> Result<&[RegistrableArtifact]>;
}

/// Image group key for a channel image file name
///
/// `35_H1_1_red.jpg` with suffix `.jpg` gives `35_H1_1_`: the suffix is
/// removed and everything after the last `_` (the channel token) is dropped.
pub fn image_group_key(file_name: &str, suffix: &str) -> Option<String> {
    let stem = file_name.strip_suffix(suffix)?;
    let cut = stem.rfind('_')?;
    Some(stem[..=cut].to_string())
}

/// Sorted image group keys found in a channel directory
pub fn list_image_groups(channel_dir: &Path, suffix: &str) -> Result<Vec<String>> {
    let entries =
        std::fs::read_dir(channel_dir).map_err(|e| EmbeddingError::file_access(channel_dir, e))?;

    let mut keys = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| EmbeddingError::file_access(channel_dir, e))?;
        let file_name = entry.file_name();
        let Some(file_name) = file_name.to_str() else {
            continue;
        };
        if let Some(key) = image_group_key(file_name, suffix) {
            keys.push(key);
        }
    }
    keys.sort();
    keys.dedup();
    Ok(keys)
}

pub(crate) fn not_generated_yet() -> EmbeddingError {
    EmbeddingError::State(
        "datasets_needing_registration called before generation ran".to_string(),
    )
}
