//! Synthetic embeddings for smoke tests and bootstrapping
//!
//! Embedding components are standard normal draws; probabilities are
//! independent uniform(0, 1) draws and do NOT sum to one.

use std::path::{Path, PathBuf};

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::StandardNormal;
use tracing::{debug, info, warn};

use super::{
    list_image_groups, not_generated_yet, EmbeddingGenerator, EmbeddingRow, EmbeddingStream,
    RegistrableArtifact,
};
use crate::constants::{DEFAULT_FOLD, DEFAULT_SUFFIX, NUM_CLASSES, RED};
use crate::error::{EmbeddingError, Result};
use crate::translator::IdentifierTranslator;

pub const DEFAULT_DIMENSIONS: usize = 1024;

/// Logged at construction and again when generation starts
pub const SYNTHETIC_DISCLAIMER: &str =
    "FAKE EMBEDDINGS: output of this run is random data, not derived from any model";

/// Generates random vectors for every image group in the red channel directory
pub struct SyntheticEmbeddingGenerator {
    inputdir: PathBuf,
    dimensions: usize,
    suffix: String,
    translator: IdentifierTranslator,
    rng: ChaCha8Rng,
    artifacts: Option<Vec<RegistrableArtifact>>,
}

impl SyntheticEmbeddingGenerator {
    pub fn new(inputdir: impl Into<PathBuf>, dimensions: usize) -> Result<Self> {
        Self::with_options(inputdir, dimensions, DEFAULT_FOLD, DEFAULT_SUFFIX)
    }

    pub fn with_options(
        inputdir: impl Into<PathBuf>,
        dimensions: usize,
        fold: u32,
        suffix: &str,
    ) -> Result<Self> {
        if dimensions == 0 {
            return Err(EmbeddingError::configuration(
                "dimensions must be a positive integer",
            ));
        }
        let inputdir = inputdir.into();
        let translator = IdentifierTranslator::new(&inputdir, fold)?;

        warn!("{}", SYNTHETIC_DISCLAIMER);

        Ok(Self {
            inputdir,
            dimensions,
            suffix: suffix.to_string(),
            translator,
            rng: ChaCha8Rng::from_entropy(),
            artifacts: None,
        })
    }

    /// Fix the random stream so repeated runs produce identical output
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = ChaCha8Rng::seed_from_u64(seed);
        self
    }

    pub fn inputdir(&self) -> &Path {
        &self.inputdir
    }
}

impl EmbeddingGenerator for SyntheticEmbeddingGenerator {
    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn generate(&mut self) -> Result<EmbeddingStream<'_>> {
        // Repeated here so the warning lands in the run's own log
        warn!("{}", SYNTHETIC_DISCLAIMER);
        let keys = list_image_groups(&self.inputdir.join(RED), &self.suffix)?;
        info!("Generating synthetic embeddings for {} image groups", keys.len());
        self.artifacts.get_or_insert_with(Vec::new);

        let dimensions = self.dimensions;
        let translator = &self.translator;
        let rng = &mut self.rng;

        let rows = keys.into_iter().filter_map(move |key| {
            let Some(gene) = translator.lookup(&key) else {
                debug!("No gene for image group {}, skipping", key);
                return None;
            };
            let embedding = (0..dimensions)
                .map(|_| rng.sample::<f32, _>(StandardNormal))
                .collect();
            let probabilities = (0..NUM_CLASSES).map(|_| rng.gen::<f32>()).collect();
            Some(Ok(EmbeddingRow {
                gene: gene.to_string(),
                embedding,
                probabilities,
            }))
        });
        Ok(Box::new(rows))
    }

    fn datasets_needing_registration(&self) -> Result<&[RegistrableArtifact]> {
        self.artifacts.as_deref().ok_or_else(not_generated_yet)
    }
}
