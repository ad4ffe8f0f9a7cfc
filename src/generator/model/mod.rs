//! Model-driven embedding generator
//!
//! # Lifecycle
//!
//! ```text
//! generate()
//!     │
//!     ├─ acquire model (copy or download)      → registrable artifact
//!     ├─ load one replica per device
//!     ├─ dataset over red/green/blue/yellow + sequential loader
//!     │
//!     └─ for seed in seeds, for augmentation in augments:
//!            reseed → batches in index order → score → sigmoid
//!            → image group key → gene (skip if unknown) → row
//! ```
//!
//! Each (seed, augmentation) pass yields its own row per image group; rows
//! are not merged across passes.

pub mod acquire;
pub mod augment;
pub mod dataset;
pub mod densenet;
pub mod scorer;

use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use candle_core::{DType, Device};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use self::acquire::{acquire_model, ModelLocator};
use self::augment::Augmentation;
use self::dataset::{Batch, BatchLoader, ImageGeometry, ProteinImageDataset};
use self::scorer::{available_devices, ReplicatedScorer, ScorerLoader};
use super::{
    not_generated_yet, EmbeddingGenerator, EmbeddingRow, EmbeddingStream, RegistrableArtifact,
};
use crate::constants::{DEFAULT_FOLD, DEFAULT_SUFFIX};
use crate::error::{EmbeddingError, Result};
use crate::provenance::DatasetAttributes;
use crate::translator::IdentifierTranslator;

pub use self::densenet::DensenetLoader;

/// Location of the model inside the published container image
pub const DEFAULT_MODEL_PATH: &str = "/opt/densenet/models/model.pth";

/// Inference settings, loadable from YAML
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelGeneratorConfig {
    pub fold: u32,
    pub suffix: String,
    pub image_size: u32,
    /// 0 disables random cropping
    pub crop_size: u32,
    pub batch_size: usize,
    pub seeds: Vec<u64>,
    pub augments: Vec<String>,
}

impl Default for ModelGeneratorConfig {
    fn default() -> Self {
        Self {
            fold: DEFAULT_FOLD,
            suffix: DEFAULT_SUFFIX.to_string(),
            image_size: 1024,
            crop_size: 0,
            batch_size: 8,
            seeds: vec![0],
            augments: vec![Augmentation::Default.name().to_string()],
        }
    }
}

impl ModelGeneratorConfig {
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let text =
            std::fs::read_to_string(path).map_err(|e| EmbeddingError::file_access(path, e))?;
        Ok(serde_yaml::from_str(&text)?)
    }

    fn augmentations(&self) -> Result<Vec<Augmentation>> {
        self.augments.iter().map(|name| name.parse()).collect()
    }

    fn geometry(&self) -> ImageGeometry {
        ImageGeometry {
            image_size: self.image_size,
            crop_size: self.crop_size,
        }
    }
}

/// Generates embeddings by running a trained classifier over the images
pub struct ModelEmbeddingGenerator {
    inputdir: PathBuf,
    outdir: PathBuf,
    locator: ModelLocator,
    config: ModelGeneratorConfig,
    augmentations: Vec<Augmentation>,
    loader: Box<dyn ScorerLoader>,
    devices: Option<Vec<Device>>,
    translator: IdentifierTranslator,
    started: bool,
    artifacts: Option<Vec<RegistrableArtifact>>,
}

impl ModelEmbeddingGenerator {
    /// `outdir` receives the cached model file; it is normally the run's output directory
    pub fn new(
        inputdir: impl Into<PathBuf>,
        outdir: impl Into<PathBuf>,
        model_path: &str,
        config: ModelGeneratorConfig,
        loader: Box<dyn ScorerLoader>,
    ) -> Result<Self> {
        if config.seeds.is_empty() {
            return Err(EmbeddingError::configuration("at least one seed is required"));
        }
        if config.augments.is_empty() {
            return Err(EmbeddingError::configuration(
                "at least one augmentation is required",
            ));
        }
        if config.batch_size == 0 {
            return Err(EmbeddingError::configuration("batch_size must be positive"));
        }
        let augmentations = config.augmentations()?;
        let inputdir = inputdir.into();
        let translator = IdentifierTranslator::new(&inputdir, config.fold)?;

        Ok(Self {
            inputdir,
            outdir: outdir.into(),
            locator: ModelLocator::parse(model_path),
            config,
            augmentations,
            loader,
            devices: None,
            translator,
            started: false,
            artifacts: None,
        })
    }

    /// DenseNet-121 generator with default settings
    pub fn densenet(
        inputdir: impl Into<PathBuf>,
        outdir: impl Into<PathBuf>,
        model_path: &str,
    ) -> Result<Self> {
        Self::new(
            inputdir,
            outdir,
            model_path,
            ModelGeneratorConfig::default(),
            Box::new(DensenetLoader),
        )
    }

    /// Pin replicas to specific devices instead of probing
    pub fn with_devices(mut self, devices: Vec<Device>) -> Self {
        self.devices = Some(devices);
        self
    }

    pub fn config(&self) -> &ModelGeneratorConfig {
        &self.config
    }

    pub fn locator(&self) -> &ModelLocator {
        &self.locator
    }

    fn model_description(&self, model_file: &Path) -> DatasetAttributes {
        let data_format = model_file
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("pth")
            .to_string();
        DatasetAttributes {
            name: "Image embedding model".to_string(),
            description: format!("Trained classification model obtained from {}", self.locator),
            author: "Human Protein Atlas image classification".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            data_format,
            date_published: chrono::Utc::now().format("%Y-%m-%d").to_string(),
            keywords: vec!["model".to_string(), "image embedding".to_string()],
            url: Some(self.locator.to_string()),
        }
    }
}

impl EmbeddingGenerator for ModelEmbeddingGenerator {
    fn dimensions(&self) -> usize {
        self.loader.feature_dim()
    }

    fn generate(&mut self) -> Result<EmbeddingStream<'_>> {
        if self.started {
            return Err(EmbeddingError::State(
                "model generator already ran; create a new generator to run again".to_string(),
            ));
        }
        self.started = true;

        let model_file = acquire_model(&self.locator, &self.outdir)?;
        self.artifacts = Some(vec![RegistrableArtifact {
            description: self.model_description(&model_file),
            path: model_file.clone(),
        }]);

        let devices = self.devices.clone().unwrap_or_else(available_devices);
        let scorer = ReplicatedScorer::load(self.loader.as_ref(), &model_file, &devices)?;
        let dataset =
            ProteinImageDataset::new(&self.inputdir, &self.config.suffix, self.config.geometry())?;

        let passes: VecDeque<(u64, Augmentation)> = self
            .config
            .seeds
            .iter()
            .flat_map(|&seed| self.augmentations.iter().map(move |&aug| (seed, aug)))
            .collect();
        info!(
            "Running {} inference passes over {} image groups",
            passes.len(),
            dataset.len()
        );

        Ok(Box::new(InferenceSweep {
            scorer,
            dataset,
            translator: &self.translator,
            dimensions: self.loader.feature_dim(),
            batch_size: self.config.batch_size,
            passes,
            loader: None,
            pending: VecDeque::new(),
            failed: false,
        }))
    }

    fn datasets_needing_registration(&self) -> Result<&[RegistrableArtifact]> {
        self.artifacts.as_deref().ok_or_else(not_generated_yet)
    }
}

/// Lazy iteration over every (seed, augmentation) pass
struct InferenceSweep<'a> {
    scorer: ReplicatedScorer,
    dataset: ProteinImageDataset,
    translator: &'a IdentifierTranslator,
    dimensions: usize,
    batch_size: usize,
    passes: VecDeque<(u64, Augmentation)>,
    loader: Option<BatchLoader>,
    pending: VecDeque<EmbeddingRow>,
    failed: bool,
}

impl InferenceSweep<'_> {
    /// Fill `pending` with the next batch; `false` once every pass is done
    fn advance(&mut self) -> Result<bool> {
        loop {
            if let Some(loader) = self.loader.as_mut() {
                if let Some(batch) = loader.next_batch(&mut self.dataset)? {
                    self.score_batch(batch)?;
                    return Ok(true);
                }
                self.loader = None;
            }
            let Some((seed, augmentation)) = self.passes.pop_front() else {
                return Ok(false);
            };
            info!("Inference pass: seed {} augmentation {}", seed, augmentation);
            self.dataset.begin_pass(seed, augmentation);
            self.scorer.reseed(seed)?;
            self.loader = Some(BatchLoader::new(self.batch_size));
        }
    }

    fn score_batch(&mut self, batch: Batch) -> Result<()> {
        let scored = self.scorer.score(&batch.images)?;
        let features = scored.features.to_dtype(DType::F32)?.to_vec2::<f32>()?;
        let probabilities = candle_nn::ops::sigmoid(&scored.logits.to_dtype(DType::F32)?)?
            .to_vec2::<f32>()?;
        if features.len() != batch.indices.len() || probabilities.len() != batch.indices.len() {
            return Err(EmbeddingError::State(format!(
                "scorer returned {} rows for a batch of {}",
                features.len(),
                batch.indices.len()
            )));
        }

        for ((index, embedding), probabilities) in
            batch.indices.iter().zip(features).zip(probabilities)
        {
            if embedding.len() != self.dimensions {
                return Err(EmbeddingError::State(format!(
                    "scorer produced {} features, expected {}",
                    embedding.len(),
                    self.dimensions
                )));
            }
            let key = self.dataset.key(*index);
            match self.translator.lookup(key) {
                Some(gene) => self.pending.push_back(EmbeddingRow {
                    gene: gene.to_string(),
                    embedding,
                    probabilities,
                }),
                None => debug!("No gene for image group {}, skipping", key),
            }
        }
        Ok(())
    }
}

impl Iterator for InferenceSweep<'_> {
    type Item = Result<EmbeddingRow>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(row) = self.pending.pop_front() {
                return Some(Ok(row));
            }
            if self.failed {
                return None;
            }
            match self.advance() {
                Ok(true) => continue,
                Ok(false) => return None,
                Err(e) => {
                    self.failed = true;
                    return Some(Err(e));
                }
            }
        }
    }
}
