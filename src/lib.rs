//! Cell Maps Image Embedding
//!
//! Turns Human Protein Atlas immunofluorescence images into one embedding
//! vector and one set of subcellular compartment probabilities per gene.
//!
//! # Architecture
//!
//! ```text
//! inputdir/{red,green,blue,yellow}/<key><channel><suffix>
//! inputdir/1_image_gene_node_attributes.tsv
//!       │
//!       ▼
//! ┌─────────────────────────────────────────┐
//! │  EmbeddingGenerator                     │
//! │  Synthetic: random vectors              │
//! │  Model: acquire → replicate → sweep     │
//! │  image group key → gene (translator)    │
//! └─────────────────────────────────────────┘
//!       │  lazy stream of EmbeddingRow
//!       ▼
//! ┌─────────────────────────────────────────┐
//! │  EmbeddingPipelineRunner                │
//! │  image_emd.tsv   ("" 1..D)              │
//! │  labels_prob.tsv ("" + 28 labels)       │
//! └─────────────────────────────────────────┘
//!       │
//!       ▼
//! ┌─────────────────────────────────────────┐
//! │  ProvenanceRecorder                     │
//! │  crate, software, datasets, computation │
//! └─────────────────────────────────────────┘
//! ```

pub mod constants;
pub mod error;
pub mod generator;
pub mod logging;
pub mod provenance;
pub mod runner;
pub mod task_record;
pub mod translator;

pub use error::{EmbeddingError, ProvenanceError, Result};
pub use generator::model::{DensenetLoader, DEFAULT_MODEL_PATH};
pub use generator::{
    EmbeddingGenerator, EmbeddingRow, EmbeddingStream, ModelEmbeddingGenerator,
    ModelGeneratorConfig, RegistrableArtifact, SyntheticEmbeddingGenerator,
};
pub use provenance::{LocalProvenance, ProvenanceRecorder};
pub use runner::{EmbeddingPipelineRunner, EmbeddingPipelineRunnerBuilder, FallbackIdentity};
pub use translator::IdentifierTranslator;
