//! Scorer abstraction and device replication
//!
//! A scorer maps an image batch `[B, 4, S, S]` to feature vectors `[B, D]`
//! and raw class logits `[B, C]`. The generator never looks inside it.
//! [`ReplicatedScorer`] loads one replica per available device and splits
//! each batch across them, re-joining the results in input order.

use std::path::Path;

use candle_core::{Device, Tensor};
use tracing::{debug, info};

use crate::error::{EmbeddingError, Result};

/// Upper bound on CUDA ordinals probed at startup
const MAX_REPLICAS: usize = 16;

/// Features and logits for one batch
pub struct ScoredBatch {
    pub features: Tensor,
    pub logits: Tensor,
}

/// A loaded, evaluation-mode model
pub trait ImageScorer {
    fn device(&self) -> &Device;

    fn score(&self, images: &Tensor) -> Result<ScoredBatch>;
}

/// Builds scorers from a weights file
pub trait ScorerLoader {
    /// Width of the feature vectors produced by loaded scorers
    fn feature_dim(&self) -> usize;

    fn load(&self, weights: &Path, device: &Device) -> Result<Box<dyn ImageScorer>>;
}

/// Every usable accelerator, or the CPU when there is none
pub fn available_devices() -> Vec<Device> {
    let mut devices = Vec::new();

    if candle_core::utils::cuda_is_available() {
        for ordinal in 0..MAX_REPLICAS {
            match Device::new_cuda(ordinal) {
                Ok(device) => {
                    info!("Using CUDA device {}", ordinal);
                    devices.push(device);
                }
                Err(e) => {
                    debug!("CUDA device {} not available: {}", ordinal, e);
                    break;
                }
            }
        }
    } else if candle_core::utils::metal_is_available() {
        match Device::new_metal(0) {
            Ok(device) => {
                info!("Using Metal device 0");
                devices.push(device);
            }
            Err(e) => debug!("Metal not available: {}", e),
        }
    }

    if devices.is_empty() {
        info!("Using CPU device");
        devices.push(Device::Cpu);
    }
    devices
}

/// Data-parallel wrapper: one replica per device
pub struct ReplicatedScorer {
    replicas: Vec<Box<dyn ImageScorer>>,
}

impl ReplicatedScorer {
    pub fn load(loader: &dyn ScorerLoader, weights: &Path, devices: &[Device]) -> Result<Self> {
        let replicas = devices
            .iter()
            .map(|device| loader.load(weights, device))
            .collect::<Result<Vec<_>>>()?;
        Self::from_replicas(replicas)
    }

    pub fn from_replicas(replicas: Vec<Box<dyn ImageScorer>>) -> Result<Self> {
        if replicas.is_empty() {
            return Err(EmbeddingError::configuration(
                "at least one scorer replica is required",
            ));
        }
        info!(
            "Model loaded on {} replica{}",
            replicas.len(),
            if replicas.len() == 1 { "" } else { "s" }
        );
        Ok(Self { replicas })
    }

    pub fn replica_count(&self) -> usize {
        self.replicas.len()
    }

    /// Reseed accelerator RNG streams; the CPU stream cannot be reseeded
    pub fn reseed(&self, seed: u64) -> Result<()> {
        for replica in &self.replicas {
            let device = replica.device();
            if !device.is_cpu() {
                device.set_seed(seed)?;
            }
        }
        Ok(())
    }

    /// Score a CPU batch, returning CPU tensors in input order
    pub fn score(&self, images: &Tensor) -> Result<ScoredBatch> {
        let batch = images.dim(0)?;
        if self.replicas.len() == 1 || batch <= 1 {
            return score_on(self.replicas[0].as_ref(), images);
        }

        let shard = batch.div_ceil(self.replicas.len());
        let mut features = Vec::new();
        let mut logits = Vec::new();
        for (i, replica) in self.replicas.iter().enumerate() {
            let start = i * shard;
            if start >= batch {
                break;
            }
            let len = shard.min(batch - start);
            let scored = score_on(replica.as_ref(), &images.narrow(0, start, len)?)?;
            features.push(scored.features);
            logits.push(scored.logits);
        }
        Ok(ScoredBatch {
            features: Tensor::cat(&features, 0)?,
            logits: Tensor::cat(&logits, 0)?,
        })
    }
}

fn score_on(replica: &dyn ImageScorer, images: &Tensor) -> Result<ScoredBatch> {
    let input = images.to_device(replica.device())?;
    let scored = replica.score(&input)?;
    Ok(ScoredBatch {
        features: scored.features.to_device(&Device::Cpu)?,
        logits: scored.logits.to_device(&Device::Cpu)?,
    })
}
