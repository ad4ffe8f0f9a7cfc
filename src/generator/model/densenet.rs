//! DenseNet-121 with the HPA classification head
//!
//! Backbone follows the torchvision layout with a four channel stem
//! (red, green, blue, yellow). The head pools the final feature map two ways:
//!
//! ```text
//! features [B, 1024, h, w]
//!       │
//!       ├── mean over (h, w) ──┐
//!       └── max over (h, w) ───┴─► concat [B, 2048]
//!                                     │
//!                          bn1 → fc1 → relu → bn2   ──► embedding [B, 1024]
//!                                                        │
//!                                                      logit ──► logits [B, 28]
//! ```
//!
//! Weight names: `features.conv0`, `features.norm0`,
//! `features.denseblock{1..4}.denselayer{n}.{norm1,conv1,norm2,conv2}`,
//! `features.transition{1..3}.{norm,conv}`, `features.norm5`, `bn1`, `fc1`,
//! `bn2`, `logit`.

use std::collections::HashMap;
use std::path::Path;

use candle_core::{DType, Device, Tensor};
use candle_nn::{
    batch_norm, conv2d_no_bias, linear, BatchNorm, Conv2d, Conv2dConfig, Linear, Module,
    VarBuilder,
};
use tracing::{debug, info};

use super::scorer::{ImageScorer, ScoredBatch, ScorerLoader};
use crate::constants::{CHANNELS, NUM_CLASSES};
use crate::error::Result;

/// Width of the embedding produced by the head
pub const FEATURE_DIM: usize = 1024;

const GROWTH_RATE: usize = 32;
const BN_SIZE: usize = 4;
const INIT_FEATURES: usize = 64;
const BLOCK_CONFIG: [usize; 4] = [6, 12, 24, 16];
const BN_EPS: f64 = 1e-5;

struct DenseLayer {
    norm1: BatchNorm,
    conv1: Conv2d,
    norm2: BatchNorm,
    conv2: Conv2d,
}

impl DenseLayer {
    fn load(in_features: usize, vb: VarBuilder) -> candle_core::Result<Self> {
        let bottleneck = BN_SIZE * GROWTH_RATE;
        let padded = Conv2dConfig {
            padding: 1,
            ..Default::default()
        };
        Ok(Self {
            norm1: batch_norm(in_features, BN_EPS, vb.pp("norm1"))?,
            conv1: conv2d_no_bias(in_features, bottleneck, 1, Default::default(), vb.pp("conv1"))?,
            norm2: batch_norm(bottleneck, BN_EPS, vb.pp("norm2"))?,
            conv2: conv2d_no_bias(bottleneck, GROWTH_RATE, 3, padded, vb.pp("conv2"))?,
        })
    }

    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        let ys = xs
            .apply_t(&self.norm1, false)?
            .relu()?
            .apply(&self.conv1)?
            .apply_t(&self.norm2, false)?
            .relu()?
            .apply(&self.conv2)?;
        Tensor::cat(&[xs, &ys], 1)
    }
}

struct Transition {
    norm: BatchNorm,
    conv: Conv2d,
}

impl Transition {
    fn load(in_features: usize, out_features: usize, vb: VarBuilder) -> candle_core::Result<Self> {
        Ok(Self {
            norm: batch_norm(in_features, BN_EPS, vb.pp("norm"))?,
            conv: conv2d_no_bias(in_features, out_features, 1, Default::default(), vb.pp("conv"))?,
        })
    }

    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        xs.apply_t(&self.norm, false)?
            .relu()?
            .apply(&self.conv)?
            .avg_pool2d(2)
    }
}

struct DenseBlock {
    layers: Vec<DenseLayer>,
    transition: Option<Transition>,
}

pub struct DensenetClassifier {
    conv0: Conv2d,
    norm0: BatchNorm,
    blocks: Vec<DenseBlock>,
    norm5: BatchNorm,
    bn1: BatchNorm,
    fc1: Linear,
    bn2: BatchNorm,
    logit: Linear,
}

impl DensenetClassifier {
    pub fn load(vb: VarBuilder) -> candle_core::Result<Self> {
        let features = vb.pp("features");
        let stem = Conv2dConfig {
            padding: 3,
            stride: 2,
            ..Default::default()
        };
        let conv0 = conv2d_no_bias(CHANNELS.len(), INIT_FEATURES, 7, stem, features.pp("conv0"))?;
        let norm0 = batch_norm(INIT_FEATURES, BN_EPS, features.pp("norm0"))?;

        let mut width = INIT_FEATURES;
        let mut blocks = Vec::with_capacity(BLOCK_CONFIG.len());
        for (i, &num_layers) in BLOCK_CONFIG.iter().enumerate() {
            let block_vb = features.pp(format!("denseblock{}", i + 1));
            let mut layers = Vec::with_capacity(num_layers);
            for j in 0..num_layers {
                layers.push(DenseLayer::load(
                    width + j * GROWTH_RATE,
                    block_vb.pp(format!("denselayer{}", j + 1)),
                )?);
            }
            width += num_layers * GROWTH_RATE;

            let transition = if i + 1 < BLOCK_CONFIG.len() {
                let t = Transition::load(width, width / 2, features.pp(format!("transition{}", i + 1)))?;
                width /= 2;
                Some(t)
            } else {
                None
            };
            blocks.push(DenseBlock { layers, transition });
        }
        debug!("DenseNet backbone width {}", width);

        Ok(Self {
            conv0,
            norm0,
            blocks,
            norm5: batch_norm(width, BN_EPS, features.pp("norm5"))?,
            bn1: batch_norm(width * 2, BN_EPS, vb.pp("bn1"))?,
            fc1: linear(width * 2, FEATURE_DIM, vb.pp("fc1"))?,
            bn2: batch_norm(FEATURE_DIM, BN_EPS, vb.pp("bn2"))?,
            logit: linear(FEATURE_DIM, NUM_CLASSES, vb.pp("logit"))?,
        })
    }

    /// Returns (embedding, logits)
    pub fn forward(&self, images: &Tensor) -> candle_core::Result<(Tensor, Tensor)> {
        // Post-ReLU activations are non-negative, so zero padding matches -inf padding here
        let mut xs = images
            .apply(&self.conv0)?
            .apply_t(&self.norm0, false)?
            .relu()?
            .pad_with_zeros(2, 1, 1)?
            .pad_with_zeros(3, 1, 1)?
            .max_pool2d_with_stride(3, 2)?;

        for block in &self.blocks {
            for layer in &block.layers {
                xs = layer.forward(&xs)?;
            }
            if let Some(transition) = &block.transition {
                xs = transition.forward(&xs)?;
            }
        }
        let xs = xs.apply_t(&self.norm5, false)?.relu()?;

        let avg = xs.mean((2, 3))?;
        let max = xs.flatten_from(2)?.max(2)?;
        let pooled = Tensor::cat(&[&avg, &max], 1)?;

        let embedding = pooled
            .apply_t(&self.bn1, false)?
            .apply(&self.fc1)?
            .relu()?
            .apply_t(&self.bn2, false)?;
        let logits = self.logit.forward(&embedding)?;
        Ok((embedding, logits))
    }
}

struct DensenetScorer {
    model: DensenetClassifier,
    device: Device,
}

impl ImageScorer for DensenetScorer {
    fn device(&self) -> &Device {
        &self.device
    }

    fn score(&self, images: &Tensor) -> Result<ScoredBatch> {
        let (features, logits) = self.model.forward(&images.to_dtype(DType::F32)?)?;
        Ok(ScoredBatch { features, logits })
    }
}

/// Loads [`DensenetClassifier`] weights from `.safetensors` or `.pth`
#[derive(Debug, Default, Clone, Copy)]
pub struct DensenetLoader;

impl ScorerLoader for DensenetLoader {
    fn feature_dim(&self) -> usize {
        FEATURE_DIM
    }

    fn load(&self, weights: &Path, device: &Device) -> Result<Box<dyn ImageScorer>> {
        info!("Loading DenseNet weights from {}", weights.display());
        let vb = load_var_builder(weights, device)?;
        let model = DensenetClassifier::load(vb)?;
        Ok(Box::new(DensenetScorer {
            model,
            device: device.clone(),
        }))
    }
}

fn load_var_builder(path: &Path, device: &Device) -> Result<VarBuilder<'static>> {
    let is_safetensors = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("safetensors"));
    if is_safetensors {
        // SAFETY: the file is not modified while mapped
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[path], DType::F32, device)? };
        return Ok(vb);
    }

    // Training checkpoints nest weights under `state_dict`; plain state dicts don't
    let tensors = candle_core::pickle::read_all_with_key(path, Some("state_dict"))
        .or_else(|_| candle_core::pickle::read_all_with_key(path, None))?;
    Ok(VarBuilder::from_tensors(
        strip_replica_prefix(tensors),
        DType::F32,
        device,
    ))
}

/// Drop the `module.` prefix left by multi-replica training wrappers
fn strip_replica_prefix(tensors: Vec<(String, Tensor)>) -> HashMap<String, Tensor> {
    tensors
        .into_iter()
        .map(|(name, tensor)| match name.strip_prefix("module.") {
            Some(stripped) => (stripped.to_string(), tensor),
            None => (name, tensor),
        })
        .collect()
}
