//! Model generator with a stub scorer in place of DenseNet

use std::fs;
use std::path::{Path, PathBuf};

use candle_core::{DType, Device, Tensor};
use image::{GrayImage, Luma};

use cellmaps_image_embedding::constants::{CHANNELS, NUM_CLASSES};
use cellmaps_image_embedding::generator::model::scorer::{ImageScorer, ScoredBatch, ScorerLoader};
use cellmaps_image_embedding::{
    EmbeddingError, EmbeddingGenerator, ModelEmbeddingGenerator, ModelGeneratorConfig, Result,
};

/// Features are per-channel means, logits are all zero
struct MeanScorer {
    device: Device,
}

impl ImageScorer for MeanScorer {
    fn device(&self) -> &Device {
        &self.device
    }

    fn score(&self, images: &Tensor) -> Result<ScoredBatch> {
        let batch = images.dim(0)?;
        Ok(ScoredBatch {
            features: images.mean((2, 3))?,
            logits: Tensor::zeros((batch, NUM_CLASSES), DType::F32, &self.device)?,
        })
    }
}

struct MeanLoader;

impl ScorerLoader for MeanLoader {
    fn feature_dim(&self) -> usize {
        CHANNELS.len()
    }

    fn load(&self, weights: &Path, device: &Device) -> Result<Box<dyn ImageScorer>> {
        assert!(weights.is_file(), "weights not acquired: {}", weights.display());
        Ok(Box::new(MeanScorer {
            device: device.clone(),
        }))
    }
}

/// Three image groups; only the first two appear in the side table
fn input_dir(root: &Path) -> PathBuf {
    let inputdir = root.join("input");
    let groups = [("35_H1_1_", 51u8), ("669_H5_1_", 102), ("999_Z9_9_", 204)];
    for channel in CHANNELS {
        let dir = inputdir.join(channel);
        fs::create_dir_all(&dir).unwrap();
        for (key, value) in groups {
            GrayImage::from_pixel(8, 8, Luma([value]))
                .save(dir.join(format!("{}{}.png", key, channel)))
                .unwrap();
        }
    }
    fs::write(
        inputdir.join("1_image_gene_node_attributes.tsv"),
        "name\tfilename\nPPFIBP1\t35_H1_1_\nACTN1\t669_H5_1_\n",
    )
    .unwrap();
    inputdir
}

/// Same groups as `input_dir`, every plane a gradient of `10 * x + y`
fn gradient_input_dir(root: &Path) -> PathBuf {
    let inputdir = input_dir(root);
    for channel in CHANNELS {
        for key in ["35_H1_1_", "669_H5_1_", "999_Z9_9_"] {
            GrayImage::from_fn(8, 8, |x, y| Luma([(10 * x + y) as u8]))
                .save(inputdir.join(channel).join(format!("{}{}.png", key, channel)))
                .unwrap();
        }
    }
    inputdir
}

fn model_file(root: &Path) -> String {
    let path = root.join("weights.bin");
    fs::write(&path, b"not really weights").unwrap();
    path.display().to_string()
}

fn config(seeds: Vec<u64>, augments: &[&str]) -> ModelGeneratorConfig {
    ModelGeneratorConfig {
        suffix: ".png".to_string(),
        image_size: 8,
        batch_size: 2,
        seeds,
        augments: augments.iter().map(|a| a.to_string()).collect(),
        ..Default::default()
    }
}

fn generator(root: &Path, config: ModelGeneratorConfig) -> ModelEmbeddingGenerator {
    ModelEmbeddingGenerator::new(
        input_dir(root),
        root.join("out"),
        &model_file(root),
        config,
        Box::new(MeanLoader),
    )
    .unwrap()
    .with_devices(vec![Device::Cpu])
}

#[test]
fn test_rows_per_pass_skip_unresolved() {
    let tmp = tempfile::tempdir().unwrap();
    let mut generator = generator(tmp.path(), config(vec![0, 1], &["default", "flipud"]));
    assert_eq!(4, generator.dimensions());

    let rows: Vec<_> = generator
        .generate()
        .unwrap()
        .collect::<Result<Vec<_>>>()
        .unwrap();
    assert_eq!(8, rows.len());

    let genes: Vec<&str> = rows.iter().map(|r| r.gene.as_str()).collect();
    assert_eq!(vec!["PPFIBP1", "ACTN1"], genes[..2].to_vec());
    assert!(genes.iter().all(|g| *g == "PPFIBP1" || *g == "ACTN1"));

    for row in &rows {
        assert_eq!(4, row.embedding.len());
        assert_eq!(NUM_CLASSES, row.probabilities.len());
        assert!(row.probabilities.iter().all(|p| (p - 0.5).abs() < 1e-6));
    }
    // 102 / 255 in every channel, whatever the augmentation
    let actn1 = &rows[1].embedding;
    assert!(actn1.iter().all(|v| (v - 0.4).abs() < 1e-4));
}

#[test]
fn test_model_registered_with_locator() {
    let tmp = tempfile::tempdir().unwrap();
    let mut generator = generator(tmp.path(), config(vec![0], &["default"]));
    assert!(matches!(
        generator.datasets_needing_registration(),
        Err(EmbeddingError::State(_))
    ));

    let rows = generator.generate().unwrap().count();
    assert_eq!(2, rows);

    let artifacts = generator.datasets_needing_registration().unwrap();
    assert_eq!(1, artifacts.len());
    assert_eq!(tmp.path().join("out").join("weights.bin"), artifacts[0].path);
    assert!(artifacts[0].path.is_file());
    assert_eq!(
        Some(tmp.path().join("weights.bin").display().to_string()),
        artifacts[0].description.url
    );
}

#[test]
fn test_second_generate_is_rejected() {
    let tmp = tempfile::tempdir().unwrap();
    let mut generator = generator(tmp.path(), config(vec![0], &["default"]));
    generator.generate().unwrap().for_each(drop);
    assert!(matches!(generator.generate(), Err(EmbeddingError::State(_))));
}

#[test]
fn test_unknown_augmentation_fails_at_construction() {
    let tmp = tempfile::tempdir().unwrap();
    let result = ModelEmbeddingGenerator::new(
        input_dir(tmp.path()),
        tmp.path().join("out"),
        &model_file(tmp.path()),
        config(vec![0], &["rotate45"]),
        Box::new(MeanLoader),
    );
    assert!(matches!(result, Err(EmbeddingError::Configuration(_))));
}

#[test]
fn test_missing_side_table_is_fatal() {
    let tmp = tempfile::tempdir().unwrap();
    let inputdir = input_dir(tmp.path());
    fs::remove_file(inputdir.join("1_image_gene_node_attributes.tsv")).unwrap();
    let result = ModelEmbeddingGenerator::new(
        inputdir,
        tmp.path().join("out"),
        &model_file(tmp.path()),
        config(vec![0], &["default"]),
        Box::new(MeanLoader),
    );
    assert!(matches!(result, Err(EmbeddingError::FileAccess { .. })));
}

#[test]
fn test_crop_follows_seed_and_augmentation() {
    let tmp = tempfile::tempdir().unwrap();
    let config = ModelGeneratorConfig {
        crop_size: 3,
        ..config(vec![5, 5, 0], &["default", "flipud_lr"])
    };
    let mut generator = ModelEmbeddingGenerator::new(
        gradient_input_dir(tmp.path()),
        tmp.path().join("out"),
        &model_file(tmp.path()),
        config,
        Box::new(MeanLoader),
    )
    .unwrap()
    .with_devices(vec![Device::Cpu]);

    let rows: Vec<_> = generator
        .generate()
        .unwrap()
        .collect::<Result<Vec<_>>>()
        .unwrap();
    // 3 seeds x 2 augmentations x 2 resolved groups
    assert_eq!(12, rows.len());
    let first_group = |pass: usize| &rows[pass * 2].embedding;

    // seed 5 again gives the same crop
    assert_eq!(first_group(0), first_group(2));
    assert_eq!(first_group(1), first_group(3));

    // flipping both axes moves the cropped window's contents
    assert_ne!(first_group(0), first_group(1));

    // seed 0 disables cropping: full-plane mean of 38.5
    let uncropped = 38.5 / 255.0;
    for pass in [4, 5] {
        assert!(first_group(pass).iter().all(|v| (v - uncropped).abs() < 1e-5));
    }
    // a 3x3 window mean is a whole number, never 38.5
    assert!(first_group(0).iter().all(|v| (v - uncropped).abs() > 1e-3));
}
