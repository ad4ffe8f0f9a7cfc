//! On-disk image dataset and sequential batch loader
//!
//! Each item is one image group: the red, green, blue and yellow planes are
//! read as grayscale, resized to `image_size`, augmented, optionally cropped,
//! and stacked into a `[4, H, W]` float buffer scaled to `[0, 1]`.

use std::path::{Path, PathBuf};

use candle_core::{Device, Tensor};
use image::{imageops, imageops::FilterType, GrayImage};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tracing::debug;

use super::augment::Augmentation;
use crate::constants::{CHANNELS, RED};
use crate::error::{EmbeddingError, Result};
use crate::generator::list_image_groups;

/// Geometry of the tensors handed to the scorer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageGeometry {
    pub image_size: u32,
    pub crop_size: u32,
}

impl ImageGeometry {
    /// Side length of the items produced with or without cropping
    pub fn output_size(&self, cropping: bool) -> u32 {
        if cropping {
            self.crop_size
        } else {
            self.image_size
        }
    }
}

/// Stateful per-pass settings: augmentation and crop RNG
struct PassState {
    augmentation: Augmentation,
    random_crop: bool,
    rng: ChaCha8Rng,
}

pub struct ProteinImageDataset {
    inputdir: PathBuf,
    suffix: String,
    geometry: ImageGeometry,
    keys: Vec<String>,
    pass: PassState,
}

impl ProteinImageDataset {
    pub fn new(inputdir: &Path, suffix: &str, geometry: ImageGeometry) -> Result<Self> {
        if geometry.image_size == 0 {
            return Err(EmbeddingError::configuration("image_size must be positive"));
        }
        if geometry.crop_size > geometry.image_size {
            return Err(EmbeddingError::configuration(format!(
                "crop_size {} exceeds image_size {}",
                geometry.crop_size, geometry.image_size
            )));
        }
        let keys = list_image_groups(&inputdir.join(RED), suffix)?;
        debug!("Dataset over {} image groups", keys.len());
        Ok(Self {
            inputdir: inputdir.to_path_buf(),
            suffix: suffix.to_string(),
            geometry,
            keys,
            pass: PassState {
                augmentation: Augmentation::Default,
                random_crop: false,
                rng: ChaCha8Rng::seed_from_u64(0),
            },
        })
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Image group key for an index
    pub fn key(&self, index: usize) -> &str {
        &self.keys[index]
    }

    pub fn geometry(&self) -> ImageGeometry {
        self.geometry
    }

    /// Reset per-pass state; seed 0 is the canonical uncropped pass
    pub fn begin_pass(&mut self, seed: u64, augmentation: Augmentation) {
        self.pass = PassState {
            augmentation,
            random_crop: self.geometry.crop_size > 0 && seed != 0,
            rng: ChaCha8Rng::seed_from_u64(seed),
        };
    }

    /// Side length of items in the current pass
    pub fn item_size(&self) -> u32 {
        self.geometry.output_size(self.pass.random_crop)
    }

    fn channel_path(&self, key: &str, channel: &str) -> PathBuf {
        self.inputdir
            .join(channel)
            .join(format!("{}{}{}", key, channel, self.suffix))
    }

    fn load_plane(&self, path: &Path) -> Result<GrayImage> {
        let img = image::open(path).map_err(|source| EmbeddingError::Image {
            path: path.to_path_buf(),
            source,
        })?;
        let size = self.geometry.image_size;
        let plane = img.to_luma8();
        if plane.dimensions() == (size, size) {
            Ok(plane)
        } else {
            Ok(imageops::resize(&plane, size, size, FilterType::Triangle))
        }
    }

    /// Load item `index` as a flat `[4, S, S]` buffer
    pub fn item(&mut self, index: usize) -> Result<Vec<f32>> {
        let key = self.keys[index].clone();
        let mut planes = Vec::with_capacity(CHANNELS.len());
        for channel in CHANNELS {
            let plane = self.load_plane(&self.channel_path(&key, channel))?;
            planes.push(self.pass.augmentation.apply(plane));
        }

        if self.pass.random_crop {
            let crop = self.geometry.crop_size;
            let (width, height) = planes[0].dimensions();
            let x = self.pass.rng.gen_range(0..=width - crop);
            let y = self.pass.rng.gen_range(0..=height - crop);
            planes = planes
                .iter()
                .map(|p| imageops::crop_imm(p, x, y, crop, crop).to_image())
                .collect();
        }

        let mut data = Vec::with_capacity(planes.iter().map(|p| p.as_raw().len()).sum());
        for plane in &planes {
            data.extend(plane.as_raw().iter().map(|&v| f32::from(v) / 255.0));
        }
        Ok(data)
    }
}

/// One loader step: dataset indices and the stacked `[B, 4, S, S]` tensor
pub struct Batch {
    pub indices: Vec<usize>,
    pub images: Tensor,
}

/// Order-preserving batch iterator over a dataset
pub struct BatchLoader {
    batch_size: usize,
    next_index: usize,
}

impl BatchLoader {
    pub fn new(batch_size: usize) -> Self {
        Self {
            batch_size: batch_size.max(1),
            next_index: 0,
        }
    }

    /// Load the next batch onto the CPU, or `None` once the dataset is exhausted
    pub fn next_batch(&mut self, dataset: &mut ProteinImageDataset) -> Result<Option<Batch>> {
        if self.next_index >= dataset.len() {
            return Ok(None);
        }
        let end = (self.next_index + self.batch_size).min(dataset.len());
        let indices: Vec<usize> = (self.next_index..end).collect();
        self.next_index = end;

        let size = dataset.item_size() as usize;
        let mut data = Vec::with_capacity(indices.len() * CHANNELS.len() * size * size);
        for &index in &indices {
            data.extend(dataset.item(index)?);
        }
        let images = Tensor::from_vec(
            data,
            (indices.len(), CHANNELS.len(), size, size),
            &Device::Cpu,
        )?;
        Ok(Some(Batch { indices, images }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    fn write_group(dir: &Path, key: &str, value: u8) {
        for channel in CHANNELS {
            let channel_dir = dir.join(channel);
            std::fs::create_dir_all(&channel_dir).unwrap();
            GrayImage::from_pixel(8, 8, Luma([value]))
                .save(channel_dir.join(format!("{}{}.png", key, channel)))
                .unwrap();
        }
    }

    fn geometry(crop_size: u32) -> ImageGeometry {
        ImageGeometry {
            image_size: 4,
            crop_size,
        }
    }

    #[test]
    fn test_items_are_resized_and_scaled() {
        let dir = tempfile::tempdir().unwrap();
        write_group(dir.path(), "1_A1_1_", 255);
        let mut dataset = ProteinImageDataset::new(dir.path(), ".png", geometry(0)).unwrap();
        let item = dataset.item(0).unwrap();
        assert_eq!(4 * 4 * 4, item.len());
        assert!(item.iter().all(|v| (*v - 1.0).abs() < 1e-6));
    }

    #[test]
    fn test_crop_only_on_nonzero_seed() {
        let dir = tempfile::tempdir().unwrap();
        write_group(dir.path(), "1_A1_1_", 10);
        let mut dataset = ProteinImageDataset::new(dir.path(), ".png", geometry(2)).unwrap();

        dataset.begin_pass(0, Augmentation::Default);
        assert_eq!(4, dataset.item_size());
        assert_eq!(4 * 4 * 4, dataset.item(0).unwrap().len());

        dataset.begin_pass(3, Augmentation::FlipLr);
        assert_eq!(2, dataset.item_size());
        assert_eq!(4 * 2 * 2, dataset.item(0).unwrap().len());
    }

    #[test]
    fn test_loader_preserves_order() {
        let dir = tempfile::tempdir().unwrap();
        for (key, value) in [("1_A1_1_", 0), ("2_A1_1_", 100), ("3_A1_1_", 200)] {
            write_group(dir.path(), key, value);
        }
        let mut dataset = ProteinImageDataset::new(dir.path(), ".png", geometry(0)).unwrap();
        let mut loader = BatchLoader::new(2);

        let first = loader.next_batch(&mut dataset).unwrap().unwrap();
        assert_eq!(vec![0, 1], first.indices);
        assert_eq!((2, 4, 4, 4), first.images.dims4().unwrap());

        let second = loader.next_batch(&mut dataset).unwrap().unwrap();
        assert_eq!(vec![2], second.indices);
        assert_eq!("3_A1_1_", dataset.key(2));

        assert!(loader.next_batch(&mut dataset).unwrap().is_none());
    }

    #[test]
    fn test_oversized_crop_rejected() {
        let dir = tempfile::tempdir().unwrap();
        write_group(dir.path(), "1_A1_1_", 0);
        assert!(ProteinImageDataset::new(dir.path(), ".png", geometry(9)).is_err());
    }
}
