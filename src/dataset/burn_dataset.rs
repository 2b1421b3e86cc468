//! Burn Dataset Integration
//!
//! [`FundusDataset`] implements Burn's `Dataset` trait over a list of
//! labeled image paths and decodes images lazily. [`FundusBatcher`] stacks
//! items into image, one-hot, and index tensors.
//!
//! Pixels leave this module in `[0, 1]`; ImageNet normalisation is part of
//! the model so the exported network accepts the same input as the
//! browser frontend (resize, then divide by 255).

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use burn::data::dataloader::batcher::Batcher;
use burn::data::dataset::Dataset;
use burn::prelude::*;
use image::imageops::FilterType;
use image::RgbImage;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use crate::dataset::augmentation::{item_seed, Augmenter};
use crate::dataset::loader::LabeledImage;
use crate::utils::error::{ImageResultExt, Result};

/// Number of colour channels fed to the network
pub const CHANNELS: usize = 3;

/// One decoded example
#[derive(Clone, Debug)]
pub struct FundusItem {
    /// CHW pixels in `[0, 1]`, length `3 * H * W`
    pub pixels: Vec<f32>,
    pub label: usize,
}

/// Decode an image and resize it to `[height, width]`
pub fn load_rgb(path: &Path, image_size: [u32; 2]) -> Result<RgbImage> {
    let [height, width] = image_size;
    let img = image::open(path).for_image(path)?.to_rgb8();
    if img.dimensions() == (width, height) {
        return Ok(img);
    }
    Ok(image::imageops::resize(&img, width, height, FilterType::Triangle))
}

/// HWC bytes to CHW floats in `[0, 1]`
pub fn rgb_to_chw(img: &RgbImage) -> Vec<f32> {
    let (width, height) = (img.width() as usize, img.height() as usize);
    let plane = width * height;
    let mut data = vec![0.0f32; CHANNELS * plane];

    for (x, y, pixel) in img.enumerate_pixels() {
        let offset = y as usize * width + x as usize;
        for c in 0..CHANNELS {
            data[c * plane + offset] = pixel[c] as f32 / 255.0;
        }
    }
    data
}

/// Lazily decoded fundus images.
///
/// The training instance carries an [`Augmenter`]; each item's augmentation
/// is seeded from `(seed, epoch, index)`, and the epoch counter is shared
/// with the trainer through [`FundusDataset::epoch_handle`].
#[derive(Clone, Debug)]
pub struct FundusDataset {
    images: Arc<Vec<LabeledImage>>,
    image_size: [u32; 2],
    augmenter: Option<Arc<Augmenter>>,
    seed: u64,
    epoch: Arc<AtomicUsize>,
}

impl FundusDataset {
    /// Dataset without augmentation
    pub fn new(images: Vec<LabeledImage>, image_size: [u32; 2]) -> Self {
        Self {
            images: Arc::new(images),
            image_size,
            augmenter: None,
            seed: 0,
            epoch: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Enable random augmentation for this dataset
    pub fn with_augmentation(mut self, augmenter: Augmenter, seed: u64) -> Self {
        self.augmenter = Some(Arc::new(augmenter));
        self.seed = seed;
        self
    }

    pub fn is_augmented(&self) -> bool {
        self.augmenter.is_some()
    }

    pub fn image_size(&self) -> [u32; 2] {
        self.image_size
    }

    pub fn images(&self) -> &[LabeledImage] {
        &self.images
    }

    /// Shared epoch counter read by [`Dataset::get`]
    pub fn epoch_handle(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.epoch)
    }

    pub fn set_epoch(&self, epoch: usize) {
        self.epoch.store(epoch, Ordering::Relaxed);
    }

    /// Decode one item, returning the error instead of panicking
    pub fn load(&self, index: usize) -> Result<Option<FundusItem>> {
        let Some(entry) = self.images.get(index) else {
            return Ok(None);
        };

        let mut img = load_rgb(&entry.path, self.image_size)?;
        if let Some(augmenter) = &self.augmenter {
            let epoch = self.epoch.load(Ordering::Relaxed);
            let mut rng = ChaCha8Rng::seed_from_u64(item_seed(self.seed, epoch, index));
            img = augmenter.augment(&img, &mut rng);
        }

        Ok(Some(FundusItem {
            pixels: rgb_to_chw(&img),
            label: entry.label,
        }))
    }
}

impl Dataset<FundusItem> for FundusDataset {
    /// # Panics
    ///
    /// Panics when the image cannot be decoded. Headers are checked during
    /// the directory scan, so this only fires for files corrupted past the
    /// header or removed mid-run; training cannot continue either way.
    fn get(&self, index: usize) -> Option<FundusItem> {
        self.load(index)
            .unwrap_or_else(|err| panic!("failed to load training item {index}: {err}"))
    }

    fn len(&self) -> usize {
        self.images.len()
    }
}

/// A batch of images with their labels
#[derive(Clone, Debug)]
pub struct FundusBatch<B: Backend> {
    /// `[batch, 3, height, width]`, values in `[0, 1]`
    pub images: Tensor<B, 4>,
    /// `[batch, num_classes]`
    pub one_hot: Tensor<B, 2>,
    /// `[batch]` class indices
    pub targets: Tensor<B, 1, Int>,
}

/// Stacks [`FundusItem`]s into a [`FundusBatch`]
#[derive(Clone, Debug)]
pub struct FundusBatcher {
    num_classes: usize,
    height: usize,
    width: usize,
}

impl FundusBatcher {
    pub fn new(num_classes: usize, image_size: [u32; 2]) -> Self {
        Self {
            num_classes,
            height: image_size[0] as usize,
            width: image_size[1] as usize,
        }
    }
}

impl<B: Backend> Batcher<B, FundusItem, FundusBatch<B>> for FundusBatcher {
    fn batch(&self, items: Vec<FundusItem>, device: &B::Device) -> FundusBatch<B> {
        let batch_size = items.len();
        let mut pixels = Vec::with_capacity(batch_size * CHANNELS * self.height * self.width);
        let mut one_hot = vec![0.0f32; batch_size * self.num_classes];
        let mut labels: Vec<i64> = Vec::with_capacity(batch_size);

        for (row, item) in items.into_iter().enumerate() {
            pixels.extend_from_slice(&item.pixels);
            one_hot[row * self.num_classes + item.label] = 1.0;
            labels.push(item.label as i64);
        }

        let images = Tensor::<B, 4>::from_data(
            TensorData::new(pixels, [batch_size, CHANNELS, self.height, self.width]),
            device,
        );
        let one_hot = Tensor::<B, 2>::from_data(
            TensorData::new(one_hot, [batch_size, self.num_classes]),
            device,
        );
        let targets =
            Tensor::<B, 1, Int>::from_data(TensorData::new(labels, [batch_size]), device);

        FundusBatch {
            images,
            one_hot,
            targets,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::augmentation::AugmentationConfig;
    use burn::backend::NdArray;
    use image::Rgb;
    use std::path::PathBuf;

    type TestBackend = NdArray;

    fn write_image(dir: &Path, name: &str, color: [u8; 3], size: u32) -> PathBuf {
        let path = dir.join(name);
        RgbImage::from_pixel(size, size, Rgb(color)).save(&path).unwrap();
        path
    }

    #[test]
    fn test_rgb_to_chw_layout() {
        let mut img = RgbImage::new(2, 1);
        img.put_pixel(0, 0, Rgb([255, 0, 0]));
        img.put_pixel(1, 0, Rgb([0, 255, 51]));

        let chw = rgb_to_chw(&img);
        assert_eq!(chw.len(), 6);
        assert_eq!(&chw[0..2], &[1.0, 0.0]);
        assert_eq!(&chw[2..4], &[0.0, 1.0]);
        assert!((chw[5] - 0.2).abs() < 1e-6);
    }

    #[test]
    fn test_item_is_resized_and_scaled() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_image(dir.path(), "a.png", [255, 255, 255], 64);

        let dataset = FundusDataset::new(vec![LabeledImage { path, label: 1 }], [32, 32]);
        let item = dataset.get(0).unwrap();
        assert_eq!(item.pixels.len(), 3 * 32 * 32);
        assert_eq!(item.label, 1);
        assert!(item.pixels.iter().all(|&v| (v - 1.0).abs() < 1e-6));
        assert!(dataset.get(1).is_none());
    }

    #[test]
    fn test_unreadable_item_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.png");
        std::fs::write(&path, b"garbage").unwrap();

        let dataset = FundusDataset::new(vec![LabeledImage { path, label: 0 }], [32, 32]);
        assert!(dataset.load(0).is_err());
    }

    #[test]
    fn test_augmentation_depends_on_epoch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gradient.png");
        RgbImage::from_fn(32, 32, |x, y| Rgb([(x * 8) as u8, (y * 8) as u8, 0]))
            .save(&path)
            .unwrap();

        let dataset = FundusDataset::new(vec![LabeledImage { path, label: 0 }], [32, 32])
            .with_augmentation(Augmenter::new(AugmentationConfig::default()), 42);
        assert!(dataset.is_augmented());

        let first = dataset.get(0).unwrap().pixels;
        let again = dataset.get(0).unwrap().pixels;
        assert_eq!(first, again);

        dataset.set_epoch(1);
        let next_epoch = dataset.get(0).unwrap().pixels;
        assert_ne!(first, next_epoch);
    }

    #[test]
    fn test_batcher_shapes_and_one_hot() {
        let device = Default::default();
        let batcher = FundusBatcher::new(3, [4, 4]);
        let items = vec![
            FundusItem {
                pixels: vec![0.5; 3 * 16],
                label: 2,
            },
            FundusItem {
                pixels: vec![0.1; 3 * 16],
                label: 0,
            },
        ];

        let batch: FundusBatch<TestBackend> = batcher.batch(items, &device);
        assert_eq!(batch.images.dims(), [2, 3, 4, 4]);
        assert_eq!(batch.one_hot.dims(), [2, 3]);

        let one_hot = batch.one_hot.into_data().to_vec::<f32>().unwrap();
        assert_eq!(one_hot, vec![0.0, 0.0, 1.0, 1.0, 0.0, 0.0]);

        let targets = batch.targets.into_data().to_vec::<i64>().unwrap();
        assert_eq!(targets, vec![2, 0]);
    }
}
