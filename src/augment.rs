//! Infinite batch generators over an in-memory split.
//!
//! The training variant applies random affine jitter and horizontal flips before
//! subtracting the channel mean; the validation variant only subtracts the mean.
//! Both cycle over their dataset forever.

use burn::data::dataset::Dataset;
use ndarray::{Array1, Array3, Axis};
use rand::{seq::SliceRandom, Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use crate::{
    data::{ActivityDataset, ActivityItem, Sample},
    error::{Error, Result},
};

/// ImageNet RGB channel means, in pixel units.
pub const IMAGENET_MEAN: [f32; 3] = [123.68, 116.779, 103.939];

type Matrix = [[f32; 3]; 3];

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AugmentationConfig {
    /// Degrees, sampled uniformly in `[-range, range]`.
    pub rotation_range: f32,
    /// Scale factor per axis sampled in `[1 - range, 1 + range]`.
    pub zoom_range: f32,
    /// Fraction of the width.
    pub width_shift_range: f32,
    /// Fraction of the height.
    pub height_shift_range: f32,
    /// Shear angle in degrees.
    pub shear_range: f32,
    pub horizontal_flip: bool,
}

impl Default for AugmentationConfig {
    fn default() -> Self {
        Self {
            rotation_range: 30.0,
            zoom_range: 0.15,
            width_shift_range: 0.2,
            height_shift_range: 0.2,
            shear_range: 0.15,
            horizontal_flip: true,
        }
    }
}

impl AugmentationConfig {
    pub fn none() -> Self {
        Self {
            rotation_range: 0.0,
            zoom_range: 0.0,
            width_shift_range: 0.0,
            height_shift_range: 0.0,
            shear_range: 0.0,
            horizontal_flip: false,
        }
    }

    /// Samples a matrix mapping output `(row, col, 1)` coordinates to input ones.
    fn sample_transform<R: Rng>(&self, rng: &mut R, height: usize, width: usize) -> Matrix {
        let theta = symmetric(rng, self.rotation_range).to_radians();
        let tx = symmetric(rng, self.height_shift_range) * height as f32;
        let ty = symmetric(rng, self.width_shift_range) * width as f32;
        let shear = symmetric(rng, self.shear_range).to_radians();
        let zx = 1.0 + symmetric(rng, self.zoom_range);
        let zy = 1.0 + symmetric(rng, self.zoom_range);

        let rotation = [
            [theta.cos(), -theta.sin(), 0.0],
            [theta.sin(), theta.cos(), 0.0],
            [0.0, 0.0, 1.0],
        ];
        let shift = [[1.0, 0.0, tx], [0.0, 1.0, ty], [0.0, 0.0, 1.0]];
        let shear = [
            [1.0, -shear.sin(), 0.0],
            [0.0, shear.cos(), 0.0],
            [0.0, 0.0, 1.0],
        ];
        let zoom = [[zx, 0.0, 0.0], [0.0, zy, 0.0], [0.0, 0.0, 1.0]];

        let transform = matmul(&matmul(&matmul(&rotation, &shift), &shear), &zoom);

        let center_row = height as f32 / 2.0 + 0.5;
        let center_col = width as f32 / 2.0 + 0.5;
        let to_center = [[1.0, 0.0, center_row], [0.0, 1.0, center_col], [0.0, 0.0, 1.0]];
        let from_center = [[1.0, 0.0, -center_row], [0.0, 1.0, -center_col], [0.0, 0.0, 1.0]];

        matmul(&matmul(&to_center, &transform), &from_center)
    }
}

fn symmetric<R: Rng>(rng: &mut R, range: f32) -> f32 {
    if range > 0.0 {
        rng.gen_range(-range..=range)
    } else {
        0.0
    }
}

fn matmul(a: &Matrix, b: &Matrix) -> Matrix {
    let mut out = [[0.0; 3]; 3];
    for (row, out_row) in out.iter_mut().enumerate() {
        for (col, value) in out_row.iter_mut().enumerate() {
            *value = (0..3).map(|k| a[row][k] * b[k][col]).sum();
        }
    }
    out
}

/// Resamples `image` through `transform` with bilinear interpolation. Coordinates
/// outside the image take the nearest edge pixel.
fn warp(image: &Array3<f32>, transform: &Matrix) -> Array3<f32> {
    let (height, width, channels) = image.dim();
    let max_row = (height - 1) as f32;
    let max_col = (width - 1) as f32;

    Array3::from_shape_fn((height, width, channels), |(row, col, channel)| {
        let (r, c) = (row as f32, col as f32);
        let src_row = transform[0][0] * r + transform[0][1] * c + transform[0][2];
        let src_col = transform[1][0] * r + transform[1][1] * c + transform[1][2];
        let src_row = src_row.clamp(0.0, max_row);
        let src_col = src_col.clamp(0.0, max_col);

        let r0 = src_row.floor() as usize;
        let c0 = src_col.floor() as usize;
        let r1 = (r0 + 1).min(height - 1);
        let c1 = (c0 + 1).min(width - 1);
        let fr = src_row - r0 as f32;
        let fc = src_col - c0 as f32;

        let top = image[[r0, c0, channel]] * (1.0 - fc) + image[[r0, c1, channel]] * fc;
        let bottom = image[[r1, c0, channel]] * (1.0 - fc) + image[[r1, c1, channel]] * fc;
        top * (1.0 - fr) + bottom * fr
    })
}

/// Pull-based, never-ending producer of batches over one split.
pub struct BatchGenerator<'a> {
    dataset: &'a ActivityDataset,
    batch_size: usize,
    mean: Array1<f32>,
    augmentation: Option<AugmentationConfig>,
    shuffle: bool,
    seed: u64,
    rng: ChaCha8Rng,
    order: Vec<usize>,
    cursor: usize,
}

impl<'a> BatchGenerator<'a> {
    /// Shuffled batches with random augmentation, reshuffled on every pass.
    pub fn training(
        dataset: &'a ActivityDataset,
        batch_size: usize,
        mean: [f32; 3],
        augmentation: AugmentationConfig,
        seed: u64,
    ) -> Result<Self> {
        Self::new(dataset, batch_size, mean, Some(augmentation), true, seed)
    }

    /// Batches in dataset order with mean subtraction only.
    pub fn validation(
        dataset: &'a ActivityDataset,
        batch_size: usize,
        mean: [f32; 3],
    ) -> Result<Self> {
        Self::new(dataset, batch_size, mean, None, false, 0)
    }

    fn new(
        dataset: &'a ActivityDataset,
        batch_size: usize,
        mean: [f32; 3],
        augmentation: Option<AugmentationConfig>,
        shuffle: bool,
        seed: u64,
    ) -> Result<Self> {
        if batch_size == 0 {
            return Err(Error::Config("batch size must be positive".to_string()));
        }
        if dataset.is_empty() {
            return Err(Error::Config("cannot draw batches from an empty split".to_string()));
        }

        let mut generator = Self {
            dataset,
            batch_size,
            mean: Array1::from(mean.to_vec()),
            augmentation,
            shuffle,
            seed,
            rng: ChaCha8Rng::seed_from_u64(seed),
            order: Vec::new(),
            cursor: 0,
        };
        generator.reset();

        Ok(generator)
    }

    /// Restarts from the first batch with the initial random state.
    pub fn reset(&mut self) {
        self.rng = ChaCha8Rng::seed_from_u64(self.seed);
        self.order = (0..self.dataset.len()).collect();
        self.cursor = 0;
        if self.shuffle {
            self.order.shuffle(&mut self.rng);
        }
    }

    /// Number of batches covering the dataset once; the last one may be partial.
    pub fn batches_per_pass(&self) -> usize {
        self.dataset.len().div_ceil(self.batch_size)
    }

    fn transform(&mut self, item: ActivityItem) -> Sample {
        let mut image = item.image.mapv(f32::from);

        if let Some(augmentation) = self.augmentation {
            let (height, width, _) = image.dim();
            let transform = augmentation.sample_transform(&mut self.rng, height, width);
            image = warp(&image, &transform);

            if augmentation.horizontal_flip && self.rng.gen_bool(0.5) {
                image.invert_axis(Axis(1));
            }
        }

        image -= &self.mean;

        Sample {
            image,
            target: item.target,
        }
    }
}

impl Iterator for BatchGenerator<'_> {
    type Item = Vec<Sample>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor >= self.order.len() {
            self.cursor = 0;
            if self.shuffle {
                self.order.shuffle(&mut self.rng);
            }
        }

        let end = (self.cursor + self.batch_size).min(self.order.len());
        let indices = self.order[self.cursor..end].to_vec();
        self.cursor = end;

        let dataset = self.dataset;
        let samples = indices
            .into_iter()
            .filter_map(|index| dataset.get(index))
            .map(|item| self.transform(item))
            .collect();

        Some(samples)
    }
}

#[cfg(test)]
mod tests {
    use ndarray::{array, Array2};

    use super::*;
    use crate::data::{CHANNEL_COUNT, HEIGHT, WIDTH};

    fn dataset(count: usize) -> ActivityDataset {
        let images: Vec<_> = (0..count)
            .map(|i| Array3::from_elem((HEIGHT, WIDTH, CHANNEL_COUNT), (i * 10) as u8))
            .collect();
        let mut targets = Array2::zeros((count, 2));
        for i in 0..count {
            targets[[i, i % 2]] = 1.0;
        }
        let indices: Vec<_> = (0..count).collect();
        ActivityDataset::from_indices(&images, &targets, &indices)
    }

    #[test]
    fn validation_subtracts_mean_in_order() {
        let data = dataset(5);
        let mut generator = BatchGenerator::validation(&data, 2, IMAGENET_MEAN).unwrap();

        let first = generator.next().unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(first[1].image[[3, 4, 0]], 10.0 - IMAGENET_MEAN[0]);
        assert_eq!(first[1].image[[3, 4, 2]], 10.0 - IMAGENET_MEAN[2]);
        assert_eq!(first[1].target, array![0.0, 1.0]);

        let _second = generator.next().unwrap();
        let last = generator.next().unwrap();
        assert_eq!(last.len(), 1);
        assert_eq!(last[0].image[[0, 0, 1]], 40.0 - IMAGENET_MEAN[1]);
    }

    #[test]
    fn generators_never_run_dry() {
        let data = dataset(3);
        let generator =
            BatchGenerator::training(&data, 2, IMAGENET_MEAN, AugmentationConfig::default(), 42)
                .unwrap();

        let drawn: Vec<_> = generator.take(50).collect();
        assert_eq!(drawn.len(), 50);
        for samples in &drawn {
            assert!(!samples.is_empty());
            for sample in samples {
                assert_eq!(sample.image.dim(), (HEIGHT, WIDTH, CHANNEL_COUNT));
                assert_eq!(sample.target.sum(), 1.0);
            }
        }
    }

    #[test]
    fn every_pass_covers_the_dataset() {
        let data = dataset(6);
        let mut generator =
            BatchGenerator::training(&data, 4, [0.0; 3], AugmentationConfig::none(), 1).unwrap();
        assert_eq!(generator.batches_per_pass(), 2);

        for _ in 0..3 {
            let mut values: Vec<u32> = (0..generator.batches_per_pass())
                .flat_map(|_| generator.next().unwrap())
                .map(|sample| sample.image[[0, 0, 0]] as u32)
                .collect();
            values.sort();
            assert_eq!(values, vec![0, 10, 20, 30, 40, 50]);
        }
    }

    #[test]
    fn reset_replays_the_same_batches() {
        let data = dataset(4);
        let mut generator =
            BatchGenerator::training(&data, 2, IMAGENET_MEAN, AugmentationConfig::default(), 9)
                .unwrap();

        let first: Vec<_> = generator.by_ref().take(3).collect();
        generator.reset();
        let replay: Vec<_> = generator.take(3).collect();

        for (a, b) in first.iter().flatten().zip(replay.iter().flatten()) {
            assert_eq!(a.image, b.image);
            assert_eq!(a.target, b.target);
        }
    }

    #[test]
    fn identity_warp_keeps_pixels() {
        let image = Array3::from_shape_fn((4, 5, 3), |(r, c, ch)| (r * 100 + c * 10 + ch) as f32);
        let identity = [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]];
        assert_eq!(warp(&image, &identity), image);
    }

    #[test]
    fn constant_images_stay_constant_under_jitter() {
        let image = Array3::from_elem((HEIGHT, WIDTH, CHANNEL_COUNT), 77.0f32);
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let transform = AugmentationConfig::default().sample_transform(&mut rng, HEIGHT, WIDTH);

        let warped = warp(&image, &transform);
        assert!(warped.iter().all(|&value| (value - 77.0).abs() < 1e-3));
    }

    fn gradient_dataset() -> ActivityDataset {
        let image = Array3::from_shape_fn((HEIGHT, WIDTH, CHANNEL_COUNT), |(_, col, _)| col as u8);
        let targets = array![[1.0, 0.0]];
        ActivityDataset::from_indices(&[image], &targets, &[0])
    }

    #[test]
    fn shift_moves_pixels_by_the_sampled_offset() {
        let config = AugmentationConfig {
            width_shift_range: 0.2,
            ..AugmentationConfig::none()
        };
        let mut rng = ChaCha8Rng::seed_from_u64(5);
        let transform = config.sample_transform(&mut rng, HEIGHT, WIDTH);

        let offset = transform[1][2];
        assert!(offset.abs() > 0.0);
        assert!(offset.abs() <= 0.2 * WIDTH as f32 + 1e-3);
        assert!((transform[0][2]).abs() < 1e-3);
        assert!((transform[0][0] - 1.0).abs() < 1e-6 && (transform[1][1] - 1.0).abs() < 1e-6);

        let image = Array3::from_shape_fn((HEIGHT, WIDTH, 1), |(_, col, _)| col as f32);
        let warped = warp(&image, &transform);
        let col = WIDTH / 2;
        let expected = (col as f32 + offset).clamp(0.0, (WIDTH - 1) as f32);
        assert!((warped[[HEIGHT / 2, col, 0]] - expected).abs() < 1e-2);
    }

    #[test]
    fn flip_mirrors_columns() {
        let data = gradient_dataset();
        let config = AugmentationConfig {
            horizontal_flip: true,
            ..AugmentationConfig::none()
        };
        let generator = BatchGenerator::training(&data, 1, [0.0; 3], config, 11).unwrap();

        let mut flipped = 0;
        let mut kept = 0;
        for batch in generator.take(32) {
            let image = &batch[0].image;
            if image[[0, 0, 0]] == 0.0 {
                assert_eq!(image[[7, WIDTH - 1, 2]], (WIDTH - 1) as f32);
                kept += 1;
            } else {
                assert_eq!(image[[0, 0, 0]], (WIDTH - 1) as f32);
                assert_eq!(image[[7, WIDTH - 1, 2]], 0.0);
                flipped += 1;
            }
        }
        assert!(flipped > 0);
        assert!(kept > 0);
    }

    #[test]
    fn training_batches_differ_from_validation_batches() {
        let data = gradient_dataset();
        let mut training =
            BatchGenerator::training(&data, 1, IMAGENET_MEAN, AugmentationConfig::default(), 42)
                .unwrap();
        let mut validation = BatchGenerator::validation(&data, 1, IMAGENET_MEAN).unwrap();

        let augmented = training.next().unwrap().remove(0).image;
        let plain = validation.next().unwrap().remove(0).image;

        assert_eq!(plain[[3, 100, 0]], 100.0 - IMAGENET_MEAN[0]);
        assert_ne!(augmented, plain);
    }

    #[test]
    fn zero_batch_size_is_rejected() {
        let data = dataset(2);
        assert!(BatchGenerator::validation(&data, 0, IMAGENET_MEAN).is_err());
    }
}
