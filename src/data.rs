use std::path::Path;

use burn::{
    data::{
        dataloader::batcher::Batcher,
        dataset::{Dataset, InMemDataset},
    },
    prelude::*,
};
use image::imageops::FilterType;
use ndarray::{Array1, Array2, Array3, Axis};
use rayon::iter::{IntoParallelRefIterator, ParallelIterator};
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::error::{Error, Result};

pub const WIDTH: usize = 224;
pub const HEIGHT: usize = 224;
pub const CHANNEL_COUNT: usize = 3;

const IMAGE_EXTENSIONS: [&str; 8] = ["jpg", "jpeg", "png", "bmp", "tif", "tiff", "webp", "gif"];

/// Images and their string labels, index-aligned, in traversal order.
#[derive(Debug, Default)]
pub struct LoadedImages {
    pub images: Vec<Array3<u8>>,
    pub labels: Vec<String>,
}

impl LoadedImages {
    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }
}

pub fn is_image_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            IMAGE_EXTENSIONS
                .iter()
                .any(|known| known.eq_ignore_ascii_case(ext))
        })
        .unwrap_or(false)
}

/// The class of an image is the name of the directory holding it.
pub fn label_for_path(path: &Path) -> Option<&str> {
    path.parent()?.file_name()?.to_str()
}

/// Decodes an image file into a `HEIGHT x WIDTH x 3` RGB array, stretching it to fit.
pub fn decode_image(path: &Path) -> Result<Array3<u8>> {
    let decoded = image::open(path).map_err(|source| Error::ImageDecode {
        path: path.to_path_buf(),
        source,
    })?;

    let resized = decoded.resize_exact(WIDTH as u32, HEIGHT as u32, FilterType::Triangle);
    let rgb = resized.to_rgb8();

    pixels_to_array(path, rgb.into_raw())
}

fn pixels_to_array(path: &Path, raw: Vec<u8>) -> Result<Array3<u8>> {
    Array3::from_shape_vec((HEIGHT, WIDTH, CHANNEL_COUNT), raw).map_err(|err| {
        Error::ImageLayout {
            path: path.to_path_buf(),
            reason: err.to_string(),
        }
    })
}

/// Walks `root` recursively and decodes every image whose parent directory is in `allowed`.
///
/// A single undecodable file fails the whole load.
pub fn load_images(root: &Path, allowed: &[&str]) -> Result<LoadedImages> {
    if !root.is_dir() {
        return Err(Error::DatasetNotFound(root.to_path_buf()));
    }

    let mut selected = Vec::new();
    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry.map_err(std::io::Error::from)?;
        let path = entry.path();
        if !entry.file_type().is_file() || !is_image_file(path) {
            continue;
        }

        match label_for_path(path) {
            Some(label) if allowed.contains(&label) => {
                selected.push((path.to_path_buf(), label.to_string()))
            }
            _ => continue,
        }
    }

    let images = selected
        .par_iter()
        .map(|(path, _)| {
            debug!(path = %path.display(), "processing image");
            decode_image(path)
        })
        .collect::<Result<Vec<_>>>()?;

    let labels = selected.into_iter().map(|(_, label)| label).collect();
    let loaded = LoadedImages { images, labels };

    info!(count = loaded.len(), root = %root.display(), "loaded images");

    Ok(loaded)
}

/// One stored image with its one-hot target.
#[derive(Debug, Clone)]
pub struct ActivityItem {
    pub image: Array3<u8>,
    pub target: Array1<f32>,
}

pub struct ActivityDataset {
    pub dataset: InMemDataset<ActivityItem>,
}

impl Dataset<ActivityItem> for ActivityDataset {
    fn get(&self, index: usize) -> Option<ActivityItem> {
        self.dataset.get(index)
    }

    fn len(&self) -> usize {
        self.dataset.len()
    }
}

impl ActivityDataset {
    /// Gathers the rows named by `indices` from the parallel image/target arrays.
    pub fn from_indices(images: &[Array3<u8>], targets: &Array2<f32>, indices: &[usize]) -> Self {
        let items = indices
            .iter()
            .map(|&index| ActivityItem {
                image: images[index].clone(),
                target: targets.row(index).to_owned(),
            })
            .collect();

        ActivityDataset {
            dataset: InMemDataset::new(items),
        }
    }

    /// Class index of every item, taken from the one-hot targets.
    pub fn class_indices(&self) -> Vec<usize> {
        self.dataset
            .iter()
            .map(|item| argmax(item.target.view()))
            .collect()
    }
}

pub(crate) fn argmax(values: ndarray::ArrayView1<f32>) -> usize {
    values
        .iter()
        .enumerate()
        .fold((0, f32::NEG_INFINITY), |best, (index, &value)| {
            if value > best.1 {
                (index, value)
            } else {
                best
            }
        })
        .0
}

/// An image after augmentation and mean subtraction, ready to be batched.
#[derive(Debug, Clone)]
pub struct Sample {
    pub image: Array3<f32>,
    pub target: Array1<f32>,
}

#[derive(Clone, Debug)]
pub struct ActivityBatch<B: Backend> {
    pub images: Tensor<B, 4>,
    pub targets: Tensor<B, 2>,
}

#[derive(Clone)]
pub struct ActivityBatcher<B: Backend> {
    device: B::Device,
}

impl<B: Backend> ActivityBatcher<B> {
    pub fn new(device: B::Device) -> Self {
        Self { device }
    }
}

impl<B: Backend> Batcher<Sample, ActivityBatch<B>> for ActivityBatcher<B> {
    fn batch(&self, items: Vec<Sample>) -> ActivityBatch<B> {
        let count = items.len();
        let classes = items.first().map(|item| item.target.len()).unwrap_or(0);

        let images = ndarray::stack(
            Axis(0),
            &items.iter().map(|item| item.image.view()).collect::<Vec<_>>(),
        )
        .map(|stacked| stacked.iter().copied().collect::<Vec<f32>>())
        .unwrap_or_default();

        let targets = items
            .iter()
            .flat_map(|item| item.target.iter().copied())
            .collect::<Vec<f32>>();

        // NHWC on the host, NCHW for the convolutions
        let images = Tensor::<B, 4>::from_data(
            TensorData::new(images, [count, HEIGHT, WIDTH, CHANNEL_COUNT])
                .convert::<B::FloatElem>(),
            &self.device,
        )
        .permute([0, 3, 1, 2]);

        let targets = Tensor::<B, 2>::from_data(
            TensorData::new(targets, [count, classes]).convert::<B::FloatElem>(),
            &self.device,
        );

        ActivityBatch { images, targets }
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use burn::backend::NdArray;
    use image::{Rgb, RgbImage};
    use ndarray::array;
    use tempfile::TempDir;

    use super::*;

    fn write_image(dir: &Path, class: &str, name: &str, color: [u8; 3]) -> PathBuf {
        let class_dir = dir.join(class);
        std::fs::create_dir_all(&class_dir).unwrap();
        let path = class_dir.join(name);
        RgbImage::from_pixel(10, 10, Rgb(color)).save(&path).unwrap();
        path
    }

    #[test]
    fn label_comes_from_parent_directory() {
        let path = Path::new("dataset/cooking/frame_01.jpg");
        assert_eq!(label_for_path(path), Some("cooking"));
        assert_eq!(label_for_path(Path::new("frame.jpg")), None);
    }

    #[test]
    fn image_extensions_are_case_insensitive() {
        assert!(is_image_file(Path::new("a/b/c.JPG")));
        assert!(is_image_file(Path::new("a/b/c.png")));
        assert!(!is_image_file(Path::new("a/b/notes.txt")));
        assert!(!is_image_file(Path::new("a/b/no_extension")));
    }

    #[test]
    fn loads_only_allowed_classes_at_full_resolution() {
        let dir = TempDir::new().unwrap();
        write_image(dir.path(), "cooking", "a.png", [200, 10, 10]);
        write_image(dir.path(), "cooking", "b.png", [210, 10, 10]);
        write_image(dir.path(), "drinking", "c.png", [10, 10, 200]);
        write_image(dir.path(), "sleeping", "d.png", [10, 200, 10]);
        std::fs::write(dir.path().join("cooking").join("readme.txt"), "skip me").unwrap();

        let loaded = load_images(dir.path(), &["cooking", "drinking"]).unwrap();

        assert_eq!(loaded.images.len(), loaded.labels.len());
        assert_eq!(loaded.labels, vec!["cooking", "cooking", "drinking"]);
        for image in &loaded.images {
            assert_eq!(image.shape(), &[HEIGHT, WIDTH, CHANNEL_COUNT]);
        }
        assert_eq!(loaded.images[2][[0, 0, 2]], 200);
    }

    #[test]
    fn undecodable_image_fails_the_load() {
        let dir = TempDir::new().unwrap();
        write_image(dir.path(), "cooking", "good.png", [1, 2, 3]);
        std::fs::write(dir.path().join("cooking").join("broken.png"), b"not a png").unwrap();

        let err = load_images(dir.path(), &["cooking"]).unwrap_err();
        assert!(matches!(err, Error::ImageDecode { .. }));
    }

    #[test]
    fn short_pixel_buffer_is_a_layout_error() {
        let err = pixels_to_array(Path::new("cooking/short.png"), vec![0; 12]).unwrap_err();
        assert!(matches!(err, Error::ImageLayout { path, .. } if path.ends_with("short.png")));
    }

    #[test]
    fn missing_root_is_reported() {
        let err = load_images(Path::new("/definitely/not/here"), &["cooking"]).unwrap_err();
        assert!(matches!(err, Error::DatasetNotFound(_)));
    }

    #[test]
    fn batcher_stacks_channels_first() {
        let mut image = Array3::<f32>::zeros((HEIGHT, WIDTH, CHANNEL_COUNT));
        image[[5, 7, 1]] = 42.0;
        let samples = vec![
            Sample {
                image: image.clone(),
                target: array![1.0, 0.0],
            },
            Sample {
                image,
                target: array![0.0, 1.0],
            },
        ];

        let batch = ActivityBatcher::<NdArray>::new(Default::default()).batch(samples);

        assert_eq!(batch.images.dims(), [2, CHANNEL_COUNT, HEIGHT, WIDTH]);
        assert_eq!(batch.targets.dims(), [2, 2]);
        let value: f32 = batch
            .images
            .slice([1..2, 1..2, 5..6, 7..8])
            .into_scalar()
            .elem();
        assert_eq!(value, 42.0);
    }
}
