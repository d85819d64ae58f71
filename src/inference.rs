use std::path::Path;

use burn::prelude::*;
use ndarray::Array3;

use crate::{
    augment::IMAGENET_MEAN,
    data::{decode_image, CHANNEL_COUNT, HEIGHT, WIDTH},
    encoder::LabelEncoder,
    error::{Error, Result},
    model::{Model, ModelConfig},
    record::load_weights,
    training::architecture_path,
};

#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    pub class: String,
    pub confidence: f32,
    pub probabilities: Vec<f32>,
}

/// A trained model together with the encoder that names its outputs.
pub struct Predictor<B: Backend> {
    model: Model<B>,
    encoder: LabelEncoder,
    mean: [f32; 3],
    device: B::Device,
}

impl<B: Backend> Predictor<B> {
    pub fn new(model: Model<B>, encoder: LabelEncoder, device: B::Device) -> Self {
        Self {
            model,
            encoder,
            mean: IMAGENET_MEAN,
            device,
        }
    }

    /// Restores the artifacts written by a training run.
    ///
    /// `model_path` is the path the run was given; the architecture is read from the
    /// `.json` file beside it.
    pub fn load(model_path: &Path, label_path: &Path, device: B::Device) -> Result<Self> {
        let config = ModelConfig::load(architecture_path(model_path))
            .map_err(|err| Error::Config(format!("{}: {err:?}", model_path.display())))?;
        let encoder = LabelEncoder::load(label_path)?;

        if config.classes != encoder.num_classes() {
            return Err(Error::Config(format!(
                "model has {} outputs but the encoder knows {} classes",
                config.classes,
                encoder.num_classes()
            )));
        }

        let model = load_weights::<B, _>(config.init(&device), model_path, &device)?;

        Ok(Self::new(model, encoder, device))
    }

    pub fn classes(&self) -> &[String] {
        self.encoder.classes()
    }

    pub fn predict_file(&self, path: &Path) -> Result<Prediction> {
        self.predict_image(&decode_image(path)?)
    }

    /// Classifies a `HEIGHT x WIDTH x 3` RGB image.
    pub fn predict_image(&self, image: &Array3<u8>) -> Result<Prediction> {
        if image.dim() != (HEIGHT, WIDTH, CHANNEL_COUNT) {
            return Err(Error::Config(format!(
                "expected a {HEIGHT}x{WIDTH}x{CHANNEL_COUNT} image, got {:?}",
                image.dim()
            )));
        }

        let pixels: Vec<f32> = image
            .indexed_iter()
            .map(|((_, _, channel), &value)| f32::from(value) - self.mean[channel])
            .collect();
        let input = Tensor::<B, 4>::from_data(
            TensorData::new(pixels, [1, HEIGHT, WIDTH, CHANNEL_COUNT]).convert::<B::FloatElem>(),
            &self.device,
        )
        .permute([0, 3, 1, 2]);

        let probabilities = self
            .model
            .predict(input)
            .into_data()
            .iter::<f32>()
            .collect::<Vec<_>>();

        let (index, confidence) = probabilities
            .iter()
            .copied()
            .enumerate()
            .fold((0, f32::NEG_INFINITY), |best, (index, value)| {
                if value > best.1 {
                    (index, value)
                } else {
                    best
                }
            });

        Ok(Prediction {
            class: self.encoder.class_name(index)?.to_string(),
            confidence,
            probabilities,
        })
    }
}

#[cfg(test)]
mod tests {
    use burn::backend::NdArray;
    use tempfile::TempDir;

    use super::*;
    use crate::{backbone::BackboneConfig, training::save_model};

    fn tiny_config() -> ModelConfig {
        ModelConfig::new(2)
            .with_hidden(4)
            .with_backbone(BackboneConfig::new().with_width_multiplier(0.25))
    }

    #[test]
    fn reloaded_model_predicts_like_the_saved_one() {
        let dir = TempDir::new().unwrap();
        let device = Default::default();
        let config = tiny_config();
        let model = config.init::<NdArray>(&device);
        let encoder = LabelEncoder::fit(&["cooking", "drinking"]).unwrap();

        let model_path = dir.path().join("activity.model");
        let label_path = dir.path().join("lb.bin");
        save_model(&model, &config, &model_path).unwrap();
        encoder.save(&label_path).unwrap();
        assert!(model_path.exists());

        let image = Array3::from_elem((HEIGHT, WIDTH, CHANNEL_COUNT), 120u8);
        let original = Predictor::new(model, encoder, device).predict_image(&image).unwrap();
        let reloaded = Predictor::<NdArray>::load(&model_path, &label_path, device)
            .unwrap()
            .predict_image(&image)
            .unwrap();

        assert_eq!(reloaded.probabilities.len(), 2);
        assert!(["cooking", "drinking"].contains(&reloaded.class.as_str()));
        // weights are stored at half precision
        for (a, b) in original.probabilities.iter().zip(&reloaded.probabilities) {
            assert!((a - b).abs() < 0.05);
        }
    }

    #[test]
    fn mismatched_encoder_is_rejected() {
        let dir = TempDir::new().unwrap();
        let device = Default::default();
        let config = tiny_config();
        let model = config.init::<NdArray>(&device);

        let model_path = dir.path().join("activity.model");
        let label_path = dir.path().join("lb.bin");
        save_model(&model, &config, &model_path).unwrap();
        LabelEncoder::fit(&["a", "b", "c"]).unwrap().save(&label_path).unwrap();

        assert!(matches!(
            Predictor::<NdArray>::load(&model_path, &label_path, device),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn wrong_image_size_is_rejected() {
        let device = Default::default();
        let predictor = Predictor::new(
            tiny_config().init::<NdArray>(&device),
            LabelEncoder::fit(&["cooking", "drinking"]).unwrap(),
            device,
        );

        let image = Array3::<u8>::zeros((10, 10, 3));
        assert!(predictor.predict_image(&image).is_err());
    }
}
