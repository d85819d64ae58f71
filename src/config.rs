use std::path::PathBuf;

use burn::optim::{momentum::MomentumConfig, SgdConfig};
use serde::{Deserialize, Serialize};

use crate::{backbone::BackboneConfig, model::ModelConfig, training::TrainingConfig};

/// Everything one run needs to know about its inputs and outputs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    pub dataset_path: PathBuf,
    pub model_output_path: PathBuf,
    pub label_output_path: PathBuf,
    pub epoch_count: usize,
    pub plot_output_path: PathBuf,
    /// Pretrained backbone record; random initialisation when absent.
    pub backbone_path: Option<PathBuf>,
    /// Channel multiplier of the backbone; must match the pretrained weights.
    pub backbone_width: f64,
    pub batch_size: usize,
    pub seed: u64,
}

impl RunConfig {
    pub fn new(
        dataset_path: PathBuf,
        model_output_path: PathBuf,
        label_output_path: PathBuf,
    ) -> Self {
        Self {
            dataset_path,
            model_output_path,
            label_output_path,
            epoch_count: 25,
            plot_output_path: PathBuf::from("plot.png"),
            backbone_path: None,
            backbone_width: 1.0,
            batch_size: 32,
            seed: 42,
        }
    }

    /// Hyper-parameters for a head over `classes` outputs.
    pub fn training_config(&self, classes: usize) -> TrainingConfig {
        let optimizer = SgdConfig::new().with_momentum(Some(MomentumConfig {
            momentum: 0.9,
            dampening: 0.,
            nesterov: false,
        }));

        let model = ModelConfig::new(classes)
            .with_backbone(BackboneConfig::new().with_width_multiplier(self.backbone_width));

        TrainingConfig::new(model, optimizer)
            .with_epoch_count(self.epoch_count)
            .with_batch_size(self.batch_size)
            .with_seed(self.seed)
    }
}
