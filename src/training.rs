use std::{
    fs,
    io::{BufReader, BufWriter},
    path::{Path, PathBuf},
};

use burn::{
    config::Config,
    data::{dataloader::batcher::Batcher, dataset::Dataset},
    module::AutodiffModule,
    optim::{Optimizer, SgdConfig},
    LearningRate,
    prelude::*,
    tensor::backend::AutodiffBackend,
    train::{ClassificationOutput, TrainStep, ValidStep},
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::{
    augment::{AugmentationConfig, BatchGenerator, IMAGENET_MEAN},
    config::RunConfig,
    data::{load_images, ActivityBatcher, ActivityDataset},
    encoder::LabelEncoder,
    error::{Error, Result},
    model::{Model, ModelConfig},
    plot,
    record::save_weights,
    report::{evaluate, ClassificationReport},
    split::{stratified_split, SplitConfig},
    LABELS,
};

#[derive(Config)]
pub struct TrainingConfig {
    pub model: ModelConfig,

    pub optimizer: SgdConfig,

    #[config(default = 25)]
    pub epoch_count: usize,

    #[config(default = 32)]
    pub batch_size: usize,

    #[config(default = 42)]
    pub seed: u64,

    #[config(default = 1.0e-4)]
    pub learning_rate: f64,

    #[config(default = 0.25)]
    pub test_fraction: f64,

    #[config(default = "IMAGENET_MEAN")]
    pub mean: [f32; 3],

    #[config(default = "AugmentationConfig::default()")]
    pub augmentation: AugmentationConfig,
}

impl TrainingConfig {
    /// Per-step decay coefficient: the base rate spread over the epochs.
    pub fn decay(&self) -> f64 {
        self.learning_rate / self.epoch_count.max(1) as f64
    }
}

/// `lr / (1 + decay * t)`, where `t` counts optimizer steps already taken.
#[derive(Debug, Clone)]
pub struct InverseTimeDecay {
    initial: LearningRate,
    decay: f64,
    iteration: usize,
}

impl InverseTimeDecay {
    pub fn new(initial: LearningRate, decay: f64) -> Self {
        Self {
            initial,
            decay,
            iteration: 0,
        }
    }

    pub fn step(&mut self) -> LearningRate {
        let rate = self.initial / (1.0 + self.decay * self.iteration as f64);
        self.iteration += 1;
        rate
    }
}

/// Per-epoch curves, one value per completed epoch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingHistory {
    pub loss: Vec<f64>,
    pub val_loss: Vec<f64>,
    pub accuracy: Vec<f64>,
    pub val_accuracy: Vec<f64>,
}

impl TrainingHistory {
    pub fn epochs(&self) -> usize {
        self.loss.len()
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let writer = BufWriter::new(fs::File::create(path)?);
        serde_json::to_writer_pretty(writer, self)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let reader = BufReader::new(fs::File::open(path)?);
        Ok(serde_json::from_reader(reader)?)
    }
}

/// The history is kept beside the plot drawn from it.
pub fn history_path(plot_path: &Path) -> PathBuf {
    plot_path.with_extension("history.json")
}

#[derive(Debug, Default)]
struct EpochMetrics {
    loss_sum: f64,
    correct: usize,
    seen: usize,
}

impl EpochMetrics {
    fn record<B: Backend>(&mut self, output: &ClassificationOutput<B>) {
        let count = output.targets.dims()[0];
        let loss: f64 = output.loss.clone().into_scalar().elem();
        let correct: i64 = output
            .output
            .clone()
            .argmax(1)
            .squeeze::<1>(1)
            .equal(output.targets.clone())
            .int()
            .sum()
            .into_scalar()
            .elem();

        self.loss_sum += loss * count as f64;
        self.correct += correct as usize;
        self.seen += count;
    }

    fn loss(&self) -> f64 {
        self.loss_sum / self.seen.max(1) as f64
    }

    fn accuracy(&self) -> f64 {
        self.correct as f64 / self.seen.max(1) as f64
    }
}

/// Batches drawn per epoch: whole batches only, but never zero.
pub fn steps_per_epoch(samples: usize, batch_size: usize) -> usize {
    (samples / batch_size.max(1)).max(1)
}

/// Trains the head of `model` for `config.epoch_count` epochs.
pub fn fit<B: AutodiffBackend>(
    mut model: Model<B>,
    train: &ActivityDataset,
    valid: &ActivityDataset,
    config: &TrainingConfig,
    device: &B::Device,
) -> Result<(Model<B>, TrainingHistory)> {
    let mut optimizer = config.optimizer.init::<B, Model<B>>();
    let mut schedule = InverseTimeDecay::new(config.learning_rate, config.decay());

    let mut train_batches = BatchGenerator::training(
        train,
        config.batch_size,
        config.mean,
        config.augmentation,
        config.seed,
    )?;
    let mut valid_batches = BatchGenerator::validation(valid, config.batch_size, config.mean)?;

    let batcher_train = ActivityBatcher::<B>::new(device.clone());
    let batcher_valid = ActivityBatcher::<B::InnerBackend>::new(device.clone());

    let train_steps = steps_per_epoch(train.len(), config.batch_size);
    let valid_steps = steps_per_epoch(valid.len(), config.batch_size);

    let mut history = TrainingHistory::default();

    for epoch in 1..=config.epoch_count {
        let mut train_metrics = EpochMetrics::default();
        for samples in train_batches.by_ref().take(train_steps) {
            let output = TrainStep::step(&model, batcher_train.batch(samples));
            train_metrics.record(&output.item);
            model = optimizer.step(schedule.step(), model, output.grads);
        }

        let model_valid = model.valid();
        let mut valid_metrics = EpochMetrics::default();
        for samples in valid_batches.by_ref().take(valid_steps) {
            let output = ValidStep::step(&model_valid, batcher_valid.batch(samples));
            valid_metrics.record(&output);
        }

        history.loss.push(train_metrics.loss());
        history.accuracy.push(train_metrics.accuracy());
        history.val_loss.push(valid_metrics.loss());
        history.val_accuracy.push(valid_metrics.accuracy());

        info!(
            epoch,
            epochs = config.epoch_count,
            loss = train_metrics.loss(),
            accuracy = train_metrics.accuracy(),
            val_loss = valid_metrics.loss(),
            val_accuracy = valid_metrics.accuracy(),
            "epoch finished"
        );
    }

    Ok((model, history))
}

/// Where the architecture of the model stored at `model_path` lives.
pub fn architecture_path(model_path: &Path) -> PathBuf {
    let path = model_path.with_extension("json");
    if path == model_path {
        model_path.with_extension("config.json")
    } else {
        path
    }
}

/// Writes the weights to `path` and the architecture as JSON beside them.
pub fn save_model<B: Backend>(model: &Model<B>, config: &ModelConfig, path: &Path) -> Result<()> {
    save_weights::<B, _>(model.clone(), path)?;
    config.save(architecture_path(path))?;

    Ok(())
}

/// Files written by a run, and what was learned along the way.
#[derive(Debug)]
pub struct TrainOutcome {
    pub history: TrainingHistory,
    pub report: ClassificationReport,
    pub classes: Vec<String>,
    pub model_path: PathBuf,
    pub label_path: PathBuf,
    pub plot_path: PathBuf,
    pub history_path: PathBuf,
}

/// Loads the dataset, trains the head, evaluates it and writes every artifact.
pub fn train<B: AutodiffBackend>(run: &RunConfig, device: B::Device) -> Result<TrainOutcome> {
    info!(root = %run.dataset_path.display(), "loading images");
    let loaded = load_images(&run.dataset_path, &LABELS)?;
    if loaded.is_empty() {
        return Err(Error::EmptyDataset {
            root: run.dataset_path.clone(),
            allowed: LABELS.iter().map(|label| label.to_string()).collect(),
        });
    }

    let encoder = LabelEncoder::fit(&loaded.labels)?;
    let targets = encoder.transform(&loaded.labels)?;
    let config = run.training_config(encoder.num_classes());

    info!("splitting data");
    let classes = loaded
        .labels
        .iter()
        .map(|label| encoder.index_of(label))
        .collect::<Result<Vec<_>>>()?;
    let split = stratified_split(
        &classes,
        &SplitConfig {
            test_fraction: config.test_fraction,
            seed: config.seed,
        },
    )?;
    let train_set = ActivityDataset::from_indices(&loaded.images, &targets, &split.train);
    let test_set = ActivityDataset::from_indices(&loaded.images, &targets, &split.test);
    drop(loaded);
    info!(
        train = train_set.len(),
        test = test_set.len(),
        classes = ?encoder.classes(),
        "split data"
    );

    B::seed(config.seed);

    info!("compiling model");
    let backbone = match &run.backbone_path {
        Some(weights) => config.model.backbone.init_pretrained::<B>(weights, &device)?,
        None => {
            warn!("no pretrained backbone given, training on randomly initialised features");
            config.model.backbone.init::<B>(&device)
        }
    };
    let model = config.model.init_with_backbone(backbone, &device);

    info!(epochs = config.epoch_count, batch_size = config.batch_size, "training head");
    let (model, history) = fit(model, &train_set, &test_set, &config, &device)?;

    info!("evaluating network");
    let model = model.valid();
    let report = evaluate(&model, &test_set, &encoder, config.batch_size, config.mean, &device)?;

    plot::render(&history, &run.plot_output_path)?;
    let history_path = history_path(&run.plot_output_path);
    history.save(&history_path)?;
    info!(
        plot = %run.plot_output_path.display(),
        history = %history_path.display(),
        "saved training curves"
    );

    info!("serializing network");
    save_model(&model, &config.model, &run.model_output_path)?;
    encoder.save(&run.label_output_path)?;
    info!(
        model = %run.model_output_path.display(),
        labels = %run.label_output_path.display(),
        "model saved"
    );

    Ok(TrainOutcome {
        history,
        report,
        classes: encoder.classes().to_vec(),
        model_path: run.model_output_path.clone(),
        label_path: run.label_output_path.clone(),
        plot_path: run.plot_output_path.clone(),
        history_path,
    })
}
