use burn::{
    module::AutodiffModule,
    nn::{
        pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig},
        Dropout, DropoutConfig, Linear, LinearConfig,
    },
    prelude::*,
    tensor::{
        activation::{log_softmax, relu, softmax},
        backend::AutodiffBackend,
    },
    train::{ClassificationOutput, TrainOutput, TrainStep, ValidStep},
};

use crate::{
    backbone::{Backbone, BackboneConfig},
    data::ActivityBatch,
};

/// Trainable classifier stacked on the backbone's feature maps.
#[derive(Module, Debug)]
pub struct Head<B: Backend> {
    avg_pool: AdaptiveAvgPool2d,
    hidden: Linear<B>,
    dropout: Dropout,
    output: Linear<B>,
    l1: f64,
}

impl<B: Backend> Head<B> {
    /// Class logits; softmax is applied by [`Model::predict`] and inside the loss.
    pub fn forward(&self, features: Tensor<B, 4>) -> Tensor<B, 2> {
        let x = self.avg_pool.forward(features);
        let x = x.flatten(1, 3);
        let x = relu(self.hidden.forward(x));
        let x = self.dropout.forward(x);
        self.output.forward(x)
    }

    /// L1 penalty on the hidden layer's kernel.
    pub fn l1_penalty(&self) -> Tensor<B, 1> {
        self.hidden.weight.val().abs().sum().mul_scalar(self.l1)
    }
}

#[derive(Module, Debug)]
pub struct Model<B: Backend> {
    backbone: Backbone<B>,
    head: Head<B>,
}

impl<B: Backend> Model<B> {
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        self.head.forward(self.backbone.forward(images))
    }

    /// Class probabilities per image.
    pub fn predict(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        softmax(self.forward(images), 1)
    }

    pub fn head(&self) -> &Head<B> {
        &self.head
    }

    /// Categorical cross-entropy against one-hot `targets`, plus the L1 penalty.
    fn classify(&self, logits: Tensor<B, 2>, targets: Tensor<B, 2>) -> ClassificationOutput<B> {
        let cross_entropy = (log_softmax(logits.clone(), 1) * targets.clone())
            .sum_dim(1)
            .mean()
            .neg();
        let loss = cross_entropy + self.head.l1_penalty();

        let classes = targets.argmax(1).squeeze::<1>(1);

        ClassificationOutput::new(loss, logits, classes)
    }

    pub fn forward_classification(
        &self,
        images: Tensor<B, 4>,
        targets: Tensor<B, 2>,
    ) -> ClassificationOutput<B> {
        let logits = self.forward(images);
        self.classify(logits, targets)
    }
}

impl<B: AutodiffBackend> TrainStep<ActivityBatch<B>, ClassificationOutput<B>> for Model<B> {
    fn step(&self, batch: ActivityBatch<B>) -> TrainOutput<ClassificationOutput<B>> {
        // The frozen backbone runs without autodiff so its batch norms stay in inference mode.
        let features = self.backbone.valid().forward(batch.images.inner());
        let logits = self.head.forward(Tensor::from_inner(features));
        let item = self.classify(logits, batch.targets);

        TrainOutput::new(self, item.loss.backward(), item)
    }
}

impl<B: Backend> ValidStep<ActivityBatch<B>, ClassificationOutput<B>> for Model<B> {
    fn step(&self, batch: ActivityBatch<B>) -> ClassificationOutput<B> {
        self.forward_classification(batch.images, batch.targets)
    }
}

#[derive(Config, Debug)]
pub struct ModelConfig {
    pub classes: usize,

    #[config(default = 512)]
    pub hidden: usize,

    #[config(default = 0.5)]
    pub dropout: f64,

    #[config(default = 0.01)]
    pub l1: f64,

    #[config(default = "BackboneConfig::new()")]
    pub backbone: BackboneConfig,
}

impl ModelConfig {
    /// Model with a randomly initialised backbone.
    pub fn init<B: Backend>(&self, device: &B::Device) -> Model<B> {
        self.init_with_backbone(self.backbone.init(device), device)
    }

    /// Stacks a fresh head on `backbone` and freezes the backbone's parameters.
    pub fn init_with_backbone<B: Backend>(
        &self,
        backbone: Backbone<B>,
        device: &B::Device,
    ) -> Model<B> {
        let head = Head {
            avg_pool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
            hidden: LinearConfig::new(backbone.out_channels(), self.hidden).init(device),
            dropout: DropoutConfig::new(self.dropout).init(),
            output: LinearConfig::new(self.hidden, self.classes).init(device),
            l1: self.l1,
        };

        Model {
            backbone: backbone.no_grad(),
            head,
        }
    }
}

#[cfg(test)]
mod tests {
    use burn::{
        backend::{Autodiff, NdArray},
        optim::{Optimizer, SgdConfig},
    };

    use super::*;

    type TestBackend = Autodiff<NdArray>;

    fn tiny_config() -> ModelConfig {
        ModelConfig::new(2)
            .with_hidden(8)
            .with_backbone(BackboneConfig::new().with_width_multiplier(0.25))
    }

    fn batch(device: &<TestBackend as Backend>::Device) -> ActivityBatch<TestBackend> {
        ActivityBatch {
            images: Tensor::random([2, 3, 32, 32], burn::tensor::Distribution::Default, device),
            targets: Tensor::from_floats([[1.0, 0.0], [0.0, 1.0]], device),
        }
    }

    #[test]
    fn predictions_are_probabilities() {
        let device = Default::default();
        let model = tiny_config().init::<NdArray>(&device);

        let probabilities = model.predict(Tensor::zeros([3, 3, 32, 32], &device));
        assert_eq!(probabilities.dims(), [3, 2]);

        let sums = probabilities.sum_dim(1).into_data().to_vec::<f32>().unwrap();
        assert!(sums.iter().all(|sum| (sum - 1.0).abs() < 1e-4));
    }

    #[test]
    fn loss_includes_l1_penalty() {
        let device = Default::default();
        let model = tiny_config().with_dropout(0.0).init::<NdArray>(&device);
        let images = Tensor::zeros([2, 3, 32, 32], &device);
        let targets = Tensor::from_floats([[1.0, 0.0], [0.0, 1.0]], &device);

        let output = model.forward_classification(images, targets);
        let loss: f32 = output.loss.into_scalar().elem();
        let penalty: f32 = model.head().l1_penalty().into_scalar().elem();

        assert!(penalty > 0.0);
        assert!(loss > penalty);
        assert_eq!(output.targets.into_data().to_vec::<i64>().unwrap(), vec![0, 1]);
    }

    #[test]
    fn training_step_leaves_backbone_untouched() {
        let device = Default::default();
        let model = tiny_config().with_dropout(0.0).init::<TestBackend>(&device);
        let input = || Tensor::ones([1, 3, 32, 32], &device);
        let backbone_before = model.backbone.valid().forward(input());
        let head_before = model.head.output.weight.val().inner().into_data();

        let output = TrainStep::step(&model, batch(&device));
        let mut optimizer = SgdConfig::new().init();
        let model = optimizer.step(0.1, model, output.grads);

        let backbone_after = model.backbone.valid().forward(input());
        let head_after = model.head.output.weight.val().inner().into_data();

        backbone_after
            .into_data()
            .assert_approx_eq(&backbone_before.into_data(), 5);
        assert_ne!(
            head_after.to_vec::<f32>().unwrap(),
            head_before.to_vec::<f32>().unwrap()
        );
    }
}
