use burn::prelude::*;

use super::conv_norm::{ConvNorm, ConvNormConfig};

/// MobileNetV2 bottleneck: optional 1x1 expansion, 3x3 depthwise, linear 1x1 projection.
#[derive(Module, Debug)]
pub struct InvertedResidual<B: Backend> {
    expand: Option<ConvNorm<B>>,
    depthwise: ConvNorm<B>,
    project: ConvNorm<B>,

    residual: bool,
}

impl<B: Backend> InvertedResidual<B> {
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let input = x.clone();

        let x = match &self.expand {
            Some(expand) => expand.forward(x),
            None => x,
        };
        let x = self.depthwise.forward(x);
        let x = self.project.forward(x);

        if self.residual {
            input + x
        } else {
            x
        }
    }
}

#[derive(Config, Debug)]
pub struct InvertedResidualConfig {
    pub channels: [usize; 2],
    pub stride: usize,
    pub expand_ratio: usize,
}

impl InvertedResidualConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> InvertedResidual<B> {
        let [input, output] = self.channels;
        let hidden = input * self.expand_ratio;

        let expand = (self.expand_ratio > 1)
            .then(|| ConvNormConfig::new([input, hidden], [1, 1]).init(device));

        InvertedResidual {
            expand,
            depthwise: ConvNormConfig::new([hidden, hidden], [3, 3])
                .with_stride([self.stride, self.stride])
                .with_groups(hidden)
                .init(device),
            project: ConvNormConfig::new([hidden, output], [1, 1])
                .with_relu6(false)
                .init(device),
            residual: self.stride == 1 && input == output,
        }
    }
}

#[cfg(test)]
mod tests {
    use burn::backend::NdArray;

    use super::*;

    #[test]
    fn residual_only_when_shape_is_kept() {
        let device = Default::default();
        let same = InvertedResidualConfig::new([16, 16], 1, 6).init::<NdArray>(&device);
        let strided = InvertedResidualConfig::new([16, 24], 2, 6).init::<NdArray>(&device);

        assert!(same.residual);
        assert!(!strided.residual);

        let x = Tensor::<NdArray, 4>::ones([1, 16, 8, 8], &device);
        assert_eq!(same.forward(x.clone()).dims(), [1, 16, 8, 8]);
        assert_eq!(strided.forward(x).dims(), [1, 24, 4, 4]);
    }

    #[test]
    fn no_expansion_for_unit_ratio() {
        let block =
            InvertedResidualConfig::new([32, 16], 1, 1).init::<NdArray>(&Default::default());
        assert!(block.expand.is_none());
    }
}
