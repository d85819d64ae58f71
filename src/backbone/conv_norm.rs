use burn::{
    nn::{
        conv::{Conv2d, Conv2dConfig},
        BatchNorm, BatchNormConfig, PaddingConfig2d,
    },
    prelude::*,
    tensor::activation::relu,
};

/// Convolution followed by batch norm and, optionally, a ReLU clipped at 6.
#[derive(Module, Debug)]
pub struct ConvNorm<B: Backend> {
    conv: Conv2d<B>,
    norm: BatchNorm<B, 2>,
    relu6: bool,
}

impl<B: Backend> ConvNorm<B> {
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.conv.forward(x);
        let x = self.norm.forward(x);

        if self.relu6 {
            relu(x).clamp_max(6)
        } else {
            x
        }
    }
}

#[derive(Config, Debug)]
pub struct ConvNormConfig {
    channels: [usize; 2],

    kernel_size: [usize; 2],

    #[config(default = "[1, 1]")]
    stride: [usize; 2],

    #[config(default = "1")]
    groups: usize,

    #[config(default = true)]
    relu6: bool,
}

impl ConvNormConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> ConvNorm<B> {
        // same padding for odd kernels
        let padding = PaddingConfig2d::Explicit(self.kernel_size[0] / 2, self.kernel_size[1] / 2);

        ConvNorm {
            conv: Conv2dConfig::new(self.channels, self.kernel_size)
                .with_stride(self.stride)
                .with_padding(padding)
                .with_groups(self.groups)
                .with_bias(false)
                .init(device),
            norm: BatchNormConfig::new(self.channels[1]).init(device),
            relu6: self.relu6,
        }
    }
}
