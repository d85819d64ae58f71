//! MobileNetV2 feature extractor, without its classifier.

pub mod conv_norm;
pub mod inverted_residual;

use std::path::Path;

use burn::prelude::*;
use tracing::info;

use crate::{error::Result, record::load_weights};

use self::{
    conv_norm::{ConvNorm, ConvNormConfig},
    inverted_residual::{InvertedResidual, InvertedResidualConfig},
};

const INVERTED_RESIDUAL_SETTINGS: [[usize; 4]; 7] = [
    // t = expansion factor, c = channels, n = blocks, s = stride of the first block
    // t, c, n, s
    [1, 16, 1, 1],
    [6, 24, 2, 2],
    [6, 32, 3, 2],
    [6, 64, 4, 2],
    [6, 96, 3, 1],
    [6, 160, 3, 2],
    [6, 320, 1, 1],
];

const STEM_CHANNELS: usize = 32;
const LAST_CHANNELS: usize = 1280;

/// Rounds a scaled channel count to a multiple of 8 without losing more than 10%.
fn make_divisible(channels: f64) -> usize {
    const DIVISOR: usize = 8;
    let rounded = ((channels + DIVISOR as f64 / 2.0) as usize / DIVISOR * DIVISOR).max(DIVISOR);
    if (rounded as f64) < 0.9 * channels {
        rounded + DIVISOR
    } else {
        rounded
    }
}

#[derive(Module, Debug)]
enum Block<B: Backend> {
    Conv(ConvNorm<B>),
    InvertedResidual(InvertedResidual<B>),
}

impl<B: Backend> Block<B> {
    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        match self {
            Block::Conv(conv) => conv.forward(x),
            Block::InvertedResidual(inverted_residual) => inverted_residual.forward(x),
        }
    }
}

/// Maps `[batch, 3, 224, 224]` images to `[batch, out_channels, 7, 7]` feature maps.
#[derive(Module, Debug)]
pub struct Backbone<B: Backend> {
    blocks: Vec<Block<B>>,
    out_channels: usize,
}

impl<B: Backend> Backbone<B> {
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        self.blocks.iter().fold(x, |x, block| block.forward(x))
    }

    pub fn out_channels(&self) -> usize {
        self.out_channels
    }
}

#[derive(Config, Debug)]
pub struct BackboneConfig {
    #[config(default = 1.0)]
    pub width_multiplier: f64,
}

impl BackboneConfig {
    pub fn out_channels(&self) -> usize {
        make_divisible(LAST_CHANNELS as f64 * self.width_multiplier.max(1.0))
    }

    /// Randomly initialised network.
    pub fn init<B: Backend>(&self, device: &B::Device) -> Backbone<B> {
        let mut input_channels = make_divisible(STEM_CHANNELS as f64 * self.width_multiplier);
        let out_channels = self.out_channels();

        let mut blocks = vec![Block::Conv(
            ConvNormConfig::new([3, input_channels], [3, 3])
                .with_stride([2, 2])
                .init(device),
        )];

        for [t, c, n, s] in INVERTED_RESIDUAL_SETTINGS {
            let output_channels = make_divisible(c as f64 * self.width_multiplier);
            for i in 0..n {
                let stride = if i == 0 { s } else { 1 };
                blocks.push(Block::InvertedResidual(
                    InvertedResidualConfig::new([input_channels, output_channels], stride, t)
                        .init(device),
                ));
                input_channels = output_channels;
            }
        }

        blocks.push(Block::Conv(
            ConvNormConfig::new([input_channels, out_channels], [1, 1]).init(device),
        ));

        Backbone {
            blocks,
            out_channels,
        }
    }

    /// Network with weights read from a record written by [`crate::record::save_weights`].
    pub fn init_pretrained<B: Backend>(
        &self,
        weights: &Path,
        device: &B::Device,
    ) -> Result<Backbone<B>> {
        let backbone = load_weights::<B, _>(self.init(device), weights, device)?;

        info!(weights = %weights.display(), "loaded pretrained backbone");

        Ok(backbone)
    }
}

#[cfg(test)]
mod tests {
    use burn::backend::NdArray;

    use super::*;

    #[test]
    fn channel_rounding_matches_published_widths() {
        assert_eq!(make_divisible(32.0), 32);
        assert_eq!(make_divisible(32.0 * 0.35), 16);
        assert_eq!(make_divisible(24.0 * 0.5), 16);
        assert_eq!(make_divisible(1.0), 8);
    }

    #[test]
    fn downsamples_by_thirty_two() {
        let device = Default::default();
        let config = BackboneConfig::new().with_width_multiplier(0.25);
        let backbone = config.init::<NdArray>(&device);

        let features = backbone.forward(Tensor::zeros([1, 3, 64, 64], &device));
        assert_eq!(features.dims(), [1, LAST_CHANNELS, 2, 2]);
        assert_eq!(backbone.out_channels(), config.out_channels());
    }
}
