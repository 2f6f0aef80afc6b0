use tch::{nn, nn::Module, nn::ModuleT, Tensor};

use crate::model::{Mode, NetConfig};

/// `(output channels, stride)` for the eight convolution blocks.
const CONV_BLOCKS: [(i64, i64); 8] = [
    (64, 1),
    (64, 2),
    (128, 1),
    (128, 2),
    (256, 1),
    (256, 2),
    (512, 1),
    (512, 2),
];

const DENSE_UNITS: i64 = 1024;

/// Convolution stack plus two dense layers scoring how likely an image is
/// genuine. One instance serves both evaluations of a training step, so
/// the real and the generated batch read the same variables.
#[derive(Debug)]
pub struct Discriminator {
    features: nn::SequentialT,
    dense1: nn::Linear,
    dense2: nn::Linear,
}

impl Discriminator {
    pub fn new(path: nn::Path, config: &NetConfig) -> Discriminator {
        let mut features = nn::seq_t();
        let mut in_channels = config.channels;
        let (mut height, mut width) = (config.hr_height, config.hr_width);
        for (i, &(out_channels, stride)) in CONV_BLOCKS.iter().enumerate() {
            let block = &path / format!("conv{}", i + 1);
            features = features.add(nn::conv2d(&block, in_channels, out_channels,
                                               3, nn::ConvConfig { stride, padding: 1, ..Default::default() }));
            // The first block runs without batch norm.
            if i > 0 {
                features = features.add(nn::batch_norm2d(&block / "bn", out_channels, config.batch_norm()));
            }
            features = features.add_fn(|x| x.leaky_relu());
            in_channels = out_channels;
            height = (height + stride - 1) / stride;
            width = (width + stride - 1) / stride;
        }
        let flat = in_channels * height * width;
        Discriminator {
            features,
            dense1: nn::linear(&path / "dense1", flat, DENSE_UNITS, Default::default()),
            dense2: nn::linear(&path / "dense2", DENSE_UNITS, 1, Default::default()),
        }
    }

    /// Probability in (0, 1) that each image of a `[B, H, W, C]` batch is
    /// genuine; shape `[B, 1]`.
    pub fn evaluate(&self, image: &Tensor, mode: Mode) -> Tensor {
        image
            .permute([0, 3, 1, 2])
            .apply_t(self, mode.is_training())
            .sigmoid()
    }
}

impl nn::ModuleT for Discriminator {
    /// Channels-first forward pass returning logits.
    fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        let h = self.features.forward_t(xs, train).flatten(1, -1);
        self.dense1.forward(&h).leaky_relu().apply(&self.dense2)
    }
}
