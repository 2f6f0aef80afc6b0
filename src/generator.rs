use tch::{nn, nn::ModuleT, Tensor};

use crate::model::{Mode, NetConfig};

/// conv → BN → ReLU → conv → BN, plus the identity skip.
#[derive(Debug)]
struct ResidualBlock {
    conv1: nn::Conv2D,
    bn1: nn::BatchNorm,
    conv2: nn::Conv2D,
    bn2: nn::BatchNorm,
}

impl ResidualBlock {
    fn new(path: nn::Path, features: i64, net: &NetConfig) -> ResidualBlock {
        let conv = nn::ConvConfig { stride: 1, padding: 1, ..Default::default() };
        ResidualBlock {
            conv1: nn::conv2d(&path / "conv1", features, features, 3, conv),
            bn1: nn::batch_norm2d(&path / "bn1", features, net.batch_norm()),
            conv2: nn::conv2d(&path / "conv2", features, features, 3, conv),
            bn2: nn::batch_norm2d(&path / "bn2", features, net.batch_norm()),
        }
    }
}

impl nn::ModuleT for ResidualBlock {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        let ys = xs
            .apply(&self.conv1)
            .apply_t(&self.bn1, train)
            .relu()
            .apply(&self.conv2)
            .apply_t(&self.bn2, train);
        xs + ys
    }
}

/// Residual trunk followed by stride-2 transposed convolutions; maps an LR
/// batch to an HR reconstruction with no output activation.
#[derive(Debug)]
pub struct Generator {
    net: nn::SequentialT,
}

impl Generator {
    pub const FEATURES: i64 = 64;

    pub fn new(path: nn::Path, config: &NetConfig) -> Generator {
        let features = Self::FEATURES;
        let mut seq = nn::seq_t()
            .add(nn::conv2d(&path / "conv1", config.channels, features,
                            3, nn::ConvConfig { stride: 1, padding: 1, ..Default::default() }))
            .add_fn(|x| x.relu());
        for i in 0..config.residual_blocks {
            seq = seq.add(ResidualBlock::new(&path / format!("res{}", i + 1), features, config));
        }
        for i in 0..config.deconv_blocks {
            seq = seq
                .add(nn::conv_transpose2d(&path / format!("deconv{}", i + 1), features, features,
                                          4, nn::ConvTransposeConfig { stride: 2, padding: 1, ..Default::default() }))
                .add_fn(|x| x.relu());
        }
        let net = seq.add(nn::conv2d(&path / "conv2", features, config.channels,
                                     3, nn::ConvConfig { stride: 1, padding: 1, ..Default::default() }));
        Generator { net }
    }

    /// `[B, h, w, C]` → `[B, r·h, r·w, C]`.
    pub fn upscale(&self, low_res: &Tensor, mode: Mode) -> Tensor {
        low_res
            .permute([0, 3, 1, 2])
            .apply_t(self, mode.is_training())
            .permute([0, 2, 3, 1])
    }
}

impl nn::ModuleT for Generator {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        self.net.forward_t(xs, train)
    }
}
