use serde::Serialize;
use tch::{nn, nn::VarStore, Device, Tensor};

use crate::config::Config;
use crate::discriminator::Discriminator;
use crate::generator::Generator;

/// Whether batch norm uses batch statistics (and updates its running ones)
/// or the stored running statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Training,
    Inference,
}

impl Mode {
    pub fn is_training(self) -> bool {
        matches!(self, Mode::Training)
    }
}

/// Architecture knobs shared by both networks.
#[derive(Debug, Clone)]
pub struct NetConfig {
    pub channels: i64,
    pub hr_height: i64,
    pub hr_width: i64,
    pub residual_blocks: usize,
    pub deconv_blocks: usize,
    pub bn_epsilon: f64,
    pub bn_momentum: f64,
}

impl Default for NetConfig {
    fn default() -> Self {
        NetConfig {
            channels: 3,
            hr_height: 96,
            hr_width: 96,
            residual_blocks: 16,
            deconv_blocks: 2,
            bn_epsilon: 1e-3,
            bn_momentum: 3e-4,
        }
    }
}

impl NetConfig {
    pub fn from_config(config: &Config) -> NetConfig {
        NetConfig {
            channels: config.num_channels,
            hr_height: config.hr_height,
            hr_width: config.hr_width,
            residual_blocks: config.residual_blocks,
            deconv_blocks: config.deconv_blocks(),
            bn_epsilon: config.bn_epsilon,
            bn_momentum: config.bn_momentum(),
        }
    }

    pub fn batch_norm(&self) -> nn::BatchNormConfig {
        nn::BatchNormConfig {
            eps: self.bn_epsilon,
            momentum: self.bn_momentum,
            ..Default::default()
        }
    }
}

/// Borrowed view of both parameter sets.
#[derive(Clone, Copy)]
pub struct ModelParameters<'a> {
    pub generator: &'a VarStore,
    pub discriminator: &'a VarStore,
}

/// Generator and discriminator, each with its own variable store.
pub struct SrGan {
    pub generator: Generator,
    pub discriminator: Discriminator,
    g_vs: VarStore,
    d_vs: VarStore,
    device: Device,
}

impl SrGan {
    pub fn new(config: &NetConfig, device: Device) -> SrGan {
        let g_vs = VarStore::new(device);
        let generator = Generator::new(&g_vs.root() / "G", config);
        let d_vs = VarStore::new(device);
        let discriminator = Discriminator::new(&d_vs.root() / "D", config);
        SrGan { generator, discriminator, g_vs, d_vs, device }
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn parameters(&self) -> ModelParameters<'_> {
        ModelParameters { generator: &self.g_vs, discriminator: &self.d_vs }
    }

    pub fn generator_vs(&self) -> &VarStore {
        &self.g_vs
    }

    pub fn discriminator_vs(&self) -> &VarStore {
        &self.d_vs
    }

    pub fn generator_vars(&self) -> Vec<Tensor> {
        self.g_vs.trainable_variables()
    }

    pub fn discriminator_vars(&self) -> Vec<Tensor> {
        self.d_vs.trainable_variables()
    }

    pub fn graph(&self) -> GraphSummary {
        GraphSummary {
            generator: describe(&self.g_vs),
            discriminator: describe(&self.d_vs),
        }
    }
}

/// Names and shapes of every variable, for the metrics sink.
#[derive(Debug, Clone, Serialize)]
pub struct GraphSummary {
    pub generator: Vec<VariableInfo>,
    pub discriminator: Vec<VariableInfo>,
}

#[derive(Debug, Clone, Serialize)]
pub struct VariableInfo {
    pub name: String,
    pub shape: Vec<i64>,
    pub trainable: bool,
}

impl GraphSummary {
    pub fn parameter_count(&self) -> i64 {
        self.generator
            .iter()
            .chain(&self.discriminator)
            .filter(|v| v.trainable)
            .map(|v| v.shape.iter().product::<i64>())
            .sum()
    }
}

fn describe(vs: &VarStore) -> Vec<VariableInfo> {
    let mut vars: Vec<VariableInfo> = vs
        .variables()
        .into_iter()
        .map(|(name, tensor)| VariableInfo {
            name,
            shape: tensor.size(),
            trainable: tensor.requires_grad(),
        })
        .collect();
    vars.sort_by(|a, b| a.name.cmp(&b.name));
    vars
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parameter_sets_are_disjoint() {
        let net = NetConfig { hr_height: 16, hr_width: 16, residual_blocks: 1, ..NetConfig::default() };
        let model = SrGan::new(&net, Device::Cpu);
        let graph = model.graph();
        assert!(graph.generator.iter().all(|v| v.name.starts_with("G.")));
        assert!(graph.discriminator.iter().all(|v| v.name.starts_with("D.")));
        assert!(graph.parameter_count() > 0);
        // Running statistics are stored but not trained.
        assert!(graph.discriminator.iter().any(|v| v.name.ends_with("running_mean") && !v.trainable));
    }
}
