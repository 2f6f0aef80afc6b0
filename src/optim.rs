use tch::{nn, nn::OptimizerConfig, Kind, Tensor};

use crate::error::Result;
use crate::loss::GanLosses;
use crate::model::SrGan;

/// The three independent Adam optimizers: generator on MSE (pretraining),
/// discriminator on `d_loss`, generator on `g_loss`.
pub struct Optimizers {
    pretrain: nn::Optimizer,
    discriminator: nn::Optimizer,
    generator: nn::Optimizer,
}

impl Optimizers {
    pub fn new(model: &SrGan, learning_rate: f64, beta_1: f64) -> Result<Optimizers> {
        let adam = || nn::adam(beta_1, 0.999, 0.);
        Ok(Optimizers {
            pretrain: adam().build(model.generator_vs(), learning_rate)?,
            discriminator: adam().build(model.discriminator_vs(), learning_rate)?,
            generator: adam().build(model.generator_vs(), learning_rate)?,
        })
    }

    pub fn pretrain_step(&mut self, mse: &Tensor) {
        self.pretrain.backward_step(mse);
    }

    /// Takes the gradients of `d_loss` (discriminator variables) and
    /// `g_loss` (generator variables) from the same graph, then applies both
    /// updates. Neither update sees parameters changed by the other.
    pub fn adversarial_step(&mut self, model: &SrGan, losses: &GanLosses) {
        let d_vars = model.discriminator_vars();
        let g_vars = model.generator_vars();
        let d_grads = Tensor::run_backward(&[&losses.d], &d_vars, true, false);
        let g_grads = Tensor::run_backward(&[&losses.g], &g_vars, false, false);

        apply(&mut self.discriminator, &d_vars, &d_grads);
        apply(&mut self.generator, &g_vars, &g_grads);
    }
}

/// Loads precomputed gradients into the variables' `.grad` slots and steps.
/// Backpropagating `Σ <v, g>` with `g` detached writes exactly `g`.
fn apply(opt: &mut nn::Optimizer, vars: &[Tensor], grads: &[Tensor]) {
    let terms: Vec<Tensor> = vars
        .iter()
        .zip(grads)
        .map(|(v, g)| (v * g.detach()).sum(Kind::Float))
        .collect();
    opt.backward_step(&Tensor::stack(&terms, 0).sum(Kind::Float));
}
