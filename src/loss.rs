use serde::Serialize;
use tch::{Kind, Tensor};

/// Probabilities are kept inside `(EPSILON, 1 - EPSILON)` before any `log`.
pub const PROB_EPSILON: f64 = 1e-7;

fn safe_log(prob: &Tensor) -> Tensor {
    prob.clamp(PROB_EPSILON, 1.0 - PROB_EPSILON).log()
}

pub fn mse_loss(high_res: &Tensor, reconstructed: &Tensor) -> Tensor {
    (high_res - reconstructed).square().mean(Kind::Float)
}

/// The six scalar losses of one forward pass, still attached to the graph.
#[derive(Debug)]
pub struct GanLosses {
    pub mse: Tensor,
    pub g_adv: Tensor,
    pub g: Tensor,
    pub d_real: Tensor,
    pub d_fake: Tensor,
    pub d: Tensor,
}

impl GanLosses {
    /// `d_real_prob = D(high_res)`, `d_fake_prob = D(G(low_res))`.
    ///
    /// `d_fake` is `mean(log D(G(x)))`, not negated. The sign is suspect;
    /// flipping it changes the training dynamics.
    pub fn compute(
        high_res: &Tensor,
        reconstructed: &Tensor,
        d_real_prob: &Tensor,
        d_fake_prob: &Tensor,
        adversarial_weight: f64,
    ) -> GanLosses {
        let mse = mse_loss(high_res, reconstructed);
        let g_adv = safe_log(d_fake_prob).neg().mean(Kind::Float);
        let g = &mse + &g_adv * adversarial_weight;

        let d_real = safe_log(d_real_prob).neg().mean(Kind::Float);
        let d_fake = safe_log(d_fake_prob).mean(Kind::Float);
        let d = &d_real + &d_fake;

        GanLosses { mse, g_adv, g, d_real, d_fake, d }
    }

    pub fn values(&self) -> LossValues {
        LossValues {
            mse_loss: self.mse.double_value(&[]),
            g_adv_loss: self.g_adv.double_value(&[]),
            g_loss: self.g.double_value(&[]),
            d_loss_real: self.d_real.double_value(&[]),
            d_loss_fake: self.d_fake.double_value(&[]),
            d_loss: self.d.double_value(&[]),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct LossValues {
    pub mse_loss: f64,
    pub g_adv_loss: f64,
    pub g_loss: f64,
    pub d_loss_real: f64,
    pub d_loss_fake: f64,
    pub d_loss: f64,
}

impl LossValues {
    pub fn named(&self) -> [(&'static str, f64); 6] {
        [
            ("mse_loss", self.mse_loss),
            ("g_adv_loss", self.g_adv_loss),
            ("g_loss", self.g_loss),
            ("d_loss_real", self.d_loss_real),
            ("d_loss_fake", self.d_loss_fake),
            ("d_loss", self.d_loss),
        ]
    }

    pub fn is_finite(&self) -> bool {
        self.named().iter().all(|(_, v)| v.is_finite())
    }
}

/// Running sums of the losses over one epoch.
#[derive(Debug, Clone, Copy, Default)]
pub struct LossAccumulator {
    sum: LossValues,
    count: usize,
}

impl LossAccumulator {
    pub fn add(&mut self, v: &LossValues) {
        self.sum.mse_loss += v.mse_loss;
        self.sum.g_adv_loss += v.g_adv_loss;
        self.sum.g_loss += v.g_loss;
        self.sum.d_loss_real += v.d_loss_real;
        self.sum.d_loss_fake += v.d_loss_fake;
        self.sum.d_loss += v.d_loss;
        self.count += 1;
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn mean(&self) -> LossValues {
        if self.count == 0 {
            return LossValues::default();
        }
        let n = self.count as f64;
        LossValues {
            mse_loss: self.sum.mse_loss / n,
            g_adv_loss: self.sum.g_adv_loss / n,
            g_loss: self.sum.g_loss / n,
            d_loss_real: self.sum.d_loss_real / n,
            d_loss_fake: self.sum.d_loss_fake / n,
            d_loss: self.sum.d_loss / n,
        }
    }

    pub fn reset(&mut self) {
        *self = LossAccumulator::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::Device;

    fn opts() -> (Kind, Device) {
        (Kind::Float, Device::Cpu)
    }

    #[test]
    fn combined_losses_are_exact_sums() {
        let hr = Tensor::randn([2, 8, 8, 3], opts());
        let sr = Tensor::randn([2, 8, 8, 3], opts());
        let p_real = Tensor::rand([2, 1], opts());
        let p_fake = Tensor::rand([2, 1], opts());
        for lambda in [1e-3, 1.0, 0.0] {
            let l = GanLosses::compute(&hr, &sr, &p_real, &p_fake, lambda);
            let g = &l.mse + &l.g_adv * lambda;
            let d = &l.d_real + &l.d_fake;
            assert!(l.g.equal(&g));
            assert!(l.d.equal(&d));
        }
    }

    #[test]
    fn fake_term_keeps_its_sign() {
        let hr = Tensor::zeros([1, 2, 2, 1], opts());
        let p = Tensor::from_slice(&[0.5f32]).view([1, 1]);
        let v = GanLosses::compute(&hr, &hr, &p, &p, 1.0).values();
        let ln_half = 0.5f64.ln();
        assert!((v.d_loss_fake - ln_half).abs() < 1e-6);
        assert!((v.d_loss_real + ln_half).abs() < 1e-6);
        assert!((v.g_adv_loss + ln_half).abs() < 1e-6);
        assert!(v.d_loss.abs() < 1e-6);
        assert_eq!(v.mse_loss, 0.0);
    }

    #[test]
    fn saturated_probabilities_give_finite_losses() {
        let hr = Tensor::randn([2, 4, 4, 3], opts());
        let sr = Tensor::randn([2, 4, 4, 3], opts());
        let zeros = Tensor::zeros([2, 1], opts());
        let ones = Tensor::ones([2, 1], opts());
        for (real, fake) in [(&zeros, &ones), (&ones, &zeros), (&zeros, &zeros), (&ones, &ones)] {
            let v = GanLosses::compute(&hr, &sr, real, fake, 1e-3).values();
            assert!(v.is_finite(), "{v:?}");
        }
    }

    #[test]
    fn mse_matches_manual_mean() {
        let hr = Tensor::from_slice(&[1.0f32, 2.0, 3.0, 4.0]).view([1, 2, 2, 1]);
        let sr = Tensor::from_slice(&[1.0f32, 0.0, 3.0, 8.0]).view([1, 2, 2, 1]);
        assert_eq!(mse_loss(&hr, &sr).double_value(&[]), 5.0);
    }

    #[test]
    fn accumulator_averages_and_resets() {
        let mut acc = LossAccumulator::default();
        acc.add(&LossValues { g_loss: 1.0, d_loss: 4.0, ..Default::default() });
        acc.add(&LossValues { g_loss: 3.0, d_loss: 2.0, ..Default::default() });
        assert_eq!(acc.count(), 2);
        assert_eq!(acc.mean().g_loss, 2.0);
        assert_eq!(acc.mean().d_loss, 3.0);
        acc.reset();
        assert_eq!(acc.count(), 0);
        assert_eq!(acc.mean(), LossValues::default());
    }
}
