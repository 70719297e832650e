use serde::{Deserialize, Serialize};
use tch::{Kind, Reduction, Tensor};

use super::anchor_targets::POSITIVE;

/// Objectness loss: binary cross entropy on the logits of every anchor that is not
/// ignored, averaged over those anchors.
///
/// `logits` is [B, N], `labels` is [B, N] i64 with -1 for ignored anchors.
pub fn rpn_cls_loss(logits: &Tensor, labels: &Tensor) -> Tensor {
    let valid = labels.ge(0).to_kind(Kind::Float);
    let targets = labels.clamp_min(0).to_kind(Kind::Float);
    let per_anchor = logits.binary_cross_entropy_with_logits::<Tensor>(
        &targets,
        None,
        None,
        Reduction::None,
    );
    let nb_valid = valid.sum(Kind::Float).clamp_min(1.);
    (per_anchor * valid).sum(Kind::Float) / nb_valid
}

/// Box regression loss: smooth L1 over the four deltas of positive anchors, divided
/// by the number of positives.
///
/// `deltas` and `targets` are [B, N, 4], `labels` is [B, N].
pub fn rpn_reg_loss(deltas: &Tensor, targets: &Tensor, labels: &Tensor, beta: f64) -> Tensor {
    let positive = labels.eq(POSITIVE).to_kind(Kind::Float);
    let per_coord = deltas.smooth_l1_loss(targets, Reduction::None, beta);
    let nb_positive = positive.sum(Kind::Float).clamp_min(1.);
    (per_coord * positive.unsqueeze(-1)).sum(Kind::Float) / nb_positive
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RpnLoss {
    pub cls_weight: f64,
    pub reg_weight: f64,
    /// Transition point of the smooth L1 loss
    pub smooth_l1_beta: f64,
}

impl Default for RpnLoss {
    fn default() -> Self {
        RpnLoss {
            cls_weight: 1.,
            reg_weight: 1.,
            smooth_l1_beta: 1. / 9.,
        }
    }
}

#[derive(Debug)]
pub struct RpnLossOutput {
    pub total: Tensor,
    pub cls: Tensor,
    pub reg: Tensor,
}

impl RpnLoss {
    pub fn forward(
        &self,
        cls_logits: &Tensor,
        deltas: &Tensor,
        labels: &Tensor,
        reg_targets: &Tensor,
    ) -> RpnLossOutput {
        let cls = rpn_cls_loss(cls_logits, labels);
        let reg = rpn_reg_loss(deltas, reg_targets, labels, self.smooth_l1_beta);
        let total = &cls * self.cls_weight + &reg * self.reg_weight;
        RpnLossOutput { total, cls, reg }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpn_nn::anchor_targets::{IGNORE, NEGATIVE};
    use approx::assert_abs_diff_eq;

    #[test]
    fn cls_loss_skips_ignored_anchors() {
        let logits = Tensor::from_slice(&[0f32, 0., 100.]).view([1, 3]);
        let labels = Tensor::from_slice(&[POSITIVE, NEGATIVE, IGNORE]).view([1, 3]);
        // both valid anchors have p = 0.5
        let loss = rpn_cls_loss(&logits, &labels);
        assert_abs_diff_eq!(loss.double_value(&[]), 2f64.ln(), epsilon = 1e-5);
    }

    #[test]
    fn cls_loss_without_valid_anchors_is_zero() {
        let logits = Tensor::from_slice(&[3f32, -2.]).view([1, 2]);
        let labels = Tensor::from_slice(&[IGNORE, IGNORE]).view([1, 2]);
        assert_eq!(rpn_cls_loss(&logits, &labels).double_value(&[]), 0.);
    }

    #[test]
    fn reg_loss_only_counts_positives() {
        let deltas = Tensor::from_slice(&[
            1f32, 0., 0., 0., // positive, |d| = 1
            0., 0., 0.05, 0., // positive, |d| = 0.05 < beta
            9., 9., 9., 9., // negative, ignored
        ])
        .view([1, 3, 4]);
        let targets = Tensor::zeros([1, 3, 4], tch::kind::FLOAT_CPU);
        let labels = Tensor::from_slice(&[POSITIVE, POSITIVE, NEGATIVE]).view([1, 3]);
        let beta = 0.1;
        let loss = rpn_reg_loss(&deltas, &targets, &labels, beta);
        let expected = ((1. - 0.5 * beta) + 0.5 * 0.05 * 0.05 / beta) / 2.;
        assert_abs_diff_eq!(loss.double_value(&[]), expected, epsilon = 1e-5);
    }

    #[test]
    fn reg_loss_without_positives_is_zero() {
        let deltas = Tensor::ones([1, 2, 4], tch::kind::FLOAT_CPU);
        let targets = Tensor::zeros([1, 2, 4], tch::kind::FLOAT_CPU);
        let labels = Tensor::from_slice(&[NEGATIVE, IGNORE]).view([1, 2]);
        assert_eq!(rpn_reg_loss(&deltas, &targets, &labels, 1.).double_value(&[]), 0.);
    }

    #[test]
    fn combined_loss_weights_terms_and_backpropagates() {
        let logits = Tensor::from_slice(&[0f32, 0.]).view([1, 2]).set_requires_grad(true);
        let deltas = Tensor::from_slice(&[2f32, 0., 0., 0., 0., 0., 0., 0.])
            .view([1, 2, 4])
            .set_requires_grad(true);
        let targets = Tensor::zeros([1, 2, 4], tch::kind::FLOAT_CPU);
        let labels = Tensor::from_slice(&[POSITIVE, NEGATIVE]).view([1, 2]);

        let loss = RpnLoss {
            cls_weight: 1.,
            reg_weight: 10.,
            smooth_l1_beta: 1.,
        };
        let output = loss.forward(&logits, &deltas, &labels, &targets);
        assert_abs_diff_eq!(output.cls.double_value(&[]), 2f64.ln(), epsilon = 1e-5);
        assert_abs_diff_eq!(output.reg.double_value(&[]), 1.5, epsilon = 1e-5);
        assert_abs_diff_eq!(
            output.total.double_value(&[]),
            2f64.ln() + 15.,
            epsilon = 1e-4
        );

        output.total.backward();
        assert!(deltas.grad().abs().sum(Kind::Float).double_value(&[]) > 0.);
        assert!(logits.grad().abs().sum(Kind::Float).double_value(&[]) > 0.);
    }
}
