use rand::seq::SliceRandom;
use rand::Rng;
use tch::{Device, Kind, Tensor};

use super::box_ops::{coords2param, iou};

pub const POSITIVE: i64 = 1;
pub const NEGATIVE: i64 = 0;
pub const IGNORE: i64 = -1;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatchThresholds {
    /// Anchors with a max IoU at or above this are positives
    pub pos_iou_threshold: f64,
    /// Anchors with a max IoU below this are negatives
    pub neg_iou_threshold: f64,
}

impl Default for MatchThresholds {
    fn default() -> Self {
        MatchThresholds {
            pos_iou_threshold: 0.7,
            neg_iou_threshold: 0.3,
        }
    }
}

/// Training targets of every anchor of a single image
#[derive(Debug)]
pub struct AnchorTargets {
    /// [N] i64: POSITIVE, NEGATIVE or IGNORE
    pub labels: Tensor,
    /// [N, 4] (tx, ty, tw, th) towards the matched ground truth, zero unless positive
    pub reg_targets: Tensor,
}

impl AnchorTargets {
    pub fn nb_positives(&self) -> i64 {
        self.labels.eq(POSITIVE).sum(Kind::Int64).int64_value(&[])
    }

    pub fn nb_negatives(&self) -> i64 {
        self.labels.eq(NEGATIVE).sum(Kind::Int64).int64_value(&[])
    }
}

/// Labels every anchor against the ground truth boxes of one image.
///
/// `anchors` is [N, 4], `gt_boxes` is [M, 4] (M may be 0), `inside` is the [N] mask
/// from `filter_boxes`. An anchor is positive when its best IoU reaches
/// `pos_iou_threshold` or when it is the best anchor of some ground truth box,
/// negative when its best IoU is below `neg_iou_threshold`, ignored otherwise.
/// Anchors outside the image are always ignored.
pub fn anchors_vs_gt(
    anchors: &Tensor,
    gt_boxes: &Tensor,
    inside: &Tensor,
    thresholds: MatchThresholds,
) -> AnchorTargets {
    let nb_anchors = anchors.size()[0];
    let nb_gt = gt_boxes.size()[0];
    let device = anchors.device();
    let outside = inside.logical_not();

    if nb_gt == 0 {
        let labels = Tensor::full([nb_anchors], NEGATIVE, (Kind::Int64, device))
            .masked_fill(&outside, IGNORE);
        return AnchorTargets {
            labels,
            reg_targets: Tensor::zeros([nb_anchors, 4], (Kind::Float, device)),
        };
    }

    let overlaps = iou(anchors, gt_boxes);
    let (max_iou, best_gt) = overlaps.max_dim(1, false);

    let labels = Tensor::full([nb_anchors], IGNORE, (Kind::Int64, device))
        .masked_fill(&max_iou.lt(thresholds.neg_iou_threshold), NEGATIVE)
        .masked_fill(&max_iou.ge(thresholds.pos_iou_threshold), POSITIVE);

    // best anchor(s) of each gt box, ties included, cross-boundary ones excluded
    let inside_overlaps = overlaps.masked_fill(&outside.unsqueeze(1), -1.);
    let (gt_best, _) = inside_overlaps.max_dim(0, true);
    let is_best_of_some_gt = inside_overlaps
        .eq_tensor(&gt_best)
        .logical_and(&gt_best.gt(0.))
        .any_dim(1, false);
    let labels = labels
        .masked_fill(&is_best_of_some_gt, POSITIVE)
        .masked_fill(&outside, IGNORE);

    let matched_gt = gt_boxes.index_select(0, &best_gt);
    let positive = labels.eq(POSITIVE).unsqueeze(1);
    let reg_targets = coords2param(anchors, &matched_gt)
        .masked_fill(&positive.logical_not(), 0.)
        .to_kind(Kind::Float);

    AnchorTargets {
        labels,
        reg_targets,
    }
}

/// Subsamples the labels of one image down to `samples_per_image` anchors, with at
/// most `positive_fraction` of them positive. Surplus anchors become IGNORE.
pub fn sample_anchors<R: Rng + ?Sized>(
    labels: &Tensor,
    samples_per_image: usize,
    positive_fraction: f64,
    rng: &mut R,
) -> anyhow::Result<Tensor> {
    let mut values: Vec<i64> = Vec::try_from(&labels.to_device(Device::Cpu))?;

    let mut positives: Vec<usize> = indices_with_label(&values, POSITIVE);
    let mut negatives: Vec<usize> = indices_with_label(&values, NEGATIVE);

    let max_positives = (samples_per_image as f64 * positive_fraction) as usize;
    if positives.len() > max_positives {
        positives.shuffle(rng);
        for &index in &positives[max_positives..] {
            values[index] = IGNORE;
        }
        positives.truncate(max_positives);
    }

    let max_negatives = samples_per_image.saturating_sub(positives.len());
    if negatives.len() > max_negatives {
        negatives.shuffle(rng);
        for &index in &negatives[max_negatives..] {
            values[index] = IGNORE;
        }
    }

    Ok(Tensor::from_slice(&values).to_device(labels.device()))
}

fn indices_with_label(labels: &[i64], label: i64) -> Vec<usize> {
    labels
        .iter()
        .enumerate()
        .filter(|(_, value)| **value == label)
        .map(|(index, _)| index)
        .collect()
}
