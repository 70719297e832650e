use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use tch::{Device, Kind, Tensor};

use super::box_ops::{clip_boxes, param2coords};
use crate::config::ProposalConfig;
use crate::dataset::common_structs::SignBbox;

/// A region the RPN believes contains a traffic sign
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Proposal {
    pub left: f32,
    pub top: f32,
    pub right: f32,
    pub bottom: f32,
    /// Objectness probability
    pub score: f32,
}

impl Proposal {
    pub fn area(&self) -> f32 {
        (self.right - self.left).max(0.) * (self.bottom - self.top).max(0.)
    }

    pub fn iou(&self, other: &Proposal) -> f32 {
        let i_w = (self.right.min(other.right) - self.left.max(other.left)).max(0.);
        let i_h = (self.bottom.min(other.bottom) - self.top.max(other.top)).max(0.);
        let i_area = i_w * i_h;
        let union = self.area() + other.area() - i_area;
        if union <= 0. {
            return 0.;
        }
        i_area / union
    }
}

impl From<&SignBbox> for Proposal {
    fn from(bb: &SignBbox) -> Self {
        let [left, top, right, bottom] = bb.corners();
        Proposal {
            left,
            top,
            right,
            bottom,
            score: 1.,
        }
    }
}

/// (found, total): how many ground truth boxes overlap some proposal by at least
/// `iou_threshold`
pub fn proposal_recall(proposals: &[Proposal], gt: &[SignBbox], iou_threshold: f64) -> (usize, usize) {
    let found = gt
        .iter()
        .map(Proposal::from)
        .filter(|sign| {
            proposals
                .iter()
                .any(|p| p.iou(sign) as f64 >= iou_threshold)
        })
        .count();
    (found, gt.len())
}

/// Greedy non maximum suppression. The output is sorted by decreasing score.
pub fn nms(mut proposals: Vec<Proposal>, iou_threshold: f64) -> Vec<Proposal> {
    proposals.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));
    let mut kept: Vec<Proposal> = vec![];
    for candidate in proposals {
        if kept
            .iter()
            .all(|k| (k.iou(&candidate) as f64) < iou_threshold)
        {
            kept.push(candidate);
        }
    }
    kept
}

/// Decodes the RPN output of a single image into proposals.
///
/// `cls_logits` is [N], `deltas` and `anchors` are [N, 4], `image_size` is
/// (height, width) of the network input.
pub fn generate_proposals(
    cls_logits: &Tensor,
    deltas: &Tensor,
    anchors: &Tensor,
    image_size: (i64, i64),
    config: &ProposalConfig,
) -> anyhow::Result<Vec<Proposal>> {
    let cpu = |t: &Tensor| t.to_device(Device::Cpu).to_kind(Kind::Float);
    let scores = cpu(cls_logits).sigmoid();
    let boxes = clip_boxes(&param2coords(&cpu(anchors), &cpu(deltas)), image_size);

    let widths = boxes.select(1, 2) - boxes.select(1, 0);
    let heights = boxes.select(1, 3) - boxes.select(1, 1);
    let keep = widths
        .ge(config.min_size)
        .logical_and(&heights.ge(config.min_size))
        .logical_and(&scores.ge(config.score_threshold));
    let keep = keep.nonzero().squeeze_dim(1);
    let scores = scores.index_select(0, &keep);
    let boxes = boxes.index_select(0, &keep);

    let top_n = (config.pre_nms_top_n as i64).min(scores.size()[0]);
    let (scores, order) = scores.topk(top_n, 0, true, true);
    let boxes = boxes.index_select(0, &order).reshape([-1]);

    let scores: Vec<f32> = Vec::try_from(&scores)?;
    let corners: Vec<f32> = Vec::try_from(&boxes)?;
    let proposals = scores
        .iter()
        .zip(corners.chunks(4))
        .map(|(&score, corner)| Proposal {
            left: corner[0],
            top: corner[1],
            right: corner[2],
            bottom: corner[3],
            score,
        })
        .collect();

    let mut proposals = nms(proposals, config.nms_iou_threshold);
    proposals.truncate(config.post_nms_top_n);
    Ok(proposals)
}
