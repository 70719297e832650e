use tch::Tensor;

/// Largest log-scale delta accepted when decoding, ln(1000 / 16)
pub const BBOX_XFORM_CLIP: f64 = 4.135166556742356;

// Every box tensor here is [N, 4] in (x1, y1, x2, y2) pixel coordinates.

pub fn box_area(boxes: &Tensor) -> Tensor {
    let widths = (boxes.select(1, 2) - boxes.select(1, 0)).clamp_min(0.);
    let heights = (boxes.select(1, 3) - boxes.select(1, 1)).clamp_min(0.);
    widths * heights
}

/// Pairwise intersection areas, [N, M]
pub fn intersect(boxes1: &Tensor, boxes2: &Tensor) -> Tensor {
    let b1 = boxes1.unsqueeze(1);
    let b2 = boxes2.unsqueeze(0);
    let top_left = b1.narrow(2, 0, 2).maximum(&b2.narrow(2, 0, 2));
    let bottom_right = b1.narrow(2, 2, 2).minimum(&b2.narrow(2, 2, 2));
    let wh = (bottom_right - top_left).clamp_min(0.);
    wh.select(2, 0) * wh.select(2, 1)
}

/// Pairwise union areas, [N, M]
pub fn union(boxes1: &Tensor, boxes2: &Tensor) -> Tensor {
    let area1 = box_area(boxes1).unsqueeze(1);
    let area2 = box_area(boxes2).unsqueeze(0);
    area1 + area2 - intersect(boxes1, boxes2)
}

/// Pairwise intersection over union, [N, M]. Pairs with an empty union get 0.
pub fn iou(boxes1: &Tensor, boxes2: &Tensor) -> Tensor {
    let area1 = box_area(boxes1).unsqueeze(1);
    let area2 = box_area(boxes2).unsqueeze(0);
    let inter = intersect(boxes1, boxes2);
    let union = area1 + area2 - &inter;
    // union == 0 implies inter == 0
    inter / union.clamp_min(1e-9)
}

fn centers_and_sizes(boxes: &Tensor) -> (Tensor, Tensor, Tensor, Tensor) {
    let widths = boxes.select(1, 2) - boxes.select(1, 0);
    let heights = boxes.select(1, 3) - boxes.select(1, 1);
    let ctr_x = boxes.select(1, 0) + &widths * 0.5;
    let ctr_y = boxes.select(1, 1) + &heights * 0.5;
    (ctr_x, ctr_y, widths, heights)
}

/// Encodes `boxes` relative to `anchors` (row by row) as (tx, ty, tw, th):
///
/// tx = (x - xa) / wa, ty = (y - ya) / ha, tw = ln(w / wa), th = ln(h / ha)
pub fn coords2param(anchors: &Tensor, boxes: &Tensor) -> Tensor {
    let (anchor_x, anchor_y, anchor_w, anchor_h) = centers_and_sizes(anchors);
    let (box_x, box_y, box_w, box_h) = centers_and_sizes(boxes);
    let tx = (box_x - anchor_x) / &anchor_w;
    let ty = (box_y - anchor_y) / &anchor_h;
    let tw = (box_w / anchor_w).log();
    let th = (box_h / anchor_h).log();
    Tensor::stack(&[tx, ty, tw, th], 1)
}

/// Inverse of [coords2param]: applies (tx, ty, tw, th) deltas to the anchors.
pub fn param2coords(anchors: &Tensor, deltas: &Tensor) -> Tensor {
    let (anchor_x, anchor_y, anchor_w, anchor_h) = centers_and_sizes(anchors);
    let dw = deltas.select(1, 2).clamp_max(BBOX_XFORM_CLIP);
    let dh = deltas.select(1, 3).clamp_max(BBOX_XFORM_CLIP);
    let ctr_x = deltas.select(1, 0) * &anchor_w + anchor_x;
    let ctr_y = deltas.select(1, 1) * &anchor_h + anchor_y;
    let half_w = dw.exp() * anchor_w * 0.5;
    let half_h = dh.exp() * anchor_h * 0.5;
    Tensor::stack(
        &[
            &ctr_x - &half_w,
            &ctr_y - &half_h,
            &ctr_x + &half_w,
            &ctr_y + &half_h,
        ],
        1,
    )
}

/// Clamps boxes to an image of (height, width)
pub fn clip_boxes(boxes: &Tensor, image_size: (i64, i64)) -> Tensor {
    let (height, width) = image_size;
    let xs = boxes.narrow(1, 0, 1).clamp(0., width as f64);
    let ys = boxes.narrow(1, 1, 1).clamp(0., height as f64);
    let xs2 = boxes.narrow(1, 2, 1).clamp(0., width as f64);
    let ys2 = boxes.narrow(1, 3, 1).clamp(0., height as f64);
    Tensor::cat(&[xs, ys, xs2, ys2], 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn boxes(values: &[[f32; 4]]) -> Tensor {
        let flat: Vec<f32> = values.iter().flatten().copied().collect();
        Tensor::from_slice(&flat).view([values.len() as i64, 4])
    }

    #[test]
    fn pairwise_intersection_union_and_iou() {
        let a = boxes(&[[0., 0., 10., 10.], [0., 0., 4., 4.]]);
        let b = boxes(&[[5., 0., 15., 10.], [20., 20., 30., 30.], [0., 0., 10., 10.]]);

        let inter = intersect(&a, &b);
        assert_eq!(inter.size(), vec![2, 3]);
        assert_abs_diff_eq!(inter.double_value(&[0, 0]), 50., epsilon = 1e-6);
        assert_abs_diff_eq!(inter.double_value(&[0, 1]), 0., epsilon = 1e-6);
        assert_abs_diff_eq!(inter.double_value(&[1, 2]), 16., epsilon = 1e-6);

        let uni = union(&a, &b);
        assert_abs_diff_eq!(uni.double_value(&[0, 0]), 150., epsilon = 1e-6);
        assert_abs_diff_eq!(uni.double_value(&[1, 2]), 100., epsilon = 1e-6);

        let overlaps = iou(&a, &b);
        assert_abs_diff_eq!(overlaps.double_value(&[0, 0]), 1. / 3., epsilon = 1e-6);
        assert_abs_diff_eq!(overlaps.double_value(&[0, 2]), 1., epsilon = 1e-6);
        assert_abs_diff_eq!(overlaps.double_value(&[1, 2]), 0.16, epsilon = 1e-6);
    }

    #[test]
    fn iou_of_degenerate_boxes_is_zero() {
        let point = boxes(&[[3., 3., 3., 3.]]);
        let overlaps = iou(&point, &point);
        assert_eq!(overlaps.double_value(&[0, 0]), 0.);
    }

    #[test]
    fn iou_against_no_boxes_is_empty() {
        let a = boxes(&[[0., 0., 10., 10.]]);
        let none = Tensor::zeros([0, 4], (tch::Kind::Float, tch::Device::Cpu));
        assert_eq!(iou(&a, &none).size(), vec![1, 0]);
    }

    #[test]
    fn coords2param_known_values() {
        // anchor centred at (10, 10), 20x20; box centred at (15, 5), 40x10
        let anchors = boxes(&[[0., 0., 20., 20.]]);
        let gt = boxes(&[[-5., 0., 35., 10.]]);
        let params = coords2param(&anchors, &gt);
        assert_abs_diff_eq!(params.double_value(&[0, 0]), 0.25, epsilon = 1e-6);
        assert_abs_diff_eq!(params.double_value(&[0, 1]), -0.25, epsilon = 1e-6);
        assert_abs_diff_eq!(params.double_value(&[0, 2]), 2f64.ln(), epsilon = 1e-6);
        assert_abs_diff_eq!(params.double_value(&[0, 3]), 0.5f64.ln(), epsilon = 1e-6);

        let decoded = param2coords(&anchors, &params);
        for (index, expected) in [-5., 0., 35., 10.].iter().enumerate() {
            assert_abs_diff_eq!(
                decoded.double_value(&[0, index as i64]),
                *expected,
                epsilon = 1e-4
            );
        }
    }

    #[test]
    fn decoding_clamps_huge_scales() {
        let anchors = boxes(&[[0., 0., 16., 16.]]);
        let deltas = Tensor::from_slice(&[0f32, 0., 100., 100.]).view([1, 4]);
        let decoded = param2coords(&anchors, &deltas);
        let width = decoded.double_value(&[0, 2]) - decoded.double_value(&[0, 0]);
        assert_abs_diff_eq!(width, 1000., epsilon = 1e-2);
    }

    #[test]
    fn clip_boxes_to_image() {
        let clipped = clip_boxes(&boxes(&[[-5., -2., 120., 40.]]), (30, 100));
        let values: Vec<f64> = (0..4).map(|i| clipped.double_value(&[0, i])).collect();
        assert_eq!(values, vec![0., 0., 100., 30.]);
    }
}
