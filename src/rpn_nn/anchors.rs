use tch::{Device, Kind, Tensor};

/// Spatial size of the backbone output for an image of (height, width) after `pools`
/// 2x2 max pools.
pub fn feature_size(image_size: (i64, i64), pools: u32) -> (i64, i64) {
    let (mut height, mut width) = image_size;
    for _ in 0..pools {
        height /= 2;
        width /= 2;
    }
    (height, width)
}

/// Anchors centred at the origin, one per (size, ratio) pair, sizes outermost.
/// Ratio is height / width, so the area stays size².
fn base_anchors(sizes: &[f64], ratios: &[f64]) -> Vec<f32> {
    let mut base = Vec::with_capacity(sizes.len() * ratios.len() * 4);
    for size in sizes {
        for ratio in ratios {
            let half_w = size / ratio.sqrt() / 2.;
            let half_h = size * ratio.sqrt() / 2.;
            base.extend_from_slice(&[
                -half_w as f32,
                -half_h as f32,
                half_w as f32,
                half_h as f32,
            ]);
        }
    }
    base
}

/// Every anchor of a feature map of `feature_size` (height, width), [H * W * K, 4].
///
/// Rows are ordered by feature map row, then column, then anchor shape, which is the
/// order the RPN heads are flattened in.
pub fn get_anchors(feature_size: (i64, i64), stride: i64, sizes: &[f64], ratios: &[f64]) -> Tensor {
    let (height, width) = feature_size;
    let nb_anchors = (sizes.len() * ratios.len()) as i64;
    let base = Tensor::from_slice(&base_anchors(sizes, ratios)).view([1, nb_anchors, 4]);

    let options = (Kind::Float, Device::Cpu);
    let centers_x = (Tensor::arange(width, options) + 0.5) * stride as f64;
    let centers_y = (Tensor::arange(height, options) + 0.5) * stride as f64;
    let centers_x = centers_x
        .view([1, width])
        .expand([height, width], false)
        .reshape([-1]);
    let centers_y = centers_y
        .view([height, 1])
        .expand([height, width], false)
        .reshape([-1]);
    let shifts = Tensor::stack(&[&centers_x, &centers_y, &centers_x, &centers_y], 1);

    (shifts.view([-1, 1, 4]) + base).view([-1, 4])
}

/// Mask of the anchors that lie inside an image of (height, width), allowing
/// `allowed_border` pixels of overflow on every side.
pub fn filter_boxes(anchors: &Tensor, image_size: (i64, i64), allowed_border: f64) -> Tensor {
    let (height, width) = image_size;
    anchors
        .select(1, 0)
        .ge(-allowed_border)
        .logical_and(&anchors.select(1, 1).ge(-allowed_border))
        .logical_and(&anchors.select(1, 2).le(width as f64 + allowed_border))
        .logical_and(&anchors.select(1, 3).le(height as f64 + allowed_border))
}
