use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView};
use tch::{Kind, Tensor};

use crate::dataset::common_structs::SignBbox;

/// RGB image to a [3, height, width] Uint8 tensor
pub fn from_img_to_tensor(img: &DynamicImage) -> Tensor {
    let rgb = img.to_rgb8();
    let (width, height) = rgb.dimensions();
    Tensor::from_slice(rgb.as_raw())
        .view([height as i64, width as i64, 3])
        .permute([2, 0, 1])
}

/// Same as [from_img_to_tensor] with values scaled to [0, 1]
pub fn from_img_to_normalized_tensor(img: &DynamicImage) -> Tensor {
    from_img_to_tensor(img).to_kind(Kind::Float) / 255.
}

/// Resizes the image to exactly (target_width, target_height) and scales its boxes along
pub fn resize_with_bboxes(
    img: DynamicImage,
    bboxes: &[SignBbox],
    target_width: u32,
    target_height: u32,
) -> (DynamicImage, Vec<SignBbox>) {
    let (ori_width, ori_height) = img.dimensions();
    if (ori_width, ori_height) == (target_width, target_height) {
        return (img, bboxes.to_vec());
    }
    let width_ratio = target_width as f64 / ori_width as f64;
    let height_ratio = target_height as f64 / ori_height as f64;
    let resized = img.resize_exact(target_width, target_height, FilterType::Triangle);
    let bboxes = bboxes
        .iter()
        .map(|bb| bb.scale(width_ratio, height_ratio))
        .collect();
    (resized, bboxes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    #[test]
    fn tensor_layout_is_channel_row_column() {
        let mut img = RgbImage::new(4, 2);
        img.put_pixel(3, 1, Rgb([10, 20, 30]));
        img.put_pixel(1, 0, Rgb([255, 0, 0]));
        let img = DynamicImage::ImageRgb8(img);

        let tensor = from_img_to_tensor(&img);
        assert_eq!(tensor.size(), vec![3, 2, 4]);
        assert_eq!(tensor.int64_value(&[0, 1, 3]), 10);
        assert_eq!(tensor.int64_value(&[1, 1, 3]), 20);
        assert_eq!(tensor.int64_value(&[2, 1, 3]), 30);
        assert_eq!(tensor.int64_value(&[0, 0, 1]), 255);

        let normalized = from_img_to_normalized_tensor(&img);
        assert_eq!(normalized.kind(), Kind::Float);
        assert_eq!(normalized.double_value(&[0, 0, 1]), 1.);
    }

    #[test]
    fn resizing_scales_boxes() {
        let img = DynamicImage::ImageRgb8(RgbImage::new(100, 50));
        let bboxes = vec![SignBbox {
            left: 20.,
            top: 10.,
            right: 40.,
            bottom: 30.,
            class_id: 3,
        }];
        let (resized, scaled) = resize_with_bboxes(img, &bboxes, 50, 100);
        assert_eq!(resized.dimensions(), (50, 100));
        assert_eq!(
            scaled,
            vec![SignBbox {
                left: 10.,
                top: 20.,
                right: 20.,
                bottom: 60.,
                class_id: 3,
            }]
        );
    }
}
