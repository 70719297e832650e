use image::{DynamicImage, GenericImageView};
use rand::Rng;

use crate::dataset::common_structs::SignBbox;

// Reasonable values are up to 30, max is 255
pub fn random_change_brightness<R: Rng + ?Sized>(
    img: &DynamicImage,
    max_abs_change: i32,
    rng: &mut R,
) -> DynamicImage {
    if max_abs_change <= 0 {
        return img.clone();
    }
    let value = rng.gen_range(-max_abs_change..=max_abs_change);
    img.brighten(value)
}

/// Flips the image and its boxes around the vertical middle line with probability `prob`
pub fn random_horizontal_flip<R: Rng + ?Sized>(
    img: DynamicImage,
    bboxes: Vec<SignBbox>,
    prob: f64,
    rng: &mut R,
) -> (DynamicImage, Vec<SignBbox>) {
    if prob <= 0. || !rng.gen_bool(prob.min(1.)) {
        return (img, bboxes);
    }
    let img_width = img.width() as f64;
    let flipped_bbs = bboxes
        .iter()
        .map(|bb| bb.flip_horizontally(img_width))
        .collect();
    (img.fliph(), flipped_bbs)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Augmenter {
    pub hflip_prob: f64,
    pub brightness_jitter: i32,
}

impl Augmenter {
    pub fn augment<R: Rng + ?Sized>(
        &self,
        img: DynamicImage,
        bboxes: Vec<SignBbox>,
        rng: &mut R,
    ) -> (DynamicImage, Vec<SignBbox>) {
        let (img, bboxes) = random_horizontal_flip(img, bboxes, self.hflip_prob, rng);
        let img = random_change_brightness(&img, self.brightness_jitter, rng);
        (img, bboxes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn marked_img() -> DynamicImage {
        let mut img = RgbImage::new(10, 4);
        img.put_pixel(0, 0, Rgb([200, 100, 50]));
        DynamicImage::ImageRgb8(img)
    }

    fn sign() -> SignBbox {
        SignBbox {
            left: 1.,
            top: 0.,
            right: 3.,
            bottom: 2.,
            class_id: 5,
        }
    }

    #[test]
    fn certain_flip_moves_pixels_and_boxes() {
        let mut rng = StdRng::seed_from_u64(0);
        let (img, bboxes) = random_horizontal_flip(marked_img(), vec![sign()], 1., &mut rng);
        assert_eq!(img.to_rgb8().get_pixel(9, 0), &Rgb([200, 100, 50]));
        assert_eq!(bboxes[0].left, 7.);
        assert_eq!(bboxes[0].right, 9.);
        assert_eq!(bboxes[0].class_id, 5);
    }

    #[test]
    fn zero_probability_never_flips() {
        let mut rng = StdRng::seed_from_u64(0);
        for _ in 0..10 {
            let (img, bboxes) = random_horizontal_flip(marked_img(), vec![sign()], 0., &mut rng);
            assert_eq!(img.to_rgb8().get_pixel(0, 0), &Rgb([200, 100, 50]));
            assert_eq!(bboxes, vec![sign()]);
        }
    }

    #[test]
    fn disabled_augmenter_is_identity() {
        let mut rng = StdRng::seed_from_u64(0);
        let augmenter = Augmenter {
            hflip_prob: 0.,
            brightness_jitter: 0,
        };
        let (img, bboxes) = augmenter.augment(marked_img(), vec![sign()], &mut rng);
        assert_eq!(img.to_rgb8(), marked_img().to_rgb8());
        assert_eq!(bboxes, vec![sign()]);
    }
}
