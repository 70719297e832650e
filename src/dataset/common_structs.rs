use serde::{Deserialize, Serialize};
/// Frequently used structs in the provided data transformers/loaders/augmenters

/// An image with its traffic sign Bounding Boxes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImgFilenameWithBboxes {
    pub img_filename: String,
    pub bboxes: Vec<SignBbox>,
}

/// A traffic sign Bounding Box in corner form, in pixels of the image it belongs to.
///
/// GTSDB stores `leftCol;topRow;rightCol;bottomRow`, we keep the same corners and
/// treat them as continuous coordinates, so width is `right - left`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SignBbox {
    pub left: f64,
    pub top: f64,
    pub right: f64,
    pub bottom: f64,
    pub class_id: u32,
}

impl SignBbox {
    pub fn width(&self) -> f64 {
        (self.right - self.left).max(0.)
    }

    pub fn height(&self) -> f64 {
        (self.bottom - self.top).max(0.)
    }

    pub fn area(&self) -> f64 {
        self.width() * self.height()
    }

    /// (x1, y1, x2, y2), the layout used by every box tensor in the crate
    pub fn corners(&self) -> [f32; 4] {
        [
            self.left as f32,
            self.top as f32,
            self.right as f32,
            self.bottom as f32,
        ]
    }

    /// Used when the image is resized by (width_ratio, height_ratio)
    pub fn scale(&self, width_ratio: f64, height_ratio: f64) -> SignBbox {
        SignBbox {
            left: self.left * width_ratio,
            top: self.top * height_ratio,
            right: self.right * width_ratio,
            bottom: self.bottom * height_ratio,
            ..*self
        }
    }

    /// Mirror around the vertical middle line of an image `img_width` wide
    pub fn flip_horizontally(&self, img_width: f64) -> SignBbox {
        SignBbox {
            left: img_width - self.right,
            right: img_width - self.left,
            ..*self
        }
    }

    pub fn iou(&self, other: &SignBbox) -> f64 {
        let i_left = self.left.max(other.left);
        let i_right = self.right.min(other.right);
        let i_top = self.top.max(other.top);
        let i_bottom = self.bottom.min(other.bottom);
        let i_area = (i_right - i_left).max(0.) * (i_bottom - i_top).max(0.);
        let union = self.area() + other.area() - i_area;
        if union <= 0. {
            return 0.;
        }
        i_area / union
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn bb(left: f64, top: f64, right: f64, bottom: f64) -> SignBbox {
        SignBbox {
            left,
            top,
            right,
            bottom,
            class_id: 0,
        }
    }

    #[test]
    fn iou_of_half_overlapping_boxes() {
        let a = bb(0., 0., 10., 10.);
        let b = bb(5., 0., 15., 10.);
        // intersection 50, union 150
        assert_abs_diff_eq!(a.iou(&b), 1. / 3., epsilon = 1e-9);
        assert_abs_diff_eq!(a.iou(&a), 1., epsilon = 1e-9);
        assert_eq!(a.iou(&bb(20., 20., 30., 30.)), 0.);
    }

    #[test]
    fn degenerate_box_has_zero_iou() {
        let point = bb(3., 3., 3., 3.);
        assert_eq!(point.iou(&point), 0.);
    }

    #[test]
    fn horizontal_flip_keeps_size() {
        let original = bb(10., 5., 30., 25.);
        let flipped = original.flip_horizontally(100.);
        assert_eq!(flipped.left, 70.);
        assert_eq!(flipped.right, 90.);
        assert_eq!(flipped.width(), original.width());
        assert_eq!(flipped.flip_horizontally(100.), original);
    }

    #[test]
    fn scale_resizes_corners() {
        let scaled = bb(100., 50., 140., 90.).scale(0.5, 0.25);
        assert_eq!(scaled, bb(50., 12.5, 70., 22.5));
    }
}
