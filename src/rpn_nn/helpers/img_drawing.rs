use image::{DynamicImage, Rgba};
use imageproc::drawing::Blend;
use imageproc::rect::Rect;

use crate::dataset::common_structs::SignBbox;
use crate::rpn_nn::proposals::Proposal;

pub const GT_COLOR: [u8; 4] = [0, 255, 0, 255];
pub const PROPOSAL_COLOR: [u8; 4] = [255, 0, 0, 160];

/// Box outline, None when it falls entirely outside of the image
fn outline(left: f64, top: f64, right: f64, bottom: f64, img_width: u32, img_height: u32) -> Option<Rect> {
    let left = left.max(0.).round() as i32;
    let top = top.max(0.).round() as i32;
    let right = right.min(img_width as f64 - 1.).round() as i32;
    let bottom = bottom.min(img_height as f64 - 1.).round() as i32;
    if right < left || bottom < top {
        return None;
    }
    // of_size panics on zero sizes
    Some(Rect::at(left, top).of_size((right - left).max(1) as u32, (bottom - top).max(1) as u32))
}

fn draw_outlines<I>(img: &mut DynamicImage, outlines: I, rgba_color: [u8; 4])
where
    I: IntoIterator<Item = (f64, f64, f64, f64)>,
{
    let mut img_blend = Blend(img.to_rgba8());
    let (img_width, img_height) = img_blend.0.dimensions();
    let color = Rgba(rgba_color);
    for (left, top, right, bottom) in outlines {
        if let Some(rect) = outline(left, top, right, bottom, img_width, img_height) {
            imageproc::drawing::draw_hollow_rect_mut(&mut img_blend, rect, color);
        }
    }
    *img = DynamicImage::ImageRgba8(img_blend.0);
}

pub fn draw_bbs_to_img(img: &mut DynamicImage, bbs: &[SignBbox], rgba_color: [u8; 4]) {
    draw_outlines(
        img,
        bbs.iter().map(|bb| (bb.left, bb.top, bb.right, bb.bottom)),
        rgba_color,
    );
}

pub fn draw_proposals_to_img(img: &mut DynamicImage, proposals: &[Proposal], rgba_color: [u8; 4]) {
    draw_outlines(
        img,
        proposals.iter().map(|p| {
            (
                p.left as f64,
                p.top as f64,
                p.right as f64,
                p.bottom as f64,
            )
        }),
        rgba_color,
    );
}
