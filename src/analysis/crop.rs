// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
use image::{DynamicImage, GenericImageView, RgbImage};

use crate::protocol::FaceBox;

/// 裁剪人脸: 四周外扩 `padding * min(w, h)` 像素, 并裁到图像边界内。
///
/// Returns `None` when the padded box does not overlap the image.
pub fn crop_face(img: &DynamicImage, face: &FaceBox, padding: f32) -> Option<RgbImage> {
    let (img_w, img_h) = img.dimensions();
    let pad = (face.w.min(face.h).max(0) as f32 * padding) as i64;

    let x1 = (face.x as i64 - pad).max(0);
    let y1 = (face.y as i64 - pad).max(0);
    let x2 = (face.x as i64 + face.w as i64 + pad).min(img_w as i64);
    let y2 = (face.y as i64 + face.h as i64 + pad).min(img_h as i64);

    if x2 <= x1 || y2 <= y1 {
        return None;
    }

    Some(
        img.crop_imm(x1 as u32, y1 as u32, (x2 - x1) as u32, (y2 - y1) as u32)
            .to_rgb8(),
    )
}
