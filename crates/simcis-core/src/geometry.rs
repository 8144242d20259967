//! Box and mask geometry shared by target construction and the box losses.

use candle_core::{DType, Tensor, D};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Axis-aligned box in corner format, pixel units.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct BoxXyxy {
    pub x0: f32,
    pub y0: f32,
    pub x1: f32,
    pub y1: f32,
}

/// Box in center-size format, normalized to the image extent.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct BoxCxcywh {
    pub cx: f32,
    pub cy: f32,
    pub w: f32,
    pub h: f32,
}

impl BoxXyxy {
    pub fn new(x0: f32, y0: f32, x1: f32, y1: f32) -> Self {
        Self { x0, y0, x1, y1 }
    }

    pub fn width(&self) -> f32 {
        (self.x1 - self.x0).max(0.0)
    }

    pub fn height(&self) -> f32 {
        (self.y1 - self.y0).max(0.0)
    }

    pub fn area(&self) -> f32 {
        self.width() * self.height()
    }

    /// Convert to center-size format and divide by the image width and height.
    pub fn normalize(&self, image_width: f32, image_height: f32) -> BoxCxcywh {
        BoxCxcywh {
            cx: (self.x0 + self.x1) / 2.0 / image_width,
            cy: (self.y0 + self.y1) / 2.0 / image_height,
            w: (self.x1 - self.x0) / image_width,
            h: (self.y1 - self.y0) / image_height,
        }
    }
}

impl BoxCxcywh {
    pub fn to_xyxy(&self) -> BoxXyxy {
        BoxXyxy {
            x0: self.cx - 0.5 * self.w,
            y0: self.cy - 0.5 * self.h,
            x1: self.cx + 0.5 * self.w,
            y1: self.cy + 0.5 * self.h,
        }
    }

    pub fn to_array(&self) -> [f32; 4] {
        [self.cx, self.cy, self.w, self.h]
    }
}

/// Generalized IoU of two corner boxes. Degenerate unions yield 0 IoU.
pub fn generalized_iou(a: &BoxXyxy, b: &BoxXyxy) -> f32 {
    let inter_w = (a.x1.min(b.x1) - a.x0.max(b.x0)).max(0.0);
    let inter_h = (a.y1.min(b.y1) - a.y0.max(b.y0)).max(0.0);
    let inter = inter_w * inter_h;
    let union = a.area() + b.area() - inter;
    let iou = if union > 0.0 { inter / union } else { 0.0 };

    let hull_w = (a.x1.max(b.x1) - a.x0.min(b.x0)).max(0.0);
    let hull_h = (a.y1.max(b.y1) - a.y0.min(b.y0)).max(0.0);
    let hull = hull_w * hull_h;
    if hull > 0.0 {
        iou - (hull - union) / hull
    } else {
        iou
    }
}

/// Tight bounding box of a binary mask stored row-major as `[height, width]`.
///
/// The max edges are exclusive (`x1 = last column + 1`). An empty mask yields
/// the zero box.
pub fn mask_bounding_box(mask: &[u8], height: usize, width: usize) -> BoxXyxy {
    let mut x_min = usize::MAX;
    let mut y_min = usize::MAX;
    let mut x_max = 0usize;
    let mut y_max = 0usize;
    let mut any = false;

    for y in 0..height {
        let row = &mask[y * width..(y + 1) * width];
        for (x, &v) in row.iter().enumerate() {
            if v != 0 {
                any = true;
                x_min = x_min.min(x);
                y_min = y_min.min(y);
                x_max = x_max.max(x);
                y_max = y_max.max(y);
            }
        }
    }

    if !any {
        return BoxXyxy::default();
    }
    BoxXyxy::new(
        x_min as f32,
        y_min as f32,
        (x_max + 1) as f32,
        (y_max + 1) as f32,
    )
}

/// Bounding boxes of every mask in a `[N, H, W]` binary tensor.
pub fn masks_to_boxes(masks: &Tensor) -> Result<Vec<BoxXyxy>> {
    let (n, h, w) = masks.dims3()?;
    let data: Vec<u8> = masks.to_dtype(DType::U8)?.flatten_all()?.to_vec1()?;
    Ok((0..n)
        .map(|i| mask_bounding_box(&data[i * h * w..(i + 1) * h * w], h, w))
        .collect())
}

/// Pack boxes into an `[N, 4]` f32 tensor.
pub fn boxes_to_tensor(boxes: &[BoxCxcywh], device: &candle_core::Device) -> Result<Tensor> {
    let data: Vec<f32> = boxes.iter().flat_map(|b| b.to_array()).collect();
    Ok(Tensor::from_vec(data, (boxes.len(), 4), device)?)
}

/// Differentiable center-size to corner conversion on the last dimension.
pub fn box_cxcywh_to_xyxy(boxes: &Tensor) -> Result<Tensor> {
    let cx = boxes.narrow(D::Minus1, 0, 1)?;
    let cy = boxes.narrow(D::Minus1, 1, 1)?;
    let half_w = (boxes.narrow(D::Minus1, 2, 1)? * 0.5)?;
    let half_h = (boxes.narrow(D::Minus1, 3, 1)? * 0.5)?;
    Ok(Tensor::cat(
        &[
            (&cx - &half_w)?,
            (&cy - &half_h)?,
            (&cx + &half_w)?,
            (&cy + &half_h)?,
        ],
        D::Minus1,
    )?)
}

/// Generalized IoU between aligned pairs of corner boxes, `[N, 4]` each.
///
/// Returns `[N]`. This is the diagonal of the pairwise GIoU matrix.
pub fn aligned_generalized_iou(a: &Tensor, b: &Tensor) -> Result<Tensor> {
    if a.dims() != b.dims() {
        return Err(Error::ShapeMismatch {
            context: "aligned_generalized_iou",
            expected: a.dims().to_vec(),
            actual: b.dims().to_vec(),
        });
    }
    let col = |t: &Tensor, i: usize| t.narrow(D::Minus1, i, 1).and_then(|c| c.squeeze(D::Minus1));
    let (ax0, ay0, ax1, ay1) = (col(a, 0)?, col(a, 1)?, col(a, 2)?, col(a, 3)?);
    let (bx0, by0, bx1, by1) = (col(b, 0)?, col(b, 1)?, col(b, 2)?, col(b, 3)?);

    let area_a = ((&ax1 - &ax0)? * (&ay1 - &ay0)?)?;
    let area_b = ((&bx1 - &bx0)? * (&by1 - &by0)?)?;

    let inter_w = (ax1.minimum(&bx1)? - ax0.maximum(&bx0)?)?.relu()?;
    let inter_h = (ay1.minimum(&by1)? - ay0.maximum(&by0)?)?.relu()?;
    let inter = (inter_w * inter_h)?;
    let union = ((area_a + area_b)? - &inter)?;
    let iou = (&inter / (&union + 1e-7)?)?;

    let hull_w = (ax1.maximum(&bx1)? - ax0.minimum(&bx0)?)?.relu()?;
    let hull_h = (ay1.maximum(&by1)? - ay0.minimum(&by0)?)?.relu()?;
    let hull = (hull_w * hull_h)?;

    Ok((iou - ((&hull - &union)? / (&hull + 1e-7)?)?)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_normalize_box() {
        let b = BoxXyxy::new(10.0, 20.0, 30.0, 60.0);
        let n = b.normalize(100.0, 200.0);
        assert!((n.cx - 0.2).abs() < 1e-6);
        assert!((n.cy - 0.2).abs() < 1e-6);
        assert!((n.w - 0.2).abs() < 1e-6);
        assert!((n.h - 0.2).abs() < 1e-6);
    }

    #[test]
    fn test_generalized_iou() {
        let a = BoxXyxy::new(0.0, 0.0, 2.0, 2.0);
        assert!((generalized_iou(&a, &a) - 1.0).abs() < 1e-6);

        // Disjoint boxes: IoU = 0, hull 3x1, union 2 -> -1/3
        let b = BoxXyxy::new(0.0, 0.0, 1.0, 1.0);
        let c = BoxXyxy::new(2.0, 0.0, 3.0, 1.0);
        assert!((generalized_iou(&b, &c) + 1.0 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn test_mask_bounding_box() {
        #[rustfmt::skip]
        let mask = [
            0, 0, 0, 0,
            0, 1, 1, 0,
            0, 0, 1, 0,
        ];
        let b = mask_bounding_box(&mask, 3, 4);
        assert_eq!(b, BoxXyxy::new(1.0, 1.0, 3.0, 3.0));

        let empty = [0u8; 12];
        assert_eq!(mask_bounding_box(&empty, 3, 4), BoxXyxy::default());
    }

    #[test]
    fn test_aligned_giou_matches_scalar() -> Result<()> {
        let device = Device::Cpu;
        let a = Tensor::new(&[[0.0f32, 0.0, 2.0, 2.0], [0.0, 0.0, 1.0, 1.0]], &device)?;
        let b = Tensor::new(&[[1.0f32, 1.0, 3.0, 3.0], [2.0, 0.0, 3.0, 1.0]], &device)?;
        let giou: Vec<f32> = aligned_generalized_iou(&a, &b)?.to_vec1()?;

        let expected0 = generalized_iou(
            &BoxXyxy::new(0.0, 0.0, 2.0, 2.0),
            &BoxXyxy::new(1.0, 1.0, 3.0, 3.0),
        );
        assert!((giou[0] - expected0).abs() < 1e-4);
        assert!((giou[1] + 1.0 / 3.0).abs() < 1e-4);
        Ok(())
    }

    #[test]
    fn test_cxcywh_to_xyxy_tensor() -> Result<()> {
        let device = Device::Cpu;
        let boxes = Tensor::new(&[[0.5f32, 0.5, 0.2, 0.4]], &device)?;
        let xyxy: Vec<Vec<f32>> = box_cxcywh_to_xyxy(&boxes)?.to_vec2()?;
        let expected = [0.4f32, 0.3, 0.6, 0.7];
        for (v, e) in xyxy[0].iter().zip(expected) {
            assert!((v - e).abs() < 1e-6);
        }
        Ok(())
    }
}
