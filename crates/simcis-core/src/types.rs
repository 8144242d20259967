//! Core data model shared across the continual training engine.

use std::ops::Range;

use candle_core::{DType, Device, Tensor};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::geometry::{boxes_to_tensor, BoxCxcywh};

/// Dataset category index.
pub type ClassId = u32;

/// Contiguous range of category ids introduced by one task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryRange {
    pub start: ClassId,
    pub end: ClassId,
}

impl CategoryRange {
    pub fn new(start: ClassId, end: ClassId) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, class: ClassId) -> bool {
        class >= self.start && class < self.end
    }

    /// Number of classes learned before this range.
    pub fn old_class_count(&self) -> usize {
        self.start as usize
    }

    /// Number of classes learned up to and including this range.
    pub fn seen_class_count(&self) -> usize {
        self.end as usize
    }

    pub fn as_range(&self) -> Range<ClassId> {
        self.start..self.end
    }
}

/// Per-image supervision: ordered `(label, mask, box)` triples.
///
/// Masks are `[N, H, W]` u8 at the padded canvas resolution; boxes are
/// normalized center-size.
#[derive(Debug, Clone)]
pub struct Target {
    labels: Vec<ClassId>,
    masks: Tensor,
    boxes: Vec<BoxCxcywh>,
}

impl Target {
    pub fn new(labels: Vec<ClassId>, masks: Tensor, boxes: Vec<BoxCxcywh>) -> Result<Self> {
        let (n_masks, _, _) = masks.dims3()?;
        if labels.len() != n_masks || labels.len() != boxes.len() {
            return Err(Error::TargetLength {
                labels: labels.len(),
                masks: n_masks,
                boxes: boxes.len(),
            });
        }
        let masks = if masks.dtype() == DType::U8 {
            masks
        } else {
            masks.to_dtype(DType::U8)?
        };
        Ok(Self {
            labels,
            masks,
            boxes,
        })
    }

    /// A target with no instances on a `(height, width)` canvas.
    pub fn empty(height: usize, width: usize, device: &Device) -> Result<Self> {
        Ok(Self {
            labels: Vec::new(),
            masks: Tensor::zeros((0, height, width), DType::U8, device)?,
            boxes: Vec::new(),
        })
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn labels(&self) -> &[ClassId] {
        &self.labels
    }

    pub fn masks(&self) -> &Tensor {
        &self.masks
    }

    pub fn boxes(&self) -> &[BoxCxcywh] {
        &self.boxes
    }

    /// Canvas size as `(height, width)`.
    pub fn canvas(&self) -> (usize, usize) {
        let dims = self.masks.dims();
        (dims[1], dims[2])
    }

    pub fn device(&self) -> &Device {
        self.masks.device()
    }

    pub fn boxes_tensor(&self) -> Result<Tensor> {
        boxes_to_tensor(&self.boxes, self.masks.device())
    }

    /// Concatenate `self` followed by `other`. Both must share one canvas.
    pub fn concat(&self, other: &Target) -> Result<Target> {
        if self.canvas() != other.canvas() {
            let (h, w) = self.canvas();
            let (oh, ow) = other.canvas();
            return Err(Error::ShapeMismatch {
                context: "Target::concat",
                expected: vec![h, w],
                actual: vec![oh, ow],
            });
        }
        if other.is_empty() {
            return Ok(self.clone());
        }
        if self.is_empty() {
            return Ok(other.clone());
        }
        let mut labels = self.labels.clone();
        labels.extend_from_slice(&other.labels);
        let mut boxes = self.boxes.clone();
        boxes.extend_from_slice(&other.boxes);
        let masks = Tensor::cat(&[&self.masks, &other.masks], 0)?;
        Ok(Target {
            labels,
            masks,
            boxes,
        })
    }

    /// Whether any label falls outside `range`.
    pub fn has_class_outside(&self, range: &CategoryRange) -> bool {
        self.labels.iter().any(|&l| !range.contains(l))
    }

    /// Pixel union of every mask as a `[H, W]` u8 tensor.
    pub fn region(&self) -> Result<Tensor> {
        let (h, w) = self.canvas();
        if self.is_empty() {
            return Ok(Tensor::zeros((h, w), DType::U8, self.masks.device())?);
        }
        Ok(self.masks.max(0)?)
    }
}

/// Old-model inference result for one image.
///
/// Masks are `[N, H, W]` f32 probabilities. No ordering is assumed.
#[derive(Debug, Clone)]
pub struct Prediction {
    pub labels: Vec<ClassId>,
    pub scores: Vec<f32>,
    pub masks: Tensor,
    pub boxes: Vec<BoxCxcywh>,
}

impl Prediction {
    pub fn new(
        labels: Vec<ClassId>,
        scores: Vec<f32>,
        masks: Tensor,
        boxes: Vec<BoxCxcywh>,
    ) -> Result<Self> {
        let (n_masks, _, _) = masks.dims3()?;
        if labels.len() != n_masks || labels.len() != boxes.len() || scores.len() != labels.len()
        {
            return Err(Error::TargetLength {
                labels: labels.len(),
                masks: n_masks,
                boxes: boxes.len(),
            });
        }
        Ok(Self {
            labels,
            scores,
            masks,
            boxes,
        })
    }

    pub fn empty(height: usize, width: usize, device: &Device) -> Result<Self> {
        Ok(Self {
            labels: Vec::new(),
            scores: Vec::new(),
            masks: Tensor::zeros((0, height, width), DType::F32, device)?,
            boxes: Vec::new(),
        })
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn canvas(&self) -> (usize, usize) {
        let dims = self.masks.dims();
        (dims[1], dims[2])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_length_invariant() {
        let device = Device::Cpu;
        let masks = Tensor::zeros((2, 4, 4), DType::U8, &device).unwrap();
        let err = Target::new(vec![1], masks, vec![BoxCxcywh::default(); 2]).unwrap_err();
        assert!(matches!(err, Error::TargetLength { labels: 1, masks: 2, boxes: 2 }));
        assert!(err.is_precondition());
    }

    #[test]
    fn test_concat_keeps_order() -> Result<()> {
        let device = Device::Cpu;
        let a = Target::new(
            vec![3],
            Tensor::ones((1, 2, 2), DType::U8, &device)?,
            vec![BoxCxcywh::default()],
        )?;
        let b = Target::new(
            vec![7, 8],
            Tensor::zeros((2, 2, 2), DType::U8, &device)?,
            vec![BoxCxcywh::default(); 2],
        )?;
        let c = a.concat(&b)?;
        assert_eq!(c.labels(), &[3, 7, 8]);
        assert_eq!(c.masks().dims(), &[3, 2, 2]);

        let empty = Target::empty(2, 2, &device)?;
        assert_eq!(empty.concat(&b)?.labels(), &[7, 8]);
        Ok(())
    }

    #[test]
    fn test_memory_image_detection() -> Result<()> {
        let device = Device::Cpu;
        let current = CategoryRange::new(100, 110);
        let t = Target::new(
            vec![105, 12],
            Tensor::zeros((2, 2, 2), DType::U8, &device)?,
            vec![BoxCxcywh::default(); 2],
        )?;
        assert!(t.has_class_outside(&current));
        assert!(!Target::empty(2, 2, &device)?.has_class_outside(&current));
        assert_eq!(current.old_class_count(), 100);
        Ok(())
    }
}
