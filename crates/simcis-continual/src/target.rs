//! Conversion of raw annotations into normalized training targets.

use candle_core::{DType, Tensor};
use simcis_core::{BoxXyxy, ClassId, Error, Result, Target};

/// Raw ground-truth instances of one image, as produced by a dataset mapper.
#[derive(Debug, Clone)]
pub struct RawInstances {
    /// Unpadded image size `(height, width)`
    pub image_size: (usize, usize),
    pub classes: Vec<ClassId>,
    /// Binary masks `[n, height, width]`
    pub masks: Tensor,
    /// Corner boxes in pixels
    pub boxes: Vec<BoxXyxy>,
}

/// Builds [`Target`]s on a shared padded canvas.
pub struct TargetBuilder {
    canvas: (usize, usize),
}

impl TargetBuilder {
    /// `canvas` is the padded batch size `(height, width)`.
    pub fn new(canvas: (usize, usize)) -> Self {
        Self { canvas }
    }

    pub fn canvas(&self) -> (usize, usize) {
        self.canvas
    }

    pub fn build(&self, instances: &RawInstances) -> Result<Target> {
        let (n, h, w) = instances.masks.dims3()?;
        if n != instances.classes.len() || n != instances.boxes.len() {
            return Err(Error::TargetLength {
                labels: instances.classes.len(),
                masks: n,
                boxes: instances.boxes.len(),
            });
        }
        let (canvas_h, canvas_w) = self.canvas;
        if h > canvas_h || w > canvas_w {
            return Err(Error::ShapeMismatch {
                context: "TargetBuilder::build",
                expected: vec![canvas_h, canvas_w],
                actual: vec![h, w],
            });
        }

        let masks = instances
            .masks
            .to_dtype(DType::U8)?
            .pad_with_zeros(1, 0, canvas_h - h)?
            .pad_with_zeros(2, 0, canvas_w - w)?;

        let (image_h, image_w) = instances.image_size;
        let boxes = instances
            .boxes
            .iter()
            .map(|b| b.normalize(image_w as f32, image_h as f32))
            .collect();

        Target::new(instances.classes.clone(), masks, boxes)
    }

    pub fn build_batch(&self, batch: &[RawInstances]) -> Result<Vec<Target>> {
        batch.iter().map(|instances| self.build(instances)).collect()
    }
}
