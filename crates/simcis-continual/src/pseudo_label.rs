//! Pseudo-labelling of old-class regions with the frozen previous-task model.
//!
//! Old predictions compete for every pixel by `score * probability`; the
//! winner keeps the pixel only if it is inside its own binarized mask and
//! outside every ground-truth mask. A prediction survives when enough of its
//! original area is left.

use candle_core::{DType, IndexOp, Tensor, D};
use candle_nn::ops::{sigmoid, softmax};
use simcis_core::{
    masks_to_boxes, BoxCxcywh, CategoryRange, ClassId, Error, Prediction, Result, Target,
};
use tracing::debug;

use crate::config::{FilterMode, FusionMode, PseudoLabelConfig};
use crate::output::ScopeOutput;
use crate::point_sample::resize_bilinear;

/// Pseudo targets of one batch plus the memory-image flags.
#[derive(Debug, Clone)]
pub struct PseudoTargets {
    pub pseudo: Vec<Target>,
    pub memory_images: Vec<bool>,
}

impl PseudoTargets {
    /// Loss supervision: `pseudo ++ real`, or the real target alone for
    /// memory images.
    pub fn complete(&self, targets: &[Target]) -> Result<Vec<Target>> {
        self.check_batch(targets)?;
        targets
            .iter()
            .zip(&self.pseudo)
            .zip(&self.memory_images)
            .map(|((target, pseudo), &memory)| {
                if memory {
                    Ok(target.clone())
                } else {
                    pseudo.concat(target)
                }
            })
            .collect()
    }

    /// `pseudo ++ real` for every image, memory images included.
    pub fn fused(&self, targets: &[Target]) -> Result<Vec<Target>> {
        self.check_batch(targets)?;
        targets
            .iter()
            .zip(&self.pseudo)
            .map(|(target, pseudo)| pseudo.concat(target))
            .collect()
    }

    /// Every pseudo label in the batch.
    pub fn labels(&self) -> impl Iterator<Item = ClassId> + '_ {
        self.pseudo.iter().flat_map(|t| t.labels().iter().copied())
    }

    fn check_batch(&self, targets: &[Target]) -> Result<()> {
        if targets.len() != self.pseudo.len() {
            return Err(Error::InvalidInput(format!(
                "{} targets for {} pseudo targets",
                targets.len(),
                self.pseudo.len()
            )));
        }
        Ok(())
    }
}

/// Builds pseudo targets from old-model predictions.
pub struct PseudoLabelGenerator {
    overlap_threshold: f32,
    fusion: FusionMode,
    filter: FilterMode,
    strict_score_threshold: f32,
    current: CategoryRange,
}

impl PseudoLabelGenerator {
    pub fn new(config: &PseudoLabelConfig, current: CategoryRange) -> Self {
        Self {
            overlap_threshold: config.overlap_threshold,
            fusion: config.fusion,
            filter: config.filter,
            strict_score_threshold: config.strict_score_threshold,
            current,
        }
    }

    /// An image whose ground truth already contains a class outside the
    /// current task.
    pub fn is_memory_image(&self, target: &Target) -> bool {
        target.has_class_outside(&self.current)
    }

    /// `image_sizes` are the unpadded `(height, width)` used to normalize the
    /// recomputed boxes.
    pub fn generate(
        &self,
        targets: &[Target],
        predictions: &[Prediction],
        image_sizes: &[(usize, usize)],
    ) -> Result<PseudoTargets> {
        if targets.len() != predictions.len() || targets.len() != image_sizes.len() {
            return Err(Error::InvalidInput(format!(
                "batch mismatch: {} targets, {} predictions, {} image sizes",
                targets.len(),
                predictions.len(),
                image_sizes.len()
            )));
        }

        let mut pseudo = Vec::with_capacity(targets.len());
        let mut memory_images = Vec::with_capacity(targets.len());
        for ((target, prediction), &size) in targets.iter().zip(predictions).zip(image_sizes) {
            memory_images.push(self.is_memory_image(target));
            pseudo.push(self.generate_one(target, prediction, size)?);
        }

        debug!(
            pseudo = pseudo.iter().map(Target::len).sum::<usize>(),
            memory = memory_images.iter().filter(|&&m| m).count(),
            "generated pseudo labels"
        );
        Ok(PseudoTargets {
            pseudo,
            memory_images,
        })
    }

    fn generate_one(
        &self,
        target: &Target,
        prediction: &Prediction,
        image_size: (usize, usize),
    ) -> Result<Target> {
        let (h, w) = target.canvas();
        let device = target.device();
        if prediction.canvas() != (h, w) {
            let (ph, pw) = prediction.canvas();
            return Err(Error::ShapeMismatch {
                context: "PseudoLabelGenerator::generate",
                expected: vec![h, w],
                actual: vec![ph, pw],
            });
        }

        let candidates: Vec<usize> = match self.filter {
            FilterMode::Overlap => (0..prediction.len()).collect(),
            FilterMode::Strict => (0..prediction.len())
                .filter(|&k| prediction.scores[k] >= self.strict_score_threshold)
                .collect(),
        };
        if candidates.is_empty() {
            return Target::empty(h, w, device);
        }

        let n = candidates.len();
        let index = Tensor::from_vec(
            candidates.iter().map(|&k| k as u32).collect::<Vec<_>>(),
            n,
            device,
        )?;
        let probs = prediction
            .masks
            .to_dtype(DType::F32)?
            .index_select(&index, 0)?;
        let scores: Vec<f32> = candidates.iter().map(|&k| prediction.scores[k]).collect();
        let scores = Tensor::from_vec(scores, (n, 1, 1), device)?;

        let binarized = probs.ge(0.5f32)?;
        let owner = probs.broadcast_mul(&scores)?.argmax(0)?;
        let ids = Tensor::arange(0u32, n as u32, device)?.reshape((n, 1, 1))?;
        let owned = owner.unsqueeze(0)?.broadcast_eq(&ids)?;
        let free = target.region()?.eq(0u8)?.unsqueeze(0)?;
        let region = (&binarized * &owned)?.broadcast_mul(&free)?;

        let old_area = area(&binarized)?;
        let new_area = area(&region)?;
        let owned_area = area(&owned)?;

        let keep: Vec<usize> = (0..n)
            .filter(|&k| {
                let passes = new_area[k] > 0.0
                    && new_area[k] > old_area[k] * self.overlap_threshold;
                match self.filter {
                    FilterMode::Overlap => passes,
                    FilterMode::Strict => {
                        passes && old_area[k] > owned_area[k] * self.overlap_threshold
                    }
                }
            })
            .collect();
        if keep.is_empty() {
            return Target::empty(h, w, device);
        }

        let labels: Vec<ClassId> = keep
            .iter()
            .map(|&k| prediction.labels[candidates[k]])
            .collect();
        let kept_index = Tensor::from_vec(
            keep.iter().map(|&k| k as u32).collect::<Vec<_>>(),
            keep.len(),
            device,
        )?;
        let masks = region.index_select(&kept_index, 0)?;

        let (labels, masks) = match self.fusion {
            FusionMode::PerPrediction => (labels, masks),
            FusionMode::PerClass => union_per_class(&labels, &masks)?,
        };

        let (image_h, image_w) = image_size;
        let boxes: Vec<BoxCxcywh> = masks_to_boxes(&masks)?
            .iter()
            .map(|b| b.normalize(image_w as f32, image_h as f32))
            .collect();

        Target::new(labels, masks, boxes)
    }
}

/// Pixel count of every `[N, H, W]` binary mask.
fn area(masks: &Tensor) -> Result<Vec<f32>> {
    Ok(masks.to_dtype(DType::F32)?.sum((1, 2))?.to_vec1()?)
}

/// Union of the masks sharing a label, labels ascending.
fn union_per_class(labels: &[ClassId], masks: &Tensor) -> Result<(Vec<ClassId>, Tensor)> {
    let mut unique = labels.to_vec();
    unique.sort_unstable();
    unique.dedup();

    let mut unions = Vec::with_capacity(unique.len());
    for &label in &unique {
        let members: Vec<u32> = labels
            .iter()
            .enumerate()
            .filter(|(_, l)| **l == label)
            .map(|(i, _)| i as u32)
            .collect();
        let count = members.len();
        let index = Tensor::from_vec(members, count, masks.device())?;
        unions.push(masks.index_select(&index, 0)?.max(0)?);
    }
    Ok((unique, Tensor::stack(&unions, 0)?))
}

/// Turns the frozen model's raw output into per-image [`Prediction`]s.
pub struct PredictionExtractor {
    score_threshold: f32,
    rescore_temperature: Option<f64>,
}

impl PredictionExtractor {
    pub fn new(config: &PseudoLabelConfig) -> Self {
        let rescore_temperature = match config.fusion {
            FusionMode::PerPrediction => Some(config.rescore_temperature),
            FusionMode::PerClass => None,
        };
        Self {
            score_threshold: config.score_threshold,
            rescore_temperature,
        }
    }

    /// Predictions sorted by descending score, masks resized to `canvas`.
    pub fn extract(&self, scope: &ScopeOutput, canvas: (usize, usize)) -> Result<Vec<Prediction>> {
        scope.validate("PredictionExtractor::extract")?;
        let probs = sigmoid(&scope.logits.detach())?;
        let (raw_scores, _) = max_with_index(&probs)?;
        let (scores, labels) = match self.rescore_temperature {
            Some(t) => max_with_index(&softmax(&(&probs / t)?, D::Minus1)?)?,
            None => max_with_index(&probs)?,
        };
        let boxes = scope.boxes.detach().to_dtype(DType::F32)?;
        let mask_logits = scope.masks.detach();

        let mut predictions = Vec::with_capacity(raw_scores.len());
        for b in 0..raw_scores.len() {
            let mut keep: Vec<usize> = (0..raw_scores[b].len())
                .filter(|&q| raw_scores[b][q] > self.score_threshold)
                .collect();
            keep.sort_by(|&x, &y| scores[b][y].total_cmp(&scores[b][x]));

            if keep.is_empty() {
                predictions.push(Prediction::empty(canvas.0, canvas.1, scope.logits.device())?);
                continue;
            }

            let index = Tensor::from_vec(
                keep.iter().map(|&q| q as u32).collect::<Vec<_>>(),
                keep.len(),
                scope.logits.device(),
            )?;
            let masks = sigmoid(&mask_logits.i(b)?.index_select(&index, 0)?)?;
            let masks = resize_bilinear(&masks, canvas)?;
            let image_boxes: Vec<Vec<f32>> = boxes.i(b)?.to_vec2()?;

            predictions.push(Prediction::new(
                keep.iter().map(|&q| labels[b][q]).collect(),
                keep.iter().map(|&q| scores[b][q]).collect(),
                masks,
                keep.iter()
                    .map(|&q| {
                        let v = &image_boxes[q];
                        BoxCxcywh {
                            cx: v[0],
                            cy: v[1],
                            w: v[2],
                            h: v[3],
                        }
                    })
                    .collect(),
            )?);
        }
        Ok(predictions)
    }
}

/// Per-query max value and its class index, `[B, Q, C]` -> `([B][Q], [B][Q])`.
fn max_with_index(probs: &Tensor) -> Result<(Vec<Vec<f32>>, Vec<Vec<ClassId>>)> {
    let values = probs.max(D::Minus1)?.to_dtype(DType::F32)?.to_vec2()?;
    let indices = probs.argmax(D::Minus1)?.to_vec2()?;
    Ok((values, indices))
}
