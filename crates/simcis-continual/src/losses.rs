//! Set-prediction and distillation losses.
//!
//! Classification: sigmoid focal loss over one-hot targets, where unmatched
//! queries target "no object" (all zeros).
//! Masks: sigmoid BCE and dice on sampled points.
//! Boxes: L1 and `1 - GIoU` on normalized center-size boxes.
//!
//! Knowledge distillation compares the class distribution of the current
//! model against the frozen old model, query by query.

use candle_core::{DType, Device, Tensor, D};
use candle_nn::ops::{log_softmax, sigmoid, softmax};
use simcis_core::{aligned_generalized_iou, box_cxcywh_to_xyxy, ClassId, Error, Result};

use crate::config::KdType;

/// Element-wise binary cross entropy on logits.
///
/// `max(x, 0) - x * t + log(1 + exp(-|x|))`, stable for large `|x|`.
pub fn binary_cross_entropy_with_logits(logits: &Tensor, targets: &Tensor) -> Result<Tensor> {
    let positive = logits.relu()?;
    let cross = (logits * targets)?;
    let soft = (logits.abs()?.neg()?.exp()? + 1.0)?.log()?;
    Ok(((positive - cross)? + soft)?)
}

/// Sigmoid focal loss (RetinaNet) on `[B, Q, C]` logits.
///
/// Averaged over queries, summed over the rest and divided by `num_masks`.
pub fn sigmoid_focal_loss(
    logits: &Tensor,
    targets: &Tensor,
    num_masks: f64,
    alpha: f64,
    gamma: f64,
) -> Result<Tensor> {
    if logits.dims() != targets.dims() {
        return Err(Error::ShapeMismatch {
            context: "sigmoid_focal_loss",
            expected: logits.dims().to_vec(),
            actual: targets.dims().to_vec(),
        });
    }
    let prob = sigmoid(logits)?;
    let ce = binary_cross_entropy_with_logits(logits, targets)?;

    // p_t = p * t + (1 - p) * (1 - t)
    let negatives = targets.affine(-1.0, 1.0)?;
    let p_t = ((&prob * targets)? + (prob.affine(-1.0, 1.0)? * &negatives)?)?;
    let modulator = p_t.affine(-1.0, 1.0)?.powf(gamma)?;
    let mut loss = (ce * modulator)?;

    if alpha >= 0.0 {
        let alpha_t = ((targets * alpha)? + (negatives * (1.0 - alpha))?)?;
        loss = (loss * alpha_t)?;
    }

    Ok((loss.mean(1)?.sum_all()? / num_masks)?)
}

/// Sigmoid BCE on `[N, P]` point logits, averaged over points.
pub fn sigmoid_ce_loss(logits: &Tensor, labels: &Tensor, num_masks: f64) -> Result<Tensor> {
    let loss = binary_cross_entropy_with_logits(logits, labels)?;
    Ok((loss.mean(1)?.sum_all()? / num_masks)?)
}

/// Dice loss on `[N, P]` point logits with +1 smoothing.
pub fn dice_loss(logits: &Tensor, labels: &Tensor, num_masks: f64) -> Result<Tensor> {
    let prob = sigmoid(logits)?;
    let numerator = ((&prob * labels)?.sum(1)? * 2.0)?;
    let denominator = (prob.sum(1)? + labels.sum(1)?)?;
    let ratio = ((numerator + 1.0)? / (denominator + 1.0)?)?;
    Ok((ratio.affine(-1.0, 1.0)?.sum_all()? / num_masks)?)
}

/// L1 distance between matched `[N, 4]` boxes.
pub fn box_l1_loss(src: &Tensor, target: &Tensor, num_masks: f64) -> Result<Tensor> {
    Ok(((src - target)?.abs()?.sum_all()? / num_masks)?)
}

/// `1 - GIoU` between matched `[N, 4]` center-size boxes.
pub fn giou_loss(src: &Tensor, target: &Tensor, num_masks: f64) -> Result<Tensor> {
    let giou = aligned_generalized_iou(&box_cxcywh_to_xyxy(src)?, &box_cxcywh_to_xyxy(target)?)?;
    Ok((giou.affine(-1.0, 1.0)?.sum_all()? / num_masks)?)
}

/// One-hot class targets `[B, Q, C]`.
///
/// `assignments[b]` lists `(query, label)` pairs of image `b`; every other
/// query stays all-zero.
pub fn one_hot_targets(
    assignments: &[Vec<(usize, ClassId)>],
    num_queries: usize,
    num_classes: usize,
    device: &Device,
) -> Result<Tensor> {
    let batch = assignments.len();
    let mut data = vec![0f32; batch * num_queries * num_classes];
    for (b, pairs) in assignments.iter().enumerate() {
        for &(query, label) in pairs {
            if label as usize >= num_classes {
                return Err(Error::ClassOutOfRange { label, num_classes });
            }
            if query >= num_queries {
                return Err(Error::InvalidInput(format!(
                    "query {query} outside {num_queries} query slots"
                )));
            }
            data[(b * num_queries + query) * num_classes + label as usize] = 1.0;
        }
    }
    Ok(Tensor::from_vec(data, (batch, num_queries, num_classes), device)?)
}

/// Old-model distillation on `[B, Q, C]` class logits.
#[derive(Debug, Clone)]
pub struct DistillationLoss {
    kind: KdType,
    kl_all: bool,
    old_classes: usize,
}

impl DistillationLoss {
    pub fn new(kind: KdType, kl_all: bool, old_classes: usize) -> Self {
        Self {
            kind,
            kl_all,
            old_classes,
        }
    }

    pub fn kind(&self) -> KdType {
        self.kind
    }

    /// Distillation term between `student` and frozen `teacher` logits.
    pub fn compute(&self, student: &Tensor, teacher: &Tensor, temperature: f64) -> Result<Tensor> {
        let (batch, queries, _) = student.dims3()?;
        let (t_batch, t_queries, _) = teacher.dims3()?;
        if (batch, queries) != (t_batch, t_queries) {
            return Err(Error::ShapeMismatch {
                context: "distillation logits",
                expected: vec![batch, queries],
                actual: vec![t_batch, t_queries],
            });
        }
        let teacher = teacher.detach();
        match self.kind {
            KdType::Kl => self.kl_divergence(student, &teacher, temperature),
            KdType::L2 => self.l2(student, &teacher),
            KdType::Unbiased => self.unbiased(student, &teacher),
        }
    }

    /// `Σ p_old (log p_old - log_softmax(student / T)) / B`.
    ///
    /// No `T²` rescaling.
    fn kl_divergence(&self, student: &Tensor, teacher: &Tensor, temperature: f64) -> Result<Tensor> {
        let classes = if self.kl_all {
            student.dim(D::Minus1)?.min(teacher.dim(D::Minus1)?)
        } else {
            self.old_classes
        };
        let student = narrow_classes(student, classes)?;
        let teacher = narrow_classes(teacher, classes)?;
        let batch = student.dim(0)?;

        let student_log = log_softmax(&(student / temperature)?, D::Minus1)?;
        let teacher_log = log_softmax(&(teacher / temperature)?, D::Minus1)?;
        let teacher_prob = teacher_log.exp()?;

        let kl = (teacher_prob * (teacher_log - student_log)?)?.sum_all()?;
        Ok((kl / batch.max(1) as f64)?)
    }

    /// Squared distance of sigmoid scores over the old classes.
    fn l2(&self, student: &Tensor, teacher: &Tensor) -> Result<Tensor> {
        let student = sigmoid(&narrow_classes(student, self.old_classes)?)?;
        let teacher = sigmoid(&narrow_classes(teacher, self.old_classes)?)?;
        let batch = student.dim(0)?;
        let per_query = (student - teacher)?.sqr()?.sum(D::Minus1)?;
        Ok((per_query.mean_all()? / batch.max(1) as f64)?)
    }

    /// Unbiased distillation: the student is normalized over every class it
    /// knows, then only its old-class slice is compared to the old model.
    fn unbiased(&self, student: &Tensor, teacher: &Tensor) -> Result<Tensor> {
        let student_log = narrow_classes(&log_softmax(student, D::Minus1)?, self.old_classes)?;
        let teacher = narrow_classes(teacher, self.old_classes)?;
        let teacher_prob = softmax(&teacher, D::Minus1)?;
        let teacher_log = log_softmax(&teacher, D::Minus1)?;

        let per_query = (teacher_prob * (teacher_log - student_log)?)?.sum(D::Minus1)?;
        Ok(per_query.mean_all()?)
    }
}

fn narrow_classes(logits: &Tensor, classes: usize) -> Result<Tensor> {
    let available = logits.dim(D::Minus1)?;
    if classes > available {
        return Err(Error::ShapeMismatch {
            context: "distillation classes",
            expected: vec![classes],
            actual: vec![available],
        });
    }
    Ok(logits.narrow(D::Minus1, 0, classes)?)
}

/// Scalar value of a loss tensor.
pub fn scalar(loss: &Tensor) -> Result<f32> {
    Ok(loss.to_dtype(DType::F32)?.to_scalar::<f32>()?)
}
