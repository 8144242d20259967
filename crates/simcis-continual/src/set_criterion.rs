//! Loss aggregation over every decoder scope.
//!
//! Each scope (primary, aux layers, interm) is matched on its real queries.
//! Classification uses the match extended with the replay slots; masks and
//! boxes use the plain match. Distillation runs on the primary and interm
//! scopes only.

use std::collections::{BTreeMap, HashSet};

use candle_core::{DType, Device, Tensor};
use rand::Rng;
use simcis_core::{ClassId, Error, Result, Target};
use tracing::debug;

use crate::comm::Collective;
use crate::config::{DistillConfig, LossConfig};
use crate::losses::{
    box_l1_loss, dice_loss, giou_loss, one_hot_targets, scalar, sigmoid_ce_loss,
    sigmoid_focal_loss, DistillationLoss,
};
use crate::matching::{extend_with_synthetic, match_real_queries, ExtendedMatch, MatchIndices, Matcher};
use crate::output::{DecoderOutput, ScopeKind, ScopeOutput, TeacherLogits};
use crate::point_sample::{point_sample, sample_uncertain_points};

pub const LOSS_CE: &str = "loss_ce";
pub const LOSS_MASK: &str = "loss_mask";
pub const LOSS_DICE: &str = "loss_dice";
pub const LOSS_BBOX: &str = "loss_bbox";
pub const LOSS_GIOU: &str = "loss_giou";
pub const LOSS_KD: &str = "kl_loss";

/// Per-key loss weights, including aux and interm copies.
#[derive(Debug, Clone, Default)]
pub struct LossWeights {
    weights: BTreeMap<String, f64>,
}

impl LossWeights {
    pub fn new(loss: &LossConfig, distill: &DistillConfig) -> Self {
        let base = [
            (LOSS_CE, loss.class_weight),
            (LOSS_MASK, loss.mask_weight),
            (LOSS_DICE, loss.dice_weight),
            (LOSS_BBOX, loss.mask_weight),
            (LOSS_GIOU, loss.giou_weight),
            (LOSS_KD, distill.kl_weight),
        ];

        let mut weights = BTreeMap::new();
        for (key, weight) in base {
            weights.insert(ScopeKind::Primary.loss_key(key), weight);
            weights.insert(ScopeKind::Interm.loss_key(key), weight);
        }
        if loss.deep_supervision {
            for i in 0..loss.dec_layers.saturating_sub(1) {
                for (key, weight) in base {
                    weights.insert(ScopeKind::Aux(i).loss_key(key), weight);
                }
            }
        }
        Self { weights }
    }

    pub fn get(&self, key: &str) -> Option<f64> {
        self.weights.get(key).copied()
    }

    /// Scale every term by its weight; terms without a weight are dropped.
    pub fn apply(&self, losses: BTreeMap<String, Tensor>) -> Result<WeightedLosses> {
        let mut terms = BTreeMap::new();
        let mut total: Option<Tensor> = None;
        for (key, loss) in losses {
            let Some(weight) = self.get(&key) else {
                debug!(key = %key, "dropping loss without weight");
                continue;
            };
            let weighted = (loss * weight)?;
            total = Some(match total {
                Some(sum) => (sum + &weighted)?,
                None => weighted.clone(),
            });
            terms.insert(key, weighted);
        }
        let total = match total {
            Some(total) => total,
            None => Tensor::zeros((), DType::F32, &Device::Cpu)?,
        };
        Ok(WeightedLosses { terms, total })
    }
}

/// Weighted loss terms and their sum.
#[derive(Debug, Clone)]
pub struct WeightedLosses {
    pub terms: BTreeMap<String, Tensor>,
    pub total: Tensor,
}

impl WeightedLosses {
    /// Scalar values for logging.
    pub fn values(&self) -> Result<BTreeMap<String, f32>> {
        self.terms
            .iter()
            .map(|(key, loss)| Ok((key.clone(), scalar(loss)?)))
            .collect()
    }

    pub fn total_value(&self) -> Result<f32> {
        scalar(&self.total)
    }
}

/// Cross-worker mask normalizer: `max(Σ targets / world_size, 1)`.
pub fn num_masks(targets: &[Target], collective: &dyn Collective) -> Result<f64> {
    let mut count = [targets.iter().map(|t| t.len() as f64).sum::<f64>()];
    collective.all_reduce_sum(&mut count)?;
    Ok((count[0] / collective.world_size().max(1) as f64).max(1.0))
}

/// Mask-classification set criterion.
pub struct SetCriterion {
    matcher: Box<dyn Matcher + Send + Sync>,
    num_classes: usize,
    config: LossConfig,
    stuff_classes: HashSet<ClassId>,
    distillation: DistillationLoss,
    kd_temperature: f64,
    kd_temperature2: f64,
    kd_decoder: bool,
    weights: LossWeights,
}

impl SetCriterion {
    pub fn new(
        matcher: Box<dyn Matcher + Send + Sync>,
        num_classes: usize,
        config: LossConfig,
        distill: &DistillConfig,
        old_classes: usize,
    ) -> Self {
        let weights = LossWeights::new(&config, distill);
        Self {
            matcher,
            num_classes,
            stuff_classes: config.stuff_classes.iter().copied().collect(),
            config,
            distillation: DistillationLoss::new(distill.kd_type, distill.kl_all, old_classes),
            kd_temperature: distill.kd_temperature,
            kd_temperature2: distill.kd_temperature2,
            kd_decoder: distill.kd_decoder,
            weights,
        }
    }

    pub fn weights(&self) -> &LossWeights {
        &self.weights
    }

    pub fn matcher(&self) -> &(dyn Matcher + Send + Sync) {
        self.matcher.as_ref()
    }

    /// Unweighted losses of every scope.
    ///
    /// `targets` are the complete targets. `teacher` enables distillation and
    /// then requires the distillation logits in `outputs`.
    pub fn losses<R: Rng>(
        &self,
        outputs: &DecoderOutput,
        targets: &[Target],
        teacher: Option<&TeacherLogits>,
        collective: &dyn Collective,
        rng: &mut R,
    ) -> Result<BTreeMap<String, Tensor>> {
        if targets.len() != outputs.layout.batch_size() {
            return Err(Error::InvalidInput(format!(
                "{} targets for a batch of {}",
                targets.len(),
                outputs.layout.batch_size()
            )));
        }
        let num_masks = num_masks(targets, collective)?;
        let mut losses = BTreeMap::new();

        for (kind, scope) in outputs.scopes() {
            if matches!(kind, ScopeKind::Aux(_)) && !self.config.deep_supervision {
                continue;
            }
            scope.validate("set criterion scope")?;
            let indices = match_real_queries(self.matcher.as_ref(), scope, &outputs.layout, targets)?;

            let extended = extend_with_synthetic(&indices, targets, &outputs.layout)?;
            losses.insert(kind.loss_key(LOSS_CE), self.loss_labels(scope, &extended, num_masks)?);

            let (mask, dice) = self.loss_masks(scope, targets, &indices, num_masks, rng)?;
            losses.insert(kind.loss_key(LOSS_MASK), mask);
            losses.insert(kind.loss_key(LOSS_DICE), dice);

            let (bbox, giou) = self.loss_boxes(scope, targets, &indices, num_masks)?;
            losses.insert(kind.loss_key(LOSS_BBOX), bbox);
            losses.insert(kind.loss_key(LOSS_GIOU), giou);

            if let Some(teacher) = teacher {
                if let Some(kd) = self.loss_kd(kind, outputs, teacher)? {
                    losses.insert(kind.loss_key(LOSS_KD), kd);
                }
            }
        }
        Ok(losses)
    }

    /// Weighted losses and their total.
    pub fn compute<R: Rng>(
        &self,
        outputs: &DecoderOutput,
        targets: &[Target],
        teacher: Option<&TeacherLogits>,
        collective: &dyn Collective,
        rng: &mut R,
    ) -> Result<WeightedLosses> {
        let losses = self.losses(outputs, targets, teacher, collective, rng)?;
        self.weights.apply(losses)
    }

    fn loss_labels(&self, scope: &ScopeOutput, extended: &ExtendedMatch, num_masks: f64) -> Result<Tensor> {
        let num_queries = scope.num_queries()?;
        let mut assignments = Vec::with_capacity(extended.indices.len());
        for (m, labels) in extended.indices.iter().zip(&extended.labels) {
            let pairs = m
                .pairs()
                .map(|(q, t)| {
                    labels.get(t).map(|&label| (q, label)).ok_or_else(|| {
                        Error::InvalidInput(format!("target {t} outside {} labels", labels.len()))
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            assignments.push(pairs);
        }
        let onehot = one_hot_targets(&assignments, num_queries, self.num_classes, scope.logits.device())?
            .to_dtype(scope.logits.dtype())?;
        let loss = sigmoid_focal_loss(
            &scope.logits,
            &onehot,
            num_masks,
            self.config.focal_alpha,
            self.config.focal_gamma,
        )?;
        Ok((loss * num_queries as f64)?)
    }

    fn loss_masks<R: Rng>(
        &self,
        scope: &ScopeOutput,
        targets: &[Target],
        indices: &[MatchIndices],
        num_masks: f64,
        rng: &mut R,
    ) -> Result<(Tensor, Tensor)> {
        let device = scope.masks.device();
        let (batch, queries, h, w) = scope.masks.dims4()?;

        let mut src_index = Vec::new();
        let mut target_masks = Vec::new();
        for (b, (m, target)) in indices.iter().zip(targets).enumerate() {
            if m.is_empty() {
                continue;
            }
            src_index.extend(m.queries.iter().map(|&q| (b * queries + q) as u32));
            let t_index = Tensor::from_vec(
                m.targets.iter().map(|&t| t as u32).collect::<Vec<_>>(),
                m.len(),
                target.device(),
            )?;
            target_masks.push(target.masks().index_select(&t_index, 0)?.to_dtype(DType::F32)?);
        }
        if src_index.is_empty() {
            let zero = Tensor::zeros((), scope.masks.dtype(), device)?;
            return Ok((zero.clone(), zero));
        }

        let n = src_index.len();
        let src_index = Tensor::from_vec(src_index, n, device)?;
        let src_masks = scope
            .masks
            .reshape((batch * queries, h, w))?
            .index_select(&src_index, 0)?;
        let target_masks = Tensor::cat(&target_masks, 0)?;

        let coords = sample_uncertain_points(
            &src_masks,
            self.config.num_points,
            self.config.oversample_ratio,
            self.config.importance_sample_ratio,
            rng,
        )?;
        let point_labels = point_sample(&target_masks, &coords)?.detach();
        let point_logits = point_sample(&src_masks, &coords)?;
        let point_labels = point_labels.to_dtype(point_logits.dtype())?;

        Ok((
            sigmoid_ce_loss(&point_logits, &point_labels, num_masks)?,
            dice_loss(&point_logits, &point_labels, num_masks)?,
        ))
    }

    fn loss_boxes(
        &self,
        scope: &ScopeOutput,
        targets: &[Target],
        indices: &[MatchIndices],
        num_masks: f64,
    ) -> Result<(Tensor, Tensor)> {
        let device = scope.boxes.device();
        let (batch, queries, _) = scope.boxes.dims3()?;

        let mut src_index = Vec::new();
        let mut target_boxes = Vec::new();
        for (b, (m, target)) in indices.iter().zip(targets).enumerate() {
            for (q, t) in m.pairs() {
                if self.stuff_classes.contains(&target.labels()[t]) {
                    continue;
                }
                src_index.push((b * queries + q) as u32);
                target_boxes.extend(target.boxes()[t].to_array());
            }
        }
        if src_index.is_empty() {
            let zero = Tensor::zeros((), scope.boxes.dtype(), device)?;
            return Ok((zero.clone(), zero));
        }

        let n = src_index.len();
        let src_index = Tensor::from_vec(src_index, n, device)?;
        let src_boxes = scope
            .boxes
            .reshape((batch * queries, 4))?
            .index_select(&src_index, 0)?;
        let target_boxes = Tensor::from_vec(target_boxes, (n, 4), device)?.to_dtype(src_boxes.dtype())?;

        Ok((
            box_l1_loss(&src_boxes, &target_boxes, num_masks)?,
            giou_loss(&src_boxes, &target_boxes, num_masks)?,
        ))
    }

    fn loss_kd(
        &self,
        kind: ScopeKind,
        outputs: &DecoderOutput,
        teacher: &TeacherLogits,
    ) -> Result<Option<Tensor>> {
        let (student, old, temperature) = match kind {
            ScopeKind::Aux(_) => return Ok(None),
            ScopeKind::Primary if !self.kd_decoder => return Ok(None),
            ScopeKind::Primary => {
                let distill = outputs
                    .distill
                    .as_ref()
                    .ok_or(Error::MissingOutput("distillation logits"))?;
                (&distill.primary, &teacher.primary, self.kd_temperature2)
            }
            ScopeKind::Interm => {
                let distill = outputs
                    .distill
                    .as_ref()
                    .ok_or(Error::MissingOutput("distillation logits"))?;
                (&distill.interm, &teacher.interm, self.kd_temperature)
            }
        };
        Ok(Some(self.distillation.compute(student, old, temperature)?))
    }
}
