//! Typed decoder output consumed by matching, losses and the feature cache.

use candle_core::Tensor;
use simcis_core::{ClassId, Error, Result};

/// Identity of one query slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryTag {
    Real,
    /// Replayed feature carrying its sampled class label
    Synthetic(ClassId),
}

/// Arrangement of real and synthetic query slots.
///
/// Real queries always come first; every image carries the same number of
/// synthetic slots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryLayout {
    real: usize,
    synthetic: Vec<Vec<ClassId>>,
}

impl QueryLayout {
    /// Layout with no replayed queries.
    pub fn real_only(real: usize, batch_size: usize) -> Self {
        Self {
            real,
            synthetic: vec![Vec::new(); batch_size],
        }
    }

    /// Layout with per-image synthetic labels appended after `real` slots.
    pub fn with_synthetic(real: usize, synthetic: Vec<Vec<ClassId>>) -> Result<Self> {
        if let Some(first) = synthetic.first() {
            if synthetic.iter().any(|labels| labels.len() != first.len()) {
                return Err(Error::InvalidInput(
                    "synthetic query count differs between images".to_string(),
                ));
            }
        }
        Ok(Self { real, synthetic })
    }

    pub fn batch_size(&self) -> usize {
        self.synthetic.len()
    }

    pub fn real_count(&self) -> usize {
        self.real
    }

    /// Synthetic slots per image.
    pub fn synthetic_count(&self) -> usize {
        self.synthetic.first().map_or(0, Vec::len)
    }

    pub fn total(&self) -> usize {
        self.real + self.synthetic_count()
    }

    pub fn has_synthetic(&self) -> bool {
        self.synthetic_count() > 0
    }

    pub fn synthetic_labels(&self, image: usize) -> &[ClassId] {
        &self.synthetic[image]
    }

    pub fn tag(&self, image: usize, slot: usize) -> QueryTag {
        if slot < self.real {
            QueryTag::Real
        } else {
            QueryTag::Synthetic(self.synthetic[image][slot - self.real])
        }
    }

    pub fn tags(&self, image: usize) -> impl Iterator<Item = QueryTag> + '_ {
        (0..self.total()).map(move |slot| self.tag(image, slot))
    }
}

/// Class, mask and box predictions of one output scope.
#[derive(Debug, Clone)]
pub struct ScopeOutput {
    /// `[B, Q, C]`
    pub logits: Tensor,
    /// `[B, Q, h, w]`
    pub masks: Tensor,
    /// `[B, Q, 4]` center-size in `[0, 1]`
    pub boxes: Tensor,
}

impl ScopeOutput {
    pub fn num_queries(&self) -> Result<usize> {
        Ok(self.logits.dim(1)?)
    }

    pub fn batch_size(&self) -> Result<usize> {
        Ok(self.logits.dim(0)?)
    }

    pub fn num_classes(&self) -> Result<usize> {
        Ok(self.logits.dim(2)?)
    }

    /// Check that logits, masks and boxes agree on batch and query counts.
    pub fn validate(&self, context: &'static str) -> Result<()> {
        let (b, q, _) = self.logits.dims3()?;
        let mask_dims = self.masks.dims();
        let box_dims = self.boxes.dims();
        if mask_dims.len() != 4 || mask_dims[..2] != [b, q] {
            return Err(Error::ShapeMismatch {
                context,
                expected: vec![b, q],
                actual: mask_dims.to_vec(),
            });
        }
        if box_dims != [b, q, 4] {
            return Err(Error::ShapeMismatch {
                context,
                expected: vec![b, q, 4],
                actual: box_dims.to_vec(),
            });
        }
        Ok(())
    }

    /// Keep query slots `start..start + len` of every tensor.
    pub fn narrow_queries(&self, start: usize, len: usize) -> Result<ScopeOutput> {
        Ok(ScopeOutput {
            logits: self.logits.narrow(1, start, len)?,
            masks: self.masks.narrow(1, start, len)?,
            boxes: self.boxes.narrow(1, start, len)?,
        })
    }

    /// Detached copy for consumers that must not receive gradients.
    pub fn detach(&self) -> ScopeOutput {
        ScopeOutput {
            logits: self.logits.detach(),
            masks: self.masks.detach(),
            boxes: self.boxes.detach(),
        }
    }
}

/// Logits of the distillation branch.
#[derive(Debug, Clone)]
pub struct DistillLogits {
    /// Final decoder layer, `[B, Qd, C]`
    pub primary: Tensor,
    /// Encoder stage, `[B, Qd, C]`
    pub interm: Tensor,
}

/// Which part of the decoder a scope comes from; drives loss key naming.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeKind {
    Primary,
    Aux(usize),
    Interm,
}

impl ScopeKind {
    pub fn loss_key(&self, base: &str) -> String {
        match self {
            ScopeKind::Primary => base.to_string(),
            ScopeKind::Aux(i) => format!("{base}_{i}"),
            ScopeKind::Interm => format!("interm_{base}"),
        }
    }
}

/// Everything one decoder forward produces.
#[derive(Debug, Clone)]
pub struct DecoderOutput {
    pub primary: ScopeOutput,
    /// One entry per decoder layer except the last
    pub aux: Vec<ScopeOutput>,
    pub interm: ScopeOutput,
    pub layout: QueryLayout,
    /// Pre-decoder query vectors `[B, Qt, D]`
    pub query_features: Tensor,
    /// Encoder positions selected as real queries, `[B, Q]` u32
    pub proposal_positions: Tensor,
    pub distill: Option<DistillLogits>,
}

impl DecoderOutput {
    /// Every scope in loss order: primary, aux layers, interm.
    pub fn scopes(&self) -> Vec<(ScopeKind, &ScopeOutput)> {
        let mut scopes = vec![(ScopeKind::Primary, &self.primary)];
        scopes.extend(
            self.aux
                .iter()
                .enumerate()
                .map(|(i, scope)| (ScopeKind::Aux(i), scope)),
        );
        scopes.push((ScopeKind::Interm, &self.interm));
        scopes
    }

    /// Frozen logits for distilling into the next model.
    pub fn teacher_logits(&self) -> TeacherLogits {
        TeacherLogits {
            primary: self.primary.logits.detach(),
            interm: self.interm.logits.detach(),
        }
    }
}

/// Old-model logits at the proposal positions handed to the student.
#[derive(Debug, Clone)]
pub struct TeacherLogits {
    pub primary: Tensor,
    pub interm: Tensor,
}
