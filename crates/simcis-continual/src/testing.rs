//! Shared fixtures for unit tests.

use candle_core::{DType, Device, Tensor};
use simcis_core::{BoxCxcywh, ClassId, Result, Target};

use crate::matching::{MatchIndices, Matcher};
use crate::output::ScopeOutput;

pub const CANVAS: usize = 16;

/// Pairs query `i` with target `i` for as many pairs as both sides allow.
pub struct InOrderMatcher;

impl Matcher for InOrderMatcher {
    fn match_scope(&self, scope: &ScopeOutput, targets: &[Target]) -> Result<Vec<MatchIndices>> {
        let queries = scope.num_queries()?;
        targets
            .iter()
            .map(|t| {
                let n = t.len().min(queries);
                MatchIndices::new((0..n).collect(), (0..n).collect())
            })
            .collect()
    }
}

/// Scope output of zero logits, zero mask logits and centered boxes.
pub fn scope(batch: usize, queries: usize, classes: usize, device: &Device) -> Result<ScopeOutput> {
    Ok(ScopeOutput {
        logits: Tensor::zeros((batch, queries, classes), DType::F32, device)?,
        masks: Tensor::zeros((batch, queries, CANVAS / 2, CANVAS / 2), DType::F32, device)?,
        boxes: (Tensor::ones((batch, queries, 4), DType::F32, device)? * 0.5)?,
    })
}

/// Target on a `CANVAS` square with one horizontal band per label.
pub fn target_with_labels(labels: &[ClassId], device: &Device) -> Result<Target> {
    if labels.is_empty() {
        return Target::empty(CANVAS, CANVAS, device);
    }
    let n = labels.len();
    let band = (CANVAS / n).max(1);
    let mut data = vec![0u8; n * CANVAS * CANVAS];
    for i in 0..n {
        for y in (i * band).min(CANVAS)..((i + 1) * band).min(CANVAS) {
            for x in 0..CANVAS {
                data[i * CANVAS * CANVAS + y * CANVAS + x] = 1;
            }
        }
    }
    let boxes = (0..n)
        .map(|i| BoxCxcywh {
            cx: 0.5,
            cy: ((i as f32 + 0.5) * band as f32) / CANVAS as f32,
            w: 1.0,
            h: band as f32 / CANVAS as f32,
        })
        .collect();
    Target::new(
        labels.to_vec(),
        Tensor::from_vec(data, (n, CANVAS, CANVAS), device)?,
        boxes,
    )
}
