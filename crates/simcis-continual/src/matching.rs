//! Bipartite matching contract and the synthetic-query adapter around it.
//!
//! Synthetic replay queries have no spatial meaning, so they are removed
//! before matching and spliced back afterwards with a fixed assignment to
//! appended targets carrying their sampled labels.

use simcis_core::{ClassId, Error, Result, Target};

use crate::output::{QueryLayout, ScopeOutput};

/// Matched `(query, target)` pairs of one image.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MatchIndices {
    pub queries: Vec<usize>,
    pub targets: Vec<usize>,
}

impl MatchIndices {
    pub fn new(queries: Vec<usize>, targets: Vec<usize>) -> Result<Self> {
        if queries.len() != targets.len() {
            return Err(Error::InvalidInput(format!(
                "{} matched queries for {} matched targets",
                queries.len(),
                targets.len()
            )));
        }
        Ok(Self { queries, targets })
    }

    pub fn len(&self) -> usize {
        self.queries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queries.is_empty()
    }

    pub fn pairs(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.queries.iter().copied().zip(self.targets.iter().copied())
    }
}

/// Minimal-cost assignment of predictions to targets.
///
/// Returns one [`MatchIndices`] per image with at most one pair per target
/// and per query.
pub trait Matcher {
    fn match_scope(&self, scope: &ScopeOutput, targets: &[Target]) -> Result<Vec<MatchIndices>>;
}

/// Matching extended with the synthetic query assignments.
#[derive(Debug, Clone)]
pub struct ExtendedMatch {
    pub indices: Vec<MatchIndices>,
    /// Target labels with the synthetic labels appended, per image
    pub labels: Vec<Vec<ClassId>>,
}

/// Narrow a scope to its real query slots.
pub fn strip_synthetic(scope: &ScopeOutput, layout: &QueryLayout) -> Result<ScopeOutput> {
    if !layout.has_synthetic() {
        return Ok(scope.clone());
    }
    scope.narrow_queries(0, layout.real_count())
}

/// Match the real queries of `scope` and check the result is in range.
pub fn match_real_queries<M: Matcher + ?Sized>(
    matcher: &M,
    scope: &ScopeOutput,
    layout: &QueryLayout,
    targets: &[Target],
) -> Result<Vec<MatchIndices>> {
    let real = strip_synthetic(scope, layout)?;
    let indices = matcher.match_scope(&real, targets)?;
    if indices.len() != targets.len() {
        return Err(Error::InvalidInput(format!(
            "matcher returned {} results for {} images",
            indices.len(),
            targets.len()
        )));
    }
    for (m, target) in indices.iter().zip(targets) {
        if m.queries.len() != m.targets.len() {
            return Err(Error::InvalidInput(
                "matcher returned unequal index lists".to_string(),
            ));
        }
        if let Some(&q) = m.queries.iter().find(|&&q| q >= layout.real_count()) {
            return Err(Error::InvalidInput(format!(
                "matched query {q} outside {} real queries",
                layout.real_count()
            )));
        }
        if let Some(&t) = m.targets.iter().find(|&&t| t >= target.len()) {
            return Err(Error::InvalidInput(format!(
                "matched target {t} outside {} targets",
                target.len()
            )));
        }
    }
    Ok(indices)
}

/// Append one fixed pair per synthetic slot.
///
/// Synthetic slot `s` of an image is paired with target index `base + s`,
/// where `base` lies past every existing target index, and the sampled
/// label is appended to that image's labels at the same position.
pub fn extend_with_synthetic(
    indices: &[MatchIndices],
    targets: &[Target],
    layout: &QueryLayout,
) -> Result<ExtendedMatch> {
    if indices.len() != targets.len() || layout.batch_size() != targets.len() {
        return Err(Error::InvalidInput(format!(
            "extend: {} matches, {} targets, layout for {} images",
            indices.len(),
            targets.len(),
            layout.batch_size()
        )));
    }

    let mut extended = Vec::with_capacity(indices.len());
    let mut labels = Vec::with_capacity(indices.len());
    for (image, (m, target)) in indices.iter().zip(targets).enumerate() {
        let mut image_match = m.clone();
        let mut image_labels = target.labels().to_vec();

        let synthetic = layout.synthetic_labels(image);
        if !synthetic.is_empty() {
            let after_matched = m.targets.iter().max().map_or(0, |&t| t + 1);
            let base = after_matched.max(image_labels.len());
            for (s, &label) in synthetic.iter().enumerate() {
                image_match.queries.push(layout.real_count() + s);
                image_match.targets.push(base + s);
                image_labels.push(label);
            }
        }

        extended.push(image_match);
        labels.push(image_labels);
    }

    Ok(ExtendedMatch {
        indices: extended,
        labels,
    })
}
