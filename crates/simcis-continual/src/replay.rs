//! Virtual query replay: the per-class feature cache and its sampler.
//!
//! A [`FeatureBank`] is the mutable, bounded cache filled while training.
//! At task end it is persisted and the next task loads it as an immutable
//! [`QueryLibrary`] snapshot from which the [`ReplaySampler`] draws synthetic
//! queries.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::Path;
use std::sync::Arc;

use candle_core::{DType, Device, IndexOp, Tensor};
use rand::distributions::{Distribution, WeightedIndex};
use rand::Rng;
use serde::{Deserialize, Serialize};
use simcis_core::{ClassId, Error, Result};
use tracing::{debug, info};

const CLASS_KEY_PREFIX: &str = "class.";

/// Bounded per-class FIFO of feature vectors. Oldest entries are evicted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureBank {
    capacity: usize,
    buffers: BTreeMap<ClassId, VecDeque<Vec<f32>>>,
}

impl FeatureBank {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            buffers: BTreeMap::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn push(&mut self, class: ClassId, feature: Vec<f32>) {
        let capacity = self.capacity;
        if capacity == 0 {
            return;
        }
        let buffer = self
            .buffers
            .entry(class)
            .or_insert_with(|| VecDeque::with_capacity(capacity));
        if buffer.len() == capacity {
            buffer.pop_front();
        }
        buffer.push_back(feature);
    }

    /// Append every entry of `other`, oldest first, re-applying the bound.
    pub fn merge(&mut self, other: FeatureBank) {
        for (class, buffer) in other.buffers {
            for feature in buffer {
                self.push(class, feature);
            }
        }
    }

    pub fn len_of(&self, class: ClassId) -> usize {
        self.buffers.get(&class).map_or(0, VecDeque::len)
    }

    pub fn classes(&self) -> impl Iterator<Item = ClassId> + '_ {
        self.buffers.keys().copied()
    }

    pub fn total_len(&self) -> usize {
        self.buffers.values().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.total_len() == 0
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Snapshot as one `[n, D]` tensor per class.
    pub fn freeze(&self, device: &Device) -> Result<QueryLibrary> {
        let mut entries = BTreeMap::new();
        for (&class, buffer) in &self.buffers {
            if buffer.is_empty() {
                continue;
            }
            let dim = buffer[0].len();
            if buffer.iter().any(|f| f.len() != dim) {
                return Err(Error::ShapeMismatch {
                    context: "FeatureBank::freeze",
                    expected: vec![dim],
                    actual: buffer.iter().map(Vec::len).collect(),
                });
            }
            let data: Vec<f32> = buffer.iter().flatten().copied().collect();
            entries.insert(class, Tensor::from_vec(data, (buffer.len(), dim), device)?);
        }
        QueryLibrary::from_entries(entries)
    }
}

/// Read-only per-class replay features, `[n, D]` per class.
#[derive(Debug, Clone, Default)]
pub struct QueryLibrary {
    entries: BTreeMap<ClassId, Tensor>,
    hidden_dim: Option<usize>,
}

impl QueryLibrary {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: BTreeMap<ClassId, Tensor>) -> Result<Self> {
        let mut hidden_dim = None;
        for (&class, features) in &entries {
            let (_, dim) = features.dims2()?;
            match hidden_dim {
                None => hidden_dim = Some(dim),
                Some(d) if d != dim => {
                    return Err(Error::ShapeMismatch {
                        context: "QueryLibrary entry",
                        expected: vec![d],
                        actual: vec![class as usize, dim],
                    })
                }
                Some(_) => {}
            }
        }
        Ok(Self {
            entries,
            hidden_dim,
        })
    }

    pub fn get(&self, class: ClassId) -> Option<&Tensor> {
        self.entries.get(&class)
    }

    pub fn entry_len(&self, class: ClassId) -> usize {
        self.entries.get(&class).map_or(0, |t| t.dim(0).unwrap_or(0))
    }

    pub fn classes(&self) -> impl Iterator<Item = ClassId> + '_ {
        self.entries.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn hidden_dim(&self) -> Option<usize> {
        self.hidden_dim
    }

    /// Write one `class.<id>` tensor per class in safetensors format.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let tensors: HashMap<String, Tensor> = self
            .entries
            .iter()
            .map(|(class, t)| (format!("{CLASS_KEY_PREFIX}{class}"), t.clone()))
            .collect();
        candle_core::safetensors::save(&tensors, path.as_ref())?;
        info!(
            path = %path.as_ref().display(),
            classes = self.entries.len(),
            "saved replay query library"
        );
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>, device: &Device) -> Result<Self> {
        let tensors = candle_core::safetensors::load(path.as_ref(), device)?;
        let mut entries = BTreeMap::new();
        for (key, tensor) in tensors {
            let class = key
                .strip_prefix(CLASS_KEY_PREFIX)
                .and_then(|id| id.parse::<ClassId>().ok())
                .ok_or_else(|| {
                    Error::Serialization(format!("unexpected replay library key `{key}`"))
                })?;
            entries.insert(class, tensor.to_dtype(DType::F32)?);
        }
        Self::from_entries(entries)
    }
}

/// Per-class pseudo-label occurrence counts gathered in collection mode.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PseudoLabelHistogram {
    counts: Vec<u64>,
}

impl PseudoLabelHistogram {
    pub fn new(num_classes: usize) -> Self {
        Self {
            counts: vec![0; num_classes],
        }
    }

    pub fn from_counts(counts: Vec<u64>) -> Self {
        Self { counts }
    }

    pub fn counts(&self) -> &[u64] {
        &self.counts
    }

    pub fn record(&mut self, class: ClassId) {
        let idx = class as usize;
        if idx >= self.counts.len() {
            self.counts.resize(idx + 1, 0);
        }
        self.counts[idx] += 1;
    }

    /// Element-wise sum; the result is as long as the longer operand.
    pub fn add(&mut self, other: &PseudoLabelHistogram) {
        if other.counts.len() > self.counts.len() {
            self.counts.resize(other.counts.len(), 0);
        }
        for (c, o) in self.counts.iter_mut().zip(&other.counts) {
            *c += o;
        }
    }

    /// Inverse-frequency weights over classes `0..old_classes`.
    ///
    /// Counts are smoothed by one: `w_c = (Σ (n + 1) / (n_c + 1))^alpha`.
    pub fn sampling_weights(&self, old_classes: usize, alpha: f64) -> Vec<f64> {
        let smoothed: Vec<f64> = (0..old_classes)
            .map(|c| self.counts.get(c).copied().unwrap_or(0) as f64 + 1.0)
            .collect();
        let total: f64 = smoothed.iter().sum();
        smoothed.iter().map(|n| (total / n).powf(alpha)).collect()
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        std::fs::write(path.as_ref(), serde_json::to_vec(self)?)?;
        info!(
            path = %path.as_ref().display(),
            total = self.counts.iter().sum::<u64>(),
            "saved pseudo-label histogram"
        );
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let bytes = std::fs::read(path.as_ref())?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

/// Synthetic queries for one batch.
#[derive(Debug, Clone)]
pub struct ReplayBatch {
    /// `[B, vq, D]`, detached
    pub queries: Tensor,
    /// Sampled class per synthetic slot, per image
    pub labels: Vec<Vec<ClassId>>,
}

/// Draws replay queries from an immutable [`QueryLibrary`].
pub struct ReplaySampler {
    library: Arc<QueryLibrary>,
    classes: Vec<ClassId>,
    distribution: Option<WeightedIndex<f64>>,
    vq_number: usize,
}

impl ReplaySampler {
    /// `weights` cover classes `0..old_classes`; `None` samples uniformly.
    /// Classes absent from the library never get drawn.
    pub fn new(
        library: Arc<QueryLibrary>,
        weights: Option<&[f64]>,
        old_classes: usize,
        vq_number: usize,
    ) -> Result<Self> {
        if let Some(w) = weights {
            if w.len() != old_classes {
                return Err(Error::InvalidInput(format!(
                    "{} sampling weights for {} old classes",
                    w.len(),
                    old_classes
                )));
            }
        }

        let mut classes = Vec::new();
        let mut class_weights = Vec::new();
        for class in 0..old_classes {
            if library.entry_len(class as ClassId) == 0 {
                continue;
            }
            classes.push(class as ClassId);
            class_weights.push(weights.map_or(1.0, |w| w[class]));
        }

        let distribution = if vq_number == 0 || classes.is_empty() {
            None
        } else {
            WeightedIndex::new(&class_weights).ok()
        };
        debug!(
            classes = classes.len(),
            vq_number,
            active = distribution.is_some(),
            "built replay sampler"
        );

        Ok(Self {
            library,
            classes,
            distribution,
            vq_number,
        })
    }

    /// A sampler that never injects anything.
    pub fn disabled() -> Self {
        Self {
            library: Arc::new(QueryLibrary::empty()),
            classes: Vec::new(),
            distribution: None,
            vq_number: 0,
        }
    }

    pub fn is_active(&self) -> bool {
        self.distribution.is_some()
    }

    pub fn vq_number(&self) -> usize {
        self.vq_number
    }

    pub fn library(&self) -> &QueryLibrary {
        &self.library
    }

    /// Draw `vq_number` synthetic queries for each of `batch_size` images.
    pub fn sample<R: Rng>(
        &self,
        batch_size: usize,
        rng: &mut R,
        device: &Device,
    ) -> Result<Option<ReplayBatch>> {
        let Some(distribution) = &self.distribution else {
            return Ok(None);
        };
        if batch_size == 0 {
            return Ok(None);
        }

        let mut labels = Vec::with_capacity(batch_size);
        let mut rows = Vec::with_capacity(batch_size * self.vq_number);
        for _ in 0..batch_size {
            let mut image_labels = Vec::with_capacity(self.vq_number);
            for _ in 0..self.vq_number {
                let class = self.classes[distribution.sample(rng)];
                let features = self
                    .library
                    .get(class)
                    .ok_or(Error::MissingOutput("replay library entry"))?;
                let row = rng.gen_range(0..features.dim(0)?);
                rows.push(features.i(row)?);
                image_labels.push(class);
            }
            labels.push(image_labels);
        }

        let hidden_dim = rows[0].dim(0)?;
        let queries = Tensor::stack(&rows, 0)?
            .reshape((batch_size, self.vq_number, hidden_dim))?
            .to_device(device)?
            .detach();
        Ok(Some(ReplayBatch { queries, labels }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_bank_capacity_bound() {
        let mut bank = FeatureBank::new(3);
        for i in 0..10 {
            bank.push(1, vec![i as f32]);
            assert!(bank.len_of(1) <= 3);
        }
        // Newest entries retained.
        let library = bank.freeze(&Device::Cpu).unwrap();
        let kept: Vec<Vec<f32>> = library.get(1).unwrap().to_vec2().unwrap();
        assert_eq!(kept, vec![vec![7.0], vec![8.0], vec![9.0]]);
    }

    #[test]
    fn test_bank_merge_reapplies_bound() {
        let mut a = FeatureBank::new(4);
        let mut b = FeatureBank::new(4);
        for i in 0..4 {
            a.push(2, vec![i as f32]);
            b.push(2, vec![10.0 + i as f32]);
            b.push(5, vec![i as f32]);
        }
        a.merge(b);
        assert_eq!(a.len_of(2), 4);
        assert_eq!(a.len_of(5), 4);
        let kept: Vec<Vec<f32>> = a.freeze(&Device::Cpu).unwrap().get(2).unwrap().to_vec2().unwrap();
        assert_eq!(kept[0], vec![10.0]);
    }

    #[test]
    fn test_bank_bytes_roundtrip() -> Result<()> {
        let mut bank = FeatureBank::new(2);
        bank.push(3, vec![1.0, 2.0]);
        let restored = FeatureBank::from_bytes(&bank.to_bytes()?)?;
        assert_eq!(restored, bank);
        Ok(())
    }

    #[test]
    fn test_library_save_load() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("fake_query.safetensors");
        let mut bank = FeatureBank::new(5);
        for i in 0..7 {
            bank.push(0, vec![i as f32; 4]);
            bank.push(9, vec![-(i as f32); 4]);
        }
        bank.freeze(&Device::Cpu)?.save(&path)?;

        let library = QueryLibrary::load(&path, &Device::Cpu)?;
        assert_eq!(library.classes().collect::<Vec<_>>(), vec![0, 9]);
        assert_eq!(library.entry_len(0), 5);
        assert_eq!(library.hidden_dim(), Some(4));
        Ok(())
    }

    #[test]
    fn test_histogram_weights() {
        let hist = PseudoLabelHistogram::from_counts(vec![3, 0, 1]);
        let weights = hist.sampling_weights(3, 1.0);
        // Smoothed counts 4, 1, 2 with total 7.
        assert!((weights[0] - 7.0 / 4.0).abs() < 1e-9);
        assert!((weights[1] - 7.0).abs() < 1e-9);
        assert!((weights[2] - 3.5).abs() < 1e-9);

        let sqrt = hist.sampling_weights(2, 0.5);
        assert!((sqrt[1] - 5.0f64.sqrt()).abs() < 1e-9);
    }

    #[test]
    fn test_histogram_accumulates() -> Result<()> {
        let mut hist = PseudoLabelHistogram::new(2);
        hist.record(1);
        hist.record(4);
        assert_eq!(hist.counts(), &[0, 1, 0, 0, 1]);

        hist.add(&PseudoLabelHistogram::from_counts(vec![2, 2]));
        assert_eq!(hist.counts(), &[2, 3, 0, 0, 1]);

        let dir = tempfile::tempdir()?;
        let path = dir.path().join("psd_distribution.json");
        hist.save(&path)?;
        assert_eq!(std::fs::read_to_string(&path)?, "[2,3,0,0,1]");
        assert_eq!(PseudoLabelHistogram::load(&path)?, hist);
        Ok(())
    }

    #[test]
    fn test_sampler_shapes_and_labels() -> Result<()> {
        let device = Device::Cpu;
        let mut bank = FeatureBank::new(4);
        for class in [0, 2] {
            for i in 0..3 {
                bank.push(class, vec![class as f32 * 10.0 + i as f32; 8]);
            }
        }
        let library = Arc::new(bank.freeze(&device)?);
        let sampler = ReplaySampler::new(library, None, 3, 3)?;
        assert!(sampler.is_active());

        let mut rng = StdRng::seed_from_u64(0);
        let batch = sampler.sample(2, &mut rng, &device)?.unwrap();
        assert_eq!(batch.queries.dims(), &[2, 3, 8]);
        assert_eq!(batch.labels.len(), 2);
        let rows: Vec<Vec<Vec<f32>>> = batch.queries.to_vec3()?;
        for (image, labels) in batch.labels.iter().enumerate() {
            for (slot, &class) in labels.iter().enumerate() {
                // Class 1 has no library entry.
                assert!(class == 0 || class == 2);
                let value = rows[image][slot][0];
                assert!(value >= class as f32 * 10.0 && value < class as f32 * 10.0 + 3.0);
            }
        }
        Ok(())
    }

    #[test]
    fn test_sampler_weighting() -> Result<()> {
        let device = Device::Cpu;
        let mut bank = FeatureBank::new(1);
        bank.push(0, vec![0.0]);
        bank.push(1, vec![1.0]);
        let library = Arc::new(bank.freeze(&device)?);
        let sampler = ReplaySampler::new(library, Some(&[0.0, 1.0]), 2, 1)?;

        let mut rng = StdRng::seed_from_u64(3);
        let batch = sampler.sample(16, &mut rng, &device)?.unwrap();
        assert!(batch.labels.iter().flatten().all(|&c| c == 1));
        Ok(())
    }

    #[test]
    fn test_sampler_inactive_without_library() -> Result<()> {
        let device = Device::Cpu;
        let sampler = ReplaySampler::new(Arc::new(QueryLibrary::empty()), None, 100, 3)?;
        assert!(!sampler.is_active());
        let mut rng = StdRng::seed_from_u64(0);
        assert!(sampler.sample(2, &mut rng, &device)?.is_none());

        let mut bank = FeatureBank::new(2);
        bank.push(0, vec![1.0]);
        let no_vq = ReplaySampler::new(Arc::new(bank.freeze(&device)?), None, 1, 0)?;
        assert!(!no_vq.is_active());
        Ok(())
    }
}
