//! End-of-step harvesting of query features and pseudo-label statistics.
//!
//! Training runs fill a [`FeatureCacheWriter`] with the pre-decoder features
//! of matched real queries; the next task replays them. Collection runs fill
//! a [`HistogramCollector`] instead and stop after writing it.

use candle_core::{DType, Device};
use simcis_core::{ClassId, Error, Result, Target};
use tracing::info;

use crate::artifacts::TaskArtifacts;
use crate::comm::Collective;
use crate::matching::{match_real_queries, Matcher};
use crate::output::DecoderOutput;
use crate::pseudo_label::PseudoTargets;
use crate::replay::{FeatureBank, PseudoLabelHistogram, QueryLibrary};

/// Per-worker feature bank fed after every training step.
pub struct FeatureCacheWriter {
    bank: FeatureBank,
    recorded: u64,
}

impl FeatureCacheWriter {
    /// `capacity` is the per-class bound of this worker.
    pub fn new(capacity: usize) -> Self {
        Self {
            bank: FeatureBank::new(capacity),
            recorded: 0,
        }
    }

    pub fn bank(&self) -> &FeatureBank {
        &self.bank
    }

    /// Match the primary real queries against `fused` targets and keep the
    /// matched query features under the target label.
    ///
    /// Returns the number of features pushed.
    pub fn record(
        &mut self,
        matcher: &(dyn Matcher + Send + Sync),
        outputs: &DecoderOutput,
        fused: &[Target],
    ) -> Result<usize> {
        let indices = match_real_queries(matcher, &outputs.primary, &outputs.layout, fused)?;
        let features: Vec<Vec<Vec<f32>>> = outputs
            .query_features
            .detach()
            .to_dtype(DType::F32)?
            .to_vec3()?;
        if features.len() != fused.len() {
            return Err(Error::ShapeMismatch {
                context: "query features batch",
                expected: vec![fused.len()],
                actual: vec![features.len()],
            });
        }

        let mut pushed = 0;
        for ((m, target), image_features) in indices.iter().zip(fused).zip(&features) {
            for (q, t) in m.pairs() {
                let label = target.labels()[t];
                self.bank.push(label, image_features[q].clone());
                pushed += 1;
            }
        }
        self.recorded += pushed as u64;
        Ok(pushed)
    }

    /// Gather every worker's bank, merge in rank order and persist on the
    /// main worker. Every rank gets the merged library back.
    pub fn finish(
        self,
        collective: &dyn Collective,
        artifacts: &TaskArtifacts,
        device: &Device,
    ) -> Result<QueryLibrary> {
        let gathered = collective.all_gather(self.bank.to_bytes()?)?;

        let mut merged = FeatureBank::new(self.bank.capacity());
        for bytes in gathered {
            merged.merge(FeatureBank::from_bytes(&bytes)?);
        }
        let library = merged.freeze(device)?;

        if collective.is_main() {
            artifacts.save_library(&library)?;
            info!(
                classes = library.len(),
                features = merged.total_len(),
                recorded = self.recorded,
                "saved replay query library"
            );
        }
        Ok(library)
    }
}

/// Pseudo-label class counts for the collection run.
pub struct HistogramCollector {
    histogram: PseudoLabelHistogram,
    num_classes: usize,
}

impl HistogramCollector {
    pub fn new(num_classes: usize) -> Self {
        Self {
            histogram: PseudoLabelHistogram::new(num_classes),
            num_classes,
        }
    }

    pub fn histogram(&self) -> &PseudoLabelHistogram {
        &self.histogram
    }

    /// Count every pseudo label of the step, memory images included.
    pub fn record(&mut self, pseudo: &PseudoTargets) -> Result<()> {
        for label in pseudo.labels() {
            self.record_label(label)?;
        }
        Ok(())
    }

    fn record_label(&mut self, label: ClassId) -> Result<()> {
        if label as usize >= self.num_classes {
            return Err(Error::ClassOutOfRange {
                label,
                num_classes: self.num_classes,
            });
        }
        self.histogram.record(label);
        Ok(())
    }

    /// Sum the counts across workers, optionally add the previous task's
    /// histogram, and write the result on the main worker.
    pub fn finish(
        self,
        collective: &dyn Collective,
        artifacts: &TaskArtifacts,
        cumulative: bool,
    ) -> Result<PseudoLabelHistogram> {
        let mut counts: Vec<f64> = self.histogram.counts().iter().map(|&c| c as f64).collect();
        collective.all_reduce_sum(&mut counts)?;
        let mut histogram =
            PseudoLabelHistogram::from_counts(counts.iter().map(|&c| c.round() as u64).collect());

        if cumulative {
            if let Some(previous) = artifacts.load_previous_histogram()? {
                histogram.add(&previous);
            }
        }

        if collective.is_main() {
            artifacts.save_histogram(&histogram)?;
        }
        Ok(histogram)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::{LocalGroup, SingleProcess};
    use crate::output::QueryLayout;
    use crate::testing::{scope, target_with_labels, InOrderMatcher};
    use candle_core::Tensor;
    use std::thread;

    fn outputs(batch: usize, layout: QueryLayout, device: &Device) -> Result<DecoderOutput> {
        let total = layout.total();
        let features: Vec<f32> = (0..batch * total * 3).map(|i| i as f32).collect();
        Ok(DecoderOutput {
            primary: scope(batch, total, 4, device)?,
            aux: Vec::new(),
            interm: scope(batch, total, 4, device)?,
            layout,
            query_features: Tensor::from_vec(features, (batch, total, 3), device)?,
            proposal_positions: Tensor::zeros((batch, 2), DType::U32, device)?,
            distill: None,
        })
    }

    #[test]
    fn test_record_skips_replay_slots() -> Result<()> {
        let device = Device::Cpu;
        let layout = QueryLayout::with_synthetic(2, vec![vec![9]])?;
        let outputs = outputs(1, layout, &device)?;
        let fused = vec![target_with_labels(&[1, 2, 3], &device)?];

        let mut writer = FeatureCacheWriter::new(4);
        // Three targets but only two real queries.
        assert_eq!(writer.record(&InOrderMatcher, &outputs, &fused)?, 2);
        assert_eq!(writer.bank().len_of(1), 1);
        assert_eq!(writer.bank().len_of(2), 1);
        assert_eq!(writer.bank().len_of(9), 0);
        Ok(())
    }

    #[test]
    fn test_capacity_bound_across_steps() -> Result<()> {
        let device = Device::Cpu;
        let outputs = outputs(1, QueryLayout::real_only(1, 1), &device)?;
        let fused = vec![target_with_labels(&[5], &device)?];

        let mut writer = FeatureCacheWriter::new(2);
        for _ in 0..5 {
            writer.record(&InOrderMatcher, &outputs, &fused)?;
        }
        assert_eq!(writer.bank().len_of(5), 2);
        Ok(())
    }

    #[test]
    fn test_finish_writes_library() -> Result<()> {
        let root = tempfile::tempdir()?;
        let artifacts = TaskArtifacts::new(root.path().join("step2"));
        let device = Device::Cpu;
        let outputs = outputs(1, QueryLayout::real_only(2, 1), &device)?;
        let fused = vec![target_with_labels(&[0, 3], &device)?];

        let mut writer = FeatureCacheWriter::new(3);
        writer.record(&InOrderMatcher, &outputs, &fused)?;
        let library = writer.finish(&SingleProcess, &artifacts, &device)?;
        assert_eq!(library.entry_len(3), 1);

        let reloaded = QueryLibrary::load(artifacts.library_path(), &device)?;
        assert_eq!(reloaded.entry_len(0), 1);
        assert_eq!(reloaded.hidden_dim(), Some(3));
        Ok(())
    }

    #[test]
    fn test_merge_across_workers_respects_capacity() -> Result<()> {
        let root = tempfile::tempdir()?;
        let artifacts = TaskArtifacts::new(root.path().join("step1"));

        let handles: Vec<_> = LocalGroup::new(2)
            .into_iter()
            .map(|comm| {
                let artifacts = artifacts.clone();
                thread::spawn(move || {
                    let device = Device::Cpu;
                    let outputs = outputs(1, QueryLayout::real_only(1, 1), &device).unwrap();
                    let fused = vec![target_with_labels(&[7], &device).unwrap()];
                    let mut writer = FeatureCacheWriter::new(2);
                    for _ in 0..=comm.rank() {
                        writer.record(&InOrderMatcher, &outputs, &fused).unwrap();
                    }
                    writer.finish(&comm, &artifacts, &device).unwrap().entry_len(7)
                })
            })
            .collect();
        for handle in handles {
            // Rank 0 holds one entry and rank 1 two; the merge keeps the newest two.
            assert_eq!(handle.join().unwrap(), 2);
        }
        assert_eq!(QueryLibrary::load(artifacts.library_path(), &Device::Cpu)?.entry_len(7), 2);
        Ok(())
    }

    #[test]
    fn test_histogram_collection() -> Result<()> {
        let root = tempfile::tempdir()?;
        let device = Device::Cpu;
        let previous = TaskArtifacts::new(root.path().join("step2"));
        previous.save_histogram(&PseudoLabelHistogram::from_counts(vec![1, 0, 0, 0, 4]))?;

        let artifacts = TaskArtifacts::new(root.path().join("step3"));
        let pseudo = PseudoTargets {
            pseudo: vec![target_with_labels(&[0, 0, 2], &device)?],
            memory_images: vec![true],
        };
        let mut collector = HistogramCollector::new(5);
        collector.record(&pseudo)?;
        assert_eq!(collector.histogram().counts(), &[2, 0, 1, 0, 0]);

        let histogram = collector.finish(&SingleProcess, &artifacts, true)?;
        assert_eq!(histogram.counts(), &[3, 0, 1, 0, 4]);
        assert_eq!(std::fs::read_to_string(artifacts.histogram_path())?, "[3,0,1,0,4]");
        Ok(())
    }

    #[test]
    fn test_histogram_label_out_of_range() -> Result<()> {
        let device = Device::Cpu;
        let pseudo = PseudoTargets {
            pseudo: vec![target_with_labels(&[7], &device)?],
            memory_images: vec![false],
        };
        let mut collector = HistogramCollector::new(5);
        assert!(matches!(
            collector.record(&pseudo).unwrap_err(),
            Error::ClassOutOfRange { label: 7, .. }
        ));
        Ok(())
    }
}
