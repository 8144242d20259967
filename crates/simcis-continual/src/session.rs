//! One task of the continual schedule, seen from a single worker.
//!
//! `start` resolves the task and loads the previous task's artifacts,
//! `step` runs pseudo-labelling, the losses and feature harvesting for one
//! batch, and `finish` persists what the task produced.

use std::sync::Arc;

use candle_core::Device;
use rand::Rng;
use simcis_core::{CategoryRange, Error, Result, Target};
use tracing::{debug, info};

use crate::artifacts::TaskArtifacts;
use crate::cache_writer::{FeatureCacheWriter, HistogramCollector};
use crate::comm::Collective;
use crate::config::{ContinualConfig, RunMode};
use crate::matching::Matcher;
use crate::output::DecoderOutput;
use crate::pseudo_label::{PredictionExtractor, PseudoLabelGenerator};
use crate::replay::{ReplayBatch, ReplaySampler};
use crate::set_criterion::{SetCriterion, WeightedLosses};

/// What the caller should do once a task is finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    /// Move on to the next task
    Continue,
    /// Collection run complete; stop without further training
    Terminate,
}

/// Model outputs and annotations of one training batch.
pub struct StepInput<'a> {
    /// Current model, training forward
    pub outputs: &'a DecoderOutput,
    /// Real targets of the current task
    pub targets: &'a [Target],
    /// Frozen previous-task model, inference forward; `None` on the first task
    pub old_outputs: Option<&'a DecoderOutput>,
    /// Unpadded `(height, width)` per image
    pub image_sizes: &'a [(usize, usize)],
}

/// Summary of one step.
pub struct StepReport {
    pub losses: WeightedLosses,
    pub pseudo_labels: usize,
    pub cached_features: usize,
}

pub struct TaskSession {
    config: ContinualConfig,
    categories: CategoryRange,
    artifacts: TaskArtifacts,
    collective: Arc<dyn Collective>,
    device: Device,
    sampler: ReplaySampler,
    extractor: PredictionExtractor,
    generator: PseudoLabelGenerator,
    criterion: SetCriterion,
    writer: FeatureCacheWriter,
    collector: Option<HistogramCollector>,
    steps: u64,
}

impl TaskSession {
    pub fn start(
        config: ContinualConfig,
        matcher: Box<dyn Matcher + Send + Sync>,
        collective: Arc<dyn Collective>,
        device: Device,
    ) -> Result<Self> {
        config.validate()?;
        let schedule = &config.schedule;
        let categories = schedule.current_categories();
        let artifacts = TaskArtifacts::new(&config.output_dir);

        let sampler = if config.mode == RunMode::Train
            && schedule.is_incremental()
            && config.replay.vq_number > 0
        {
            let library = artifacts.load_previous_library(&device)?;
            let weights = if config.replay.weighted_sample {
                artifacts.load_histogram()?.map(|h| {
                    h.sampling_weights(
                        categories.old_class_count(),
                        config.replay.distribution_alpha,
                    )
                })
            } else {
                None
            };
            ReplaySampler::new(
                Arc::new(library),
                weights.as_deref(),
                categories.old_class_count(),
                config.replay.vq_number,
            )?
        } else {
            ReplaySampler::disabled()
        };

        let criterion = SetCriterion::new(
            matcher,
            schedule.total_classes,
            config.loss.clone(),
            &config.distill,
            categories.old_class_count(),
        );
        let writer = FeatureCacheWriter::new(config.replay.capacity(collective.world_size()));
        let collector = match config.mode {
            RunMode::Collect => Some(HistogramCollector::new(schedule.total_classes)),
            RunMode::Train => None,
        };

        info!(
            task = schedule.task,
            mode = ?config.mode,
            classes = ?categories.as_range(),
            replay = sampler.is_active(),
            rank = collective.rank(),
            world_size = collective.world_size(),
            output_dir = %artifacts.output_dir().display(),
            "started task"
        );

        Ok(Self {
            extractor: PredictionExtractor::new(&config.pseudo_label),
            generator: PseudoLabelGenerator::new(&config.pseudo_label, categories),
            categories,
            artifacts,
            collective,
            device,
            sampler,
            criterion,
            writer,
            collector,
            steps: 0,
            config,
        })
    }

    pub fn categories(&self) -> CategoryRange {
        self.categories
    }

    pub fn artifacts(&self) -> &TaskArtifacts {
        &self.artifacts
    }

    pub fn sampler(&self) -> &ReplaySampler {
        &self.sampler
    }

    pub fn writer(&self) -> &FeatureCacheWriter {
        &self.writer
    }

    /// Synthetic queries for the next training forward, if replay is active.
    pub fn replay_batch<R: Rng>(&self, batch_size: usize, rng: &mut R) -> Result<Option<ReplayBatch>> {
        self.sampler.sample(batch_size, rng, &self.device)
    }

    /// Pseudo-label, compute the losses and harvest features for one batch.
    pub fn step<R: Rng>(&mut self, input: StepInput<'_>, rng: &mut R) -> Result<StepReport> {
        let targets = input.targets;
        let Some(first) = targets.first() else {
            return Err(Error::InvalidInput("empty batch".to_string()));
        };

        let (complete, fused, pseudo_labels, teacher) = match input.old_outputs {
            Some(old) if self.config.schedule.is_incremental() => {
                let predictions = self.extractor.extract(&old.primary, first.canvas())?;
                let pseudo = self.generator.generate(targets, &predictions, input.image_sizes)?;
                if let Some(collector) = self.collector.as_mut() {
                    collector.record(&pseudo)?;
                }
                (
                    pseudo.complete(targets)?,
                    pseudo.fused(targets)?,
                    pseudo.labels().count(),
                    Some(old.teacher_logits()),
                )
            }
            _ => (targets.to_vec(), targets.to_vec(), 0, None),
        };

        let losses = self.criterion.compute(
            input.outputs,
            &complete,
            teacher.as_ref(),
            self.collective.as_ref(),
            rng,
        )?;

        let cached_features = match self.config.mode {
            RunMode::Train => self
                .writer
                .record(self.criterion.matcher(), input.outputs, &fused)?,
            RunMode::Collect => 0,
        };

        self.steps += 1;
        debug!(
            step = self.steps,
            total = losses.total_value()?,
            pseudo_labels,
            cached_features,
            "finished step"
        );
        Ok(StepReport {
            losses,
            pseudo_labels,
            cached_features,
        })
    }

    /// Persist the task's artifacts.
    ///
    /// Collection runs write the histogram and end with
    /// [`TaskOutcome::Terminate`]; training runs write the replay library.
    pub fn finish(self) -> Result<TaskOutcome> {
        let collective = self.collective.as_ref();
        match self.collector {
            Some(collector) => {
                let cumulative =
                    self.config.replay.cumulative_histogram && self.config.schedule.task > 2;
                let histogram = collector.finish(collective, &self.artifacts, cumulative)?;
                info!(
                    steps = self.steps,
                    pseudo_labels = histogram.counts().iter().sum::<u64>(),
                    "collection finished"
                );
                Ok(TaskOutcome::Terminate)
            }
            None => {
                let library = self.writer.finish(collective, &self.artifacts, &self.device)?;
                info!(steps = self.steps, classes = library.len(), "task finished");
                Ok(TaskOutcome::Continue)
            }
        }
    }
}
