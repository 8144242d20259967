//! Continual training configuration.
//!
//! Mode flags are resolved into enums once at load time; each component
//! receives only its own section.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use simcis_core::{CategoryRange, ClassId, Error, Result};

/// What the current run produces at task end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    /// Regular training; the replay cache is written at task end.
    #[default]
    Train,
    /// Pseudo-label histogram collection; the run stops after persisting it.
    Collect,
}

/// How surviving pseudo-label regions are emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FusionMode {
    /// One entry per surviving prediction.
    #[default]
    PerPrediction,
    /// Surviving regions of one label unioned into a single entry.
    PerClass,
}

/// Pseudo-label keep predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterMode {
    /// Area-retention gate only.
    #[default]
    Overlap,
    /// Adds a score floor and an ownership-area condition.
    Strict,
}

/// Knowledge distillation objective.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KdType {
    #[default]
    Kl,
    L2,
    Unbiased,
}

/// Category schedule across tasks.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskSchedule {
    /// Total number of dataset categories
    pub total_classes: usize,
    /// Categories learned in the first task
    pub base_classes: usize,
    /// Categories added by every later task
    pub increment_classes: usize,
    /// Current task, 1-based
    pub task: usize,
}

impl Default for TaskSchedule {
    fn default() -> Self {
        Self {
            total_classes: 150,
            base_classes: 100,
            increment_classes: 10,
            task: 1,
        }
    }
}

impl TaskSchedule {
    pub fn num_tasks(&self) -> usize {
        if self.increment_classes == 0 {
            return 1;
        }
        1 + (self.total_classes - self.base_classes) / self.increment_classes
    }

    /// Categories introduced by the current task.
    pub fn current_categories(&self) -> CategoryRange {
        if self.task <= 1 {
            return CategoryRange::new(0, self.base_classes as ClassId);
        }
        let start = self.base_classes + (self.task - 2) * self.increment_classes;
        CategoryRange::new(start as ClassId, (start + self.increment_classes) as ClassId)
    }

    /// Whether an earlier task exists to distill from.
    pub fn is_incremental(&self) -> bool {
        self.task > 1
    }
}

/// Pseudo-label extraction and filtering
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PseudoLabelConfig {
    /// Old-model score a query must exceed to become a prediction
    pub score_threshold: f32,
    /// Fraction of the predicted area that must survive subtraction
    pub overlap_threshold: f32,
    pub fusion: FusionMode,
    pub filter: FilterMode,
    /// Score floor applied before ownership in strict mode
    pub strict_score_threshold: f32,
    /// Temperature of the per-query re-scoring softmax
    pub rescore_temperature: f64,
}

impl Default for PseudoLabelConfig {
    fn default() -> Self {
        Self {
            score_threshold: 0.35,
            overlap_threshold: 0.8,
            fusion: FusionMode::PerPrediction,
            filter: FilterMode::Overlap,
            strict_score_threshold: 0.4,
            rescore_temperature: 0.06,
        }
    }
}

/// Virtual query replay
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplayConfig {
    /// Total per-class capacity of the replay cache, split across workers
    pub lib_size: usize,
    /// Synthetic queries injected per image
    pub vq_number: usize,
    /// Weight classes by inverse pseudo-label frequency
    pub weighted_sample: bool,
    pub distribution_alpha: f64,
    /// Add the positional embedding to synthetic queries at the first layer
    pub add_pos_to_replay: bool,
    /// Add the previous task's histogram to the collected counts
    pub cumulative_histogram: bool,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            lib_size: 80,
            vq_number: 3,
            weighted_sample: true,
            distribution_alpha: 0.5,
            add_pos_to_replay: false,
            cumulative_histogram: false,
        }
    }
}

impl ReplayConfig {
    /// Per-class capacity held by one worker.
    pub fn capacity(&self, world_size: usize) -> usize {
        self.lib_size / world_size.max(1)
    }
}

/// Knowledge distillation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DistillConfig {
    pub kd_type: KdType,
    /// Distill over every class instead of only the old ones
    pub kl_all: bool,
    pub kl_weight: f64,
    /// Temperature of the interm scope
    pub kd_temperature: f64,
    /// Temperature of the primary scope
    pub kd_temperature2: f64,
    /// Distill the primary decoder output
    pub kd_decoder: bool,
}

impl Default for DistillConfig {
    fn default() -> Self {
        Self {
            kd_type: KdType::Kl,
            kl_all: true,
            kl_weight: 2.0,
            kd_temperature: 0.1,
            kd_temperature2: 0.1,
            kd_decoder: true,
        }
    }
}

/// Set-criterion weights and point sampling
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LossConfig {
    pub class_weight: f64,
    pub mask_weight: f64,
    pub dice_weight: f64,
    pub giou_weight: f64,
    pub focal_alpha: f64,
    pub focal_gamma: f64,
    /// Points sampled per mask
    pub num_points: usize,
    pub oversample_ratio: f64,
    pub importance_sample_ratio: f64,
    /// Emit auxiliary per-layer losses
    pub deep_supervision: bool,
    /// Decoder layers, including the last one
    pub dec_layers: usize,
    /// Categories excluded from box regression
    pub stuff_classes: Vec<ClassId>,
}

impl Default for LossConfig {
    fn default() -> Self {
        Self {
            class_weight: 2.0,
            mask_weight: 5.0,
            dice_weight: 5.0,
            giou_weight: 2.0,
            focal_alpha: 0.25,
            focal_gamma: 2.0,
            num_points: 12544,
            oversample_ratio: 3.0,
            importance_sample_ratio: 0.75,
            deep_supervision: true,
            dec_layers: 9,
            stuff_classes: Vec::new(),
        }
    }
}

/// Complete continual training configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContinualConfig {
    pub mode: RunMode,
    /// Output directory of the current task; ends with the task number
    pub output_dir: PathBuf,
    pub schedule: TaskSchedule,
    pub pseudo_label: PseudoLabelConfig,
    pub replay: ReplayConfig,
    pub distill: DistillConfig,
    pub loss: LossConfig,
}

impl Default for ContinualConfig {
    fn default() -> Self {
        Self {
            mode: RunMode::Train,
            output_dir: PathBuf::from("output/ade_100-10/step1"),
            schedule: TaskSchedule::default(),
            pseudo_label: PseudoLabelConfig::default(),
            replay: ReplayConfig::default(),
            distill: DistillConfig::default(),
            loss: LossConfig::default(),
        }
    }
}

impl ContinualConfig {
    /// Load configuration from file, with `SIMCIS__`-prefixed overrides
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(config::Environment::with_prefix("SIMCIS").separator("__"))
            .build()
            .map_err(|e| Error::Config(e.to_string()))?;

        let config: Self = settings
            .try_deserialize()
            .map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from environment variables
    pub fn from_env() -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::Environment::with_prefix("SIMCIS").separator("__"))
            .build()
            .map_err(|e| Error::Config(e.to_string()))?;

        let config: Self = settings
            .try_deserialize()
            .map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let s = &self.schedule;
        if s.base_classes > s.total_classes {
            return Err(Error::Config(format!(
                "base_classes {} exceeds total_classes {}",
                s.base_classes, s.total_classes
            )));
        }
        if s.task == 0 || s.task > s.num_tasks() {
            return Err(Error::Config(format!(
                "task {} outside [1, {}]",
                s.task,
                s.num_tasks()
            )));
        }
        let overlap = self.pseudo_label.overlap_threshold;
        if !(0.0..=1.0).contains(&overlap) {
            return Err(Error::Config(format!(
                "overlap_threshold {overlap} outside [0, 1]"
            )));
        }
        if self.pseudo_label.rescore_temperature <= 0.0
            || self.distill.kd_temperature <= 0.0
            || self.distill.kd_temperature2 <= 0.0
        {
            return Err(Error::Config("temperatures must be positive".to_string()));
        }
        if !(0.0..=1.0).contains(&self.loss.importance_sample_ratio) {
            return Err(Error::Config(format!(
                "importance_sample_ratio {} outside [0, 1]",
                self.loss.importance_sample_ratio
            )));
        }
        if self.loss.oversample_ratio < 1.0 {
            return Err(Error::Config(format!(
                "oversample_ratio {} below 1",
                self.loss.oversample_ratio
            )));
        }
        if self.loss.dec_layers == 0 {
            return Err(Error::Config("dec_layers must be at least 1".to_string()));
        }
        Ok(())
    }
}
