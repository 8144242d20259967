//! Task-chain artifact layout.
//!
//! Every task writes into its own output directory whose name ends with the
//! task number (`.../step3`). The replay library of task `N` is read from the
//! directory of task `N - 1`. The pseudo-label histogram is written by the
//! collection run of task `N` and read by the training run of the same task.

use std::path::{Path, PathBuf};

use candle_core::Device;
use simcis_core::Result;
use tracing::info;

use crate::replay::{PseudoLabelHistogram, QueryLibrary};

pub const REPLAY_LIBRARY_FILE: &str = "fake_query.safetensors";
pub const HISTOGRAM_FILE: &str = "psd_distribution.json";

/// Previous task's output directory: the trailing task number decremented.
///
/// Returns `None` when the directory name carries no number or the number is
/// already zero.
pub fn previous_task_dir(output_dir: &Path) -> Option<PathBuf> {
    let name = output_dir.file_name()?.to_str()?;
    let digits = name.len() - name.trim_end_matches(|c: char| c.is_ascii_digit()).len();
    if digits == 0 {
        return None;
    }
    let (stem, number) = name.split_at(name.len() - digits);
    let number: u64 = number.parse().ok()?;
    let previous = number.checked_sub(1)?;
    Some(output_dir.with_file_name(format!("{stem}{previous}")))
}

/// Artifact paths and loaders for one task.
#[derive(Debug, Clone)]
pub struct TaskArtifacts {
    output_dir: PathBuf,
    previous_dir: Option<PathBuf>,
}

impl TaskArtifacts {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        let output_dir = output_dir.into();
        let previous_dir = previous_task_dir(&output_dir);
        Self {
            output_dir,
            previous_dir,
        }
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn previous_dir(&self) -> Option<&Path> {
        self.previous_dir.as_deref()
    }

    pub fn library_path(&self) -> PathBuf {
        self.output_dir.join(REPLAY_LIBRARY_FILE)
    }

    pub fn histogram_path(&self) -> PathBuf {
        self.output_dir.join(HISTOGRAM_FILE)
    }

    /// Replay library written at the end of the previous task.
    ///
    /// A missing file is not an error: replay is disabled for this task.
    pub fn load_previous_library(&self, device: &Device) -> Result<QueryLibrary> {
        let Some(path) = self.previous_dir.as_ref().map(|d| d.join(REPLAY_LIBRARY_FILE)) else {
            info!("no previous task directory, replay disabled");
            return Ok(QueryLibrary::empty());
        };
        if !path.exists() {
            info!(path = %path.display(), "no replay query library found, replay disabled");
            return Ok(QueryLibrary::empty());
        }
        let library = QueryLibrary::load(&path, device)?;
        info!(
            path = %path.display(),
            classes = library.len(),
            "loaded replay query library"
        );
        Ok(library)
    }

    /// Histogram collected for the current task, if any.
    pub fn load_histogram(&self) -> Result<Option<PseudoLabelHistogram>> {
        load_histogram_from(&self.histogram_path())
    }

    /// Histogram collected for the previous task, if any.
    pub fn load_previous_histogram(&self) -> Result<Option<PseudoLabelHistogram>> {
        match &self.previous_dir {
            Some(dir) => load_histogram_from(&dir.join(HISTOGRAM_FILE)),
            None => Ok(None),
        }
    }

    pub fn save_library(&self, library: &QueryLibrary) -> Result<()> {
        std::fs::create_dir_all(&self.output_dir)?;
        library.save(self.library_path())
    }

    pub fn save_histogram(&self, histogram: &PseudoLabelHistogram) -> Result<()> {
        std::fs::create_dir_all(&self.output_dir)?;
        histogram.save(self.histogram_path())
    }
}

fn load_histogram_from(path: &Path) -> Result<Option<PseudoLabelHistogram>> {
    if !path.exists() {
        info!(path = %path.display(), "no pseudo-label histogram found, sampling uniformly");
        return Ok(None);
    }
    let histogram = PseudoLabelHistogram::load(path)?;
    info!(path = %path.display(), classes = histogram.counts().len(), "loaded pseudo-label histogram");
    Ok(Some(histogram))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replay::FeatureBank;

    #[test]
    fn test_previous_task_dir() {
        assert_eq!(
            previous_task_dir(Path::new("output/ade_100-10/step3")),
            Some(PathBuf::from("output/ade_100-10/step2"))
        );
        assert_eq!(
            previous_task_dir(Path::new("out/step10")),
            Some(PathBuf::from("out/step9"))
        );
        assert_eq!(previous_task_dir(Path::new("out/step")), None);
        assert_eq!(previous_task_dir(Path::new("out/step0")), None);
    }

    #[test]
    fn test_missing_artifacts_fall_back() -> Result<()> {
        let root = tempfile::tempdir()?;
        let artifacts = TaskArtifacts::new(root.path().join("step2"));
        assert!(artifacts.load_previous_library(&Device::Cpu)?.is_empty());
        assert!(artifacts.load_histogram()?.is_none());
        assert!(artifacts.load_previous_histogram()?.is_none());
        Ok(())
    }

    #[test]
    fn test_library_flows_to_next_task() -> Result<()> {
        let root = tempfile::tempdir()?;
        let mut bank = FeatureBank::new(2);
        bank.push(4, vec![1.0, 2.0, 3.0]);
        TaskArtifacts::new(root.path().join("step1")).save_library(&bank.freeze(&Device::Cpu)?)?;

        let next = TaskArtifacts::new(root.path().join("step2"));
        let library = next.load_previous_library(&Device::Cpu)?;
        assert_eq!(library.entry_len(4), 1);
        assert_eq!(library.hidden_dim(), Some(3));
        Ok(())
    }
}
