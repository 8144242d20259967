//! Error types for the SimCIS continual training engine.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    #[error("Target length mismatch: {labels} labels, {masks} masks, {boxes} boxes")]
    TargetLength {
        labels: usize,
        masks: usize,
        boxes: usize,
    },

    #[error("Shape mismatch in {context}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        context: &'static str,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("Class index {label} out of range [0, {num_classes})")]
    ClassOutOfRange { label: u32, num_classes: usize },

    #[error("Missing decoder output: {0}")]
    MissingOutput(&'static str),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Collective communication error: {0}")]
    Collective(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl Error {
    /// Whether the error signals a caller bug rather than a runtime condition.
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            Error::TargetLength { .. }
                | Error::ShapeMismatch { .. }
                | Error::ClassOutOfRange { .. }
                | Error::MissingOutput(_)
                | Error::InvalidInput(_)
        )
    }
}
