//! # SimCIS-Core
//!
//! Core types and utilities for class-incremental segmentation training:
//! per-image targets and old-model predictions, box geometry and the shared
//! error type.

pub mod error;
pub mod geometry;
pub mod types;

pub use error::{Error, Result};
pub use geometry::*;
pub use types::*;
