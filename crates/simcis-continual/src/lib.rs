//! # SimCIS-Continual
//!
//! Continual pseudo-labelling, virtual query replay and distillation losses
//! for class-incremental mask-classification segmentation.
//!
//! ## Task pipeline
//!
//! Each task adds new categories. Per training step:
//!
//! 1. **Pseudo-labels**: the frozen previous-task model labels old-class
//!    regions the real annotation leaves uncovered
//! 2. **Replay**: cached query features of old classes are appended to the
//!    decoder queries with their class as a synthetic target
//! 3. **Set criterion**: focal, mask, dice, box and distillation losses over
//!    every decoder scope
//! 4. **Feature cache**: matched query features are banked per class and
//!    persisted at task end for the next task
//!
//! A collection run of the same task only counts pseudo-labels per class;
//! the histogram then weights replay sampling towards rare classes.

pub mod artifacts;
pub mod cache_writer;
pub mod comm;
pub mod config;
pub mod decoder;
pub mod losses;
pub mod matching;
pub mod output;
pub mod point_sample;
pub mod pseudo_label;
pub mod replay;
pub mod session;
pub mod set_criterion;
pub mod target;

#[cfg(test)]
mod testing;

pub use artifacts::*;
pub use cache_writer::*;
pub use comm::*;
pub use self::config::*;
pub use decoder::*;
pub use losses::*;
pub use matching::*;
pub use output::*;
pub use point_sample::*;
pub use pseudo_label::*;
pub use replay::*;
pub use session::*;
pub use set_criterion::*;
pub use target::*;
