//! Data types shared between the acquisition core and its front-ends.

mod sample;
mod thresholds;

pub use sample::{parse_frame, Sample};
pub use thresholds::{SharedThresholds, Status, Thresholds};
