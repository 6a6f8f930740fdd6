//! Burn detection models and their training losses.
//!
//! - `DenseDetector`: stride-4 conv encoder with a dense per-cell head. Trains with
//!   either the Retina or the DenseBox loss set.
//! - `LossDict`: named scalar losses for one step.
//! - `TrainableDetector`: what the training engine needs from a model.

pub mod assign;
pub mod detector;
pub mod loss;
pub mod trainable;

pub use assign::{assign_targets_to_grid, GridTargets};
pub use detector::{DenseDetector, DenseDetectorConfig, DetectorBranch};
pub use loss::LossDict;
pub use trainable::TrainableDetector;

use thiserror::Error;

/// Ground truth for one image: normalized `[x0, y0, x1, y1]` boxes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DetectionTargets {
    pub boxes: Vec<[f32; 4]>,
}

impl DetectionTargets {
    pub fn new(boxes: Vec<[f32; 4]>) -> Self {
        Self { boxes }
    }
}

#[derive(Debug, Error)]
pub enum DetectorError {
    #[error("empty batch")]
    EmptyBatch,
    #[error("batch has {images} images but {targets} target sets")]
    TargetCountMismatch { images: usize, targets: usize },
    #[error("invalid box {bbox:?} for image {image}")]
    InvalidBox { image: usize, bbox: [f32; 4] },
    #[error("expected 3-channel images, got {0}")]
    ChannelMismatch(usize),
}

pub mod prelude {
    pub use super::{
        DenseDetector, DenseDetectorConfig, DetectionTargets, DetectorBranch, DetectorError,
        LossDict, TrainableDetector,
    };
}
