//! Shared label contracts for detection training data.

pub mod annotation;

pub use annotation::{BoxLabel, FrameAnnotation, LabelSource, ValidationError};
