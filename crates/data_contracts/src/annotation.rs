use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LabelSource {
    Human,
    Synthetic,
    Model,
}

/// One ground-truth box. Either coordinate form may be present; normalized wins.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoxLabel {
    #[serde(default)]
    pub bbox_px: Option<[f32; 4]>,
    #[serde(default)]
    pub bbox_norm: Option<[f32; 4]>,
    #[serde(default)]
    pub source: Option<LabelSource>,
    #[serde(default)]
    pub source_confidence: Option<f32>,
}

/// Annotation file for a single frame (`labels/<frame>.json`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrameAnnotation {
    pub frame_id: u64,
    pub image: String,
    #[serde(default = "default_true")]
    pub image_present: bool,
    #[serde(default)]
    pub labels: Vec<BoxLabel>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("bbox_px invalid order or negative: {0:?}")]
    InvalidBboxPx([f32; 4]),
    #[error("bbox_norm out of range: {0:?}")]
    InvalidBboxNorm([f32; 4]),
    #[error("label has neither bbox_px nor bbox_norm")]
    MissingBox,
    #[error("source_confidence out of range: {0:?}")]
    InvalidSourceConfidence(f32),
    #[error("missing image path for present frame")]
    MissingImage,
}

impl BoxLabel {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.bbox_px.is_none() && self.bbox_norm.is_none() {
            return Err(ValidationError::MissingBox);
        }
        if let Some(px) = self.bbox_px {
            if px.iter().any(|v| v.is_nan() || *v < 0.0) || px[0] > px[2] || px[1] > px[3] {
                return Err(ValidationError::InvalidBboxPx(px));
            }
        }
        if let Some(norm) = self.bbox_norm {
            let in_range = norm.iter().all(|v| !v.is_nan() && *v >= 0.0 && *v <= 1.0);
            if !in_range || norm[0] > norm[2] || norm[1] > norm[3] {
                return Err(ValidationError::InvalidBboxNorm(norm));
            }
        }
        if let Some(conf) = self.source_confidence {
            if conf.is_nan() || !(0.0..=1.0).contains(&conf) {
                return Err(ValidationError::InvalidSourceConfidence(conf));
            }
        }
        Ok(())
    }

    /// Normalized `[x0, y0, x1, y1]` for an image of the given size.
    pub fn normalized(&self, width: u32, height: u32) -> Option<[f32; 4]> {
        if let Some(norm) = self.bbox_norm {
            return Some(norm);
        }
        let px = self.bbox_px?;
        if width == 0 || height == 0 {
            return None;
        }
        let (w, h) = (width as f32, height as f32);
        let raw = [px[0] / w, px[1] / h, px[2] / w, px[3] / h];
        let norm = raw.map(|v| v.clamp(0.0, 1.0));
        if norm != raw {
            tracing::debug!(
                bbox_px = ?px,
                width,
                height,
                clamped = ?norm,
                "pixel box extends past the image; clamped"
            );
        }
        Some(norm)
    }
}

impl FrameAnnotation {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.image_present && self.image.trim().is_empty() {
            return Err(ValidationError::MissingImage);
        }
        for label in &self.labels {
            label.validate()?;
        }
        Ok(())
    }
}
