//! Detection samples, dataset sources, and batch collation.

use std::fs;
use std::path::{Path, PathBuf};

use burn::tensor::backend::Backend;
use burn::tensor::{Tensor, TensorData};
use data_contracts::FrameAnnotation;
use models::DetectionTargets;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type DatasetResult<T> = Result<T, DatasetError>;

#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("json parse error at {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("label validation failed at {path}: {msg}")]
    Validation { path: PathBuf, msg: String },
    #[error("image decode error at {path}: {source}")]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("dataset is empty")]
    Empty,
    #[error("rank {rank} is outside a group of {num_replicas} replicas")]
    InvalidShard { rank: usize, num_replicas: usize },
    #[error("sample index {index} out of range for dataset of {len}")]
    Index { index: usize, len: usize },
    #[error("sample {index} has {actual} pixels values, expected {expected}")]
    Shape {
        index: usize,
        expected: usize,
        actual: usize,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct DetectionSample {
    /// Image in CHW layout, normalized to [0, 1].
    pub image_chw: Vec<f32>,
    pub width: u32,
    pub height: u32,
    /// Normalized boxes: [x_min, y_min, x_max, y_max] in 0..1.
    pub boxes: Vec<[f32; 4]>,
}

pub trait DetectionDataset: Sync {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn get(&self, index: usize) -> DatasetResult<DetectionSample>;
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryDataset {
    samples: Vec<DetectionSample>,
}

impl InMemoryDataset {
    pub fn new(samples: Vec<DetectionSample>) -> Self {
        Self { samples }
    }
}

impl DetectionDataset for InMemoryDataset {
    fn len(&self) -> usize {
        self.samples.len()
    }

    fn get(&self, index: usize) -> DatasetResult<DetectionSample> {
        self.samples.get(index).cloned().ok_or(DatasetError::Index {
            index,
            len: self.samples.len(),
        })
    }
}

/// Label-file layout on disk: `<root>/<labels_subdir>/*.json` plus images.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetPathConfig {
    pub root: PathBuf,
    pub labels_subdir: String,
    pub images_subdir: String,
}

impl DatasetPathConfig {
    /// Indexes and validates every label file. Images are decoded lazily.
    pub fn open(&self) -> DatasetResult<CaptureDataset> {
        let labels_dir = self.root.join(&self.labels_subdir);
        let entries = fs::read_dir(&labels_dir).map_err(|source| DatasetError::Io {
            path: labels_dir.clone(),
            source,
        })?;
        let mut label_paths = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| DatasetError::Io {
                path: labels_dir.clone(),
                source,
            })?;
            let path = entry.path();
            if path.extension().and_then(|s| s.to_str()) == Some("json") {
                label_paths.push(path);
            }
        }
        label_paths.sort();

        let mut frames = Vec::with_capacity(label_paths.len());
        for path in label_paths {
            let raw = fs::read(&path).map_err(|source| DatasetError::Io {
                path: path.clone(),
                source,
            })?;
            let meta: FrameAnnotation =
                serde_json::from_slice(&raw).map_err(|source| DatasetError::Json {
                    path: path.clone(),
                    source,
                })?;
            meta.validate().map_err(|e| DatasetError::Validation {
                path: path.clone(),
                msg: e.to_string(),
            })?;
            if !meta.image_present {
                continue;
            }
            let image = self.root.join(&self.images_subdir).join(&meta.image);
            frames.push(CaptureFrame { image, meta });
        }
        tracing::info!(
            root = %self.root.display(),
            frames = frames.len(),
            "indexed label files"
        );
        Ok(CaptureDataset { frames })
    }
}

#[derive(Debug, Clone)]
struct CaptureFrame {
    image: PathBuf,
    meta: FrameAnnotation,
}

/// Frames described by label JSON files, decoded on access.
#[derive(Debug, Clone)]
pub struct CaptureDataset {
    frames: Vec<CaptureFrame>,
}

impl CaptureDataset {
    pub fn image_path(&self, index: usize) -> Option<&Path> {
        self.frames.get(index).map(|f| f.image.as_path())
    }
}

impl DetectionDataset for CaptureDataset {
    fn len(&self) -> usize {
        self.frames.len()
    }

    fn get(&self, index: usize) -> DatasetResult<DetectionSample> {
        let frame = self.frames.get(index).ok_or(DatasetError::Index {
            index,
            len: self.frames.len(),
        })?;
        let img = image::open(&frame.image)
            .map_err(|source| DatasetError::Image {
                path: frame.image.clone(),
                source,
            })?
            .to_rgb8();
        let (width, height) = img.dimensions();
        let pixels = (width * height) as usize;
        let mut image_chw = vec![0.0f32; pixels * 3];
        for (i, p) in img.pixels().enumerate() {
            for c in 0..3 {
                image_chw[c * pixels + i] = p[c] as f32 / 255.0;
            }
        }
        let boxes = frame
            .meta
            .labels
            .iter()
            .filter_map(|label| label.normalized(width, height))
            .collect();
        Ok(DetectionSample {
            image_chw,
            width,
            height,
            boxes,
        })
    }
}

/// Deterministic generated frames: dark background with bright rectangles.
#[derive(Debug, Clone)]
pub struct SyntheticDataset {
    len: usize,
    width: u32,
    height: u32,
    seed: u64,
}

impl SyntheticDataset {
    pub fn new(len: usize, width: u32, height: u32, seed: u64) -> Self {
        Self {
            len,
            width: width.max(1),
            height: height.max(1),
            seed,
        }
    }
}

impl DetectionDataset for SyntheticDataset {
    fn len(&self) -> usize {
        self.len
    }

    fn get(&self, index: usize) -> DatasetResult<DetectionSample> {
        if index >= self.len {
            return Err(DatasetError::Index {
                index,
                len: self.len,
            });
        }
        let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(index as u64));
        let (w, h) = (self.width as usize, self.height as usize);
        let pixels = w * h;
        let mut image_chw = vec![0.1f32; pixels * 3];
        let count = rng.random_range(0..=2usize);
        let mut boxes = Vec::with_capacity(count);
        for _ in 0..count {
            let x0: f32 = rng.random_range(0.0..0.6);
            let y0: f32 = rng.random_range(0.0..0.6);
            let x1 = (x0 + rng.random_range(0.15..0.4f32)).min(1.0);
            let y1 = (y0 + rng.random_range(0.15..0.4f32)).min(1.0);
            let shade: f32 = rng.random_range(0.6..1.0);
            let (px0, px1) = ((x0 * w as f32) as usize, (x1 * w as f32) as usize);
            let (py0, py1) = ((y0 * h as f32) as usize, (y1 * h as f32) as usize);
            for y in py0..py1.min(h) {
                for x in px0..px1.min(w) {
                    for c in 0..3 {
                        image_chw[c * pixels + y * w + x] = shade;
                    }
                }
            }
            boxes.push([x0, y0, x1, y1]);
        }
        Ok(DetectionSample {
            image_chw,
            width: self.width,
            height: self.height,
            boxes,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollateConfig {
    /// Padded height and width are rounded up to a multiple of this (0 disables).
    pub size_divisibility: usize,
    /// Boxes past this count are dropped.
    pub max_boxes: usize,
}

impl Default for CollateConfig {
    fn default() -> Self {
        Self {
            size_divisibility: 4,
            max_boxes: 64,
        }
    }
}

/// Host image batch in `[N, 3, H, W]` layout.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageBatch {
    pub data: Vec<f32>,
    pub shape: [usize; 4],
}

impl ImageBatch {
    pub fn to_tensor<B: Backend>(&self, device: &B::Device) -> Tensor<B, 4> {
        Tensor::<B, 4>::from_data(TensorData::new(self.data.clone(), self.shape), device)
    }
}

#[derive(Debug, Clone)]
pub struct LoadedBatch {
    pub images: ImageBatch,
    pub targets: Vec<DetectionTargets>,
    /// Dataset indices of the samples, in batch order.
    pub indices: Vec<usize>,
}

fn round_up(value: usize, divisor: usize) -> usize {
    if divisor == 0 {
        value
    } else {
        value.div_ceil(divisor) * divisor
    }
}

/// Pads images to a shared canvas and rescales boxes to it.
pub fn collate(
    samples: Vec<DetectionSample>,
    indices: Vec<usize>,
    cfg: &CollateConfig,
) -> DatasetResult<LoadedBatch> {
    if samples.is_empty() {
        return Err(DatasetError::Empty);
    }
    for (sample, index) in samples.iter().zip(&indices) {
        let expected = 3 * (sample.width * sample.height) as usize;
        if sample.image_chw.len() != expected {
            return Err(DatasetError::Shape {
                index: *index,
                expected,
                actual: sample.image_chw.len(),
            });
        }
    }

    let max_h = samples.iter().map(|s| s.height as usize).max().unwrap_or(1);
    let max_w = samples.iter().map(|s| s.width as usize).max().unwrap_or(1);
    let height = round_up(max_h, cfg.size_divisibility);
    let width = round_up(max_w, cfg.size_divisibility);
    let batch = samples.len();
    let plane = height * width;

    let mut data = vec![0.0f32; batch * 3 * plane];
    let mut targets = Vec::with_capacity(batch);
    for (b, sample) in samples.iter().enumerate() {
        let (w, h) = (sample.width as usize, sample.height as usize);
        for c in 0..3 {
            for y in 0..h {
                let src = c * w * h + y * w;
                let dst = (b * 3 + c) * plane + y * width;
                data[dst..dst + w].copy_from_slice(&sample.image_chw[src..src + w]);
            }
        }
        let sx = w as f32 / width as f32;
        let sy = h as f32 / height as f32;
        let boxes = sample
            .boxes
            .iter()
            .take(cfg.max_boxes)
            .map(|b| [b[0] * sx, b[1] * sy, b[2] * sx, b[3] * sy])
            .collect();
        targets.push(DetectionTargets::new(boxes));
    }

    Ok(LoadedBatch {
        images: ImageBatch {
            data,
            shape: [batch, 3, height, width],
        },
        targets,
        indices,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(width: u32, height: u32, fill: f32, boxes: Vec<[f32; 4]>) -> DetectionSample {
        DetectionSample {
            image_chw: vec![fill; (3 * width * height) as usize],
            width,
            height,
            boxes,
        }
    }

    #[test]
    fn pads_to_divisible_canvas_and_rescales_boxes() {
        let cfg = CollateConfig {
            size_divisibility: 4,
            max_boxes: 8,
        };
        let batch = collate(
            vec![
                sample(6, 2, 1.0, vec![[0.0, 0.0, 1.0, 1.0]]),
                sample(2, 3, 0.5, vec![]),
            ],
            vec![10, 11],
            &cfg,
        )
        .unwrap();
        assert_eq!(batch.images.shape, [2, 3, 4, 8]);
        assert_eq!(batch.indices, vec![10, 11]);
        assert_eq!(batch.targets[0].boxes, vec![[0.0, 0.0, 0.75, 0.5]]);
        assert!(batch.targets[1].boxes.is_empty());
        // First row of image 0 is filled up to its width, then padding.
        assert_eq!(&batch.images.data[0..8], &[1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 0.0, 0.0]);
        // Third row of image 0 is padding.
        assert!(batch.images.data[16..24].iter().all(|v| *v == 0.0));
        let second = 3 * 32;
        assert_eq!(&batch.images.data[second..second + 3], &[0.5, 0.5, 0.0]);
    }

    #[test]
    fn truncates_boxes_to_max() {
        let cfg = CollateConfig {
            size_divisibility: 0,
            max_boxes: 1,
        };
        let boxes = vec![[0.0, 0.0, 0.5, 0.5], [0.5, 0.5, 1.0, 1.0]];
        let batch = collate(vec![sample(2, 2, 0.0, boxes)], vec![0], &cfg).unwrap();
        assert_eq!(batch.images.shape, [1, 3, 2, 2]);
        assert_eq!(batch.targets[0].boxes, vec![[0.0, 0.0, 0.5, 0.5]]);
    }

    #[test]
    fn rejects_empty_and_misshapen_batches() {
        assert!(matches!(
            collate(Vec::new(), Vec::new(), &CollateConfig::default()),
            Err(DatasetError::Empty)
        ));
        let mut bad = sample(2, 2, 0.0, vec![]);
        bad.image_chw.pop();
        assert!(matches!(
            collate(vec![bad], vec![3], &CollateConfig::default()),
            Err(DatasetError::Shape { index: 3, .. })
        ));
    }

    #[test]
    fn synthetic_frames_are_deterministic() {
        let ds = SyntheticDataset::new(4, 16, 12, 7);
        let a = ds.get(2).unwrap();
        let b = ds.get(2).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.image_chw.len(), 3 * 16 * 12);
        assert!(a
            .boxes
            .iter()
            .all(|bx| bx[0] <= bx[2] && bx[1] <= bx[3] && bx[2] <= 1.0));
        assert!(matches!(ds.get(4), Err(DatasetError::Index { index: 4, len: 4 })));
    }
}
