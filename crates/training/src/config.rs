//! Training configuration loaded from TOML.

use std::path::{Path, PathBuf};

use models::DenseDetectorConfig;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::dataset::{CollateConfig, DatasetPathConfig};
use crate::schedule::{
    ParamGroups, ScheduleError, Scheduler, Warmup, WarmupCosineLr, WarmupMultiStepLr,
};
use crate::visualize::VisualMode;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Toml {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    pub model: ModelSection,
    pub solver: SolverConfig,
    pub data: DataConfig,
    pub output: OutputConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelSection {
    #[serde(flatten)]
    pub detector: DenseDetectorConfig,
    /// Overrides the dashboard curves implied by the detector branch.
    pub visual_mode: Option<VisualMode>,
}

impl ModelSection {
    pub fn visual_mode(&self) -> VisualMode {
        self.visual_mode
            .unwrap_or_else(|| VisualMode::from(self.detector.branch))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizerKind {
    AdamW,
    Sgd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerKind {
    MultiStep,
    Cosine,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverConfig {
    pub base_lr: f64,
    pub weight_decay: f32,
    pub momentum: f64,
    pub optimizer: OptimizerKind,
    pub scheduler: SchedulerKind,
    pub milestones: Vec<usize>,
    pub gamma: f64,
    pub min_lr: f64,
    pub warmup: Warmup,
    pub max_iter: usize,
    /// Iterations between checkpoints; 0 saves only the final one.
    pub checkpoint_period: usize,
    pub ims_per_batch: usize,
    /// Separate encoder and decoder learning rates.
    pub split_lr: bool,
    pub encoder_lr_factor: f64,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            base_lr: 1e-3,
            weight_decay: 1e-4,
            momentum: 0.9,
            optimizer: OptimizerKind::AdamW,
            scheduler: SchedulerKind::MultiStep,
            milestones: vec![6000, 8000],
            gamma: 0.1,
            min_lr: 0.0,
            warmup: Warmup::default(),
            max_iter: 9000,
            checkpoint_period: 2500,
            ims_per_batch: 4,
            split_lr: false,
            encoder_lr_factor: 0.1,
        }
    }
}

impl SolverConfig {
    pub fn build_scheduler(&self) -> Result<Scheduler, ScheduleError> {
        Ok(match self.scheduler {
            SchedulerKind::MultiStep => Scheduler::MultiStep(WarmupMultiStepLr::new(
                self.base_lr,
                self.milestones.clone(),
                self.gamma,
                self.warmup,
            )?),
            SchedulerKind::Cosine => Scheduler::Cosine(WarmupCosineLr::new(
                self.base_lr,
                self.min_lr,
                self.max_iter,
                self.warmup,
            )?),
        })
    }

    pub fn param_groups(&self) -> ParamGroups {
        if self.split_lr {
            ParamGroups::split(self.encoder_lr_factor)
        } else {
            ParamGroups::single()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DataConfig {
    pub root: PathBuf,
    pub labels_subdir: String,
    pub images_subdir: String,
    pub size_divisibility: usize,
    pub max_boxes: usize,
    pub shuffle: bool,
    pub seed: u64,
    pub drop_last: bool,
    /// Frame count and edge length for `--synthetic` runs.
    pub synthetic_len: usize,
    pub synthetic_size: u32,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("assets/datasets/captures_filtered"),
            labels_subdir: "labels".to_string(),
            images_subdir: ".".to_string(),
            size_divisibility: 4,
            max_boxes: 64,
            shuffle: true,
            seed: 42,
            drop_last: false,
            synthetic_len: 32,
            synthetic_size: 32,
        }
    }
}

impl DataConfig {
    pub fn paths(&self) -> DatasetPathConfig {
        DatasetPathConfig {
            root: self.root.clone(),
            labels_subdir: self.labels_subdir.clone(),
            images_subdir: self.images_subdir.clone(),
        }
    }

    pub fn collate(&self) -> CollateConfig {
        CollateConfig {
            size_divisibility: self.size_divisibility,
            max_boxes: self.max_boxes,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub dir: PathBuf,
    /// Scalar JSONL path; defaults to `<dir>/metrics.jsonl`.
    pub metrics_out: Option<PathBuf>,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("checkpoints"),
            metrics_out: None,
        }
    }
}

impl OutputConfig {
    pub fn metrics_path(&self) -> PathBuf {
        self.metrics_out
            .clone()
            .unwrap_or_else(|| self.dir.join("metrics.jsonl"))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub period: usize,
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            period: 20,
            level: "info".to_string(),
        }
    }
}

impl TrainConfig {
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let cfg = Self::from_toml_str(&raw).map_err(|source| ConfigError::Toml {
            path: path.to_path_buf(),
            source,
        })?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(raw)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.solver.ims_per_batch == 0 {
            return Err(ConfigError::Invalid("solver.ims_per_batch must be > 0".into()));
        }
        if self.solver.max_iter == 0 {
            return Err(ConfigError::Invalid("solver.max_iter must be > 0".into()));
        }
        if self.log.period == 0 {
            return Err(ConfigError::Invalid("log.period must be > 0".into()));
        }
        if self.model.detector.channels == 0 {
            return Err(ConfigError::Invalid("model.channels must be > 0".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use models::DetectorBranch;

    #[test]
    fn empty_file_uses_defaults() {
        let cfg = TrainConfig::from_toml_str("").unwrap();
        assert_eq!(cfg.solver.max_iter, 9000);
        assert_eq!(cfg.log.period, 20);
        assert_eq!(cfg.model.detector.branch, DetectorBranch::Retina);
        assert_eq!(cfg.model.visual_mode(), VisualMode::Retina);
        assert_eq!(cfg.output.metrics_path(), PathBuf::from("checkpoints/metrics.jsonl"));
        cfg.validate().unwrap();
    }

    #[test]
    fn sections_override_defaults() {
        let raw = r#"
            [model]
            branch = "dense_box"
            channels = 8
            visual_mode = "common"

            [solver]
            base_lr = 0.01
            scheduler = "cosine"
            max_iter = 10
            split_lr = true
            encoder_lr_factor = 0.5

            [solver.warmup]
            factor = 0.5
            iters = 2
            method = "constant"

            [data]
            root = "/tmp/frames"
            max_boxes = 3

            [log]
            period = 5
        "#;
        let cfg = TrainConfig::from_toml_str(raw).unwrap();
        assert_eq!(cfg.model.detector.branch, DetectorBranch::DenseBox);
        assert_eq!(cfg.model.detector.channels, 8);
        assert_eq!(cfg.model.visual_mode(), VisualMode::Common);
        assert_eq!(cfg.solver.scheduler, SchedulerKind::Cosine);
        assert_eq!(cfg.solver.param_groups().lrs(0.01), vec![0.005, 0.01]);
        assert_eq!(cfg.data.collate().max_boxes, 3);
        assert_eq!(cfg.data.labels_subdir, "labels");
        assert_eq!(cfg.log.period, 5);
        assert!(matches!(
            cfg.solver.build_scheduler().unwrap(),
            Scheduler::Cosine(_)
        ));
    }

    #[test]
    fn rejects_zero_batch() {
        let cfg = TrainConfig::from_toml_str("[solver]\nims_per_batch = 0\n").unwrap();
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn from_path_reports_missing_file() {
        let err = TrainConfig::from_path(Path::new("/nonexistent/train.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
