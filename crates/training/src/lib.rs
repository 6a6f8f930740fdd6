#![recursion_limit = "256"]

pub mod checkpoint;
pub mod comm;
pub mod config;
pub mod dataset;
pub mod engine;
pub mod loader;
pub mod logging;
pub mod losses;
pub mod memory;
pub mod meters;
pub mod schedule;
pub mod util;
pub mod visualize;

pub use checkpoint::{
    CheckpointError, Checkpointer, FileCheckpointer, Restored, TrainArguments,
};
pub use comm::{CommError, LocalGroup, ProcessGroup, SingleProcess};
pub use config::{ConfigError, TrainConfig};
pub use dataset::{
    collate, CaptureDataset, CollateConfig, DatasetError, DatasetPathConfig, DetectionDataset,
    DetectionSample, ImageBatch, InMemoryDataset, LoadedBatch, SyntheticDataset,
};
pub use engine::{do_train, EngineOptions, TrainOutcome, TrainSummary};
pub use loader::{IterationLoader, LoaderConfig};
pub use losses::{reduce_loss_dict, reduce_step_losses, LossValues};
pub use meters::{MetricLogger, SmoothedValue};
pub use schedule::{ParamGroups, Scheduler, WarmupCosineLr, WarmupMultiStepLr};
pub use util::{run_train, TrainArgs};
pub use visualize::{visualize, JsonlScalarWriter, ScalarLog, ScalarWriter, VisualMode};

/// Backend alias for training (NdArray by default; WGPU if enabled).
#[cfg(feature = "backend-wgpu")]
pub type TrainBackend = burn_wgpu::Wgpu<f32>;
#[cfg(not(feature = "backend-wgpu"))]
pub type TrainBackend = burn_ndarray::NdArray<f32>;
