use std::fs;
use std::path::PathBuf;

use anyhow::Context;
use burn::backend::Autodiff;
use burn::optim::momentum::MomentumConfig;
use burn::optim::decay::WeightDecayConfig;
use burn::optim::{AdamWConfig, Optimizer, SgdConfig};
use clap::{Parser, ValueEnum};
use models::DenseDetector;

use crate::checkpoint::{FileCheckpointer, Restored, TrainArguments};
use crate::config::{OptimizerKind, TrainConfig};
use crate::dataset::{DetectionDataset, SyntheticDataset};
use crate::engine::{do_train, EngineOptions, TrainSummary};
use crate::loader::{IterationLoader, LoaderConfig};
use crate::logging::init_tracing;
use crate::visualize::JsonlScalarWriter;
use crate::TrainBackend;

#[derive(ValueEnum, Debug, Clone, Copy, Default)]
pub enum BackendKind {
    #[default]
    NdArray,
    Wgpu,
}

#[derive(Parser, Debug, Default)]
#[command(name = "train", about = "Iteration-based training for the dense detector")]
pub struct TrainArgs {
    /// TOML config; every field has a default.
    #[arg(long, env = "TRAIN_CONFIG")]
    pub config: Option<PathBuf>,
    /// Backend to use (ndarray or wgpu if enabled).
    #[arg(long, value_enum, default_value_t = BackendKind::NdArray)]
    pub backend: BackendKind,
    /// Checkpoint and metrics directory (overrides output.dir).
    #[arg(long)]
    pub output_dir: Option<PathBuf>,
    /// Total iterations (overrides solver.max_iter).
    #[arg(long)]
    pub max_iter: Option<usize>,
    /// Images per batch (overrides solver.ims_per_batch).
    #[arg(long)]
    pub batch_size: Option<usize>,
    /// Base learning rate (overrides solver.base_lr).
    #[arg(long)]
    pub lr: Option<f64>,
    /// Dataset root containing the label and image subdirectories.
    #[arg(long)]
    pub dataset_root: Option<PathBuf>,
    /// Resume from the newest checkpoint in the output directory.
    #[arg(long)]
    pub resume: bool,
    /// Train on generated frames instead of a dataset on disk.
    #[arg(long)]
    pub synthetic: bool,
    /// Scalar JSONL output (overrides output.metrics_out).
    #[arg(long)]
    pub metrics_out: Option<PathBuf>,
    /// Log filter used when RUST_LOG is unset.
    #[arg(long)]
    pub log_level: Option<String>,
}

impl TrainArgs {
    /// Applies command-line overrides on top of the file config.
    pub fn apply(&self, cfg: &mut TrainConfig) {
        if let Some(dir) = &self.output_dir {
            cfg.output.dir = dir.clone();
        }
        if let Some(max_iter) = self.max_iter {
            cfg.solver.max_iter = max_iter;
        }
        if let Some(batch_size) = self.batch_size {
            cfg.solver.ims_per_batch = batch_size;
        }
        if let Some(lr) = self.lr {
            cfg.solver.base_lr = lr;
        }
        if let Some(root) = &self.dataset_root {
            cfg.data.root = root.clone();
        }
        if let Some(path) = &self.metrics_out {
            cfg.output.metrics_out = Some(path.clone());
        }
        if let Some(level) = &self.log_level {
            cfg.log.level = level.clone();
        }
    }
}

type ADBackend = Autodiff<TrainBackend>;

pub fn run_train(args: TrainArgs) -> anyhow::Result<TrainSummary> {
    validate_backend_choice(args.backend)?;

    let mut cfg = match &args.config {
        Some(path) => TrainConfig::from_path(path)?,
        None => TrainConfig::default(),
    };
    args.apply(&mut cfg);
    cfg.validate()?;
    init_tracing(&cfg.log.level);

    fs::create_dir_all(&cfg.output.dir).with_context(|| {
        format!("failed to create output dir {}", cfg.output.dir.display())
    })?;

    if args.synthetic {
        let size = cfg.data.synthetic_size;
        let dataset = SyntheticDataset::new(cfg.data.synthetic_len, size, size, cfg.data.seed);
        tracing::info!(frames = cfg.data.synthetic_len, size, "training on synthetic frames");
        train_on(&cfg, dataset, args.resume)
    } else {
        let paths = cfg.data.paths();
        let dataset = paths
            .open()
            .with_context(|| format!("failed to open dataset at {}", paths.root.display()))?;
        if dataset.is_empty() {
            anyhow::bail!("no labelled frames found under {}", paths.root.display());
        }
        train_on(&cfg, dataset, args.resume)
    }
}

fn train_on<D: DetectionDataset>(
    cfg: &TrainConfig,
    dataset: D,
    resume: bool,
) -> anyhow::Result<TrainSummary> {
    let loader = IterationLoader::new(
        dataset,
        LoaderConfig {
            batch_size: cfg.solver.ims_per_batch,
            max_iter: cfg.solver.max_iter,
            shuffle: cfg.data.shuffle,
            seed: cfg.data.seed,
            drop_last: cfg.data.drop_last,
            rank: 0,
            num_replicas: 1,
            collate: cfg.data.collate(),
        },
    )?;
    let device = <ADBackend as burn::tensor::backend::Backend>::Device::default();
    let model = DenseDetector::<ADBackend>::new(cfg.model.detector.clone(), &device);

    match cfg.solver.optimizer {
        OptimizerKind::AdamW => {
            let optim = AdamWConfig::new()
                .with_weight_decay(cfg.solver.weight_decay)
                .init::<ADBackend, DenseDetector<ADBackend>>();
            train_with(cfg, &loader, model, optim, &device, resume)
        }
        OptimizerKind::Sgd => {
            let optim = SgdConfig::new()
                .with_weight_decay(Some(WeightDecayConfig::new(cfg.solver.weight_decay)))
                .with_momentum(Some(
                    MomentumConfig::new().with_momentum(cfg.solver.momentum),
                ))
                .init::<ADBackend, DenseDetector<ADBackend>>();
            train_with(cfg, &loader, model, optim, &device, resume)
        }
    }
}

fn train_with<D, O>(
    cfg: &TrainConfig,
    loader: &IterationLoader<D>,
    model: DenseDetector<ADBackend>,
    optimizer: O,
    device: &<ADBackend as burn::tensor::backend::Backend>::Device,
    resume: bool,
) -> anyhow::Result<TrainSummary>
where
    D: DetectionDataset,
    O: Optimizer<DenseDetector<ADBackend>, ADBackend> + Clone,
{
    let scheduler = cfg.solver.build_scheduler()?;
    let mut checkpointer = FileCheckpointer::new(&cfg.output.dir, true);
    let restored = if resume {
        checkpointer.load::<ADBackend, _, _, _>(
            model.clone(),
            optimizer.clone(),
            scheduler.clone(),
            device,
        )?
    } else {
        None
    };
    if resume && restored.is_none() {
        tracing::info!(dir = %cfg.output.dir.display(), "no checkpoint to resume from");
    }
    let Restored {
        model,
        optimizer,
        mut scheduler,
        mut arguments,
    } = restored.unwrap_or(Restored {
        model,
        optimizer,
        scheduler,
        arguments: TrainArguments::new(0),
    });
    let metrics_path = cfg.output.metrics_path();
    let mut writer = JsonlScalarWriter::create(&metrics_path)
        .with_context(|| format!("failed to open {}", metrics_path.display()))?;
    let options = EngineOptions::new(cfg.model.visual_mode())
        .with_log_period(cfg.log.period)
        .with_param_groups(cfg.solver.param_groups());

    let outcome = do_train::<ADBackend, _, _, _, _>(
        model,
        loader,
        optimizer,
        &mut scheduler,
        &mut checkpointer,
        device,
        cfg.solver.checkpoint_period,
        &mut arguments,
        Some(&mut writer),
        &options,
    )?;
    Ok(outcome.summary)
}

pub fn validate_backend_choice(kind: BackendKind) -> anyhow::Result<()> {
    let built_wgpu = cfg!(feature = "backend-wgpu");
    match (kind, built_wgpu) {
        (BackendKind::Wgpu, false) => {
            anyhow::bail!("backend-wgpu feature not enabled; rebuild with --features backend-wgpu or choose ndarray backend")
        }
        (BackendKind::NdArray, true) => {
            tracing::warn!("built with backend-wgpu; training will still use the WGPU backend despite --backend ndarray");
        }
        _ => {}
    }
    Ok(())
}
