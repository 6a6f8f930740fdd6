//! Named checkpoints: model, optimizer state and train arguments side by side.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use burn::lr_scheduler::LrScheduler;
use burn::module::{AutodiffModule, Module};
use burn::optim::Optimizer;
use burn::record::{BinFileRecorder, FullPrecisionSettings, Recorder};
use burn::tensor::backend::AutodiffBackend;
use serde::{Deserialize, Serialize};
use thiserror::Error;

const LAST_CHECKPOINT: &str = "last_checkpoint";

/// Mutable training state persisted with every checkpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainArguments {
    /// Completed iterations.
    pub iteration: usize,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl TrainArguments {
    pub fn new(iteration: usize) -> Self {
        Self {
            iteration,
            extra: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to record {path}: {msg}")]
    Record { path: PathBuf, msg: String },
    #[error("invalid train arguments in {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

pub trait Checkpointer<B, M, O, S>
where
    B: AutodiffBackend,
    M: AutodiffModule<B>,
    O: Optimizer<M, B>,
    S: LrScheduler,
{
    fn save(
        &mut self,
        name: &str,
        model: &M,
        optimizer: &O,
        scheduler: &S,
        arguments: &TrainArguments,
    ) -> Result<(), CheckpointError>;
}

/// Training state read back from the newest checkpoint.
pub struct Restored<M, O, S> {
    pub model: M,
    pub optimizer: O,
    pub scheduler: S,
    pub arguments: TrainArguments,
}

/// Writes `<name>.bin`, `<name>_optim.bin`, `<name>_sched.bin` and `<name>.json` under `dir`,
/// then points `last_checkpoint` at `name`. Ranks other than the main one pass `save_to_disk = false`.
pub struct FileCheckpointer {
    dir: PathBuf,
    save_to_disk: bool,
    recorder: BinFileRecorder<FullPrecisionSettings>,
}

impl FileCheckpointer {
    pub fn new(dir: impl Into<PathBuf>, save_to_disk: bool) -> Self {
        Self {
            dir: dir.into(),
            save_to_disk,
            recorder: BinFileRecorder::<FullPrecisionSettings>::new(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn has_checkpoint(&self) -> bool {
        self.dir.join(LAST_CHECKPOINT).is_file()
    }

    /// Name recorded in `last_checkpoint`, if any.
    pub fn last_checkpoint(&self) -> Result<Option<String>, CheckpointError> {
        let path = self.dir.join(LAST_CHECKPOINT);
        if !path.is_file() {
            return Ok(None);
        }
        let raw = fs::read_to_string(&path).map_err(|source| CheckpointError::Io {
            path: path.clone(),
            source,
        })?;
        let name = raw.trim();
        Ok((!name.is_empty()).then(|| name.to_string()))
    }

    /// Restores the newest checkpoint into `model`, `optimizer` and `scheduler`.
    pub fn load<B, M, O, S>(
        &self,
        model: M,
        optimizer: O,
        scheduler: S,
        device: &B::Device,
    ) -> Result<Option<Restored<M, O, S>>, CheckpointError>
    where
        B: AutodiffBackend,
        M: AutodiffModule<B>,
        O: Optimizer<M, B>,
        S: LrScheduler,
    {
        let Some(name) = self.last_checkpoint()? else {
            return Ok(None);
        };
        let model_path = self.dir.join(&name);
        let model = model
            .load_file(model_path.clone(), &self.recorder, device)
            .map_err(|e| CheckpointError::Record {
                path: model_path,
                msg: e.to_string(),
            })?;

        let optim_path = self.dir.join(format!("{name}_optim"));
        let record: O::Record = Recorder::<B>::load(&self.recorder, optim_path.clone(), device)
            .map_err(|e| CheckpointError::Record {
                path: optim_path,
                msg: e.to_string(),
            })?;
        let optimizer = optimizer.load_record(record);

        let sched_path = self.dir.join(format!("{name}_sched"));
        let record: S::Record<B> = Recorder::<B>::load(&self.recorder, sched_path.clone(), device)
            .map_err(|e| CheckpointError::Record {
                path: sched_path,
                msg: e.to_string(),
            })?;
        let scheduler = scheduler.load_record::<B>(record);

        let args_path = self.dir.join(format!("{name}.json"));
        let raw = fs::read(&args_path).map_err(|source| CheckpointError::Io {
            path: args_path.clone(),
            source,
        })?;
        let arguments: TrainArguments =
            serde_json::from_slice(&raw).map_err(|source| CheckpointError::Json {
                path: args_path,
                source,
            })?;
        tracing::info!(checkpoint = %name, iteration = arguments.iteration, "loaded checkpoint");
        Ok(Some(Restored {
            model,
            optimizer,
            scheduler,
            arguments,
        }))
    }
}

impl<B, M, O, S> Checkpointer<B, M, O, S> for FileCheckpointer
where
    B: AutodiffBackend,
    M: AutodiffModule<B>,
    O: Optimizer<M, B>,
    S: LrScheduler,
{
    fn save(
        &mut self,
        name: &str,
        model: &M,
        optimizer: &O,
        scheduler: &S,
        arguments: &TrainArguments,
    ) -> Result<(), CheckpointError> {
        if !self.save_to_disk {
            return Ok(());
        }
        fs::create_dir_all(&self.dir).map_err(|source| CheckpointError::Io {
            path: self.dir.clone(),
            source,
        })?;

        let model_path = self.dir.join(name);
        model
            .clone()
            .save_file(model_path.clone(), &self.recorder)
            .map_err(|e| CheckpointError::Record {
                path: model_path,
                msg: e.to_string(),
            })?;

        let optim_path = self.dir.join(format!("{name}_optim"));
        Recorder::<B>::record(&self.recorder, optimizer.to_record(), optim_path.clone()).map_err(
            |e| CheckpointError::Record {
                path: optim_path,
                msg: e.to_string(),
            },
        )?;

        let sched_path = self.dir.join(format!("{name}_sched"));
        Recorder::<B>::record(&self.recorder, scheduler.to_record::<B>(), sched_path.clone())
            .map_err(|e| CheckpointError::Record {
                path: sched_path,
                msg: e.to_string(),
            })?;

        let args_path = self.dir.join(format!("{name}.json"));
        let json = serde_json::to_vec_pretty(arguments).map_err(|source| CheckpointError::Json {
            path: args_path.clone(),
            source,
        })?;
        fs::write(&args_path, json).map_err(|source| CheckpointError::Io {
            path: args_path,
            source,
        })?;

        let last = self.dir.join(LAST_CHECKPOINT);
        fs::write(&last, name).map_err(|source| CheckpointError::Io { path: last, source })?;
        tracing::info!(checkpoint = %name, dir = %self.dir.display(), "saved checkpoint");
        Ok(())
    }
}
