//! Dashboard scalars: learning rates and loss curves per detector branch.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use models::DetectorBranch;
use serde::{Deserialize, Serialize};

use crate::meters::MetricLogger;

/// Sink for `(tag, value, step)` scalars.
pub trait ScalarWriter {
    fn add_scalar(&mut self, tag: &str, value: f64, step: usize) -> io::Result<()>;

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalarEvent {
    pub tag: String,
    pub value: f64,
    pub step: usize,
    pub wall_time: f64,
}

/// Appends one JSON object per scalar.
pub struct JsonlScalarWriter {
    path: PathBuf,
    out: BufWriter<File>,
}

impl JsonlScalarWriter {
    pub fn create(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            out: BufWriter::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ScalarWriter for JsonlScalarWriter {
    fn add_scalar(&mut self, tag: &str, value: f64, step: usize) -> io::Result<()> {
        let event = ScalarEvent {
            tag: tag.to_string(),
            value,
            step,
            wall_time: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs_f64())
                .unwrap_or(0.0),
        };
        serde_json::to_writer(&mut self.out, &event)?;
        self.out.write_all(b"\n")
    }

    fn flush(&mut self) -> io::Result<()> {
        self.out.flush()
    }
}

impl Drop for JsonlScalarWriter {
    fn drop(&mut self) {
        let _ = self.out.flush();
    }
}

/// Keeps scalars in memory.
#[derive(Debug, Clone, Default)]
pub struct ScalarLog {
    pub events: Vec<ScalarEvent>,
}

impl ScalarLog {
    pub fn tags(&self) -> Vec<&str> {
        self.events.iter().map(|e| e.tag.as_str()).collect()
    }

    pub fn last(&self, tag: &str) -> Option<&ScalarEvent> {
        self.events.iter().rev().find(|e| e.tag == tag)
    }
}

impl ScalarWriter for ScalarLog {
    fn add_scalar(&mut self, tag: &str, value: f64, step: usize) -> io::Result<()> {
        self.events.push(ScalarEvent {
            tag: tag.to_string(),
            value,
            step,
            wall_time: 0.0,
        });
        Ok(())
    }
}

/// Which loss curves get recorded besides lr and total loss.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VisualMode {
    Retina,
    DenseBox,
    Common,
}

impl VisualMode {
    /// Integer codes: 0/1 Retina, 2/3 DenseBox, anything else Common.
    pub fn from_code(code: u8) -> Self {
        match code {
            0 | 1 => VisualMode::Retina,
            2 | 3 => VisualMode::DenseBox,
            _ => VisualMode::Common,
        }
    }

    pub fn loss_tags(&self) -> &'static [&'static str] {
        match self {
            VisualMode::Retina => &["loss_retina_cls", "loss_retina_reg"],
            VisualMode::DenseBox => &[
                "loss_densebox_cls",
                "loss_densebox_reg",
                "loss_reg_weights",
            ],
            VisualMode::Common => &[],
        }
    }
}

impl From<DetectorBranch> for VisualMode {
    fn from(branch: DetectorBranch) -> Self {
        match branch {
            DetectorBranch::Retina => VisualMode::Retina,
            DetectorBranch::DenseBox => VisualMode::DenseBox,
        }
    }
}

/// Records the loss curve for the given branch.
///
/// `lrs` are the per-group learning rates; with `split`, groups 0 and 1 are written as
/// encoder and decoder rates. Meters that do not exist yet are skipped.
pub fn visualize(
    mode: VisualMode,
    lrs: &[f64],
    split: bool,
    meters: &MetricLogger,
    iteration: usize,
    writer: &mut dyn ScalarWriter,
) -> io::Result<()> {
    if split {
        if let Some(lr) = lrs.first() {
            writer.add_scalar("train/enc_lr", *lr, iteration)?;
        }
        if let Some(lr) = lrs.get(1) {
            writer.add_scalar("train/dec_lr", *lr, iteration)?;
        }
    } else if let Some(lr) = lrs.first() {
        writer.add_scalar("train/lr", *lr, iteration)?;
    }

    if let Some(meter) = meters.get("loss") {
        writer.add_scalar("train/loss", meter.avg(), iteration)?;
    }
    for name in mode.loss_tags() {
        match meters.get(name) {
            Some(meter) => writer.add_scalar(&format!("train/{name}"), meter.avg(), iteration)?,
            None => tracing::debug!(meter = %name, "no meter for dashboard scalar"),
        }
    }
    writer.flush()
}
