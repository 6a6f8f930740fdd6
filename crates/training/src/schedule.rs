//! Per-iteration learning-rate schedules with warmup.

use burn::lr_scheduler::cosine::{CosineAnnealingLrScheduler, CosineAnnealingLrSchedulerConfig};
use burn::lr_scheduler::LrScheduler;
use burn::tensor::backend::Backend;
use burn::LearningRate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum ScheduleError {
    #[error("milestones must be strictly increasing, got {0:?}")]
    UnorderedMilestones(Vec<usize>),
    #[error("warmup factor must be in (0, 1], got {0}")]
    InvalidWarmupFactor(f64),
    #[error("invalid cosine schedule: {0}")]
    Cosine(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarmupMethod {
    Constant,
    Linear,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Warmup {
    pub factor: f64,
    pub iters: usize,
    pub method: WarmupMethod,
}

impl Default for Warmup {
    fn default() -> Self {
        Self {
            factor: 1.0 / 3.0,
            iters: 500,
            method: WarmupMethod::Linear,
        }
    }
}

impl Warmup {
    fn validate(&self) -> Result<(), ScheduleError> {
        if !(self.factor > 0.0 && self.factor <= 1.0) {
            return Err(ScheduleError::InvalidWarmupFactor(self.factor));
        }
        Ok(())
    }

    pub fn multiplier(&self, iteration: usize) -> f64 {
        if iteration >= self.iters {
            return 1.0;
        }
        match self.method {
            WarmupMethod::Constant => self.factor,
            WarmupMethod::Linear => {
                let alpha = iteration as f64 / self.iters as f64;
                self.factor * (1.0 - alpha) + alpha
            }
        }
    }
}

/// Step decay by `gamma` at each milestone, after a warmup.
///
/// burn ships no multi-step schedule, so this one implements `LrScheduler` directly.
#[derive(Debug, Clone)]
pub struct WarmupMultiStepLr {
    base_lr: f64,
    milestones: Vec<usize>,
    gamma: f64,
    warmup: Warmup,
    iteration: usize,
}

impl WarmupMultiStepLr {
    pub fn new(
        base_lr: f64,
        milestones: Vec<usize>,
        gamma: f64,
        warmup: Warmup,
    ) -> Result<Self, ScheduleError> {
        if milestones.windows(2).any(|w| w[0] >= w[1]) {
            return Err(ScheduleError::UnorderedMilestones(milestones));
        }
        warmup.validate()?;
        Ok(Self {
            base_lr,
            milestones,
            gamma,
            warmup,
            iteration: 0,
        })
    }

    pub fn lr_at(&self, iteration: usize) -> f64 {
        let decays = self.milestones.partition_point(|m| *m <= iteration);
        self.base_lr * self.warmup.multiplier(iteration) * self.gamma.powi(decays as i32)
    }

    /// Learning rate at the current iteration.
    pub fn lr(&self) -> f64 {
        self.lr_at(self.iteration)
    }

    /// Completed steps.
    pub fn iteration(&self) -> usize {
        self.iteration
    }
}

impl LrScheduler for WarmupMultiStepLr {
    type Record<B: Backend> = usize;

    fn step(&mut self) -> LearningRate {
        self.iteration += 1;
        self.lr()
    }

    fn to_record<B: Backend>(&self) -> Self::Record<B> {
        self.iteration
    }

    fn load_record<B: Backend>(mut self, record: Self::Record<B>) -> Self {
        self.iteration = record;
        self
    }
}

/// burn's cosine annealing from `base_lr` to `min_lr` over `max_iter`, scaled by a warmup.
///
/// Iteration 1 runs at `base_lr` and iteration `max_iter` at `min_lr`.
#[derive(Debug, Clone)]
pub struct WarmupCosineLr {
    cosine: CosineAnnealingLrScheduler,
    warmup: Warmup,
    iteration: usize,
    last_lr: f64,
}

impl WarmupCosineLr {
    pub fn new(
        base_lr: f64,
        min_lr: f64,
        max_iter: usize,
        warmup: Warmup,
    ) -> Result<Self, ScheduleError> {
        warmup.validate()?;
        let cosine = CosineAnnealingLrSchedulerConfig::new(base_lr, max_iter.saturating_sub(1).max(1))
            .with_min_lr(min_lr)
            .init()
            .map_err(ScheduleError::Cosine)?;
        Ok(Self {
            cosine,
            warmup,
            iteration: 0,
            last_lr: base_lr * warmup.multiplier(0),
        })
    }

    pub fn lr(&self) -> f64 {
        self.last_lr
    }

    pub fn iteration(&self) -> usize {
        self.iteration
    }
}

impl LrScheduler for WarmupCosineLr {
    type Record<B: Backend> = usize;

    fn step(&mut self) -> LearningRate {
        self.iteration += 1;
        let annealed = LrScheduler::step(&mut self.cosine);
        self.last_lr = annealed * self.warmup.multiplier(self.iteration);
        self.last_lr
    }

    fn to_record<B: Backend>(&self) -> Self::Record<B> {
        self.iteration
    }

    fn load_record<B: Backend>(mut self, record: Self::Record<B>) -> Self {
        // The inner schedule starts at usize::MAX so its first step lands on 0.
        let before_last = record.checked_sub(2).unwrap_or(usize::MAX);
        let mut replay = LrScheduler::load_record::<B>(self.cosine, before_last);
        if record > 0 {
            self.last_lr = LrScheduler::step(&mut replay) * self.warmup.multiplier(record);
        } else {
            self.last_lr = self.warmup.multiplier(0) * LrScheduler::step(&mut replay);
            replay = LrScheduler::load_record::<B>(replay, usize::MAX);
        }
        self.cosine = replay;
        self.iteration = record;
        self
    }
}

/// Either schedule, selected from config.
#[derive(Debug, Clone)]
pub enum Scheduler {
    MultiStep(WarmupMultiStepLr),
    Cosine(WarmupCosineLr),
}

impl Scheduler {
    pub fn lr(&self) -> f64 {
        match self {
            Scheduler::MultiStep(inner) => inner.lr(),
            Scheduler::Cosine(inner) => inner.lr(),
        }
    }

    pub fn iteration(&self) -> usize {
        match self {
            Scheduler::MultiStep(inner) => inner.iteration(),
            Scheduler::Cosine(inner) => inner.iteration(),
        }
    }
}

impl LrScheduler for Scheduler {
    type Record<B: Backend> = usize;

    fn step(&mut self) -> LearningRate {
        match self {
            Scheduler::MultiStep(inner) => LrScheduler::step(inner),
            Scheduler::Cosine(inner) => LrScheduler::step(inner),
        }
    }

    fn to_record<B: Backend>(&self) -> Self::Record<B> {
        self.iteration()
    }

    fn load_record<B: Backend>(self, record: Self::Record<B>) -> Self {
        match self {
            Scheduler::MultiStep(inner) => Scheduler::MultiStep(inner.load_record::<B>(record)),
            Scheduler::Cosine(inner) => Scheduler::Cosine(inner.load_record::<B>(record)),
        }
    }
}

/// Per-parameter-group learning rates derived from the scheduled base rate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParamGroups {
    pub split: bool,
    pub encoder_factor: f64,
}

impl ParamGroups {
    pub fn single() -> Self {
        Self {
            split: false,
            encoder_factor: 1.0,
        }
    }

    pub fn split(encoder_factor: f64) -> Self {
        Self {
            split: true,
            encoder_factor,
        }
    }

    /// `[encoder, decoder]` when split, else `[base]`.
    pub fn lrs(&self, base_lr: f64) -> Vec<f64> {
        if self.split {
            vec![base_lr * self.encoder_factor, base_lr]
        } else {
            vec![base_lr]
        }
    }
}
