//! The iteration-based training loop.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use burn::lr_scheduler::LrScheduler;
use burn::optim::Optimizer;
use burn::tensor::backend::AutodiffBackend;
use models::TrainableDetector;

use crate::checkpoint::{Checkpointer, TrainArguments};
use crate::comm::{ProcessGroup, SingleProcess};
use crate::dataset::DetectionDataset;
use crate::loader::IterationLoader;
use crate::losses::{reduce_step_losses, total};
use crate::memory::PeakMemory;
use crate::meters::MetricLogger;
use crate::schedule::ParamGroups;
use crate::visualize::{visualize, ScalarWriter, VisualMode};

pub struct EngineOptions {
    /// Iterations between progress lines and dashboard scalars.
    pub log_period: usize,
    pub visual_mode: VisualMode,
    pub param_groups: ParamGroups,
    pub group: Arc<dyn ProcessGroup>,
}

impl EngineOptions {
    pub fn new(visual_mode: VisualMode) -> Self {
        Self {
            log_period: 20,
            visual_mode,
            param_groups: ParamGroups::single(),
            group: Arc::new(SingleProcess),
        }
    }

    pub fn with_log_period(mut self, log_period: usize) -> Self {
        self.log_period = log_period.max(1);
        self
    }

    pub fn with_param_groups(mut self, param_groups: ParamGroups) -> Self {
        self.param_groups = param_groups;
        self
    }

    pub fn with_group(mut self, group: Arc<dyn ProcessGroup>) -> Self {
        self.group = group;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrainSummary {
    pub start_iter: usize,
    pub last_iter: usize,
    /// Iterations whose forward pass failed and were not stepped.
    pub skipped_iters: usize,
    pub total_time: Duration,
}

impl TrainSummary {
    pub fn iterations_run(&self) -> usize {
        self.last_iter.saturating_sub(self.start_iter)
    }
}

pub struct TrainOutcome<M, O> {
    pub model: M,
    pub optimizer: O,
    pub summary: TrainSummary,
}

/// Runs iterations `arguments.iteration..loader.len()`.
///
/// Each step reduces the loss dict for logging, back-propagates the local total, and
/// steps every parameter group at its own learning rate. A failed forward pass skips
/// the step but still joins the loss reduction so other ranks are not left waiting.
///
/// `scheduler` must already sit at `arguments.iteration`; `FileCheckpointer::load`
/// restores both together.
#[allow(clippy::too_many_arguments)]
pub fn do_train<B, M, O, D, S>(
    mut model: M,
    data_loader: &IterationLoader<D>,
    mut optimizer: O,
    scheduler: &mut S,
    checkpointer: &mut dyn Checkpointer<B, M, O, S>,
    device: &B::Device,
    checkpoint_period: usize,
    arguments: &mut TrainArguments,
    mut writer: Option<&mut dyn ScalarWriter>,
    options: &EngineOptions,
) -> anyhow::Result<TrainOutcome<M, O>>
where
    B: AutodiffBackend,
    M: TrainableDetector<B>,
    O: Optimizer<M, B>,
    D: DetectionDataset,
    S: LrScheduler,
{
    let group = options.group.as_ref();
    let log_period = options.log_period.max(1);
    let collate = data_loader.collate_config();
    tracing::info!("Start training");
    tracing::info!(
        size_divisibility = collate.size_divisibility,
        max_boxes = collate.max_boxes,
        "batch collation"
    );

    let mut meters = MetricLogger::new("  ");
    let max_iter = data_loader.len();
    let start_iter = arguments.iteration;
    let loss_names = model.loss_names();
    let mut memory = PeakMemory::new();
    let mut skipped_iters = 0;
    let mut last_iter = start_iter;

    let start_training_time = Instant::now();
    let mut end = Instant::now();
    for item in data_loader.iter_from(start_iter) {
        let (index, batch) = item.context("failed to load training batch")?;
        let data_time = end.elapsed().as_secs_f64();
        let iteration = index + 1;
        arguments.iteration = iteration;

        let lrs = options.param_groups.lrs(scheduler.step());
        let images = batch.images.to_tensor::<B>(device);

        let loss_dict = match model.forward_loss(images, &batch.targets) {
            Ok(dict) => Some(dict),
            Err(err) => {
                skipped_iters += 1;
                tracing::warn!(
                    iteration,
                    samples = ?batch.indices,
                    error = %err,
                    "forward pass failed; skipping step"
                );
                None
            }
        };

        let local = loss_dict.as_ref().map(|dict| dict.to_scalars());
        let reduced = reduce_step_losses(local.as_ref(), loss_names, group)
            .context("failed to reduce step losses")?;
        if let Some(reduced) = reduced {
            meters.update("loss", f64::from(total(&reduced)));
            meters.update_values(reduced.iter());
        }

        if let Some(loss) = loss_dict.and_then(|dict| dict.total()) {
            let grads = loss.backward();
            let groups = model.grad_groups(grads, options.param_groups.split);
            for (grads, lr) in groups.into_iter().zip(lrs.iter()) {
                model = optimizer.step(*lr, model, grads);
            }
        }

        let batch_time = end.elapsed().as_secs_f64();
        end = Instant::now();
        meters.update("time", batch_time);
        meters.update("data", data_time);

        if iteration % log_period == 0 || iteration == max_iter {
            if group.is_main() {
                let eta_seconds = meters
                    .get("time")
                    .map(|m| m.global_avg() * (max_iter - iteration) as f64)
                    .unwrap_or(0.0);
                let lr = lrs.first().copied().unwrap_or(0.0);
                let delim = meters.delimiter();
                tracing::info!(
                    "eta: {}{delim}iter: {iteration}{delim}{meters}{delim}lr: {lr:.6}{delim}max mem: {:.0}",
                    format_hms(eta_seconds),
                    memory.peak_mb(),
                );
                if let Some(w) = writer.as_deref_mut() {
                    visualize(
                        options.visual_mode,
                        &lrs,
                        options.param_groups.split,
                        &meters,
                        iteration,
                        w,
                    )
                    .context("failed to write dashboard scalars")?;
                }
            }
        }

        if checkpoint_period > 0 && iteration % checkpoint_period == 0 {
            checkpointer
                .save(
                    &format!("model_{iteration:07}"),
                    &model,
                    &optimizer,
                    scheduler,
                    arguments,
                )
                .with_context(|| format!("failed to save checkpoint at iteration {iteration}"))?;
        }
        if iteration == max_iter {
            checkpointer
                .save("model_final", &model, &optimizer, scheduler, arguments)
                .context("failed to save final checkpoint")?;
        }
        last_iter = iteration;
    }

    let total_time = start_training_time.elapsed();
    let iterations = last_iter.saturating_sub(start_iter).max(1);
    tracing::info!(
        "Total training time: {} ({:.4} s / it)",
        format_duration(total_time),
        total_time.as_secs_f64() / iterations as f64
    );
    if skipped_iters > 0 {
        tracing::warn!(skipped_iters, "iterations skipped after forward failures");
    }
    group.barrier().context("final barrier failed")?;

    Ok(TrainOutcome {
        model,
        optimizer,
        summary: TrainSummary {
            start_iter,
            last_iter,
            skipped_iters,
            total_time,
        },
    })
}

fn split_days(total_secs: u64) -> (String, u64) {
    let days = total_secs / 86_400;
    let prefix = match days {
        0 => String::new(),
        1 => "1 day, ".to_string(),
        n => format!("{n} days, "),
    };
    (prefix, total_secs % 86_400)
}

/// Whole seconds as `H:MM:SS`, with a day prefix past 24 hours.
pub fn format_hms(seconds: f64) -> String {
    let (days, rest) = split_days(seconds.max(0.0) as u64);
    format!("{days}{}:{:02}:{:02}", rest / 3600, (rest % 3600) / 60, rest % 60)
}

/// `H:MM:SS.ffffff`; the fraction is omitted when it is zero.
pub fn format_duration(duration: Duration) -> String {
    let (days, rest) = split_days(duration.as_secs());
    let micros = duration.subsec_micros();
    let hms = format!("{days}{}:{:02}:{:02}", rest / 3600, (rest % 3600) / 60, rest % 60);
    if micros == 0 {
        hms
    } else {
        format!("{hms}.{micros:06}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hms_truncates_fractional_seconds() {
        assert_eq!(format_hms(0.0), "0:00:00");
        assert_eq!(format_hms(59.9), "0:00:59");
        assert_eq!(format_hms(3_725.0), "1:02:05");
        assert_eq!(format_hms(90_061.0), "1 day, 1:01:01");
        assert_eq!(format_hms(-3.0), "0:00:00");
    }

    #[test]
    fn duration_includes_microseconds() {
        assert_eq!(format_duration(Duration::from_secs(61)), "0:01:01");
        assert_eq!(
            format_duration(Duration::from_micros(3_600_000_250)),
            "1:00:00.000250"
        );
        assert_eq!(
            format_duration(Duration::from_secs(2 * 86_400 + 5)),
            "2 days, 0:00:05"
        );
    }

    #[test]
    fn summary_counts_iterations_run() {
        let summary = TrainSummary {
            start_iter: 3,
            last_iter: 10,
            skipped_iters: 1,
            total_time: Duration::ZERO,
        };
        assert_eq!(summary.iterations_run(), 7);
    }
}
