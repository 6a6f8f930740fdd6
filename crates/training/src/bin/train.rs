use clap::Parser;
use training::util::{run_train, TrainArgs};

fn main() -> anyhow::Result<()> {
    let args = TrainArgs::parse();
    let summary = run_train(args)?;
    tracing::info!(
        last_iter = summary.last_iter,
        skipped = summary.skipped_iters,
        "training finished"
    );
    Ok(())
}
