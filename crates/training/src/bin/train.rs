use std::path::PathBuf;

use clap::Parser;
use training::{
    progress::TerminalProgress,
    trainer::RunOutcome,
    visual::{SimpleVisual, TerminalSurface},
    ConfigOverride, StopFlag, TaskRegistry, Trainer, TrainingConfig, TrainingError,
};

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    if let Err(err) = run() {
        eprintln!("training failed: {}", err);
        std::process::exit(1);
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about = "SpearTTS manual training loop", long_about = None)]
struct Args {
    #[arg(
        short,
        long,
        value_name = "PATH",
        help = "Path to a TOML or JSON training config"
    )]
    config: PathBuf,

    #[arg(
        long = "override",
        value_name = "KEY=VALUE",
        help = "Override a configuration value using a dot-separated path"
    )]
    overrides: Vec<ConfigOverride>,
}

fn run() -> Result<(), TrainingError> {
    let args = Args::parse();
    let config = TrainingConfig::load(&args.config)?.with_overrides(&args.overrides)?;

    let progress = TerminalProgress::new();
    let multi = progress.multi().clone();
    let mut trainer = Trainer::from_config(
        &config,
        &TaskRegistry::builtin(),
        |total_steps| SimpleVisual::new(Box::new(TerminalSurface::attached(&multi)), total_steps),
        progress,
    )?;

    let stop = StopFlag::new();
    let handler_flag = stop.clone();
    ctrlc::set_handler(move || handler_flag.raise())
        .map_err(|err| TrainingError::runtime(format!("failed to install signal handler: {err}")))?;
    trainer = trainer.with_stop_flag(stop);

    let summary = trainer.run()?;
    match summary.outcome {
        RunOutcome::Interrupted => log::warn!(
            "stopped after {} steps ({} samples)",
            summary.steps,
            summary.samples
        ),
        _ => log::info!(
            "finished {} steps: train {:.5}, val {:.5}, {} checkpoints",
            summary.steps,
            summary.train_loss,
            summary.val_loss,
            summary.checkpoints.len()
        ),
    }
    Ok(())
}
