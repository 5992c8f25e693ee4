use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use training::{
    harness::{self, HarnessConfig},
    trainer::RunOutcome,
    DeviceKind, ModelSize, StopFlag, TaskRegistry, TerminalProgress,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Train a SpearTTS task through the hook-based runtime", long_about = None)]
struct Args {
    #[arg(long, help = "Task to train")]
    task: String,

    #[arg(long, default_value_t = 0, help = "Global training seed")]
    seed: u64,

    #[arg(long, default_value_t = 16, help = "Batch size")]
    batch_size: usize,

    #[arg(long, default_value_t = 8, help = "Max data loader workers")]
    workers: usize,

    #[arg(long, default_value = "", help = "Input data path")]
    input_dir: PathBuf,

    #[arg(
        long,
        default_value = "./checkpoints/",
        help = "Directory to save the checkpoints"
    )]
    checkpoint_dir: PathBuf,

    #[arg(long, default_value_t = 10, help = "Total training epochs")]
    epochs: usize,

    #[arg(long, default_value_t = 1e-2, help = "Optimizer weight decay")]
    weight_decay: f64,

    #[arg(long, default_value_t = 1e-4, help = "Optimizer initial learning rate")]
    lr0: f64,

    #[arg(
        long,
        help = "Fraction of the run spent raising the learning rate (defaults to 10k updates)"
    )]
    pct_start: Option<f64>,

    #[arg(long, default_value = "small", help = "Model size: tiny, small or base")]
    model_size: ModelSize,

    #[arg(long, default_value = "./runs", help = "TensorBoard log root")]
    log_dir: PathBuf,

    #[arg(long, value_enum, default_value = "auto", help = "Compute device")]
    device: DeviceArg,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum DeviceArg {
    Auto,
    Cpu,
    Cuda,
    Metal,
}

impl From<DeviceArg> for DeviceKind {
    fn from(value: DeviceArg) -> Self {
        match value {
            DeviceArg::Auto => DeviceKind::Auto,
            DeviceArg::Cpu => DeviceKind::Cpu,
            DeviceArg::Cuda => DeviceKind::Cuda,
            DeviceArg::Metal => DeviceKind::Metal,
        }
    }
}

impl From<Args> for HarnessConfig {
    fn from(args: Args) -> Self {
        HarnessConfig {
            task: args.task,
            seed: args.seed,
            batch_size: args.batch_size,
            workers: args.workers,
            input_dir: args.input_dir,
            checkpoint_dir: args.checkpoint_dir,
            epochs: args.epochs,
            weight_decay: args.weight_decay,
            lr0: args.lr0,
            pct_start: args.pct_start,
            model_size: args.model_size,
            log_dir: Some(args.log_dir),
            device: args.device.into(),
        }
    }
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    if let Err(err) = run() {
        eprintln!("Error: {err:?}");
        std::process::exit(1);
    }
}

fn run() -> anyhow::Result<()> {
    let config = HarnessConfig::from(Args::parse());

    let stop = StopFlag::new();
    let handler_flag = stop.clone();
    ctrlc::set_handler(move || handler_flag.raise())
        .context("failed to install signal handler")?;

    let summary = harness::run(
        &config,
        &TaskRegistry::builtin(),
        Some(Box::new(TerminalProgress::new())),
        stop,
    )
    .with_context(|| format!("training task '{}' failed", config.task))?;

    if summary.outcome == RunOutcome::Interrupted {
        log::warn!("fit interrupted at step {}", summary.global_step);
    }
    match summary.best() {
        Some(best) => log::info!(
            "best checkpoint {} (val_loss {:.5})",
            best.path.display(),
            best.score
        ),
        None => log::info!("no checkpoint was kept"),
    }
    Ok(())
}
