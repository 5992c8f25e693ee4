//! Hook-based harness.
//!
//! A [`TrainingModule`] describes what happens on each batch; a
//! [`TrainerRuntime`](runtime::TrainerRuntime) owns the loop, device
//! placement, gradient scaling, checkpoint retention and logging. The crate
//! ships a single-device [`LocalRuntime`](runtime::LocalRuntime).

pub mod runtime;

use std::{collections::BTreeMap, path::PathBuf};

use candle_core::{DType, Tensor};
use serde::Serialize;

pub use runtime::{FitSummary, LocalRuntime, RuntimeSettings, TrainerRuntime};

use crate::{
    config::{to_runtime_error, DeviceKind, Precision},
    data::{BatchLoader, DataBatch, LoaderConfig},
    device::select_device,
    logging::{ExperimentLogger, LoggingSettings, TEST_LOSS, TRAIN_LOSS, VAL_LOSS},
    metrics::MeanAccumulator,
    model::TrainableModel,
    optimizer::{
        build_optimization, default_pct_start, LossScaleConfig, OptimizationParams,
        OptimizationSetup,
    },
    progress::ProgressSink,
    tasks::{ModelSize, TaskRegistry},
    trainer::StopFlag,
    TrainingError,
};

/// Number of best checkpoints kept by the harness.
pub const SAVE_TOP_K: usize = 4;

/// Sink for scalars logged from inside a hook.
pub trait MetricLog {
    fn log(&mut self, name: &str, value: f64);
}

/// What the runtime knows about the loop when optimizers are configured.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeInfo {
    pub train_batches: usize,
    pub accumulate_grad_batches: usize,
    pub num_devices: usize,
    pub epochs: usize,
}

impl RuntimeInfo {
    /// Optimizer steps per epoch, rounded up.
    pub fn steps_per_epoch(&self) -> usize {
        let per_step = self.accumulate_grad_batches.max(1) * self.num_devices.max(1);
        self.train_batches.div_ceil(per_step)
    }

    pub fn total_steps(&self) -> usize {
        self.epochs * self.steps_per_epoch()
    }
}

/// The four hooks a runtime drives.
pub trait TrainingModule {
    fn configure_optimizers(&mut self, info: &RuntimeInfo) -> Result<OptimizationSetup, TrainingError>;

    /// Returns the loss to back-propagate.
    fn training_step(
        &mut self,
        batch: &DataBatch,
        batch_idx: usize,
        log: &mut dyn MetricLog,
    ) -> Result<Tensor, TrainingError>;

    fn validation_step(
        &mut self,
        batch: &DataBatch,
        batch_idx: usize,
        log: &mut dyn MetricLog,
    ) -> Result<Tensor, TrainingError>;

    fn test_step(
        &mut self,
        batch: &DataBatch,
        batch_idx: usize,
        log: &mut dyn MetricLog,
    ) -> Result<Tensor, TrainingError>;

    fn model(&self) -> &dyn TrainableModel;

    fn model_mut(&mut self) -> &mut dyn TrainableModel;

    fn hparams(&self) -> serde_json::Value {
        serde_json::Value::Null
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModuleHparams {
    pub lr0: f64,
    pub weight_decay: f64,
    /// Filled in by `configure_optimizers` when left unset.
    pub pct_start: Option<f64>,
    pub epochs: usize,
    pub decay_dense_biases: bool,
}

/// Adapts a [`TrainableModel`] to the hooks.
pub struct TaskModule {
    model: Box<dyn TrainableModel>,
    hparams: ModuleHparams,
}

impl TaskModule {
    pub fn new(model: Box<dyn TrainableModel>, hparams: ModuleHparams) -> Self {
        Self { model, hparams }
    }

    pub fn hyper_parameters(&self) -> &ModuleHparams {
        &self.hparams
    }

    fn forward_loss(&self, batch: &DataBatch) -> Result<(Tensor, f64), TrainingError> {
        let (_, loss) = self.model.forward(&batch.tensors).map_err(to_runtime_error)?;
        let value = loss
            .to_dtype(DType::F32)
            .and_then(|loss| loss.to_scalar::<f32>())
            .map_err(to_runtime_error)?;
        Ok((loss, value as f64))
    }
}

impl TrainingModule for TaskModule {
    fn configure_optimizers(&mut self, info: &RuntimeInfo) -> Result<OptimizationSetup, TrainingError> {
        let total_steps = info.total_steps();
        let pct_start = *self
            .hparams
            .pct_start
            .get_or_insert_with(|| default_pct_start(total_steps as f64));
        build_optimization(
            self.model.parameters(),
            &OptimizationParams {
                pct_start: Some(pct_start),
                decay_dense_biases: self.hparams.decay_dense_biases,
                ..OptimizationParams::new(self.hparams.lr0, self.hparams.weight_decay, total_steps)
            },
        )
    }

    fn training_step(
        &mut self,
        batch: &DataBatch,
        _batch_idx: usize,
        log: &mut dyn MetricLog,
    ) -> Result<Tensor, TrainingError> {
        let (loss, value) = self.forward_loss(batch)?;
        log.log(TRAIN_LOSS, value);
        Ok(loss)
    }

    fn validation_step(
        &mut self,
        batch: &DataBatch,
        _batch_idx: usize,
        log: &mut dyn MetricLog,
    ) -> Result<Tensor, TrainingError> {
        let (loss, value) = self.forward_loss(batch)?;
        log.log(VAL_LOSS, value);
        Ok(loss.detach())
    }

    fn test_step(
        &mut self,
        batch: &DataBatch,
        _batch_idx: usize,
        log: &mut dyn MetricLog,
    ) -> Result<Tensor, TrainingError> {
        let (loss, value) = self.forward_loss(batch)?;
        log.log(TEST_LOSS, value);
        Ok(loss.detach())
    }

    fn model(&self) -> &dyn TrainableModel {
        self.model.as_ref()
    }

    fn model_mut(&mut self) -> &mut dyn TrainableModel {
        self.model.as_mut()
    }

    fn hparams(&self) -> serde_json::Value {
        serde_json::to_value(&self.hparams).unwrap_or(serde_json::Value::Null)
    }
}

/// Values logged during one optimizer step, in logging order.
#[derive(Debug, Clone, Default)]
pub struct StepMetrics {
    pub values: Vec<(String, f64)>,
}

impl MetricLog for StepMetrics {
    fn log(&mut self, name: &str, value: f64) {
        self.values.push((name.to_string(), value));
    }
}

/// Per-name means over an evaluation epoch.
#[derive(Debug, Clone, Default)]
pub struct EpochMetrics {
    accumulators: BTreeMap<String, MeanAccumulator>,
}

impl EpochMetrics {
    pub fn take(&mut self) -> BTreeMap<String, f64> {
        std::mem::take(&mut self.accumulators)
            .into_iter()
            .filter_map(|(name, mut acc)| acc.take().map(|mean| (name, mean)))
            .collect()
    }
}

impl MetricLog for EpochMetrics {
    fn log(&mut self, name: &str, value: f64) {
        self.accumulators
            .entry(name.to_string())
            .or_default()
            .update(value);
    }
}

/// Settings of a `train_multi` run.
#[derive(Debug, Clone, Serialize)]
pub struct HarnessConfig {
    pub task: String,
    pub seed: u64,
    pub batch_size: usize,
    pub workers: usize,
    pub input_dir: PathBuf,
    pub checkpoint_dir: PathBuf,
    pub epochs: usize,
    pub weight_decay: f64,
    pub lr0: f64,
    pub pct_start: Option<f64>,
    pub model_size: ModelSize,
    /// TensorBoard root; `None` keeps scalars in memory only.
    pub log_dir: Option<PathBuf>,
    pub device: DeviceKind,
}

impl HarnessConfig {
    pub fn new(task: impl Into<String>) -> Self {
        Self {
            task: task.into(),
            seed: 0,
            batch_size: 16,
            workers: 8,
            input_dir: PathBuf::new(),
            checkpoint_dir: PathBuf::from("./checkpoints/"),
            epochs: 10,
            weight_decay: 1e-2,
            lr0: 1e-4,
            pct_start: None,
            model_size: ModelSize::Small,
            log_dir: Some(PathBuf::from("./runs")),
            device: DeviceKind::Auto,
        }
    }

    pub fn precision(&self) -> Precision {
        Precision::Mixed16
    }

    /// `<checkpoint_dir>/<task>-<epochs>e`
    pub fn run_checkpoint_dir(&self) -> PathBuf {
        self.checkpoint_dir
            .join(format!("{}-{}e", self.task, self.epochs))
    }

    pub fn project(&self) -> String {
        format!("SpearTTS-{}", self.task)
    }

    pub fn validate(&self) -> Result<(), TrainingError> {
        let mut errors = Vec::new();
        if self.task.trim().is_empty() {
            errors.push("--task is required".to_string());
        }
        if self.batch_size == 0 {
            errors.push("--batch-size must be greater than 0".to_string());
        }
        if self.epochs == 0 {
            errors.push("--epochs must be greater than 0".to_string());
        }
        if self.lr0 <= 0.0 {
            errors.push("--lr0 must be greater than 0".to_string());
        }
        if self.weight_decay < 0.0 {
            errors.push("--weight-decay must be >= 0".to_string());
        }
        if let Some(pct) = self.pct_start {
            if !(0.0 < pct && pct < 1.0) {
                errors.push("--pct-start must be in (0, 1)".to_string());
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(TrainingError::validation(errors))
        }
    }

    pub fn runtime_settings(&self) -> RuntimeSettings {
        RuntimeSettings {
            epochs: self.epochs,
            precision: self.precision(),
            autocast: None,
            loss_scale: LossScaleConfig::default(),
            accumulate_grad_batches: 1,
            checkpoint_dir: self.run_checkpoint_dir(),
            checkpoint_prefix: self.task.clone(),
            save_top_k: SAVE_TOP_K,
        }
    }
}

/// Builds the task, loaders and local runtime described by `config` and fits.
pub fn run(
    config: &HarnessConfig,
    registry: &TaskRegistry,
    progress: Option<Box<dyn ProgressSink>>,
    stop: StopFlag,
) -> Result<FitSummary, TrainingError> {
    config.validate()?;
    let task = registry.get(&config.task)?;
    let device = select_device(config.device, config.seed)?;

    let datasets = (task.load_datasets)(&config.input_dir)?;
    let mut train_loader = BatchLoader::new(
        datasets.train,
        LoaderConfig::new(config.batch_size, config.workers, true, config.seed),
    )?;
    let mut val_loader = BatchLoader::new(
        datasets.val,
        LoaderConfig::new(config.batch_size, config.workers, false, config.seed),
    )?;

    let model = (task.make_model)(config.model_size, &device)?;
    let mut module = TaskModule::new(
        model,
        ModuleHparams {
            lr0: config.lr0,
            weight_decay: config.weight_decay,
            pct_start: config.pct_start,
            epochs: config.epochs,
            decay_dense_biases: false,
        },
    );

    let logger = match config.log_dir.as_ref() {
        Some(root) => ExperimentLogger::new(
            config.project(),
            LoggingSettings::new(false, Some(root.clone()), 1),
        )?,
        None => ExperimentLogger::disabled(config.project()),
    };
    let mut runtime =
        LocalRuntime::new(config.runtime_settings(), device, logger)?.with_stop_flag(stop);
    if let Some(progress) = progress {
        runtime = runtime.with_progress(progress);
    }
    runtime.fit(&mut module, &mut train_loader, &mut val_loader)
}
