use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Instant,
};

use candle_core::{DType, Device};

use crate::{
    checkpoint::{CheckpointRecord, CheckpointWriter},
    config::{to_runtime_error, Precision, TrainingConfig},
    data::{BatchLoader, LoaderConfig},
    device::{mixed_precision_active, select_device, Placement},
    logging::{ExperimentLogger, LoggingSettings, LEARNING_RATE, TRAIN_LOSS, VAL_LOSS},
    metrics::RunningLoss,
    model::TrainableModel,
    optimizer::{
        build_optimization, default_pct_start, step_schedule, GradientScaler, LossScaleConfig,
        OptimizationParams, OptimizationSetup, TrainerOptimizer,
    },
    progress::{summary_row, ProgressSink, SUMMARY_COLUMNS},
    tasks::{TaskDatasets, TaskRegistry},
    validation::validate,
    visual::Visual,
    TrainingError,
};

/// First validation fires once this many samples have been seen.
pub const FIRST_VALIDATION_AT: usize = 50;

/// Settings of the hand-rolled loop, resolved from a [`TrainingConfig`].
#[derive(Debug, Clone)]
pub struct LoopConfig {
    pub checkpoint_dir: PathBuf,
    pub batch_size: usize,
    pub num_workers: usize,
    pub seed: u64,
    pub epochs: usize,
    pub learning_rate: f64,
    pub weight_decay: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub epsilon: f64,
    pub decay_dense_biases: bool,
    pub pct_start: Option<f64>,
    pub precision: Precision,
    /// Forces autocast and loss scaling on or off. `None` enables both for
    /// mixed precision on an accelerator.
    pub autocast: Option<bool>,
    pub loss_scale: LossScaleConfig,
    /// Cadences below are in samples, not steps.
    pub checkpoint_every_iters: usize,
    pub validation_every_iters: usize,
    pub table_row_every_iters: usize,
    pub first_validation_at: usize,
}

impl LoopConfig {
    pub fn from_training_config(config: &TrainingConfig) -> Self {
        Self {
            checkpoint_dir: config.runtime.checkpoint.directory.clone(),
            batch_size: config.data.batch_size,
            num_workers: config.data.num_workers,
            seed: config.runtime.seed,
            epochs: config.schedule.epochs,
            learning_rate: config.optimizer.learning_rate,
            weight_decay: config.optimizer.weight_decay,
            beta1: config.optimizer.beta1,
            beta2: config.optimizer.beta2,
            epsilon: config.optimizer.epsilon,
            decay_dense_biases: config.optimizer.decay_dense_biases,
            pct_start: config.schedule.pct_start,
            precision: config.runtime.precision(),
            autocast: None,
            loss_scale: LossScaleConfig::default(),
            checkpoint_every_iters: config.checkpoint_every_iters(),
            validation_every_iters: config.runtime.validation.every_n_iters,
            table_row_every_iters: config.runtime.table_row_every_iters,
            first_validation_at: FIRST_VALIDATION_AT,
        }
    }
}

/// Shared flag raised to stop the loop between steps.
#[derive(Debug, Clone, Default)]
pub struct StopFlag(Arc<AtomicBool>);

impl StopFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    Interrupted,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    NotStarted,
    Running,
    Stopped(RunOutcome),
}

#[derive(Debug, Clone)]
pub struct RunSummary {
    pub steps: usize,
    /// Sample counter `it` at the end of the run.
    pub samples: usize,
    pub train_loss: f64,
    pub val_loss: f64,
    pub checkpoints: Vec<CheckpointRecord>,
    pub outcome: RunOutcome,
}

/// Counters advanced by the loop.
struct Cursor {
    it: usize,
    steps: usize,
    next_checkpoint_it: usize,
    next_val_it: usize,
    next_table_it: usize,
    train_loss: f64,
    val_loss: f64,
    checkpoints: Vec<CheckpointRecord>,
    started: Instant,
}

/// Hand-rolled training loop.
///
/// Runs `epochs * ceil(n / batch_size)` optimizer steps. Side effects are
/// keyed on the sample counter `it`: after every step the checkpoint,
/// validation and table cadences are checked in that order, then `it`
/// advances by the configured batch size.
pub struct Trainer<V, P> {
    config: LoopConfig,
    model: Box<dyn TrainableModel>,
    train_loader: BatchLoader,
    val_loader: BatchLoader,
    placement: Placement,
    optimization: OptimizationSetup,
    scaler: GradientScaler,
    checkpoints: CheckpointWriter,
    running_loss: RunningLoss,
    visual: V,
    progress: P,
    logger: Option<ExperimentLogger>,
    stop: StopFlag,
    state: RunState,
}

impl<V, P> Trainer<V, P>
where
    V: Visual,
    P: ProgressSink,
{
    pub fn new(
        model: Box<dyn TrainableModel>,
        datasets: TaskDatasets,
        device: Device,
        config: LoopConfig,
        visual: V,
        progress: P,
    ) -> Result<Self, TrainingError> {
        let train_len = datasets.train.len();
        if train_len == 0 {
            return Err(TrainingError::initialization("training dataset is empty"));
        }
        let train_loader = BatchLoader::new(
            datasets.train,
            LoaderConfig::new(config.batch_size, config.num_workers, true, config.seed),
        )?;
        let val_loader = BatchLoader::new(
            datasets.val,
            LoaderConfig::new(config.batch_size, config.num_workers, false, config.seed),
        )?;

        let total_steps = config.epochs * train_loader.len();
        let planned = (config.epochs * train_len) as f64 / config.batch_size as f64;
        let pct_start = config.pct_start.unwrap_or_else(|| default_pct_start(planned));
        let optimization = build_optimization(
            model.parameters(),
            &OptimizationParams {
                learning_rate: config.learning_rate,
                weight_decay: config.weight_decay,
                beta1: config.beta1,
                beta2: config.beta2,
                epsilon: config.epsilon,
                pct_start: Some(pct_start),
                total_steps,
                decay_dense_biases: config.decay_dense_biases,
            },
        )?;
        let mixed = config
            .autocast
            .unwrap_or_else(|| mixed_precision_active(config.precision, &device));
        let scaler = GradientScaler::with_config(config.loss_scale.clone(), mixed);
        let placement = Placement::new(device, config.precision)
            .with_autocast(mixed)
            .matching(&model.parameters());
        let checkpoints = CheckpointWriter::new(&config.checkpoint_dir)?;
        log::info!(
            "manual loop: {} epochs x {} batches, pct_start={:.4}, precision={}, compute dtype {:?}, loss scaling {}",
            config.epochs,
            train_loader.len(),
            pct_start,
            config.precision,
            placement.compute_dtype(),
            if scaler.is_enabled() { "on" } else { "off" }
        );

        Ok(Self {
            placement,
            config,
            model,
            train_loader,
            val_loader,
            optimization,
            scaler,
            checkpoints,
            running_loss: RunningLoss::default(),
            visual,
            progress,
            logger: None,
            stop: StopFlag::new(),
            state: RunState::NotStarted,
        })
    }

    /// Resolves the task, device and datasets named by `config`.
    ///
    /// `make_visual` receives the x-axis extent, `epochs * dataset_len`.
    pub fn from_config<F>(
        config: &TrainingConfig,
        registry: &TaskRegistry,
        make_visual: F,
        progress: P,
    ) -> Result<Self, TrainingError>
    where
        F: FnOnce(usize) -> V,
    {
        config.validate()?;
        let task = registry.get(&config.task.name)?;
        let device = select_device(config.runtime.device, config.runtime.seed)?;
        let datasets = (task.load_datasets)(&config.task.input_dir)?;
        let model = (task.make_model)(config.task.model_size, &device)?;
        let loop_config = LoopConfig::from_training_config(config);
        let visual = make_visual(loop_config.epochs * datasets.train.len());
        let trainer = Self::new(model, datasets, device, loop_config, visual, progress)?;

        let logging = &config.runtime.logging;
        if logging.enable_stdout || logging.tensorboard_dir.is_some() {
            let mut logger = ExperimentLogger::new(
                format!("SpearTTS-{}", config.task.name),
                LoggingSettings::new(
                    logging.enable_stdout,
                    logging.tensorboard_dir.clone(),
                    logging.flush_every_n,
                ),
            )?;
            logger.log_hyperparams(&serde_json::to_value(config)?)?;
            return Ok(trainer.with_logger(logger));
        }
        Ok(trainer)
    }

    pub fn with_logger(mut self, logger: ExperimentLogger) -> Self {
        self.logger = Some(logger);
        self
    }

    pub fn with_stop_flag(mut self, stop: StopFlag) -> Self {
        self.stop = stop;
        self
    }

    pub fn stop_flag(&self) -> StopFlag {
        self.stop.clone()
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn total_steps(&self) -> usize {
        self.optimization.total_steps
    }

    pub fn pct_start(&self) -> f64 {
        self.optimization.pct_start
    }

    pub fn learning_rate(&self) -> f64 {
        self.optimization.optimizer.learning_rate()
    }

    pub fn model(&self) -> &dyn TrainableModel {
        self.model.as_ref()
    }

    pub fn scaler(&self) -> &GradientScaler {
        &self.scaler
    }

    pub fn optimizer(&self) -> &TrainerOptimizer {
        &self.optimization.optimizer
    }

    pub fn visual(&self) -> &V {
        &self.visual
    }

    pub fn progress(&self) -> &P {
        &self.progress
    }

    /// Runs every epoch, or until the stop flag is raised.
    ///
    /// Whatever happens, the final summary row is written, the bars are
    /// shown and the visual is hidden before returning. An interrupt is not
    /// an error; any other failure is returned after that cleanup.
    pub fn run(&mut self) -> Result<RunSummary, TrainingError> {
        if self.state != RunState::NotStarted {
            return Err(TrainingError::runtime("trainer has already been run"));
        }
        self.state = RunState::Running;
        self.model.set_training(true);

        let mut cursor = Cursor {
            it: 0,
            steps: 0,
            next_checkpoint_it: self.config.checkpoint_every_iters,
            next_val_it: self.config.first_validation_at,
            next_table_it: self.config.table_row_every_iters,
            train_loss: f64::NAN,
            val_loss: f64::NAN,
            checkpoints: Vec::new(),
            started: Instant::now(),
        };

        self.visual.show();
        self.progress.start(self.config.epochs);
        self.progress.write_header(&SUMMARY_COLUMNS);

        let result = self.run_epochs(&mut cursor);
        if let Ok(RunOutcome::Interrupted) = result {
            log::warn!("training interrupted after {} steps", cursor.steps);
            self.progress.write_notice("interrupted");
            self.progress.show();
        }

        self.write_table_row(&cursor);
        self.progress.show();
        self.visual.hide();
        if let Some(logger) = self.logger.as_mut() {
            if let Err(err) = logger.flush() {
                log::warn!("failed to flush experiment log: {err}");
            }
        }

        let outcome = match &result {
            Ok(outcome) => *outcome,
            Err(_) => RunOutcome::Failed,
        };
        self.state = RunState::Stopped(outcome);
        result.map(|outcome| RunSummary {
            steps: cursor.steps,
            samples: cursor.it,
            train_loss: cursor.train_loss,
            val_loss: cursor.val_loss,
            checkpoints: cursor.checkpoints,
            outcome,
        })
    }

    fn run_epochs(&mut self, cursor: &mut Cursor) -> Result<RunOutcome, TrainingError> {
        let epochs = self.config.epochs;
        for epoch in 0..epochs {
            self.progress.epoch_bar(self.train_loader.len());
            let mut batches = self.train_loader.epoch();
            loop {
                if self.stop.is_raised() {
                    return Ok(RunOutcome::Interrupted);
                }
                let Some(batch) = batches.next_batch()? else {
                    break;
                };

                let loss = self.train_step(batch)?;
                log::trace!("region running_loss");
                cursor.train_loss = self.running_loss.push(loss);
                cursor.steps += 1;

                self.run_cadences(cursor)?;

                cursor.it += self.config.batch_size;
                let comment = format!(
                    "#{}/{} loss: {:.3} / {:.3}",
                    epoch + 1,
                    epochs,
                    cursor.train_loss,
                    cursor.val_loss
                );
                self.progress.advance(&comment);
            }
            self.progress.finish_epoch();
        }
        Ok(RunOutcome::Completed)
    }

    /// One optimization step; returns the raw loss.
    fn train_step(&mut self, batch: crate::data::DataBatch) -> Result<f64, TrainingError> {
        log::trace!("region forward");
        let batch = self.placement.place(batch)?;
        let (_, loss) = self
            .model
            .forward(&batch.tensors)
            .map_err(to_runtime_error)?;

        log::trace!("region backward");
        let scaled = self.scaler.scale(&loss)?;
        let mut grads = scaled.backward().map_err(to_runtime_error)?;
        let OptimizationSetup {
            optimizer,
            scheduler,
            ..
        } = &mut self.optimization;
        let found_inf = self.scaler.unscale(&mut grads, &optimizer.tensors())?;
        if found_inf {
            log::debug!("skipping optimizer step with non-finite gradients");
            optimizer.zero_grad(&mut grads);
        } else {
            optimizer.step(&mut grads)?;
        }
        self.scaler.update(found_inf);
        step_schedule(scheduler, optimizer);

        let loss = loss
            .to_dtype(DType::F32)
            .and_then(|loss| loss.to_scalar::<f32>())
            .map_err(to_runtime_error)?;
        Ok(loss as f64)
    }

    fn run_cadences(&mut self, cursor: &mut Cursor) -> Result<(), TrainingError> {
        let it = cursor.it;

        if it >= cursor.next_checkpoint_it {
            log::trace!("region checkpoint");
            cursor.next_checkpoint_it += self.config.checkpoint_every_iters;
            let record = self.checkpoints.save(it, self.model.as_ref())?;
            cursor.checkpoints.push(record);
        }

        if it >= cursor.next_val_it {
            cursor.next_val_it += self.config.validation_every_iters;
            log::trace!("region validation");
            cursor.val_loss = validate(self.model.as_mut(), &mut self.val_loader, &self.placement)?;
            log::debug!("validation at {} samples: {:.5}", it, cursor.val_loss);

            log::trace!("region plotting");
            let lr = self.optimization.optimizer.learning_rate();
            self.visual.add_data(it, lr, cursor.train_loss, cursor.val_loss);
            if let Some(logger) = self.logger.as_mut() {
                logger.log_scalar(TRAIN_LOSS, it, cursor.train_loss)?;
                logger.log_scalar(VAL_LOSS, it, cursor.val_loss)?;
                logger.log_scalar(LEARNING_RATE, it, lr)?;
            }
        }

        if it >= cursor.next_table_it {
            self.write_table_row(cursor);
            cursor.next_table_it += self.config.table_row_every_iters;
        }
        Ok(())
    }

    fn write_table_row(&mut self, cursor: &Cursor) {
        let row = summary_row(
            cursor.it,
            cursor.train_loss,
            cursor.val_loss,
            cursor.started.elapsed(),
        );
        self.progress.write_row(&row);
    }
}
