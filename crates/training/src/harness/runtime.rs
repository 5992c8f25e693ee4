use std::{collections::BTreeMap, path::PathBuf, time::Instant};

use candle_core::{backprop::GradStore, Device, Tensor};

use super::{EpochMetrics, RuntimeInfo, StepMetrics, TrainingModule};
use crate::{
    checkpoint::{RankedCheckpoint, TopKCheckpoints},
    config::{to_runtime_error, Precision},
    data::BatchLoader,
    device::{mixed_precision_active, Placement},
    logging::{ExperimentLogger, LEARNING_RATE, TEST_LOSS, TRAIN_LOSS, VAL_LOSS},
    optimizer::{step_schedule, GradientScaler, LossScaleConfig},
    progress::{format_time, ProgressSink},
    trainer::{RunOutcome, StopFlag},
    TrainingError,
};

const EPOCH_COLUMNS: [&str; 5] = ["epoch", "step", "train", "val_loss", "time"];

/// Drives a [`TrainingModule`] through fitting and testing.
pub trait TrainerRuntime {
    fn num_devices(&self) -> usize;

    fn fit(
        &mut self,
        module: &mut dyn TrainingModule,
        train: &mut BatchLoader,
        val: &mut BatchLoader,
    ) -> Result<FitSummary, TrainingError>;

    /// Runs the test hook over `test`, returning the mean `test_loss`.
    fn test(
        &mut self,
        module: &mut dyn TrainingModule,
        test: &mut BatchLoader,
    ) -> Result<f64, TrainingError>;
}

#[derive(Debug, Clone)]
pub struct RuntimeSettings {
    pub epochs: usize,
    pub precision: Precision,
    /// Forces autocast and loss scaling on or off. `None` enables both for
    /// mixed precision on an accelerator.
    pub autocast: Option<bool>,
    pub loss_scale: LossScaleConfig,
    pub accumulate_grad_batches: usize,
    pub checkpoint_dir: PathBuf,
    pub checkpoint_prefix: String,
    pub save_top_k: usize,
}

#[derive(Debug, Clone)]
pub struct FitSummary {
    pub epochs_run: usize,
    pub global_step: usize,
    pub total_steps: usize,
    pub pct_start: f64,
    /// Mean validation loss after every finished epoch.
    pub val_losses: Vec<f64>,
    /// Retained checkpoints, best first.
    pub checkpoints: Vec<RankedCheckpoint>,
    pub outcome: RunOutcome,
}

impl FitSummary {
    pub fn best(&self) -> Option<&RankedCheckpoint> {
        self.checkpoints.first()
    }
}

#[derive(Debug, Clone, Copy)]
enum Stage {
    Validation,
    Test,
}

/// Single-device runtime.
///
/// Optimizer steps happen every `accumulate_grad_batches` batches and at the
/// end of each epoch; the schedule advances once per optimizer step. After
/// every epoch the validation hook runs and the best `save_top_k`
/// checkpoints by `val_loss` are kept.
pub struct LocalRuntime {
    settings: RuntimeSettings,
    placement: Placement,
    logger: ExperimentLogger,
    checkpoints: TopKCheckpoints,
    progress: Option<Box<dyn ProgressSink>>,
    stop: StopFlag,
    global_step: usize,
}

impl LocalRuntime {
    pub fn new(
        settings: RuntimeSettings,
        device: Device,
        logger: ExperimentLogger,
    ) -> Result<Self, TrainingError> {
        if settings.epochs == 0 {
            return Err(TrainingError::initialization("epochs must be greater than 0"));
        }
        let checkpoints = TopKCheckpoints::new(
            &settings.checkpoint_dir,
            settings.checkpoint_prefix.clone(),
            settings.save_top_k,
        )?;
        let mixed = settings
            .autocast
            .unwrap_or_else(|| mixed_precision_active(settings.precision, &device));
        Ok(Self {
            placement: Placement::new(device, settings.precision).with_autocast(mixed),
            settings,
            logger,
            checkpoints,
            progress: None,
            stop: StopFlag::new(),
            global_step: 0,
        })
    }

    pub fn with_progress(mut self, progress: Box<dyn ProgressSink>) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn with_stop_flag(mut self, stop: StopFlag) -> Self {
        self.stop = stop;
        self
    }

    pub fn global_step(&self) -> usize {
        self.global_step
    }

    pub fn logger(&self) -> &ExperimentLogger {
        &self.logger
    }

    fn log_all(&mut self, values: &[(String, f64)]) -> Result<(), TrainingError> {
        for (name, value) in values {
            self.logger.log_scalar(name, self.global_step, *value)?;
        }
        Ok(())
    }

    fn run_stage(
        &mut self,
        module: &mut dyn TrainingModule,
        loader: &mut BatchLoader,
        stage: Stage,
    ) -> Result<BTreeMap<String, f64>, TrainingError> {
        self.placement = self.placement.clone().matching(&module.model().parameters());
        let was_training = module.model().is_training();
        module.model_mut().set_training(false);
        let result = evaluate(module, loader, &self.placement, stage);
        module.model_mut().set_training(was_training);
        let means = result?;
        let values: Vec<_> = means.iter().map(|(k, v)| (k.clone(), *v)).collect();
        self.log_all(&values)?;
        Ok(means)
    }
}

impl TrainerRuntime for LocalRuntime {
    fn num_devices(&self) -> usize {
        1
    }

    fn fit(
        &mut self,
        module: &mut dyn TrainingModule,
        train: &mut BatchLoader,
        val: &mut BatchLoader,
    ) -> Result<FitSummary, TrainingError> {
        let epochs = self.settings.epochs;
        let accumulate = self.settings.accumulate_grad_batches.max(1);
        let info = RuntimeInfo {
            train_batches: train.len(),
            accumulate_grad_batches: accumulate,
            num_devices: self.num_devices(),
            epochs,
        };
        let mut setup = module.configure_optimizers(&info)?;
        self.placement = self.placement.clone().matching(&module.model().parameters());
        let mut scaler =
            GradientScaler::with_config(self.settings.loss_scale.clone(), self.placement.autocast());
        self.logger.log_hyperparams(&module.hparams())?;
        log::info!(
            "fitting {} epochs of {} batches ({} optimizer steps, pct_start={:.4}, precision={})",
            epochs,
            info.train_batches,
            setup.total_steps,
            setup.pct_start,
            self.settings.precision
        );

        if let Some(progress) = self.progress.as_mut() {
            progress.start(epochs);
            progress.write_header(&EPOCH_COLUMNS);
        }

        let started = Instant::now();
        let mut val_losses = Vec::with_capacity(epochs);
        let mut outcome = RunOutcome::Completed;
        let mut epochs_run = 0;

        'epochs: for epoch in 0..epochs {
            module.model_mut().set_training(true);
            if let Some(progress) = self.progress.as_mut() {
                progress.epoch_bar(info.train_batches);
            }

            let mut accumulated: Option<GradStore> = None;
            let mut pending = 0usize;
            let mut pending_logs: Vec<(String, f64)> = Vec::new();
            let mut train_loss = f64::NAN;
            let mut batches = train.epoch();
            loop {
                if self.stop.is_raised() {
                    outcome = RunOutcome::Interrupted;
                    break 'epochs;
                }
                let Some(batch) = batches.next_batch()? else {
                    break;
                };
                let batch = self.placement.place(batch)?;

                let mut step_log = StepMetrics::default();
                let loss = module.training_step(&batch, batch.index, &mut step_log)?;
                for (name, value) in &step_log.values {
                    if name == TRAIN_LOSS {
                        train_loss = *value;
                    }
                }
                pending_logs.extend(step_log.values);

                let loss = if accumulate > 1 {
                    loss.affine(1.0 / accumulate as f64, 0.0)
                        .map_err(to_runtime_error)?
                } else {
                    loss
                };
                let grads = scaler
                    .scale(&loss)?
                    .backward()
                    .map_err(to_runtime_error)?;
                let params = setup.optimizer.tensors();
                accumulated = Some(match accumulated.take() {
                    Some(existing) => merge_gradients(existing, grads, &params)?,
                    None => grads,
                });
                pending += 1;

                let last_batch = batch.index + 1 == info.train_batches;
                if pending < accumulate && !last_batch {
                    continue;
                }
                pending = 0;
                let Some(mut grads) = accumulated.take() else {
                    continue;
                };

                let lr = setup.optimizer.learning_rate();
                let found_inf = scaler.unscale(&mut grads, &params)?;
                if found_inf {
                    log::debug!("skipping optimizer step {} with non-finite gradients", self.global_step);
                } else {
                    setup.optimizer.step(&mut grads)?;
                }
                scaler.update(found_inf);
                step_schedule(&mut setup.scheduler, &mut setup.optimizer);
                self.global_step += 1;

                self.logger.log_scalar(LEARNING_RATE, self.global_step, lr)?;
                let logs = std::mem::take(&mut pending_logs);
                self.log_all(&logs)?;
                if let Some(progress) = self.progress.as_mut() {
                    progress.advance(&format!("#{}/{} loss: {:.3}", epoch + 1, epochs, train_loss));
                }
            }
            drop(batches);
            if let Some(progress) = self.progress.as_mut() {
                progress.finish_epoch();
            }

            let means = self.run_stage(module, val, Stage::Validation)?;
            let val_loss = means.get(VAL_LOSS).copied().unwrap_or(f64::NAN);
            val_losses.push(val_loss);
            epochs_run += 1;
            log::info!("epoch {} done at step {}: val_loss={:.5}", epoch, self.global_step, val_loss);

            if let Some(saved) =
                self.checkpoints
                    .consider(epoch, self.global_step, val_loss, module.model())?
            {
                log::info!("checkpoint {} kept", saved.path.display());
            }
            if let Some(progress) = self.progress.as_mut() {
                progress.write_row(&[
                    epoch.to_string(),
                    self.global_step.to_string(),
                    format!("{train_loss:.5}"),
                    format!("{val_loss:.5}"),
                    format_time(started.elapsed()),
                ]);
            }
        }

        if outcome == RunOutcome::Interrupted {
            log::warn!("fit interrupted at step {}", self.global_step);
            if let Some(progress) = self.progress.as_mut() {
                progress.write_notice("interrupted");
            }
        }
        if let Some(progress) = self.progress.as_mut() {
            progress.show();
        }
        self.logger.flush()?;

        Ok(FitSummary {
            epochs_run,
            global_step: self.global_step,
            total_steps: setup.total_steps,
            pct_start: setup.pct_start,
            val_losses,
            checkpoints: self.checkpoints.kept().to_vec(),
            outcome,
        })
    }

    fn test(
        &mut self,
        module: &mut dyn TrainingModule,
        test: &mut BatchLoader,
    ) -> Result<f64, TrainingError> {
        let means = self.run_stage(module, test, Stage::Test)?;
        self.logger.flush()?;
        Ok(means.get(TEST_LOSS).copied().unwrap_or(f64::NAN))
    }
}

fn evaluate(
    module: &mut dyn TrainingModule,
    loader: &mut BatchLoader,
    placement: &Placement,
    stage: Stage,
) -> Result<BTreeMap<String, f64>, TrainingError> {
    let mut metrics = EpochMetrics::default();
    for batch in loader.epoch() {
        let batch = placement.place(batch?)?;
        match stage {
            Stage::Validation => module.validation_step(&batch, batch.index, &mut metrics)?,
            Stage::Test => module.test_step(&batch, batch.index, &mut metrics)?,
        };
    }
    Ok(metrics.take())
}

/// Adds the gradients in `incoming` for `params` onto `existing`.
fn merge_gradients(
    mut existing: GradStore,
    mut incoming: GradStore,
    params: &[Tensor],
) -> Result<GradStore, TrainingError> {
    for param in params {
        let Some(grad) = incoming.remove(param) else {
            continue;
        };
        let merged = match existing.remove(param) {
            Some(current) => current.add(&grad).map_err(to_runtime_error)?,
            None => grad,
        };
        existing.insert(param, merged);
    }
    Ok(existing)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use candle_core::{DType, Var};

    use super::*;
    use crate::{
        data::{Dataset, LoaderConfig, TensorDataset},
        harness::{ModuleHparams, TaskModule},
        model::{ModuleKind, NamedParameter, ParamRole, TrainableModel},
        progress::MemoryProgress,
    };

    struct Line {
        weight: Var,
        training: bool,
    }

    impl TrainableModel for Line {
        fn forward(&self, inputs: &[Tensor]) -> candle_core::Result<(Tensor, Tensor)> {
            let pred = inputs[0].broadcast_mul(self.weight.as_tensor())?;
            let loss = (&pred - &inputs[1])?.sqr()?.mean_all()?;
            Ok((pred, loss))
        }

        fn parameters(&self) -> Vec<NamedParameter> {
            vec![NamedParameter::new(
                "line.weight",
                self.weight.clone(),
                ModuleKind::Linear,
                ParamRole::Weight,
            )]
        }

        fn set_training(&mut self, training: bool) {
            self.training = training;
        }

        fn is_training(&self) -> bool {
            self.training
        }
    }

    fn loader(n: usize, batch_size: usize, shuffle: bool) -> BatchLoader {
        let samples = (0..n)
            .map(|i| {
                let x = (i % 5) as f32 / 5.0;
                vec![
                    Tensor::new(x, &Device::Cpu).unwrap(),
                    Tensor::new(2.0 * x, &Device::Cpu).unwrap(),
                ]
            })
            .collect();
        let dataset: Arc<dyn Dataset> = Arc::new(TensorDataset::new(samples));
        BatchLoader::new(dataset, LoaderConfig::new(batch_size, 0, shuffle, 3)).unwrap()
    }

    fn module() -> TaskModule {
        module_with_dtype(DType::F32)
    }

    fn module_with_dtype(dtype: DType) -> TaskModule {
        TaskModule::new(
            Box::new(Line {
                weight: Var::zeros(1, dtype, &Device::Cpu).unwrap(),
                training: false,
            }),
            ModuleHparams {
                lr0: 1e-2,
                weight_decay: 1e-2,
                pct_start: None,
                epochs: 6,
                decay_dense_biases: false,
            },
        )
    }

    fn settings(dir: &std::path::Path, epochs: usize, accumulate: usize) -> RuntimeSettings {
        RuntimeSettings {
            epochs,
            precision: Precision::Mixed16,
            autocast: None,
            loss_scale: LossScaleConfig::default(),
            accumulate_grad_batches: accumulate,
            checkpoint_dir: dir.join("line-6e"),
            checkpoint_prefix: "line".to_string(),
            save_top_k: 4,
        }
    }

    #[test]
    fn fit_steps_once_per_batch_and_keeps_four_checkpoints() {
        let dir = tempfile::tempdir().unwrap();
        let mut runtime = LocalRuntime::new(
            settings(dir.path(), 6, 1),
            Device::Cpu,
            ExperimentLogger::disabled("SpearTTS-line"),
        )
        .unwrap()
        .with_progress(Box::new(MemoryProgress::default()));
        let mut module = module();
        let summary = runtime
            .fit(&mut module, &mut loader(20, 8, true), &mut loader(10, 8, false))
            .unwrap();

        assert_eq!(summary.outcome, RunOutcome::Completed);
        assert_eq!(summary.total_steps, 18);
        assert_eq!(summary.global_step, 18);
        assert_eq!(summary.val_losses.len(), 6);
        assert_eq!(module.hyper_parameters().pct_start, Some(0.3));

        assert_eq!(summary.checkpoints.len(), 4);
        let files = std::fs::read_dir(dir.path().join("line-6e")).unwrap().count();
        assert_eq!(files, 4);
        let best = summary.best().unwrap();
        assert!(summary.checkpoints.iter().all(|c| best.score <= c.score));
        let name = best.path.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("line-epoch="), "{name}");
        assert!(name.ends_with(".safetensors"), "{name}");
    }

    #[test]
    fn accumulation_divides_the_step_count() {
        let dir = tempfile::tempdir().unwrap();
        let mut runtime = LocalRuntime::new(
            settings(dir.path(), 2, 2),
            Device::Cpu,
            ExperimentLogger::disabled("SpearTTS-line"),
        )
        .unwrap();
        let summary = runtime
            .fit(&mut module(), &mut loader(20, 4, true), &mut loader(5, 4, false))
            .unwrap();
        // five batches per epoch -> three optimizer steps
        assert_eq!(summary.total_steps, 6);
        assert_eq!(summary.global_step, 6);
    }

    #[test]
    fn a_raised_flag_stops_fitting() {
        let dir = tempfile::tempdir().unwrap();
        let stop = StopFlag::new();
        stop.raise();
        let mut runtime = LocalRuntime::new(
            settings(dir.path(), 3, 1),
            Device::Cpu,
            ExperimentLogger::disabled("SpearTTS-line"),
        )
        .unwrap()
        .with_stop_flag(stop);
        let summary = runtime
            .fit(&mut module(), &mut loader(8, 4, true), &mut loader(4, 4, false))
            .unwrap();
        assert_eq!(summary.outcome, RunOutcome::Interrupted);
        assert_eq!(summary.global_step, 0);
        assert!(summary.checkpoints.is_empty());
    }

    #[test]
    fn test_returns_the_mean_and_restores_the_mode() {
        let dir = tempfile::tempdir().unwrap();
        let mut runtime = LocalRuntime::new(
            settings(dir.path(), 1, 1),
            Device::Cpu,
            ExperimentLogger::disabled("SpearTTS-line"),
        )
        .unwrap();
        let mut module = module();
        module.model_mut().set_training(true);
        // weight 0: loss is mean((2x)^2) with x in {0, .2, .4, .6, .8}
        let loss = runtime.test(&mut module, &mut loader(5, 5, false)).unwrap();
        assert!((loss - 0.96).abs() < 1e-5, "{loss}");
        assert!(module.model().is_training());
    }

    #[test]
    fn half_precision_fit_runs_with_loss_scaling() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = settings(dir.path(), 2, 1);
        settings.autocast = Some(true);
        settings.loss_scale = LossScaleConfig {
            initial_scale: 16.0,
            ..LossScaleConfig::default()
        };
        let mut runtime = LocalRuntime::new(
            settings,
            Device::Cpu,
            ExperimentLogger::disabled("SpearTTS-line"),
        )
        .unwrap();
        let mut module = module_with_dtype(DType::F16);
        let summary = runtime
            .fit(&mut module, &mut loader(20, 8, true), &mut loader(10, 8, false))
            .unwrap();

        assert_eq!(runtime.placement.compute_dtype(), DType::F16);
        assert_eq!(summary.global_step, 6);
        assert!(summary.val_losses.iter().all(|loss| loss.is_finite()));
        let weight = module.model().parameters()[0].var.as_tensor().clone();
        assert_eq!(weight.dtype(), DType::F16);
        let weight = weight.to_dtype(DType::F32).unwrap().to_vec1::<f32>().unwrap()[0];
        assert!(weight > 0.0, "{weight}");
    }
}
