//! Optimizer and schedule construction shared by both harnesses.

use crate::{
    model::{partition_parameters, NamedParameter},
    scheduler::{LRScheduler, OneCycleConfig, OneCycleLr},
    TrainingError,
};

use super::{AdamWConfig, ParamGroup, TrainerOptimizer, TrainerOptimizerOptions};

/// Warm-up fraction used when none is configured: about 10k updates, capped at 30%.
pub fn default_pct_start(planned_steps: f64) -> f64 {
    if planned_steps <= 0.0 {
        return 0.3;
    }
    (10_000.0 / planned_steps).min(0.3)
}

#[derive(Debug, Clone)]
pub struct OptimizationParams {
    pub learning_rate: f64,
    pub weight_decay: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub epsilon: f64,
    pub pct_start: Option<f64>,
    pub total_steps: usize,
    pub decay_dense_biases: bool,
}

impl OptimizationParams {
    pub fn new(learning_rate: f64, weight_decay: f64, total_steps: usize) -> Self {
        let adam = AdamWConfig::default();
        Self {
            learning_rate,
            weight_decay,
            beta1: adam.beta1,
            beta2: adam.beta2,
            epsilon: adam.epsilon,
            pct_start: None,
            total_steps,
            decay_dense_biases: false,
        }
    }
}

pub struct OptimizationSetup {
    pub optimizer: TrainerOptimizer,
    pub scheduler: OneCycleLr,
    /// Warm-up fraction actually used, after defaulting.
    pub pct_start: f64,
    pub total_steps: usize,
}

pub fn build_optimization(
    parameters: Vec<NamedParameter>,
    params: &OptimizationParams,
) -> Result<OptimizationSetup, TrainingError> {
    let groups = partition_parameters(parameters, params.decay_dense_biases)?;
    log::debug!(
        "optimizer groups: {} decayed, {} exempt",
        groups.decay.len(),
        groups.no_decay.len()
    );

    let pct_start = params
        .pct_start
        .unwrap_or_else(|| default_pct_start(params.total_steps as f64));
    let scheduler = OneCycleConfig::new(params.learning_rate, params.total_steps, pct_start).build()?;

    let mut optimizer = TrainerOptimizer::new(
        vec![
            ParamGroup {
                weight_decay: params.weight_decay,
                params: groups.decay,
            },
            ParamGroup {
                weight_decay: 0.0,
                params: groups.no_decay,
            },
        ],
        AdamWConfig {
            learning_rate: scheduler.learning_rate(),
            beta1: params.beta1,
            beta2: params.beta2,
            epsilon: params.epsilon,
        },
        TrainerOptimizerOptions::default(),
    )?;
    if let Some(momentum) = scheduler.momentum() {
        optimizer.set_beta1(momentum);
    }

    Ok(OptimizationSetup {
        optimizer,
        scheduler,
        pct_start,
        total_steps: params.total_steps,
    })
}

/// Advances `scheduler` and pushes its rate and momentum into `optimizer`.
pub fn step_schedule(scheduler: &mut dyn LRScheduler, optimizer: &mut TrainerOptimizer) -> f64 {
    let lr = scheduler.step();
    optimizer.set_learning_rate(lr);
    if let Some(momentum) = scheduler.momentum() {
        optimizer.set_beta1(momentum);
    }
    lr
}
