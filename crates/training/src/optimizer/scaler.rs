//! Dynamic loss scaling for 16-bit mixed precision.
//!
//! The scaler multiplies the loss before backward, divides the gradients
//! afterwards and reports whether any of them overflowed. Overflowing steps
//! are skipped by the caller and the scale backs off; a run of clean steps
//! grows it again.

use candle_core::{backprop::GradStore, DType, Tensor};

use crate::{config::to_runtime_error, TrainingError};

#[derive(Debug, Clone)]
pub struct LossScaleConfig {
    pub initial_scale: f64,
    pub growth_factor: f64,
    pub backoff_factor: f64,
    pub growth_interval: usize,
}

impl Default for LossScaleConfig {
    fn default() -> Self {
        Self {
            initial_scale: 65536.0,
            growth_factor: 2.0,
            backoff_factor: 0.5,
            growth_interval: 2000,
        }
    }
}

#[derive(Debug, Clone)]
pub struct GradientScaler {
    enabled: bool,
    scale: f64,
    clean_steps: usize,
    config: LossScaleConfig,
}

impl GradientScaler {
    pub fn with_config(config: LossScaleConfig, enabled: bool) -> Self {
        let config = sanitize(config);
        Self {
            enabled,
            scale: if enabled { config.initial_scale } else { 1.0 },
            clean_steps: 0,
            config,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn loss_scale(&self) -> f64 {
        self.scale
    }

    pub fn scale(&self, loss: &Tensor) -> Result<Tensor, TrainingError> {
        if !self.enabled {
            return Ok(loss.clone());
        }
        loss.affine(self.scale, 0.0).map_err(to_runtime_error)
    }

    /// Divides the gradients of `params` by the current scale in place.
    ///
    /// Returns `true` when any of them holds a non-finite value.
    pub fn unscale(&self, grads: &mut GradStore, params: &[Tensor]) -> Result<bool, TrainingError> {
        if !self.enabled {
            return Ok(false);
        }
        let inv = 1.0 / self.scale;
        let mut found_inf = false;
        for param in params {
            let Some(grad) = grads.remove(param) else {
                continue;
            };
            let unscaled = grad.affine(inv, 0.0).map_err(to_runtime_error)?;
            if !is_finite(&unscaled)? {
                found_inf = true;
            }
            grads.insert(param, unscaled);
        }
        Ok(found_inf)
    }

    pub fn update(&mut self, found_inf: bool) {
        if !self.enabled {
            return;
        }
        if found_inf {
            self.scale *= self.config.backoff_factor;
            self.clean_steps = 0;
            log::debug!("non-finite gradients, loss scale backed off to {}", self.scale);
        } else {
            self.clean_steps += 1;
            if self.clean_steps >= self.config.growth_interval {
                self.scale *= self.config.growth_factor;
                self.clean_steps = 0;
            }
        }
    }
}

fn is_finite(tensor: &Tensor) -> Result<bool, TrainingError> {
    if tensor.elem_count() == 0 {
        return Ok(true);
    }
    let total = tensor
        .to_dtype(DType::F32)
        .and_then(|t| t.abs())
        .and_then(|t| t.sum_all())
        .and_then(|t| t.to_vec0::<f32>())
        .map_err(to_runtime_error)?;
    Ok(total.is_finite())
}

fn sanitize(mut config: LossScaleConfig) -> LossScaleConfig {
    if config.growth_factor < 1.0 {
        config.growth_factor = 1.0;
    }
    if !(0.0 < config.backoff_factor && config.backoff_factor < 1.0) {
        config.backoff_factor = 0.5;
    }
    if config.growth_interval == 0 {
        config.growth_interval = 1;
    }
    if config.initial_scale <= 0.0 {
        config.initial_scale = 1.0;
    }
    config
}
