pub mod factory;
pub mod scaler;

pub use factory::{
    build_optimization, default_pct_start, step_schedule, OptimizationParams, OptimizationSetup,
};
pub use scaler::{GradientScaler, LossScaleConfig};

use candle_core::{backprop::GradStore, DType, Tensor, Var};

use crate::{config::to_runtime_error, model::NamedParameter, TrainingError};

const EPS: f64 = 1e-12;

#[derive(Debug, Clone, Copy)]
pub struct AdamWConfig {
    pub learning_rate: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub epsilon: f64,
}

impl Default for AdamWConfig {
    fn default() -> Self {
        Self {
            learning_rate: 1e-4,
            beta1: 0.9,
            beta2: 0.95,
            epsilon: 1e-8,
        }
    }
}

/// Parameters sharing one weight-decay coefficient.
#[derive(Debug, Clone)]
pub struct ParamGroup {
    pub weight_decay: f64,
    pub params: Vec<NamedParameter>,
}

#[derive(Debug, Clone)]
pub struct TrainerOptimizerOptions {
    pub use_master_weights: bool,
}

impl Default for TrainerOptimizerOptions {
    fn default() -> Self {
        Self {
            use_master_weights: true,
        }
    }
}

/// AdamW with decoupled weight decay applied per parameter group.
#[derive(Debug)]
pub struct TrainerOptimizer {
    config: AdamWConfig,
    group_weight_decay: Vec<f64>,
    params: Vec<ParameterSlot>,
    step: usize,
}

#[derive(Debug)]
struct ParameterSlot {
    name: String,
    param: Var,
    dtype: DType,
    master: Option<Var>,
    first_moment: Tensor,
    second_moment: Tensor,
    group: usize,
}

impl TrainerOptimizer {
    pub fn new(
        groups: Vec<ParamGroup>,
        config: AdamWConfig,
        options: TrainerOptimizerOptions,
    ) -> Result<Self, TrainingError> {
        if groups.iter().all(|group| group.params.is_empty()) {
            return Err(TrainingError::initialization(
                "optimizer requires at least one parameter",
            ));
        }

        let mut group_weight_decay = Vec::with_capacity(groups.len());
        let mut params = Vec::new();
        for (group_index, group) in groups.into_iter().enumerate() {
            group_weight_decay.push(group.weight_decay);
            for named in group.params {
                let tensor = named.var.as_tensor();
                if !tensor.dtype().is_float() {
                    return Err(TrainingError::initialization(format!(
                        "optimizer received non-floating parameter '{}'",
                        named.name
                    )));
                }
                let device = tensor.device();
                let shape = tensor.dims().to_vec();
                let dtype = tensor.dtype();

                let first_moment = Tensor::zeros(shape.as_slice(), DType::F32, device)
                    .map_err(to_runtime_error)?;
                let second_moment = Tensor::zeros(shape.as_slice(), DType::F32, device)
                    .map_err(to_runtime_error)?;

                let master = if options.use_master_weights && dtype != DType::F32 {
                    let fp32 = tensor.to_dtype(DType::F32).map_err(to_runtime_error)?;
                    Some(Var::from_tensor(&fp32).map_err(to_runtime_error)?)
                } else {
                    None
                };

                params.push(ParameterSlot {
                    name: named.name,
                    param: named.var,
                    dtype,
                    master,
                    first_moment,
                    second_moment,
                    group: group_index,
                });
            }
        }

        Ok(Self {
            config,
            group_weight_decay,
            params,
            step: 0,
        })
    }

    pub fn learning_rate(&self) -> f64 {
        self.config.learning_rate
    }

    pub fn set_learning_rate(&mut self, lr: f64) {
        self.config.learning_rate = lr;
    }

    pub fn beta1(&self) -> f64 {
        self.config.beta1
    }

    pub fn set_beta1(&mut self, beta1: f64) {
        self.config.beta1 = beta1;
    }

    pub fn weight_decay(&self, group: usize) -> Option<f64> {
        self.group_weight_decay.get(group).copied()
    }

    pub fn steps_taken(&self) -> usize {
        self.step
    }

    pub fn parameter_names(&self) -> impl Iterator<Item = &str> {
        self.params.iter().map(|slot| slot.name.as_str())
    }

    /// Tensors tracked by the optimizer, in slot order.
    pub fn tensors(&self) -> Vec<Tensor> {
        self.params
            .iter()
            .map(|slot| slot.param.as_tensor().clone())
            .collect()
    }

    /// Applies one AdamW update with the gradients found in `grads`.
    ///
    /// Parameters without a gradient are left untouched.
    pub fn step(&mut self, grads: &mut GradStore) -> Result<(), TrainingError> {
        let mut processed = Vec::new();
        for (index, slot) in self.params.iter().enumerate() {
            let Some(grad) = grads.remove(slot.param.as_tensor()) else {
                continue;
            };
            let grad = grad.to_dtype(DType::F32).map_err(to_runtime_error)?;
            processed.push((index, grad));
        }

        if processed.is_empty() {
            return Ok(());
        }

        self.step += 1;
        let cfg = self.config;
        let bias_correction1 = 1.0 - cfg.beta1.powi(self.step as i32);
        let bias_correction2 = 1.0 - cfg.beta2.powi(self.step as i32);
        let scale_m = if bias_correction1.abs() < EPS {
            1.0
        } else {
            1.0 / bias_correction1
        };
        let scale_v = if bias_correction2.abs() < EPS {
            1.0
        } else {
            1.0 / bias_correction2
        };

        for (index, grad) in processed {
            let weight_decay = self.group_weight_decay[self.params[index].group];
            let slot = &mut self.params[index];

            let prev_m = slot
                .first_moment
                .affine(cfg.beta1, 0.0)
                .map_err(to_runtime_error)?;
            let grad_term = grad
                .affine(1.0 - cfg.beta1, 0.0)
                .map_err(to_runtime_error)?;
            let new_m = prev_m.add(&grad_term).map_err(to_runtime_error)?;

            let grad_sq = grad.sqr().map_err(to_runtime_error)?;
            let prev_v = slot
                .second_moment
                .affine(cfg.beta2, 0.0)
                .map_err(to_runtime_error)?;
            let grad_sq_term = grad_sq
                .affine(1.0 - cfg.beta2, 0.0)
                .map_err(to_runtime_error)?;
            let new_v = prev_v.add(&grad_sq_term).map_err(to_runtime_error)?;

            let m_hat = new_m.affine(scale_m, 0.0).map_err(to_runtime_error)?;
            let v_hat = new_v.affine(scale_v, 0.0).map_err(to_runtime_error)?;
            let denom = v_hat
                .sqrt()
                .map_err(to_runtime_error)?
                .affine(1.0, cfg.epsilon)
                .map_err(to_runtime_error)?;
            let update = m_hat
                .div(&denom)
                .map_err(to_runtime_error)?
                .affine(cfg.learning_rate, 0.0)
                .map_err(to_runtime_error)?;

            let base = match slot.master.as_ref() {
                Some(master) => master.as_tensor().clone(),
                None => slot
                    .param
                    .as_tensor()
                    .to_dtype(DType::F32)
                    .map_err(to_runtime_error)?,
            };

            let decayed = if weight_decay != 0.0 {
                base.affine(1.0 - cfg.learning_rate * weight_decay, 0.0)
                    .map_err(to_runtime_error)?
            } else {
                base
            };

            let next = decayed.sub(&update).map_err(to_runtime_error)?;

            if let Some(master) = slot.master.as_ref() {
                master.set(&next).map_err(to_runtime_error)?;
            }
            let cast = if slot.dtype == DType::F32 {
                next
            } else {
                next.to_dtype(slot.dtype).map_err(to_runtime_error)?
            };
            slot.param.set(&cast).map_err(to_runtime_error)?;

            slot.first_moment = new_m;
            slot.second_moment = new_v;
        }

        Ok(())
    }

    pub fn zero_grad(&self, grads: &mut GradStore) {
        for slot in &self.params {
            let _ = grads.remove(slot.param.as_tensor());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ModuleKind, ParamRole};
    use candle_core::Device;

    fn param(name: &str, values: &[f32]) -> NamedParameter {
        let var = Var::from_slice(values, values.len(), &Device::Cpu).unwrap();
        NamedParameter::new(name, var, ModuleKind::Linear, ParamRole::Weight)
    }

    fn values(param: &NamedParameter) -> Vec<f32> {
        param.var.as_tensor().to_vec1::<f32>().unwrap()
    }

    #[test]
    fn weight_decay_only_touches_its_group() {
        let decayed = param("decayed", &[1.0, 2.0]);
        let exempt = param("exempt", &[1.0, 2.0]);
        let mut optimizer = TrainerOptimizer::new(
            vec![
                ParamGroup {
                    weight_decay: 0.5,
                    params: vec![decayed.clone()],
                },
                ParamGroup {
                    weight_decay: 0.0,
                    params: vec![exempt.clone()],
                },
            ],
            AdamWConfig {
                learning_rate: 0.1,
                ..AdamWConfig::default()
            },
            TrainerOptimizerOptions::default(),
        )
        .unwrap();

        // zero gradients leave only the decoupled decay term
        let loss = ((decayed.var.as_tensor() + exempt.var.as_tensor()).unwrap() * 0.0)
            .unwrap()
            .sum_all()
            .unwrap();
        let mut grads = loss.backward().unwrap();
        optimizer.step(&mut grads).unwrap();

        assert_eq!(optimizer.steps_taken(), 1);
        let shrunk = values(&decayed);
        assert!((shrunk[0] - 0.95).abs() < 1e-6);
        assert!((shrunk[1] - 1.90).abs() < 1e-6);
        assert_eq!(values(&exempt), vec![1.0, 2.0]);
    }

    #[test]
    fn step_moves_against_the_gradient() {
        let weight = param("w", &[3.0]);
        let mut optimizer = TrainerOptimizer::new(
            vec![ParamGroup {
                weight_decay: 0.0,
                params: vec![weight.clone()],
            }],
            AdamWConfig {
                learning_rate: 0.1,
                ..AdamWConfig::default()
            },
            TrainerOptimizerOptions::default(),
        )
        .unwrap();

        for _ in 0..5 {
            let loss = weight.var.as_tensor().sqr().unwrap().sum_all().unwrap();
            let mut grads = loss.backward().unwrap();
            optimizer.step(&mut grads).unwrap();
        }
        assert!(values(&weight)[0] < 3.0);
    }

    #[test]
    fn rejects_empty_groups() {
        let result = TrainerOptimizer::new(
            vec![ParamGroup {
                weight_decay: 0.1,
                params: vec![],
            }],
            AdamWConfig::default(),
            TrainerOptimizerOptions::default(),
        );
        assert!(matches!(result, Err(TrainingError::Initialization(_))));
    }
}
