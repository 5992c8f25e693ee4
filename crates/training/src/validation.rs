use crate::{
    config::to_runtime_error,
    data::{BatchLoader, DataBatch},
    device::Placement,
    model::TrainableModel,
    TrainingError,
};

/// Mean loss of `model` over one pass of `loader`.
///
/// The model runs in inference mode with detached outputs, so no gradient
/// graph is kept and parameters are left untouched. The previous mode is
/// restored even when a batch fails. An empty loader yields NaN.
pub fn validate<M>(
    model: &mut M,
    loader: &mut BatchLoader,
    placement: &Placement,
) -> Result<f64, TrainingError>
where
    M: TrainableModel + ?Sized,
{
    let was_training = model.is_training();
    model.set_training(false);
    let result = mean_loss(&*model, loader, placement, |_, _| {});
    model.set_training(was_training);
    result
}

/// Mean forward loss over `loader`, handing every batch loss to `on_batch`.
///
/// Leaves the model mode alone.
pub(crate) fn mean_loss<M, F>(
    model: &M,
    loader: &mut BatchLoader,
    placement: &Placement,
    mut on_batch: F,
) -> Result<f64, TrainingError>
where
    M: TrainableModel + ?Sized,
    F: FnMut(&DataBatch, f64),
{
    let mut total = 0.0;
    let mut batches = 0usize;
    for batch in loader.epoch() {
        let batch = placement.place(batch?)?;
        let (_, loss) = model.forward(&batch.tensors).map_err(to_runtime_error)?;
        let loss = loss
            .detach()
            .to_dtype(candle_core::DType::F32)
            .and_then(|loss| loss.to_scalar::<f32>())
            .map_err(to_runtime_error)? as f64;
        on_batch(&batch, loss);
        total += loss;
        batches += 1;
    }
    if batches == 0 {
        return Ok(f64::NAN);
    }
    Ok(total / batches as f64)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{
        config::Precision,
        data::{LoaderConfig, TensorDataset},
        model::{ModuleKind, NamedParameter, ParamRole},
    };
    use candle_core::{Device, Tensor, Var};

    struct Scale {
        weight: Var,
        training: bool,
        fail_on: Option<f32>,
    }

    impl TrainableModel for Scale {
        fn forward(&self, inputs: &[Tensor]) -> candle_core::Result<(Tensor, Tensor)> {
            let x = &inputs[0];
            if let Some(bad) = self.fail_on {
                if x.to_vec1::<f32>()?.contains(&bad) {
                    candle_core::bail!("bad batch");
                }
            }
            let out = x.broadcast_mul(self.weight.as_tensor())?;
            let loss = out.mean_all()?;
            Ok((out, loss))
        }

        fn parameters(&self) -> Vec<NamedParameter> {
            vec![NamedParameter::new(
                "w",
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

    fn loader(values: &[f32], batch_size: usize) -> BatchLoader {
        let samples = values
            .iter()
            .map(|v| vec![Tensor::new(*v, &Device::Cpu).unwrap()])
            .collect();
        BatchLoader::new(
            Arc::new(TensorDataset::new(samples)),
            LoaderConfig::new(batch_size, 0, false, 0),
        )
        .unwrap()
    }

    fn cpu() -> Placement {
        Placement::new(Device::Cpu, Precision::Fp32)
    }

    fn model(fail_on: Option<f32>) -> Scale {
        Scale {
            weight: Var::new(&[2.0f32], &Device::Cpu).unwrap(),
            training: true,
            fail_on,
        }
    }

    #[test]
    fn averages_batch_losses_and_restores_mode() {
        let mut model = model(None);
        // batches [1, 2] and [3] -> losses 3 and 6
        let loss = validate(&mut model, &mut loader(&[1.0, 2.0, 3.0], 2), &cpu()).unwrap();
        assert!((loss - 4.5).abs() < 1e-6);
        assert!(model.is_training());
        assert_eq!(model.weight.as_tensor().to_vec1::<f32>().unwrap(), vec![2.0]);
    }

    #[test]
    fn empty_loader_yields_nan() {
        let mut model = model(None);
        let loss = validate(&mut model, &mut loader(&[], 2), &cpu()).unwrap();
        assert!(loss.is_nan());
    }

    #[test]
    fn mode_is_restored_after_a_failing_batch() {
        let mut model = model(Some(3.0));
        let result = validate(&mut model, &mut loader(&[1.0, 2.0, 3.0], 2), &cpu());
        assert!(result.is_err());
        assert!(model.is_training());
    }
}
