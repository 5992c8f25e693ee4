use candle_core::{DType, Result, Tensor, D};
use candle_nn::ops;

/// Mean token-level cross entropy with an optional ignored target id.
#[derive(Debug, Clone, Default)]
pub struct CrossEntropyLoss {
    ignore_index: Option<u32>,
}

impl CrossEntropyLoss {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ignore_index(mut self, ignore_index: Option<u32>) -> Self {
        self.ignore_index = ignore_index;
        self
    }

    /// `logits` is `[..., vocab]`, `targets` holds the leading dimensions.
    ///
    /// Positions whose target equals the ignore index contribute nothing and
    /// are left out of the mean.
    pub fn compute(&self, logits: &Tensor, targets: &Tensor) -> Result<Tensor> {
        let dims = logits.dims();
        if dims.len() < 2 {
            candle_core::bail!("cross entropy expects logits with at least two dimensions");
        }
        let vocab_size = dims[dims.len() - 1];
        let token_dims = &dims[..dims.len() - 1];
        if targets.dims() != token_dims {
            candle_core::bail!(
                "target shape {:?} does not match logits shape {:?}",
                targets.dims(),
                dims
            );
        }
        let token_count: usize = token_dims.iter().product();

        let logits = logits
            .reshape((token_count, vocab_size))?
            .to_dtype(DType::F32)?;
        let log_probs = ops::log_softmax(&logits, D::Minus1)?;
        let targets = targets
            .to_device(logits.device())?
            .reshape((token_count,))?
            .to_dtype(DType::U32)?;

        let (targets, mask) = match self.ignore_index {
            Some(ignore) => {
                let keep = targets.ne(ignore)?;
                // ignored ids may be out of vocabulary, point them at 0 before gathering
                let safe = keep.where_cond(&targets, &targets.zeros_like()?)?;
                (safe, keep.to_dtype(DType::F32)?)
            }
            None => {
                let ones = Tensor::ones((token_count,), DType::F32, logits.device())?;
                (targets, ones)
            }
        };

        let valid = mask.sum_all()?.to_scalar::<f32>()?;
        if valid == 0.0 {
            candle_core::bail!("no valid targets remain after applying ignore_index");
        }

        let nll = log_probs
            .gather(&targets.unsqueeze(1)?, 1)?
            .squeeze(1)?
            .neg()?;
        (nll * mask)?.sum_all()?.affine(1.0 / valid as f64, 0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn uniform_logits_give_log_vocab() {
        let logits = Tensor::zeros((2, 3, 4), DType::F32, &Device::Cpu).unwrap();
        let targets = Tensor::new(&[[0u32, 1, 2], [3, 0, 1]], &Device::Cpu).unwrap();
        let loss = CrossEntropyLoss::new()
            .compute(&logits, &targets)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!((loss - 4f32.ln()).abs() < 1e-5);
    }

    #[test]
    fn ignored_positions_are_excluded() {
        // first position is confidently right, second would be wrong but is ignored
        let logits = Tensor::new(&[[10.0f32, 0.0], [10.0, 0.0]], &Device::Cpu).unwrap();
        let targets = Tensor::new(&[0u32, u32::MAX], &Device::Cpu).unwrap();
        let loss = CrossEntropyLoss::new()
            .with_ignore_index(Some(u32::MAX))
            .compute(&logits, &targets)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!(loss < 1e-3);
    }

    #[test]
    fn all_ignored_is_an_error() {
        let logits = Tensor::zeros((1, 2), DType::F32, &Device::Cpu).unwrap();
        let targets = Tensor::new(&[7u32], &Device::Cpu).unwrap();
        let result = CrossEntropyLoss::new()
            .with_ignore_index(Some(7))
            .compute(&logits, &targets);
        assert!(result.is_err());
    }
}
