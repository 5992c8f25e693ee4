use candle_core::{
    utils::{cuda_is_available, metal_is_available},
    DType, Device,
};

use crate::{
    config::{to_runtime_error, DeviceKind, Precision},
    data::DataBatch,
    model::{ModuleKind, NamedParameter, ParamRole},
    TrainingError,
};

/// Resolves the configured device, preferring Metal then CUDA for `auto`.
///
/// `auto` falls back to the CPU when an accelerator fails to initialise; an
/// explicit accelerator request fails instead.
pub fn select_device(kind: DeviceKind, seed: u64) -> Result<Device, TrainingError> {
    let device = match kind {
        DeviceKind::Cpu => Device::Cpu,
        DeviceKind::Cuda => Device::new_cuda(0).map_err(|err| {
            TrainingError::initialization(format!("failed to initialise CUDA device: {err}"))
        })?,
        DeviceKind::Metal => Device::new_metal(0).map_err(|err| {
            TrainingError::initialization(format!("failed to initialise Metal device: {err}"))
        })?,
        DeviceKind::Auto => {
            let cuda_available = cuda_is_available();
            let metal_available = metal_is_available();
            log::debug!(
                "device detection: cuda_available={} metal_available={}",
                cuda_available,
                metal_available
            );
            if metal_available {
                Device::new_metal(0).unwrap_or_else(|err| {
                    log::warn!("failed to initialise Metal device, falling back to CPU: {err}");
                    Device::Cpu
                })
            } else if cuda_available {
                Device::new_cuda(0).unwrap_or_else(|err| {
                    log::warn!("failed to initialise CUDA device, falling back to CPU: {err}");
                    Device::Cpu
                })
            } else {
                Device::Cpu
            }
        }
    };

    log::info!(
        "device selected: is_cuda={} is_metal={} is_cpu={}",
        device.is_cuda(),
        device.is_metal(),
        device.is_cpu()
    );
    if let Err(err) = device.set_seed(seed) {
        log::warn!("failed to seed device RNG: {err}");
    }
    Ok(device)
}

/// Whether autocast and loss scaling apply by default: mixed precision on an
/// accelerator.
pub fn mixed_precision_active(precision: Precision, device: &Device) -> bool {
    precision.is_mixed() && !device.is_cpu()
}

/// Moves batches to the compute device.
///
/// With autocast on, floating inputs are cast to the compute dtype, which
/// [`Placement::matching`] takes from the model's floating parameters so the
/// forward pass never mixes dtypes. Integer inputs are only moved.
#[derive(Debug, Clone)]
pub struct Placement {
    device: Device,
    autocast: bool,
    compute_dtype: DType,
}

impl Placement {
    pub fn new(device: Device, precision: Precision) -> Self {
        let autocast = mixed_precision_active(precision, &device);
        Self {
            device,
            autocast,
            compute_dtype: DType::F32,
        }
    }

    pub fn with_autocast(mut self, autocast: bool) -> Self {
        self.autocast = autocast;
        self
    }

    /// Uses the dtype of the first floating parameter as compute dtype.
    pub fn matching(mut self, parameters: &[NamedParameter]) -> Self {
        if let Some(dtype) = parameters
            .iter()
            .map(|param| param.var.as_tensor().dtype())
            .find(|dtype| dtype.is_float())
        {
            self.compute_dtype = dtype;
        }
        self
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn autocast(&self) -> bool {
        self.autocast
    }

    pub fn compute_dtype(&self) -> DType {
        self.compute_dtype
    }

    pub fn place(&self, batch: DataBatch) -> Result<DataBatch, TrainingError> {
        let mut batch = batch.to_device(&self.device)?;
        if self.autocast {
            for tensor in batch.tensors.iter_mut() {
                if tensor.dtype().is_float() && tensor.dtype() != self.compute_dtype {
                    *tensor = tensor
                        .to_dtype(self.compute_dtype)
                        .map_err(to_runtime_error)?;
                }
            }
        }
        Ok(batch)
    }
}
