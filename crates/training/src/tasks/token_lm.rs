//! Next-token language model over pre-tokenised text.
//!
//! Each line of `train.txt` / `val.txt` holds whitespace separated token ids.
//! A line becomes one `(input_ids, target_ids)` sample where targets are the
//! inputs shifted left by one. Samples are truncated or padded to a fixed
//! context; padded target positions carry [`IGNORE_INDEX`] and do not count
//! towards the loss.

use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use candle_core::{DType, Device, Result as CandleResult, Tensor, D};
use candle_nn::{Conv1d, Conv1dConfig, Dropout, Embedding, Linear, Module, VarBuilder, VarMap};

use super::{ModelSize, TaskDatasets, TaskEntry};
use crate::{
    config::to_runtime_error,
    data::{self, Dataset},
    loss::CrossEntropyLoss,
    model::{ModuleKind, NamedParameter, ParamRole, TrainableModel},
    TrainingError,
};

pub const NAME: &str = "token_lm";
pub const VOCAB_SIZE: usize = 1024;
pub const CONTEXT: usize = 64;
pub const PAD_ID: u32 = 0;
pub const IGNORE_INDEX: u32 = u32::MAX;

const KERNEL_SIZE: usize = 3;
const DROPOUT: f32 = 0.1;

pub fn entry() -> TaskEntry {
    TaskEntry {
        name: NAME,
        load_datasets,
        make_model,
    }
}

fn load_datasets(input_dir: &Path) -> Result<TaskDatasets, TrainingError> {
    let train = TokenLmDataset::from_file(input_dir.join("train.txt"), CONTEXT)?;
    let val = TokenLmDataset::from_file(input_dir.join("val.txt"), CONTEXT)?;
    log::info!(
        "token_lm: {} training and {} validation samples from {}",
        train.len(),
        val.len(),
        input_dir.display()
    );
    Ok(TaskDatasets {
        train: Arc::new(train),
        val: Arc::new(val),
    })
}

fn make_model(size: ModelSize, device: &Device) -> Result<Box<dyn TrainableModel>, TrainingError> {
    Ok(Box::new(TokenLm::new(TokenLmConfig::for_size(size), device)?))
}

#[derive(Debug, Clone)]
pub struct TokenLmDataset {
    samples: Vec<(Vec<u32>, Vec<u32>)>,
}

impl TokenLmDataset {
    pub fn from_file(path: impl Into<PathBuf>, context: usize) -> Result<Self, TrainingError> {
        let path = path.into();
        let text = fs::read_to_string(&path).map_err(|err| {
            TrainingError::initialization(format!("failed to read {}: {err}", path.display()))
        })?;
        Self::parse(&text, context)
            .map_err(|msg| TrainingError::initialization(format!("{}: {msg}", path.display())))
    }

    /// Parses one sample per line; lines with fewer than two tokens are skipped.
    pub fn parse(text: &str, context: usize) -> Result<Self, String> {
        if context == 0 {
            return Err("context must be greater than zero".to_string());
        }
        let mut samples = Vec::new();
        for (line_no, line) in text.lines().enumerate() {
            let ids = line
                .split_whitespace()
                .map(|token| {
                    let id: u32 = token
                        .parse()
                        .map_err(|_| format!("line {}: invalid token id '{token}'", line_no + 1))?;
                    if id as usize >= VOCAB_SIZE {
                        return Err(format!(
                            "line {}: token id {id} outside vocabulary of {VOCAB_SIZE}",
                            line_no + 1
                        ));
                    }
                    Ok(id)
                })
                .collect::<Result<Vec<u32>, String>>()?;
            if ids.len() < 2 {
                continue;
            }
            let window = &ids[..ids.len().min(context + 1)];
            let mut input = window[..window.len() - 1].to_vec();
            let mut target = window[1..].to_vec();
            input.resize(context, PAD_ID);
            target.resize(context, IGNORE_INDEX);
            samples.push((input, target));
        }
        Ok(Self { samples })
    }
}

impl Dataset for TokenLmDataset {
    fn len(&self) -> usize {
        self.samples.len()
    }

    fn get(&self, index: usize) -> data::Result<Vec<Tensor>> {
        let (input, target) = self.samples.get(index).ok_or_else(|| {
            TrainingError::runtime(format!(
                "sample {index} out of range for dataset of {}",
                self.samples.len()
            ))
        })?;
        let input = Tensor::new(input.as_slice(), &Device::Cpu).map_err(to_runtime_error)?;
        let target = Tensor::new(target.as_slice(), &Device::Cpu).map_err(to_runtime_error)?;
        Ok(vec![input, target])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenLmConfig {
    pub vocab_size: usize,
    pub embed_dim: usize,
    pub hidden_dim: usize,
}

impl TokenLmConfig {
    pub fn for_size(size: ModelSize) -> Self {
        let (embed_dim, hidden_dim) = match size {
            ModelSize::Tiny => (32, 64),
            ModelSize::Small => (128, 256),
            ModelSize::Base => (256, 512),
        };
        Self {
            vocab_size: VOCAB_SIZE,
            embed_dim,
            hidden_dim,
        }
    }
}

/// Embedding, causal convolution, GELU, linear head.
pub struct TokenLm {
    embed: Embedding,
    conv: Conv1d,
    dropout: Dropout,
    head: Linear,
    loss: CrossEntropyLoss,
    parameters: Vec<NamedParameter>,
    training: bool,
}

impl TokenLm {
    pub fn new(config: TokenLmConfig, device: &Device) -> Result<Self, TrainingError> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let embed = candle_nn::embedding(config.vocab_size, config.embed_dim, vb.pp("embed"))
            .map_err(init_error)?;
        let conv = candle_nn::conv1d(
            config.embed_dim,
            config.hidden_dim,
            KERNEL_SIZE,
            Conv1dConfig::default(),
            vb.pp("conv"),
        )
        .map_err(init_error)?;
        let head = candle_nn::linear(config.hidden_dim, config.vocab_size, vb.pp("head"))
            .map_err(init_error)?;

        let parameters = {
            let vars = varmap.data().lock().map_err(|_| {
                TrainingError::initialization("token_lm parameter map lock poisoned")
            })?;
            let layout = [
                ("embed.weight", ModuleKind::Other, ParamRole::Weight),
                ("conv.weight", ModuleKind::Conv1d, ParamRole::Weight),
                ("conv.bias", ModuleKind::Conv1d, ParamRole::Bias),
                ("head.weight", ModuleKind::Linear, ParamRole::Weight),
                ("head.bias", ModuleKind::Linear, ParamRole::Bias),
            ];
            layout
                .into_iter()
                .map(|(name, module, role)| {
                    vars.get(name)
                        .map(|var| NamedParameter::new(name, var.clone(), module, role))
                        .ok_or_else(|| {
                            TrainingError::initialization(format!("token_lm is missing {name}"))
                        })
                })
                .collect::<Result<Vec<_>, _>>()?
        };

        Ok(Self {
            embed,
            conv,
            dropout: Dropout::new(DROPOUT),
            head,
            loss: CrossEntropyLoss::new().with_ignore_index(Some(IGNORE_INDEX)),
            parameters,
            training: true,
        })
    }

    fn logits(&self, input_ids: &Tensor) -> CandleResult<Tensor> {
        let x = self.embed.forward(input_ids)?;
        // (B, T, C) -> (B, C, T), left padded so position t only sees t-2..=t
        let x = x
            .transpose(1, 2)?
            .pad_with_zeros(D::Minus1, KERNEL_SIZE - 1, 0)?;
        let x = self.conv.forward(&x)?.transpose(1, 2)?.gelu()?;
        let x = self.dropout.forward(&x, self.training)?;
        self.head.forward(&x)
    }
}

impl TrainableModel for TokenLm {
    fn forward(&self, inputs: &[Tensor]) -> CandleResult<(Tensor, Tensor)> {
        let [input_ids, target_ids] = inputs else {
            candle_core::bail!("token_lm expects (input_ids, target_ids), got {} tensors", inputs.len());
        };
        let logits = self.logits(input_ids)?;
        let loss = self.loss.compute(&logits, target_ids)?;
        Ok((logits, loss))
    }

    fn parameters(&self) -> Vec<NamedParameter> {
        self.parameters.clone()
    }

    fn set_training(&mut self, training: bool) {
        self.training = training;
    }

    fn is_training(&self) -> bool {
        self.training
    }
}

fn init_error(err: candle_core::Error) -> TrainingError {
    TrainingError::initialization(format!("failed to build token_lm: {err}"))
}
