use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
};

use candle_core::safetensors::load as load_safetensors;

use crate::{config::to_runtime_error, model::TrainableModel, TrainingError};

const CHECKPOINT_EXTENSION: &str = "pt";
const RANKED_EXTENSION: &str = "safetensors";

/// File name for the checkpoint written after `step` samples.
pub fn checkpoint_file_name(step: usize) -> String {
    format!("{:08}.{}", step, CHECKPOINT_EXTENSION)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointRecord {
    pub step: usize,
    pub path: PathBuf,
    pub bytes: u64,
}

/// Writes model weights into a flat directory, one file per step.
///
/// Files are never read back, rotated or replaced atomically.
#[derive(Debug, Clone)]
pub struct CheckpointWriter {
    directory: PathBuf,
}

impl CheckpointWriter {
    pub fn new(directory: impl Into<PathBuf>) -> Result<Self, TrainingError> {
        let directory = directory.into();
        create_dir(&directory)?;
        Ok(Self { directory })
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn save<M>(&self, step: usize, model: &M) -> Result<CheckpointRecord, TrainingError>
    where
        M: TrainableModel + ?Sized,
    {
        let path = self.directory.join(checkpoint_file_name(step));
        let bytes = save_model_weights(model, &path)?;
        log::info!("checkpoint written to {} ({} bytes)", path.display(), bytes);
        Ok(CheckpointRecord { step, path, bytes })
    }
}

/// Keeps the `k` best checkpoints by a monitored value, lower being better.
#[derive(Debug)]
pub struct TopKCheckpoints {
    directory: PathBuf,
    prefix: String,
    k: usize,
    kept: Vec<RankedCheckpoint>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RankedCheckpoint {
    pub score: f64,
    pub epoch: usize,
    pub step: usize,
    pub path: PathBuf,
}

impl TopKCheckpoints {
    pub fn new(
        directory: impl Into<PathBuf>,
        prefix: impl Into<String>,
        k: usize,
    ) -> Result<Self, TrainingError> {
        let directory = directory.into();
        create_dir(&directory)?;
        Ok(Self {
            directory,
            prefix: prefix.into(),
            k,
            kept: Vec::new(),
        })
    }

    /// Renders `<prefix>-epoch=<epoch>-step=<step>-val_loss=<score:.2>`.
    pub fn file_stem(&self, epoch: usize, step: usize, score: f64) -> String {
        format!(
            "{}-epoch={}-step={}-val_loss={:.2}",
            self.prefix, epoch, step, score
        )
    }

    pub fn kept(&self) -> &[RankedCheckpoint] {
        &self.kept
    }

    pub fn best(&self) -> Option<&RankedCheckpoint> {
        self.kept.first()
    }

    /// Saves `model` if `score` ranks among the best `k`, evicting the worst.
    ///
    /// Returns the written checkpoint, or `None` when the score did not rank.
    /// A NaN score ranks as +inf.
    pub fn consider<M>(
        &mut self,
        epoch: usize,
        step: usize,
        score: f64,
        model: &M,
    ) -> Result<Option<RankedCheckpoint>, TrainingError>
    where
        M: TrainableModel + ?Sized,
    {
        if self.k == 0 {
            return Ok(None);
        }
        let ranked_score = if score.is_nan() { f64::INFINITY } else { score };
        if self.kept.len() >= self.k {
            let worst = self.kept.last().map(|c| c.score).unwrap_or(f64::INFINITY);
            if ranked_score >= worst {
                return Ok(None);
            }
        }

        let path = self.unique_path(&self.file_stem(epoch, step, score));
        save_model_weights(model, &path)?;
        let entry = RankedCheckpoint {
            score: ranked_score,
            epoch,
            step,
            path,
        };
        let position = self
            .kept
            .iter()
            .position(|c| ranked_score < c.score)
            .unwrap_or(self.kept.len());
        self.kept.insert(position, entry.clone());

        while self.kept.len() > self.k {
            if let Some(evicted) = self.kept.pop() {
                log::debug!("removing checkpoint {}", evicted.path.display());
                fs::remove_file(&evicted.path).map_err(|err| {
                    TrainingError::runtime(format!(
                        "failed to remove checkpoint {}: {err}",
                        evicted.path.display()
                    ))
                })?;
            }
        }

        Ok(Some(entry))
    }

    fn unique_path(&self, stem: &str) -> PathBuf {
        let mut path = self.directory.join(format!("{stem}.{RANKED_EXTENSION}"));
        let mut version = 1;
        while path.exists() {
            path = self
                .directory
                .join(format!("{stem}-v{version}.{RANKED_EXTENSION}"));
            version += 1;
        }
        path
    }
}

/// Loads weights written by [`CheckpointWriter`] or [`TopKCheckpoints`] into `model`.
pub fn apply_model_weights<M>(model: &M, path: &Path) -> Result<(), TrainingError>
where
    M: TrainableModel + ?Sized,
{
    let parameters = model.parameters();
    let Some(first) = parameters.first() else {
        return Err(TrainingError::runtime("model contains no parameters"));
    };
    let device = first.var.as_tensor().device().clone();
    let mut by_name: HashMap<String, _> = load_safetensors(path, &device)
        .map_err(to_runtime_error)?
        .into_iter()
        .collect();

    for param in &parameters {
        let tensor = by_name.remove(&param.name).ok_or_else(|| {
            TrainingError::runtime(format!("checkpoint missing parameter {}", param.name))
        })?;
        let dtype = param.var.as_tensor().dtype();
        let tensor = tensor.to_dtype(dtype).map_err(to_runtime_error)?;
        param.var.set(&tensor).map_err(to_runtime_error)?;
    }

    if !by_name.is_empty() {
        let mut extra: Vec<_> = by_name.into_keys().collect();
        extra.sort();
        return Err(TrainingError::runtime(format!(
            "checkpoint contains unused parameters: {}",
            extra.join(", ")
        )));
    }
    Ok(())
}

fn save_model_weights<M>(model: &M, path: &Path) -> Result<u64, TrainingError>
where
    M: TrainableModel + ?Sized,
{
    let parameters = model.parameters();
    if parameters.is_empty() {
        return Err(TrainingError::runtime(
            "model contains no parameters to checkpoint",
        ));
    }
    let tensors: HashMap<String, _> = parameters
        .into_iter()
        .map(|param| (param.name, param.var.as_tensor().clone()))
        .collect();
    candle_core::safetensors::save(&tensors, path).map_err(|err| {
        TrainingError::runtime(format!(
            "failed to serialize model weights to {}: {err}",
            path.display()
        ))
    })?;
    let bytes = fs::metadata(path)?.len();
    Ok(bytes)
}

fn create_dir(directory: &Path) -> Result<(), TrainingError> {
    fs::create_dir_all(directory).map_err(|err| {
        TrainingError::runtime(format!(
            "failed to create checkpoint directory {}: {err}",
            directory.display()
        ))
    })
}
