//! Closed set of trainable tasks.
//!
//! A task knows how to load its train/validation datasets from an input
//! directory and how to build a model of a given size. Binaries resolve the
//! task by name through [`TaskRegistry::builtin`].

pub mod token_lm;

use std::{fmt, path::Path, str::FromStr, sync::Arc};

use candle_core::Device;
use serde::{Deserialize, Serialize};

use crate::{data::Dataset, model::TrainableModel, TrainingError};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelSize {
    Tiny,
    #[default]
    Small,
    Base,
}

impl ModelSize {
    pub const ALL: [ModelSize; 3] = [ModelSize::Tiny, ModelSize::Small, ModelSize::Base];

    pub fn as_str(self) -> &'static str {
        match self {
            ModelSize::Tiny => "tiny",
            ModelSize::Small => "small",
            ModelSize::Base => "base",
        }
    }
}

impl fmt::Display for ModelSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModelSize {
    type Err = TrainingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ModelSize::ALL
            .into_iter()
            .find(|size| size.as_str() == s)
            .ok_or_else(|| {
                TrainingError::initialization(format!(
                    "unknown model size '{s}' (expected tiny, small or base)"
                ))
            })
    }
}

pub struct TaskDatasets {
    pub train: Arc<dyn Dataset>,
    pub val: Arc<dyn Dataset>,
}

pub type LoadDatasetsFn = fn(&Path) -> Result<TaskDatasets, TrainingError>;
pub type MakeModelFn = fn(ModelSize, &Device) -> Result<Box<dyn TrainableModel>, TrainingError>;

#[derive(Clone, Copy)]
pub struct TaskEntry {
    pub name: &'static str,
    pub load_datasets: LoadDatasetsFn,
    pub make_model: MakeModelFn,
}

impl fmt::Debug for TaskEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskEntry").field("name", &self.name).finish()
    }
}

#[derive(Debug, Clone)]
pub struct TaskRegistry {
    entries: Vec<TaskEntry>,
}

impl TaskRegistry {
    pub fn builtin() -> Self {
        Self {
            entries: vec![token_lm::entry()],
        }
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.entries.iter().map(|entry| entry.name).collect()
    }

    pub fn get(&self, name: &str) -> Result<&TaskEntry, TrainingError> {
        self.entries
            .iter()
            .find(|entry| entry.name == name)
            .ok_or_else(|| {
                TrainingError::initialization(format!(
                    "unknown task '{}' (known tasks: {})",
                    name,
                    self.names().join(", ")
                ))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_task_lists_known_ones() {
        let registry = TaskRegistry::builtin();
        assert!(registry.get("token_lm").is_ok());
        let err = registry.get("s2a").unwrap_err().to_string();
        assert!(err.contains("unknown task 's2a'"), "{err}");
        assert!(err.contains("token_lm"), "{err}");
    }

    #[test]
    fn model_sizes_parse_from_their_names() {
        assert_eq!("base".parse::<ModelSize>().unwrap(), ModelSize::Base);
        assert_eq!(ModelSize::default(), ModelSize::Small);
        assert!("huge".parse::<ModelSize>().is_err());
    }
}
