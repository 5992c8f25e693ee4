use serde::{Deserialize, Serialize};
use std::{
    fmt, fs,
    str::FromStr,
    path::{Path, PathBuf},
};

use crate::tasks::ModelSize;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    pub task: TaskConfig,
    #[serde(default)]
    pub data: DataConfig,
    #[serde(default)]
    pub optimizer: OptimizerConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

impl TrainingConfig {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, TrainingError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let mut config: TrainingConfig = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&contents)?,
            Some("toml") | Some("tml") | None => toml::from_str(&contents)?,
            Some(other) => {
                return Err(TrainingError::ConfigFormat(format!(
                    "unsupported configuration extension '{}'",
                    other
                )));
            }
        };

        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        config.apply_base_path(base_dir);
        config.validate()?;

        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, TrainingError> {
        Self::from_path(path)
    }

    /// Applies `overrides` in order and re-validates the result.
    pub fn with_overrides(self, overrides: &[ConfigOverride]) -> Result<Self, TrainingError> {
        if overrides.is_empty() {
            return Ok(self);
        }
        let mut value = serde_json::to_value(self)?;
        for item in overrides {
            let (last, parents) = item
                .path
                .split_last()
                .ok_or_else(|| TrainingError::ConfigFormat("empty override path".to_string()))?;
            let mut current = &mut value;
            for segment in parents {
                let map = current.as_object_mut().ok_or_else(|| {
                    TrainingError::ConfigFormat(format!(
                        "override '{}' descends into a non-table value",
                        item.path.join(".")
                    ))
                })?;
                current = map
                    .entry(segment.clone())
                    .or_insert_with(|| serde_json::Value::Object(Default::default()));
                if current.is_null() {
                    *current = serde_json::Value::Object(Default::default());
                }
            }
            let map = current.as_object_mut().ok_or_else(|| {
                TrainingError::ConfigFormat(format!(
                    "override '{}' descends into a non-table value",
                    item.path.join(".")
                ))
            })?;
            map.insert(last.clone(), item.value.clone());
        }
        let config: TrainingConfig = serde_json::from_value(value)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), TrainingError> {
        let mut errors = Vec::new();

        if self.task.name.trim().is_empty() {
            errors.push("task.name must not be empty".to_string());
        }

        if self.data.batch_size == 0 {
            errors.push("data.batch_size must be greater than 0".to_string());
        }

        if self.optimizer.learning_rate <= 0.0 {
            errors.push("optimizer.learning_rate must be greater than 0".to_string());
        }

        if self.optimizer.weight_decay < 0.0 {
            errors.push("optimizer.weight_decay must be >= 0".to_string());
        }

        if !(0.0 < self.optimizer.beta1 && self.optimizer.beta1 < 1.0) {
            errors.push("optimizer.beta1 must be in (0, 1)".to_string());
        }

        if !(0.0 < self.optimizer.beta2 && self.optimizer.beta2 < 1.0) {
            errors.push("optimizer.beta2 must be in (0, 1)".to_string());
        }

        if self.schedule.epochs == 0 {
            errors.push("schedule.epochs must be greater than 0".to_string());
        }

        if let Some(pct_start) = self.schedule.pct_start {
            if !(0.0 < pct_start && pct_start < 1.0) {
                errors.push("schedule.pct_start must be in (0, 1)".to_string());
            }
        }

        if self.runtime.checkpoint.directory.as_os_str().is_empty() {
            errors.push("runtime.checkpoint.directory must not be empty".to_string());
        }

        if let Some(0) = self.runtime.checkpoint.every_n_iters {
            errors.push("runtime.checkpoint.every_n_iters must be greater than 0".to_string());
        }

        if self.runtime.validation.every_n_iters == 0 {
            errors.push("runtime.validation.every_n_iters must be greater than 0".to_string());
        }

        if self.runtime.table_row_every_iters == 0 {
            errors.push("runtime.table_row_every_iters must be greater than 0".to_string());
        }

        if !errors.is_empty() {
            return Err(TrainingError::validation(errors));
        }

        Ok(())
    }

    /// Checkpoint cadence in samples; falls back to the summary-row cadence.
    pub fn checkpoint_every_iters(&self) -> usize {
        self.runtime
            .checkpoint
            .every_n_iters
            .unwrap_or(self.runtime.table_row_every_iters)
    }

    fn apply_base_path(&mut self, base: &Path) {
        absolutize_in_place(&mut self.task.input_dir, base);
        absolutize_in_place(&mut self.runtime.checkpoint.directory, base);
        if let Some(dir) = self.runtime.logging.tensorboard_dir.as_mut() {
            absolutize_in_place(dir, base);
        }
    }
}

/// A `key.path=value` assignment applied on top of a loaded config.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigOverride {
    pub path: Vec<String>,
    pub value: serde_json::Value,
}

impl FromStr for ConfigOverride {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (path, raw) = s
            .split_once('=')
            .ok_or_else(|| "override must be in the form key=value".to_string())?;
        let path: Vec<String> = path.trim().split('.').map(str::to_string).collect();
        if path.iter().any(|segment| segment.is_empty()) {
            return Err(format!("invalid override key '{}'", s));
        }
        Ok(Self {
            path,
            value: parse_override_value(raw.trim()),
        })
    }
}

/// Booleans, null, numbers and JSON literals are typed; anything else is a string.
fn parse_override_value(raw: &str) -> serde_json::Value {
    use serde_json::Value;

    match raw {
        "true" => return Value::Bool(true),
        "false" => return Value::Bool(false),
        "null" => return Value::Null,
        _ => {}
    }
    if let Ok(int) = raw.parse::<i64>() {
        return Value::from(int);
    }
    if let Some(number) = raw.parse::<f64>().ok().and_then(serde_json::Number::from_f64) {
        return Value::Number(number);
    }
    if raw.starts_with('[') || raw.starts_with('{') {
        if let Ok(value) = serde_json::from_str(raw) {
            return value;
        }
    }
    Value::String(raw.to_string())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskConfig {
    pub name: String,
    #[serde(default)]
    pub input_dir: PathBuf,
    #[serde(default)]
    pub model_size: ModelSize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_num_workers")]
    pub num_workers: usize,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            num_workers: default_num_workers(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerConfig {
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
    #[serde(default = "default_weight_decay")]
    pub weight_decay: f64,
    #[serde(default = "default_beta1")]
    pub beta1: f64,
    #[serde(default = "default_beta2")]
    pub beta2: f64,
    #[serde(default = "default_adam_eps")]
    pub epsilon: f64,
    /// Put Linear/Conv1d biases in the decayed group as well.
    #[serde(default)]
    pub decay_dense_biases: bool,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            learning_rate: default_learning_rate(),
            weight_decay: default_weight_decay(),
            beta1: default_beta1(),
            beta2: default_beta2(),
            epsilon: default_adam_eps(),
            decay_dense_biases: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    #[serde(default = "default_epochs")]
    pub epochs: usize,
    #[serde(default)]
    pub pct_start: Option<f64>,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            epochs: default_epochs(),
            pct_start: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub seed: u64,
    #[serde(default)]
    pub device: DeviceKind,
    #[serde(default = "default_half")]
    pub half: bool,
    #[serde(default = "default_table_row_every_iters")]
    pub table_row_every_iters: usize,
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
    #[serde(default)]
    pub validation: ValidationConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            seed: 0,
            device: DeviceKind::default(),
            half: default_half(),
            table_row_every_iters: default_table_row_every_iters(),
            checkpoint: CheckpointConfig::default(),
            validation: ValidationConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl RuntimeConfig {
    pub fn precision(&self) -> Precision {
        Precision::from_half(self.half)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    #[serde(default = "default_checkpoint_dir")]
    pub directory: PathBuf,
    #[serde(default)]
    pub every_n_iters: Option<usize>,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            directory: default_checkpoint_dir(),
            every_n_iters: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationConfig {
    #[serde(default = "default_run_valid_every_iters")]
    pub every_n_iters: usize,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            every_n_iters: default_run_valid_every_iters(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub enable_stdout: bool,
    #[serde(default)]
    pub tensorboard_dir: Option<PathBuf>,
    #[serde(default)]
    pub flush_every_n: usize,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    #[default]
    Auto,
    Cpu,
    Cuda,
    Metal,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Precision {
    #[serde(rename = "32")]
    Fp32,
    #[serde(rename = "16-mixed")]
    Mixed16,
}

impl Precision {
    pub fn from_half(half: bool) -> Self {
        if half {
            Precision::Mixed16
        } else {
            Precision::Fp32
        }
    }

    pub fn is_mixed(self) -> bool {
        matches!(self, Precision::Mixed16)
    }
}

impl fmt::Display for Precision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Precision::Fp32 => f.write_str("32"),
            Precision::Mixed16 => f.write_str("16-mixed"),
        }
    }
}

fn absolutize_in_place(path: &mut PathBuf, base: &Path) {
    if path.as_os_str().is_empty() {
        return;
    }
    if path.is_relative() {
        *path = base.join(&*path);
    }
}

fn default_batch_size() -> usize {
    16
}

fn default_num_workers() -> usize {
    8
}

fn default_learning_rate() -> f64 {
    1e-4
}

fn default_weight_decay() -> f64 {
    0.1
}

fn default_beta1() -> f64 {
    0.9
}

fn default_beta2() -> f64 {
    0.95
}

fn default_adam_eps() -> f64 {
    1e-8
}

fn default_epochs() -> usize {
    10
}

fn default_half() -> bool {
    true
}

fn default_table_row_every_iters() -> usize {
    80_000
}

fn default_run_valid_every_iters() -> usize {
    8_000
}

fn default_checkpoint_dir() -> PathBuf {
    PathBuf::from("checkpoints")
}

#[derive(Debug)]
pub enum TrainingError {
    Io(std::io::Error),
    ConfigFormat(String),
    Validation(Vec<String>),
    Initialization(String),
    Runtime(String),
}

impl TrainingError {
    pub fn initialization(message: impl Into<String>) -> Self {
        Self::Initialization(message.into())
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        Self::Runtime(message.into())
    }

    pub fn validation(messages: Vec<String>) -> Self {
        Self::Validation(messages)
    }
}

impl fmt::Display for TrainingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrainingError::Io(err) => write!(f, "i/o failure: {}", err),
            TrainingError::ConfigFormat(err) => write!(f, "failed to parse config: {}", err),
            TrainingError::Validation(messages) => {
                write!(f, "invalid configuration: {}", messages.join("; "))
            }
            TrainingError::Initialization(msg) => {
                write!(f, "trainer initialization failed: {}", msg)
            }
            TrainingError::Runtime(msg) => write!(f, "training failed: {}", msg),
        }
    }
}

impl std::error::Error for TrainingError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TrainingError::Io(err) => Some(err),
            TrainingError::ConfigFormat(_) | TrainingError::Validation(_) => None,
            TrainingError::Initialization(_) | TrainingError::Runtime(_) => None,
        }
    }
}

impl From<std::io::Error> for TrainingError {
    fn from(value: std::io::Error) -> Self {
        TrainingError::Io(value)
    }
}

impl From<toml::de::Error> for TrainingError {
    fn from(value: toml::de::Error) -> Self {
        TrainingError::ConfigFormat(value.to_string())
    }
}

impl From<serde_json::Error> for TrainingError {
    fn from(value: serde_json::Error) -> Self {
        TrainingError::ConfigFormat(value.to_string())
    }
}

pub(crate) fn to_runtime_error(err: candle_core::Error) -> TrainingError {
    TrainingError::runtime(err.to_string())
}
