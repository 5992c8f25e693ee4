pub mod checkpoint;
pub mod config;
pub mod data;
pub mod device;
pub mod harness;
pub mod logging;
pub mod loss;
pub mod metrics;
pub mod model;
pub mod optimizer;
pub mod progress;
pub mod scheduler;
pub mod tasks;
pub mod trainer;
pub mod validation;
pub mod visual;

pub use checkpoint::{CheckpointRecord, CheckpointWriter, RankedCheckpoint, TopKCheckpoints};
pub use config::{ConfigOverride, DeviceKind, Precision, TrainingConfig, TrainingError};
pub use data::{BatchLoader, DataBatch, Dataset, LoaderConfig, TensorDataset};
pub use harness::{
    FitSummary, HarnessConfig, LocalRuntime, RuntimeInfo, TaskModule, TrainerRuntime,
    TrainingModule,
};
pub use logging::{ExperimentLogger, LoggingSettings};
pub use model::{ModuleKind, NamedParameter, ParamRole, TrainableModel};
pub use optimizer::{
    build_optimization, GradientScaler, LossScaleConfig, OptimizationParams, TrainerOptimizer,
};
pub use progress::{MemoryProgress, ProgressSink, TerminalProgress};
pub use scheduler::{LRScheduler, OneCycleConfig, OneCycleLr};
pub use tasks::{ModelSize, TaskRegistry};
pub use trainer::{LoopConfig, RunOutcome, RunState, RunSummary, StopFlag, Trainer};
pub use visual::{MemorySurface, SimpleVisual, TerminalSurface, Visual};
