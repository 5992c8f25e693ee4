use std::{
    fs::{self, File},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use bytes::BytesMut;
use crc32fast::Hasher as Crc32;
use prost::Message;

use crate::TrainingError;

pub const TRAIN_LOSS: &str = "train_loss";
pub const VAL_LOSS: &str = "val_loss";
pub const TEST_LOSS: &str = "test_loss";
pub const LEARNING_RATE: &str = "lr-AdamW";

#[derive(Clone, Debug, Default)]
pub struct LoggingSettings {
    pub enable_stdout: bool,
    /// Event files go to `<log_root>/<project>/`; `None` disables them.
    pub log_root: Option<PathBuf>,
    pub flush_every_n: usize,
}

impl LoggingSettings {
    pub fn new(enable_stdout: bool, log_root: Option<PathBuf>, flush_every: usize) -> Self {
        Self {
            enable_stdout,
            log_root,
            flush_every_n: flush_every.max(1),
        }
    }
}

/// Scalar sink for one experiment, grouped under a project name.
pub struct ExperimentLogger {
    project: String,
    settings: LoggingSettings,
    run_dir: Option<PathBuf>,
    tensorboard: Option<TensorBoardWriter>,
}

impl ExperimentLogger {
    pub fn new(project: impl Into<String>, settings: LoggingSettings) -> Result<Self, TrainingError> {
        let project = project.into();
        let run_dir = settings.log_root.as_ref().map(|root| root.join(&project));
        let tensorboard = match run_dir.as_ref() {
            Some(dir) => Some(TensorBoardWriter::create(dir, settings.flush_every_n)?),
            None => None,
        };
        if let Some(dir) = run_dir.as_ref() {
            log::info!("logging project {} to {}", project, dir.display());
        }
        Ok(Self {
            project,
            settings,
            run_dir,
            tensorboard,
        })
    }

    /// A logger that drops every scalar.
    pub fn disabled(project: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            settings: LoggingSettings::default(),
            run_dir: None,
            tensorboard: None,
        }
    }

    pub fn project(&self) -> &str {
        &self.project
    }

    pub fn run_dir(&self) -> Option<&Path> {
        self.run_dir.as_deref()
    }

    pub fn log_scalar(&mut self, name: &str, step: usize, value: f64) -> Result<(), TrainingError> {
        if self.settings.enable_stdout {
            println!("{} step={} {}={:.5}", self.project, step, name, value);
        }
        match self.tensorboard.as_mut() {
            Some(writer) => writer.write_scalar(name, step as i64, value),
            None => Ok(()),
        }
    }

    /// Stores run hyper-parameters next to the event file.
    pub fn log_hyperparams(&mut self, params: &serde_json::Value) -> Result<(), TrainingError> {
        let Some(dir) = self.run_dir.as_ref() else {
            return Ok(());
        };
        let path = dir.join("hparams.json");
        let data = serde_json::to_vec_pretty(params)?;
        fs::write(&path, data).map_err(|err| {
            TrainingError::runtime(format!("failed to write {}: {err}", path.display()))
        })
    }

    pub fn flush(&mut self) -> Result<(), TrainingError> {
        match self.tensorboard.as_mut() {
            Some(writer) => writer.flush(),
            None => Ok(()),
        }
    }
}

struct TensorBoardWriter {
    writer: BufWriter<File>,
    flush_every: usize,
    pending: usize,
}

impl TensorBoardWriter {
    fn create(dir: &Path, flush_every: usize) -> Result<Self, TrainingError> {
        fs::create_dir_all(dir).map_err(|err| {
            TrainingError::runtime(format!(
                "failed to create tensorboard directory {}: {err}",
                dir.display()
            ))
        })?;
        let filename = format!(
            "events.out.tfevents.{}.{}",
            current_unix_timestamp(),
            hostname()
        );
        let path = dir.join(filename);
        let file = File::create(&path).map_err(|err| {
            TrainingError::runtime(format!(
                "failed to create tensorboard file {}: {err}",
                path.display()
            ))
        })?;
        let mut writer = Self {
            writer: BufWriter::new(file),
            flush_every: flush_every.max(1),
            pending: 0,
        };
        writer.write_event(&Event {
            wall_time: current_wall_time(),
            step: 0,
            file_version: Some("brain.Event:2".to_string()),
            summary: None,
        })?;
        Ok(writer)
    }

    fn write_scalar(&mut self, tag: &str, step: i64, value: f64) -> Result<(), TrainingError> {
        let summary = Summary {
            value: vec![summary::Value {
                tag: tag.to_string(),
                simple_value: Some(value as f32),
            }],
        };
        self.write_event(&Event {
            wall_time: current_wall_time(),
            step,
            file_version: None,
            summary: Some(summary),
        })
    }

    fn write_event(&mut self, event: &Event) -> Result<(), TrainingError> {
        let mut buffer = BytesMut::with_capacity(event.encoded_len());
        event.encode(&mut buffer).map_err(|err| {
            TrainingError::runtime(format!("failed to encode tensorboard event: {err}"))
        })?;
        let data = buffer.freeze();

        let len_bytes = (data.len() as u64).to_le_bytes();
        let len_crc = masked_crc32(&len_bytes).to_le_bytes();
        let data_crc = masked_crc32(&data).to_le_bytes();

        self.writer
            .write_all(&len_bytes)
            .and_then(|_| self.writer.write_all(&len_crc))
            .and_then(|_| self.writer.write_all(&data))
            .and_then(|_| self.writer.write_all(&data_crc))
            .map_err(|err| {
                TrainingError::runtime(format!("failed to write tensorboard event: {err}"))
            })?;

        self.pending += 1;
        if self.pending >= self.flush_every {
            self.flush()?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), TrainingError> {
        self.writer.flush().map_err(|err| {
            TrainingError::runtime(format!("failed to flush tensorboard file: {err}"))
        })?;
        self.pending = 0;
        Ok(())
    }
}

impl Drop for TensorBoardWriter {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

fn masked_crc32(data: &[u8]) -> u32 {
    let mut hasher = Crc32::new();
    hasher.update(data);
    let crc = hasher.finalize();
    ((crc >> 15) | (crc << 17)).wrapping_add(0xa282_ead8)
}

fn current_unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn current_wall_time() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|dur| dur.as_secs_f64())
        .unwrap_or(0.0)
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "localhost".to_string())
}

#[derive(Clone, PartialEq, Message)]
struct Event {
    #[prost(double, tag = "1")]
    wall_time: f64,
    #[prost(int64, tag = "2")]
    step: i64,
    #[prost(string, optional, tag = "3")]
    file_version: Option<String>,
    #[prost(message, optional, tag = "5")]
    summary: Option<Summary>,
}

#[derive(Clone, PartialEq, Message)]
struct Summary {
    #[prost(message, repeated, tag = "1")]
    value: Vec<summary::Value>,
}

mod summary {
    use prost::Message;

    #[derive(Clone, PartialEq, Message)]
    pub struct Value {
        #[prost(string, tag = "1")]
        pub tag: String,
        #[prost(float, optional, tag = "2")]
        pub simple_value: Option<f32>,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_events(path: &Path) -> Vec<Event> {
        let bytes = fs::read(path).unwrap();
        let mut events = Vec::new();
        let mut offset = 0;
        while offset < bytes.len() {
            let len_bytes: [u8; 8] = bytes[offset..offset + 8].try_into().unwrap();
            let len_crc = u32::from_le_bytes(bytes[offset + 8..offset + 12].try_into().unwrap());
            assert_eq!(masked_crc32(&len_bytes), len_crc);
            let len = u64::from_le_bytes(len_bytes) as usize;
            let data = &bytes[offset + 12..offset + 12 + len];
            let data_crc =
                u32::from_le_bytes(bytes[offset + 12 + len..offset + 16 + len].try_into().unwrap());
            assert_eq!(masked_crc32(data), data_crc);
            events.push(Event::decode(data).unwrap());
            offset += 16 + len;
        }
        events
    }

    #[test]
    fn writes_framed_scalar_events_under_the_project() {
        let root = tempfile::tempdir().unwrap();
        let mut logger = ExperimentLogger::new(
            "SpearTTS-token_lm",
            LoggingSettings::new(false, Some(root.path().to_path_buf()), 1),
        )
        .unwrap();
        logger.log_scalar(TRAIN_LOSS, 3, 1.25).unwrap();
        logger.log_scalar(LEARNING_RATE, 3, 4e-6).unwrap();
        logger.flush().unwrap();

        let run_dir = root.path().join("SpearTTS-token_lm");
        assert_eq!(logger.run_dir(), Some(run_dir.as_path()));
        let file = fs::read_dir(&run_dir).unwrap().next().unwrap().unwrap().path();
        let events = read_events(&file);
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].file_version.as_deref(), Some("brain.Event:2"));
        let value = &events[1].summary.as_ref().unwrap().value[0];
        assert_eq!(value.tag, TRAIN_LOSS);
        assert_eq!(value.simple_value, Some(1.25));
        assert_eq!(events[2].step, 3);
    }

    #[test]
    fn disabled_logger_accepts_scalars() {
        let mut logger = ExperimentLogger::disabled("SpearTTS-x");
        logger.log_scalar(VAL_LOSS, 1, 2.0).unwrap();
        logger.log_hyperparams(&serde_json::json!({"lr0": 1e-4})).unwrap();
        assert!(logger.run_dir().is_none());
    }

    #[test]
    fn hyperparams_land_next_to_events() {
        let root = tempfile::tempdir().unwrap();
        let mut logger = ExperimentLogger::new(
            "p",
            LoggingSettings::new(false, Some(root.path().to_path_buf()), 8),
        )
        .unwrap();
        logger
            .log_hyperparams(&serde_json::json!({"pct_start": 0.3}))
            .unwrap();
        let stored: serde_json::Value =
            serde_json::from_slice(&fs::read(root.path().join("p/hparams.json")).unwrap()).unwrap();
        assert_eq!(stored["pct_start"], 0.3);
    }
}
