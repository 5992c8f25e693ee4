use std::{fs, path::Path};

use tempfile::tempdir;
use training::{
    checkpoint::checkpoint_file_name,
    progress::{MemoryProgress, ProgressEvent, ProgressSink},
    tasks::token_lm,
    visual::{MemorySurface, SimpleVisual},
    RunOutcome, StopFlag, TaskRegistry, Trainer, TrainingConfig,
};

/// Forwards to a [`MemoryProgress`] and raises `stop` after `after` steps.
struct StopAfter {
    inner: MemoryProgress,
    stop: StopFlag,
    after: usize,
}

impl ProgressSink for StopAfter {
    fn start(&mut self, epochs: usize) {
        self.inner.start(epochs);
    }

    fn write_header(&mut self, columns: &[&str]) {
        self.inner.write_header(columns);
    }

    fn write_row(&mut self, cells: &[String]) {
        self.inner.write_row(cells);
    }

    fn write_notice(&mut self, message: &str) {
        self.inner.write_notice(message);
    }

    fn epoch_bar(&mut self, len: usize) {
        self.inner.epoch_bar(len);
    }

    fn advance(&mut self, comment: &str) {
        self.inner.advance(comment);
        if self.inner.steps == self.after {
            self.stop.raise();
        }
    }

    fn finish_epoch(&mut self) {
        self.inner.finish_epoch();
    }

    fn show(&mut self) {
        self.inner.show();
    }
}

fn write_corpus(dir: &Path, lines: usize) {
    let text: String = (0..lines)
        .map(|i| {
            (0..12)
                .map(|j| ((i * 7 + j * 3) % token_lm::VOCAB_SIZE).to_string())
                .collect::<Vec<_>>()
                .join(" ")
                + "\n"
        })
        .collect();
    fs::write(dir.join("train.txt"), &text).unwrap();
    fs::write(dir.join("val.txt"), text.lines().take(4).collect::<Vec<_>>().join("\n")).unwrap();
}

fn config(root: &Path) -> TrainingConfig {
    let path = root.join("run.toml");
    fs::write(
        &path,
        r#"
[task]
name = "token_lm"
input_dir = "data"
model_size = "tiny"

[data]
batch_size = 4
num_workers = 2

[schedule]
epochs = 2

[runtime]
device = "cpu"
table_row_every_iters = 8

[runtime.checkpoint]
directory = "ckpt"
"#,
    )
    .unwrap();
    TrainingConfig::load(&path).unwrap()
}

#[test]
fn token_lm_run_writes_rows_and_checkpoints_on_the_sample_counter() {
    let root = tempdir().unwrap();
    fs::create_dir(root.path().join("data")).unwrap();
    write_corpus(&root.path().join("data"), 10);

    let surface = MemorySurface::new();
    let visual_surface = surface.clone();
    let mut trainer = Trainer::from_config(
        &config(root.path()),
        &TaskRegistry::builtin(),
        |total| SimpleVisual::new(Box::new(visual_surface), total),
        MemoryProgress::default(),
    )
    .unwrap();
    assert_eq!(trainer.total_steps(), 6);

    let summary = trainer.run().unwrap();
    assert_eq!(summary.outcome, RunOutcome::Completed);
    assert_eq!(summary.steps, 6);
    assert_eq!(summary.samples, 24);
    assert!(summary.train_loss.is_finite());
    // the first validation would need 50 samples
    assert!(summary.val_loss.is_nan());

    let steps: Vec<_> = summary.checkpoints.iter().map(|c| c.step).collect();
    assert_eq!(steps, vec![8, 16]);
    let mut files: Vec<_> = fs::read_dir(root.path().join("ckpt"))
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().to_string())
        .collect();
    files.sort();
    assert_eq!(files, vec![checkpoint_file_name(8), checkpoint_file_name(16)]);
    assert_eq!(files[0], "00000008.pt");

    let progress = trainer.progress();
    let samples: Vec<_> = progress.rows().iter().map(|row| row[0].clone()).collect();
    assert_eq!(samples, vec!["8", "16", "24"]);
    assert_eq!(progress.count(&ProgressEvent::EpochBar(3)), 2);
    assert!(progress.notices().is_empty());
    assert!(surface.contents().is_none());
}

#[test]
fn interrupt_writes_one_notice_and_hides_the_visual() {
    let root = tempdir().unwrap();
    fs::create_dir(root.path().join("data")).unwrap();
    write_corpus(&root.path().join("data"), 10);

    let stop = StopFlag::new();
    let surface = MemorySurface::new();
    let visual_surface = surface.clone();
    let mut trainer = Trainer::from_config(
        &config(root.path()),
        &TaskRegistry::builtin(),
        |total| SimpleVisual::new(Box::new(visual_surface), total),
        StopAfter {
            inner: MemoryProgress::default(),
            stop: stop.clone(),
            after: 4,
        },
    )
    .unwrap()
    .with_stop_flag(stop);

    let summary = trainer.run().unwrap();
    assert_eq!(summary.outcome, RunOutcome::Interrupted);
    assert_eq!(summary.steps, 4);
    assert_eq!(summary.samples, 16);

    let progress = &trainer.progress().inner;
    assert_eq!(progress.notices(), vec!["interrupted"]);
    // one row at 8 samples during the loop, then the cleanup row
    let samples: Vec<_> = progress.rows().iter().map(|row| row[0].clone()).collect();
    assert_eq!(samples, vec!["8", "16"]);
    let notice_at = progress
        .events
        .iter()
        .position(|event| *event == ProgressEvent::Notice("interrupted".to_string()))
        .unwrap();
    assert_eq!(progress.events[notice_at + 1], ProgressEvent::Show);
    assert_eq!(progress.events.last(), Some(&ProgressEvent::Show));
    assert!(surface.contents().is_none());
    assert!(surface.clears() >= 1);
}
