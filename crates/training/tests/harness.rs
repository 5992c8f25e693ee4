use std::{fs, path::Path};

use tempfile::tempdir;
use training::{
    checkpoint::apply_model_weights,
    harness::{self, HarnessConfig},
    tasks::{token_lm, ModelSize},
    DeviceKind, RunOutcome, StopFlag, TaskRegistry,
};

fn write_corpus(dir: &Path) {
    let line = |seed: usize| {
        (0..20)
            .map(|j| ((seed + j) % 50).to_string())
            .collect::<Vec<_>>()
            .join(" ")
    };
    let train: Vec<_> = (0..12).map(line).collect();
    let val: Vec<_> = (100..104).map(line).collect();
    fs::write(dir.join("train.txt"), train.join("\n")).unwrap();
    fs::write(dir.join("val.txt"), val.join("\n")).unwrap();
}

fn config(root: &Path) -> HarnessConfig {
    let mut config = HarnessConfig::new(token_lm::NAME);
    config.input_dir = root.join("data");
    config.checkpoint_dir = root.join("checkpoints");
    config.log_dir = Some(root.join("runs"));
    config.batch_size = 4;
    config.workers = 0;
    config.epochs = 5;
    config.lr0 = 3e-3;
    config.model_size = ModelSize::Tiny;
    config.device = DeviceKind::Cpu;
    config
}

#[test]
fn fits_token_lm_and_keeps_the_best_four_checkpoints() {
    let root = tempdir().unwrap();
    fs::create_dir(root.path().join("data")).unwrap();
    write_corpus(&root.path().join("data"));
    let config = config(root.path());

    let summary = harness::run(&config, &TaskRegistry::builtin(), None, StopFlag::new()).unwrap();
    assert_eq!(summary.outcome, RunOutcome::Completed);
    assert_eq!(summary.epochs_run, 5);
    assert_eq!(summary.total_steps, 15);
    assert_eq!(summary.global_step, 15);
    assert!(summary.val_losses.iter().all(|loss| loss.is_finite()));

    let run_dir = root.path().join("checkpoints").join("token_lm-5e");
    let files: Vec<_> = fs::read_dir(&run_dir)
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().to_string())
        .collect();
    assert_eq!(files.len(), 4);
    assert!(files
        .iter()
        .all(|name| name.starts_with("token_lm-epoch=") && name.ends_with(".safetensors")));

    let best = summary.best().unwrap();
    let min = summary
        .val_losses
        .iter()
        .copied()
        .fold(f64::INFINITY, f64::min);
    assert!((best.score - min).abs() < 1e-12);

    // the kept weights load back into a fresh model of the same size
    let registry = TaskRegistry::builtin();
    let task = registry.get(token_lm::NAME).unwrap();
    let model = (task.make_model)(ModelSize::Tiny, &candle_core::Device::Cpu).unwrap();
    apply_model_weights(model.as_ref(), &best.path).unwrap();

    let project_dir = root.path().join("runs").join("SpearTTS-token_lm");
    let hparams: serde_json::Value =
        serde_json::from_slice(&fs::read(project_dir.join("hparams.json")).unwrap()).unwrap();
    assert_eq!(hparams["pct_start"], 0.3);
    assert!(fs::read_dir(&project_dir)
        .unwrap()
        .any(|entry| entry.unwrap().file_name().to_string_lossy().starts_with("events.out.tfevents")));
}

#[test]
fn unknown_tasks_fail_before_touching_the_filesystem() {
    let root = tempdir().unwrap();
    let mut config = config(root.path());
    config.task = "s2a_delar".to_string();
    let err = harness::run(&config, &TaskRegistry::builtin(), None, StopFlag::new()).unwrap_err();
    assert!(err.to_string().contains("token_lm"), "{err}");
    assert!(!root.path().join("checkpoints").exists());
}
