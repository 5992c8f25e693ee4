//! Live loss and learning-rate charts.
//!
//! [`SimpleVisual`] keeps every progress sample in memory and redraws two
//! stacked text charts sharing one x axis: losses on a log scale on top,
//! learning rate on a linear scale below at a third of the height. The text
//! goes to a [`DisplaySurface`], either a terminal line block or an
//! in-memory buffer.

use std::sync::{Arc, Mutex};

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};

use crate::metrics::{ProgressRecord, ProgressSample};

pub trait Visual {
    fn show(&mut self);
    fn hide(&mut self);
    fn add_data(&mut self, step: usize, lr: f64, train_loss: f64, val_loss: f64);
}

/// Where rendered charts end up.
pub trait DisplaySurface: Send {
    fn update(&mut self, text: &str);
    fn clear(&mut self);
}

/// Renders into an `indicatif` bar used as a multi-line text block.
pub struct TerminalSurface {
    multi: Option<MultiProgress>,
    bar: Option<ProgressBar>,
}

impl TerminalSurface {
    pub fn new() -> Self {
        Self {
            multi: None,
            bar: None,
        }
    }

    /// Draws below the bars managed by `multi`.
    pub fn attached(multi: &MultiProgress) -> Self {
        Self {
            multi: Some(multi.clone()),
            bar: None,
        }
    }

    fn bar(&mut self) -> &ProgressBar {
        let multi = self.multi.as_ref();
        self.bar.get_or_insert_with(|| {
            let bar = ProgressBar::new_spinner();
            bar.set_style(
                ProgressStyle::with_template("{msg}")
                    .unwrap_or_else(|_| ProgressStyle::default_spinner()),
            );
            match multi {
                Some(multi) => multi.add(bar),
                None => bar,
            }
        })
    }
}

impl Default for TerminalSurface {
    fn default() -> Self {
        Self::new()
    }
}

impl DisplaySurface for TerminalSurface {
    fn update(&mut self, text: &str) {
        self.bar().set_message(text.to_string());
    }

    fn clear(&mut self) {
        if let Some(bar) = self.bar.take() {
            bar.finish_and_clear();
            if let Some(multi) = self.multi.as_ref() {
                multi.remove(&bar);
            }
        }
    }
}

/// Keeps the last rendering in memory; clones share the same buffer.
#[derive(Debug, Clone, Default)]
pub struct MemorySurface {
    state: Arc<Mutex<MemoryState>>,
}

#[derive(Debug, Default)]
struct MemoryState {
    contents: Option<String>,
    updates: usize,
    clears: usize,
}

impl MemorySurface {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current text, `None` after a clear.
    pub fn contents(&self) -> Option<String> {
        self.with_state(|state| state.contents.clone())
    }

    pub fn updates(&self) -> usize {
        self.with_state(|state| state.updates)
    }

    pub fn clears(&self) -> usize {
        self.with_state(|state| state.clears)
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut MemoryState) -> T) -> T {
        let mut guard = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }
}

impl DisplaySurface for MemorySurface {
    fn update(&mut self, text: &str) {
        self.with_state(|state| {
            state.contents = Some(text.to_string());
            state.updates += 1;
        });
    }

    fn clear(&mut self) {
        self.with_state(|state| {
            state.contents = None;
            state.clears += 1;
        });
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scale {
    Linear,
    Log,
}

const TRAIN_MARK: char = '*';
const VAL_MARK: char = 'o';
const LR_MARK: char = '.';
const LABEL_WIDTH: usize = 10;

pub struct SimpleVisual {
    surface: Box<dyn DisplaySurface>,
    record: ProgressRecord,
    total_steps: usize,
    width: usize,
    lr_height: usize,
}

impl SimpleVisual {
    /// `total_steps` bounds the shared x axis; the trainer passes
    /// `epochs * dataset_len` since steps are counted in samples.
    pub fn new(surface: Box<dyn DisplaySurface>, total_steps: usize) -> Self {
        Self {
            surface,
            record: ProgressRecord::default(),
            total_steps: total_steps.max(1),
            width: 60,
            lr_height: 3,
        }
    }

    pub fn with_size(mut self, width: usize, lr_height: usize) -> Self {
        self.width = width.max(2);
        self.lr_height = lr_height.max(1);
        self
    }

    pub fn record(&self) -> &ProgressRecord {
        &self.record
    }

    pub fn render(&self) -> String {
        let loss_height = self.lr_height * 3;
        let mut lines = vec![format!(
            "loss (log)  {TRAIN_MARK} train  {VAL_MARK} val"
        )];
        lines.extend(self.panel(
            &[
                (&self.record.train_losses, TRAIN_MARK),
                (&self.record.val_losses, VAL_MARK),
            ],
            loss_height,
            Scale::Log,
        ));
        lines.push("learning rate".to_string());
        lines.extend(self.panel(&[(&self.record.lrs, LR_MARK)], self.lr_height, Scale::Linear));
        lines.push(format!(
            "{:LABEL_WIDTH$} └{}",
            "",
            "─".repeat(self.width)
        ));
        let end = self.total_steps.to_string();
        lines.push(format!(
            "{:LABEL_WIDTH$}  0{:>pad$}",
            "",
            end,
            pad = self.width.saturating_sub(1)
        ));
        lines.join("\n")
    }

    fn column(&self, step: usize) -> usize {
        let frac = step as f64 / self.total_steps as f64;
        ((frac * (self.width - 1) as f64).round() as usize).min(self.width - 1)
    }

    fn panel(&self, series: &[(&Vec<f64>, char)], height: usize, scale: Scale) -> Vec<String> {
        let project = |v: f64| match scale {
            Scale::Linear if v.is_finite() => Some(v),
            Scale::Log if v.is_finite() && v > 0.0 => Some(v.ln()),
            _ => None,
        };

        let (lo, hi) = series
            .iter()
            .flat_map(|(values, _)| values.iter().copied().filter_map(project))
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| {
                (lo.min(v), hi.max(v))
            });

        let mut grid = vec![vec![' '; self.width]; height];
        if lo.is_finite() {
            for (values, mark) in series {
                for (&step, &value) in self.record.steps.iter().zip(values.iter()) {
                    let Some(y) = project(value) else { continue };
                    let row = if hi - lo > f64::EPSILON {
                        ((hi - y) / (hi - lo) * (height - 1) as f64).round() as usize
                    } else {
                        height / 2
                    };
                    grid[row.min(height - 1)][self.column(step)] = *mark;
                }
            }
        }

        let unproject = |v: f64| match scale {
            Scale::Linear => v,
            Scale::Log => v.exp(),
        };
        grid.into_iter()
            .enumerate()
            .map(|(row, cells)| {
                let label = if !lo.is_finite() {
                    String::new()
                } else if row == 0 {
                    format_tick(unproject(hi))
                } else if row + 1 == height {
                    format_tick(unproject(lo))
                } else {
                    String::new()
                };
                let cells: String = cells.into_iter().collect();
                format!("{label:>LABEL_WIDTH$} │{}", cells.trim_end())
            })
            .collect()
    }

    fn redraw(&mut self) {
        let text = self.render();
        self.surface.update(&text);
    }
}

impl Visual for SimpleVisual {
    fn show(&mut self) {
        self.redraw();
    }

    fn hide(&mut self) {
        self.surface.clear();
    }

    fn add_data(&mut self, step: usize, lr: f64, train_loss: f64, val_loss: f64) {
        self.record.push(ProgressSample {
            step,
            lr,
            train_loss,
            val_loss,
        });
        self.redraw();
    }
}

fn format_tick(value: f64) -> String {
    if value != 0.0 && (value.abs() < 1e-2 || value.abs() >= 1e4) {
        format!("{value:.2e}")
    } else {
        format!("{value:.3}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn visual(total: usize) -> (SimpleVisual, MemorySurface) {
        let surface = MemorySurface::new();
        let visual = SimpleVisual::new(Box::new(surface.clone()), total).with_size(11, 3);
        (visual, surface)
    }

    fn chart_rows(text: &str) -> Vec<String> {
        text.lines()
            .filter_map(|line| line.split_once('│').map(|(_, cells)| cells.to_string()))
            .collect()
    }

    #[test]
    fn add_data_redraws_immediately() {
        let (mut visual, surface) = visual(100);
        visual.add_data(50, 1e-4, 2.0, 2.5);
        assert_eq!(surface.updates(), 1);
        let text = surface.contents().unwrap();
        assert!(text.contains(TRAIN_MARK));
        assert!(text.contains(VAL_MARK));
        assert!(text.contains(LR_MARK));
        assert_eq!(visual.record().len(), 1);
    }

    #[test]
    fn hide_clears_output_but_keeps_data() {
        let (mut visual, surface) = visual(100);
        visual.add_data(10, 1e-4, 2.0, 2.5);
        visual.hide();
        assert_eq!(surface.contents(), None);
        assert_eq!(surface.clears(), 1);
        assert_eq!(visual.record().len(), 1);
        visual.show();
        assert!(surface.contents().is_some());
    }

    #[test]
    fn loss_panel_uses_a_log_scale() {
        let (mut visual, _surface) = visual(100);
        // 1, 10 and 100 are evenly spaced in log space
        visual.add_data(0, 1e-4, 100.0, f64::NAN);
        visual.add_data(50, 1e-4, 10.0, f64::NAN);
        visual.add_data(100, 1e-4, 1.0, f64::NAN);
        let rows = chart_rows(&visual.render());
        // loss panel has 9 rows: extremes on the first and last, middle on row 4
        assert_eq!(rows[0].find(TRAIN_MARK), Some(0));
        assert_eq!(rows[4].find(TRAIN_MARK), Some(5));
        assert_eq!(rows[8].find(TRAIN_MARK), Some(10));
    }

    #[test]
    fn x_axis_spans_the_whole_run() {
        let (visual, _surface) = visual(1_600);
        let text = visual.render();
        let last = text.lines().last().unwrap();
        assert!(last.trim_start().starts_with('0'));
        assert!(last.ends_with("1600"));
    }
}
