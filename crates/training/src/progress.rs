use std::time::Duration;

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};

pub const SUMMARY_COLUMNS: [&str; 4] = ["samples", "train", "val", "time"];

/// Table and progress-bar output driven by the training loop.
pub trait ProgressSink {
    /// Starts the master bar over `epochs`.
    fn start(&mut self, epochs: usize);
    fn write_header(&mut self, columns: &[&str]);
    fn write_row(&mut self, cells: &[String]);
    fn write_notice(&mut self, message: &str);
    /// Replaces the batch bar with a fresh one of `len` steps.
    fn epoch_bar(&mut self, len: usize);
    fn advance(&mut self, comment: &str);
    fn finish_epoch(&mut self);
    /// Redraws the bars and table.
    fn show(&mut self);
}

/// `mm:ss` below an hour, `h:mm:ss` above.
pub fn format_time(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    let (h, m, s) = (secs / 3600, (secs / 60) % 60, secs % 60);
    if h != 0 {
        format!("{h}:{m:02}:{s:02}")
    } else {
        format!("{m:02}:{s:02}")
    }
}

pub fn summary_row(samples: usize, train: f64, val: f64, elapsed: Duration) -> Vec<String> {
    vec![
        samples.to_string(),
        format!("{train:.5}"),
        format!("{val:.5}"),
        format_time(elapsed),
    ]
}

const CELL_WIDTH: usize = 12;

fn table_line<S: AsRef<str>>(cells: &[S]) -> String {
    cells
        .iter()
        .map(|cell| format!("{:<CELL_WIDTH$}", cell.as_ref()))
        .collect::<Vec<_>>()
        .join(" ")
        .trim_end()
        .to_string()
}

pub struct TerminalProgress {
    multi: MultiProgress,
    master: Option<ProgressBar>,
    child: Option<ProgressBar>,
}

impl TerminalProgress {
    pub fn new() -> Self {
        Self {
            multi: MultiProgress::new(),
            master: None,
            child: None,
        }
    }

    pub fn multi(&self) -> &MultiProgress {
        &self.multi
    }

    fn style(template: &str) -> ProgressStyle {
        ProgressStyle::with_template(template)
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=>-")
    }

    fn println(&self, line: &str) {
        if self.multi.println(line).is_err() {
            log::debug!("{line}");
        }
    }
}

impl Default for TerminalProgress {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressSink for TerminalProgress {
    fn start(&mut self, epochs: usize) {
        let master = self.multi.add(ProgressBar::new(epochs as u64));
        master.set_style(Self::style(
            "{bar:40.cyan/blue} {pos}/{len} [{elapsed_precise}<{eta}] {msg}",
        ));
        self.master = Some(master);
    }

    fn write_header(&mut self, columns: &[&str]) {
        self.println(&table_line(columns));
    }

    fn write_row(&mut self, cells: &[String]) {
        self.println(&table_line(cells));
    }

    fn write_notice(&mut self, message: &str) {
        self.println(message);
    }

    fn epoch_bar(&mut self, len: usize) {
        if let Some(old) = self.child.take() {
            old.finish_and_clear();
            self.multi.remove(&old);
        }
        let child = match self.master.as_ref() {
            Some(master) => self.multi.insert_after(master, ProgressBar::new(len as u64)),
            None => self.multi.add(ProgressBar::new(len as u64)),
        };
        child.set_style(Self::style(
            "  {bar:40.green/white} {pos}/{len} [{elapsed_precise}<{eta}] {msg}",
        ));
        self.child = Some(child);
    }

    fn advance(&mut self, comment: &str) {
        if let Some(child) = self.child.as_ref() {
            child.set_message(comment.to_string());
            child.inc(1);
        }
    }

    fn finish_epoch(&mut self) {
        if let Some(master) = self.master.as_ref() {
            master.inc(1);
        }
    }

    fn show(&mut self) {
        for bar in self.master.iter().chain(self.child.iter()) {
            bar.tick();
        }
    }
}

/// Events captured by [`MemoryProgress`].
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    Start(usize),
    Header(Vec<String>),
    Row(Vec<String>),
    Notice(String),
    EpochBar(usize),
    FinishEpoch,
    Show,
}

/// Records every call, for tests and headless runs.
#[derive(Debug, Clone, Default)]
pub struct MemoryProgress {
    pub events: Vec<ProgressEvent>,
    pub steps: usize,
}

impl MemoryProgress {
    pub fn rows(&self) -> Vec<&Vec<String>> {
        self.events
            .iter()
            .filter_map(|event| match event {
                ProgressEvent::Row(cells) => Some(cells),
                _ => None,
            })
            .collect()
    }

    pub fn notices(&self) -> Vec<&str> {
        self.events
            .iter()
            .filter_map(|event| match event {
                ProgressEvent::Notice(message) => Some(message.as_str()),
                _ => None,
            })
            .collect()
    }

    pub fn count(&self, wanted: &ProgressEvent) -> usize {
        self.events.iter().filter(|event| *event == wanted).count()
    }
}

impl ProgressSink for MemoryProgress {
    fn start(&mut self, epochs: usize) {
        self.events.push(ProgressEvent::Start(epochs));
    }

    fn write_header(&mut self, columns: &[&str]) {
        self.events.push(ProgressEvent::Header(
            columns.iter().map(|c| c.to_string()).collect(),
        ));
    }

    fn write_row(&mut self, cells: &[String]) {
        self.events.push(ProgressEvent::Row(cells.to_vec()));
    }

    fn write_notice(&mut self, message: &str) {
        self.events.push(ProgressEvent::Notice(message.to_string()));
    }

    fn epoch_bar(&mut self, len: usize) {
        self.events.push(ProgressEvent::EpochBar(len));
    }

    fn advance(&mut self, _comment: &str) {
        self.steps += 1;
    }

    fn finish_epoch(&mut self) {
        self.events.push(ProgressEvent::FinishEpoch);
    }

    fn show(&mut self) {
        self.events.push(ProgressEvent::Show);
    }
}
