use std::collections::VecDeque;

/// Mean of the most recent raw losses over a fixed window.
#[derive(Debug, Clone)]
pub struct RunningLoss {
    window: usize,
    values: VecDeque<f64>,
}

impl RunningLoss {
    pub const DEFAULT_WINDOW: usize = 5;

    pub fn new(window: usize) -> Self {
        let window = window.max(1);
        Self {
            window,
            values: VecDeque::with_capacity(window),
        }
    }

    pub fn push(&mut self, loss: f64) -> f64 {
        if self.values.len() == self.window {
            self.values.pop_front();
        }
        self.values.push_back(loss);
        self.mean()
    }

    /// NaN until the first loss arrives.
    pub fn mean(&self) -> f64 {
        if self.values.is_empty() {
            return f64::NAN;
        }
        self.values.iter().sum::<f64>() / self.values.len() as f64
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl Default for RunningLoss {
    fn default() -> Self {
        Self::new(Self::DEFAULT_WINDOW)
    }
}

/// Plain arithmetic mean, reset between epochs.
#[derive(Debug, Clone, Default)]
pub struct MeanAccumulator {
    sum: f64,
    count: usize,
}

impl MeanAccumulator {
    pub fn update(&mut self, value: f64) {
        self.sum += value;
        self.count += 1;
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn take(&mut self) -> Option<f64> {
        if self.count == 0 {
            return None;
        }
        let mean = self.sum / self.count as f64;
        *self = Self::default();
        Some(mean)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressSample {
    pub step: usize,
    pub lr: f64,
    pub train_loss: f64,
    pub val_loss: f64,
}

/// Append-only series of progress samples, stored column-wise.
#[derive(Debug, Clone, Default)]
pub struct ProgressRecord {
    pub steps: Vec<usize>,
    pub lrs: Vec<f64>,
    pub train_losses: Vec<f64>,
    pub val_losses: Vec<f64>,
}

impl ProgressRecord {
    pub fn push(&mut self, sample: ProgressSample) {
        self.steps.push(sample.step);
        self.lrs.push(sample.lr);
        self.train_losses.push(sample.train_loss);
        self.val_losses.push(sample.val_loss);
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn last(&self) -> Option<ProgressSample> {
        let index = self.len().checked_sub(1)?;
        Some(ProgressSample {
            step: self.steps[index],
            lr: self.lrs[index],
            train_loss: self.train_losses[index],
            val_loss: self.val_losses[index],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn running_loss_averages_the_last_five() {
        let mut running = RunningLoss::default();
        assert!(running.mean().is_nan());
        assert_eq!(running.push(2.0), 2.0);
        assert_eq!(running.push(4.0), 3.0);
        for loss in [6.0, 8.0, 10.0, 12.0] {
            running.push(loss);
        }
        assert_eq!(running.len(), 5);
        assert_eq!(running.mean(), 8.0);
    }

    #[test]
    fn mean_accumulator_resets_on_take() {
        let mut mean = MeanAccumulator::default();
        assert_eq!(mean.take(), None);
        mean.update(1.0);
        mean.update(2.0);
        assert_eq!(mean.take(), Some(1.5));
        assert_eq!(mean.count(), 0);
    }

    #[test]
    fn progress_record_is_columnar() {
        let mut record = ProgressRecord::default();
        let sample = ProgressSample {
            step: 64,
            lr: 1e-4,
            train_loss: 2.0,
            val_loss: 2.5,
        };
        record.push(sample);
        assert_eq!(record.len(), 1);
        assert_eq!(record.last(), Some(sample));
    }
}
