use std::f64::consts::PI;

use crate::TrainingError;

pub trait LRScheduler: Send {
    /// Advances the schedule by one optimization step and returns the new rate.
    fn step(&mut self) -> f64;
    fn learning_rate(&self) -> f64;
    /// First-moment coefficient to pair with the current rate, when cycled.
    fn momentum(&self) -> Option<f64> {
        None
    }
}

#[derive(Debug, Clone)]
pub struct OneCycleConfig {
    pub max_lr: f64,
    pub total_steps: usize,
    pub pct_start: f64,
    pub div_factor: f64,
    pub final_div_factor: f64,
    pub base_momentum: f64,
    pub max_momentum: f64,
    pub cycle_momentum: bool,
}

impl OneCycleConfig {
    pub fn new(max_lr: f64, total_steps: usize, pct_start: f64) -> Self {
        Self {
            max_lr,
            total_steps,
            pct_start,
            div_factor: 25.0,
            final_div_factor: 1e4,
            base_momentum: 0.85,
            max_momentum: 0.95,
            cycle_momentum: true,
        }
    }

    pub fn build(self) -> Result<OneCycleLr, TrainingError> {
        OneCycleLr::new(self)
    }
}

#[derive(Debug, Clone, Copy)]
struct Phase {
    end_step: f64,
    start_lr: f64,
    end_lr: f64,
    start_momentum: f64,
    end_momentum: f64,
}

/// Two-phase one-cycle policy with cosine annealing.
///
/// The rate warms up from `max_lr / div_factor` to `max_lr` over the first
/// `pct_start` of the run, then anneals to `initial_lr / final_div_factor`.
/// Momentum moves the opposite way between `max_momentum` and
/// `base_momentum`. Construction already positions the schedule at step 0.
#[derive(Debug, Clone)]
pub struct OneCycleLr {
    phases: [Phase; 2],
    total_steps: usize,
    step: usize,
    cycle_momentum: bool,
    current_lr: f64,
    current_momentum: f64,
}

impl OneCycleLr {
    pub fn new(config: OneCycleConfig) -> Result<Self, TrainingError> {
        if config.total_steps == 0 {
            return Err(TrainingError::initialization(
                "one-cycle schedule requires total_steps greater than zero",
            ));
        }
        if config.max_lr <= 0.0 {
            return Err(TrainingError::initialization(
                "one-cycle schedule requires max_lr > 0",
            ));
        }
        if !(0.0..=1.0).contains(&config.pct_start) {
            return Err(TrainingError::initialization(format!(
                "pct_start must be in [0, 1], got {}",
                config.pct_start
            )));
        }

        let initial_lr = config.max_lr / config.div_factor;
        let min_lr = initial_lr / config.final_div_factor;
        let total = config.total_steps as f64;
        let phases = [
            Phase {
                end_step: config.pct_start * total - 1.0,
                start_lr: initial_lr,
                end_lr: config.max_lr,
                start_momentum: config.max_momentum,
                end_momentum: config.base_momentum,
            },
            Phase {
                end_step: total - 1.0,
                start_lr: config.max_lr,
                end_lr: min_lr,
                start_momentum: config.base_momentum,
                end_momentum: config.max_momentum,
            },
        ];

        let mut schedule = Self {
            phases,
            total_steps: config.total_steps,
            step: 0,
            cycle_momentum: config.cycle_momentum,
            current_lr: initial_lr,
            current_momentum: config.max_momentum,
        };
        schedule.apply(0);
        Ok(schedule)
    }

    pub fn steps_taken(&self) -> usize {
        self.step
    }

    pub fn total_steps(&self) -> usize {
        self.total_steps
    }

    fn apply(&mut self, step: usize) {
        let step = step as f64;
        let mut start_step = 0.0;
        for (index, phase) in self.phases.iter().enumerate() {
            let last = index + 1 == self.phases.len();
            if step <= phase.end_step || last {
                let span = phase.end_step - start_step;
                let pct = if span > 0.0 {
                    (step - start_step) / span
                } else {
                    1.0
                };
                self.current_lr = cosine_anneal(phase.start_lr, phase.end_lr, pct);
                self.current_momentum =
                    cosine_anneal(phase.start_momentum, phase.end_momentum, pct);
                return;
            }
            start_step = phase.end_step;
        }
    }
}

impl LRScheduler for OneCycleLr {
    fn step(&mut self) -> f64 {
        if self.step < self.total_steps {
            self.step += 1;
        } else {
            log::warn!(
                "one-cycle schedule stepped past its {} planned steps",
                self.total_steps
            );
        }
        self.apply(self.step);
        self.current_lr
    }

    fn learning_rate(&self) -> f64 {
        self.current_lr
    }

    fn momentum(&self) -> Option<f64> {
        self.cycle_momentum.then_some(self.current_momentum)
    }
}

fn cosine_anneal(start: f64, end: f64, pct: f64) -> f64 {
    end + (start - end) / 2.0 * ((PI * pct).cos() + 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() <= 1e-12_f64.max(b.abs() * 1e-9)
    }

    #[test]
    fn starts_at_initial_rate_and_peaks_after_warmup() {
        let mut schedule = OneCycleConfig::new(1e-3, 100, 0.3).build().unwrap();
        assert!(approx(schedule.learning_rate(), 1e-3 / 25.0));
        assert!(approx(schedule.momentum().unwrap(), 0.95));

        let mut lrs = vec![schedule.learning_rate()];
        for _ in 0..99 {
            lrs.push(schedule.step());
        }
        // warm-up ends at step 29
        assert!(approx(lrs[29], 1e-3));
        assert!(lrs[..29].windows(2).all(|w| w[0] < w[1]));
        assert!(lrs[29..].windows(2).all(|w| w[0] > w[1]));
        assert!(approx(lrs[99], 1e-3 / 25.0 / 1e4));
    }

    #[test]
    fn momentum_moves_against_the_rate() {
        let mut schedule = OneCycleConfig::new(1e-3, 10, 0.5).build().unwrap();
        for _ in 0..4 {
            schedule.step();
        }
        assert!(approx(schedule.momentum().unwrap(), 0.85));
        for _ in 0..5 {
            schedule.step();
        }
        assert!(approx(schedule.momentum().unwrap(), 0.95));
    }

    #[test]
    fn momentum_can_be_left_alone() {
        let mut config = OneCycleConfig::new(1e-3, 10, 0.5);
        config.cycle_momentum = false;
        let schedule = config.build().unwrap();
        assert_eq!(schedule.momentum(), None);
    }

    #[test]
    fn rejects_empty_runs() {
        assert!(OneCycleConfig::new(1e-3, 0, 0.3).build().is_err());
        assert!(OneCycleConfig::new(1e-3, 10, 1.5).build().is_err());
    }
}
