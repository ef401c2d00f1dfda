// scheduler.rs

use crate::config::PlateauConfig;
use tch::nn;

/// Reduce-on-plateau learning rate schedule (minimising, relative threshold).
///
/// The rate is multiplied by `factor` once the monitored value has failed to
/// improve for more than `patience` consecutive steps.
#[derive(Debug, Clone)]
pub struct ReduceLrOnPlateau {
    factor: f64,
    patience: usize,
    threshold: f64,
    min_lr: f64,
    lr: f64,
    best: f64,
    bad_epochs: usize,
}

impl ReduceLrOnPlateau {
    pub fn new(cfg: &PlateauConfig, initial_lr: f64) -> Self {
        Self {
            factor: cfg.factor,
            patience: cfg.patience,
            threshold: cfg.threshold,
            min_lr: cfg.min_lr,
            lr: initial_lr,
            best: f64::INFINITY,
            bad_epochs: 0,
        }
    }

    pub fn lr(&self) -> f64 {
        self.lr
    }

    pub fn best(&self) -> f64 {
        self.best
    }

    fn is_better(&self, value: f64) -> bool {
        value < self.best * (1.0 - self.threshold)
    }

    /// Records one validation loss; returns the new rate when it was reduced.
    pub fn observe(&mut self, value: f64) -> Option<f64> {
        if !value.is_finite() {
            tracing::warn!("validation loss is not finite; skipping plateau update");
            return None;
        }
        if self.is_better(value) {
            self.best = value;
            self.bad_epochs = 0;
            return None;
        }
        self.bad_epochs += 1;
        if self.bad_epochs <= self.patience {
            return None;
        }
        self.bad_epochs = 0;
        let new_lr = (self.lr * self.factor).max(self.min_lr);
        if self.lr - new_lr > 1e-12 {
            self.lr = new_lr;
            Some(new_lr)
        } else {
            None
        }
    }

    pub fn step(&mut self, value: f64, optimizer: &mut nn::Optimizer) -> Option<f64> {
        let reduced = self.observe(value);
        if let Some(lr) = reduced {
            optimizer.set_lr(lr);
            tracing::info!("learning rate reduced to {lr:.3e}");
        }
        reduced
    }
}
