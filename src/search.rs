// search.rs

use crate::category::Category;
use crate::config::{AugmentationStrategy, Config, OptimizerKind, SearchConfig};
use crate::error::Result;
use crate::loader::split_loaders;
use crate::metrics::TensorBoardWriter;
use crate::model::{build_model, ModelSpec};
use crate::trainer::{EpochObserver, EpochReport, TrainerOptions, TwoStageTrainer};
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::fmt;
use std::ops::ControlFlow;
use std::panic::{self, AssertUnwindSafe};
use tch::Device;

const BATCH_SIZES: [usize; 3] = [16, 32, 64];
const OPTIMIZERS: [OptimizerKind; 2] = [OptimizerKind::AdamW, OptimizerKind::RmsProp];

/// One sampled configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct TrialParams {
    pub batch_size: usize,
    pub lr_stage1: f64,
    pub lr_stage2: f64,
    pub weight_decay: f64,
    pub optimizer: OptimizerKind,
    pub stage1_epochs: usize,
    pub stage2_epochs: usize,
    pub rotate_limit: u32,
    pub shift_limit: f64,
    pub scale_limit: f64,
    pub brightness: f64,
    pub contrast: f64,
    pub saturation: f64,
    pub hue: f64,
}

fn log_uniform(rng: &mut ChaCha8Rng, lo: f64, hi: f64) -> f64 {
    rng.gen_range(lo.ln()..=hi.ln()).exp()
}

impl TrialParams {
    /// Draws every parameter independently from its range.
    pub fn sample(rng: &mut ChaCha8Rng) -> Self {
        Self {
            batch_size: *BATCH_SIZES.choose(rng).unwrap_or(&32),
            lr_stage1: log_uniform(rng, 1e-4, 1e-2),
            lr_stage2: log_uniform(rng, 1e-6, 1e-3),
            weight_decay: log_uniform(rng, 1e-6, 1e-2),
            optimizer: *OPTIMIZERS.choose(rng).unwrap_or(&OptimizerKind::AdamW),
            stage1_epochs: rng.gen_range(5..=15),
            stage2_epochs: rng.gen_range(10..=30),
            rotate_limit: rng.gen_range(10..=45),
            shift_limit: rng.gen_range(0.01..=1.0),
            scale_limit: rng.gen_range(0.05..=0.15),
            brightness: rng.gen_range(0.1..=0.5),
            contrast: rng.gen_range(0.1..=0.5),
            saturation: rng.gen_range(0.1..=0.5),
            hue: rng.gen_range(0.1..=0.5),
        }
    }

    /// `base` with this trial's values written over it.
    pub fn apply(&self, base: &Config) -> Config {
        let mut config = base.clone();
        config.data.batch_size = self.batch_size;

        let t = &mut config.training;
        t.optimizer = self.optimizer;
        t.weight_decay = self.weight_decay;
        t.stage1.learning_rate = self.lr_stage1;
        t.stage1.epochs = self.stage1_epochs;
        t.stage2.learning_rate = self.lr_stage2;
        t.stage2.epochs = self.stage2_epochs;

        let aug = &mut config.augmentation;
        aug.strategy = AugmentationStrategy::Extended;
        aug.rotate_limit = self.rotate_limit as f64;
        aug.shift_limit = self.shift_limit;
        aug.scale_limit = self.scale_limit;
        aug.brightness = self.brightness;
        aug.contrast = self.contrast;
        aug.saturation = self.saturation;
        aug.hue = self.hue;
        config
    }

    pub fn entries(&self) -> Vec<(&'static str, String)> {
        let optimizer = match self.optimizer {
            OptimizerKind::AdamW => "AdamW",
            OptimizerKind::RmsProp => "RMSprop",
        };
        vec![
            ("batch_size", self.batch_size.to_string()),
            ("lr_stage1", self.lr_stage1.to_string()),
            ("lr_stage2", self.lr_stage2.to_string()),
            ("weight_decay", self.weight_decay.to_string()),
            ("optimizer", optimizer.to_string()),
            ("stage1_epochs", self.stage1_epochs.to_string()),
            ("stage2_epochs", self.stage2_epochs.to_string()),
            ("rotate_limit", self.rotate_limit.to_string()),
            ("shift_limit", self.shift_limit.to_string()),
            ("scale_limit", self.scale_limit.to_string()),
            ("brightness", self.brightness.to_string()),
            ("contrast", self.contrast.to_string()),
            ("saturation", self.saturation.to_string()),
            ("hue", self.hue.to_string()),
        ]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrialState {
    Complete,
    Pruned,
    Failed,
}

impl fmt::Display for TrialState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TrialState::Complete => "complete",
            TrialState::Pruned => "pruned",
            TrialState::Failed => "failed",
        })
    }
}

#[derive(Debug, Clone)]
pub struct TrialRecord {
    pub number: usize,
    pub params: TrialParams,
    pub state: TrialState,
    /// Objective; negative infinity for failed trials.
    pub value: f64,
    /// (step, validation accuracy) for every reported epoch.
    pub intermediate: Vec<(usize, f64)>,
    pub error: Option<String>,
}

impl TrialRecord {
    pub fn value_at(&self, step: usize) -> Option<f64> {
        self.intermediate
            .iter()
            .find(|(s, _)| *s == step)
            .map(|(_, v)| *v)
    }
}

/// Stops a trial whose intermediate value falls below the median of the
/// completed trials at the same step.
#[derive(Debug, Clone)]
pub struct MedianPruner {
    pub startup_trials: usize,
    pub warmup_steps: usize,
}

impl MedianPruner {
    pub fn from_config(cfg: &SearchConfig) -> Self {
        Self {
            startup_trials: cfg.startup_trials,
            warmup_steps: cfg.warmup_steps,
        }
    }

    pub fn should_prune(&self, history: &[TrialRecord], step: usize, value: f64) -> bool {
        let completed: Vec<&TrialRecord> = history
            .iter()
            .filter(|t| t.state == TrialState::Complete)
            .collect();
        if completed.len() < self.startup_trials || step < self.warmup_steps {
            return false;
        }
        let mut at_step: Vec<f64> = completed.iter().filter_map(|t| t.value_at(step)).collect();
        if at_step.is_empty() {
            return false;
        }
        at_step.sort_by(|a, b| a.total_cmp(b));
        let mid = at_step.len() / 2;
        let median = if at_step.len() % 2 == 0 {
            (at_step[mid - 1] + at_step[mid]) / 2.0
        } else {
            at_step[mid]
        };
        value < median
    }
}

/// Handed to the objective; collects intermediate values and answers
/// whether the trial should stop.
pub struct TrialReporter<'a> {
    number: usize,
    pruner: &'a MedianPruner,
    history: &'a [TrialRecord],
    intermediate: Vec<(usize, f64)>,
    pruned: bool,
}

impl<'a> TrialReporter<'a> {
    pub fn number(&self) -> usize {
        self.number
    }

    pub fn report(&mut self, step: usize, value: f64) -> ControlFlow<()> {
        self.intermediate.push((step, value));
        if self.pruner.should_prune(self.history, step, value) {
            tracing::info!("trial {} pruned at step {} (value {:.2})", self.number, step, value);
            self.pruned = true;
            ControlFlow::Break(())
        } else {
            ControlFlow::Continue(())
        }
    }

    pub fn is_pruned(&self) -> bool {
        self.pruned
    }
}

impl EpochObserver for TrialReporter<'_> {
    fn on_epoch_end(&mut self, report: &EpochReport) -> ControlFlow<()> {
        self.report(report.global_step, report.val_accuracy)
    }
}

/// Runs trials one after another and keeps every record.
pub struct SearchController {
    n_trials: usize,
    rng: ChaCha8Rng,
    pruner: MedianPruner,
    trials: Vec<TrialRecord>,
}

impl SearchController {
    pub fn new(cfg: &SearchConfig) -> Self {
        Self {
            n_trials: cfg.n_trials,
            rng: ChaCha8Rng::seed_from_u64(cfg.seed),
            pruner: MedianPruner::from_config(cfg),
            trials: Vec::new(),
        }
    }

    pub fn trials(&self) -> &[TrialRecord] {
        &self.trials
    }

    /// Highest objective among completed trials.
    pub fn best(&self) -> Option<&TrialRecord> {
        self.trials
            .iter()
            .filter(|t| t.state == TrialState::Complete)
            .max_by(|a, b| a.value.total_cmp(&b.value))
    }

    /// Errors and panics inside `objective` mark the trial failed; the
    /// search always continues with the next trial.
    pub fn run<F>(&mut self, mut objective: F) -> Option<&TrialRecord>
    where
        F: FnMut(&TrialParams, &mut TrialReporter<'_>) -> Result<f64>,
    {
        for number in 0..self.n_trials {
            let params = TrialParams::sample(&mut self.rng);
            tracing::info!("trial {}/{} starting", number + 1, self.n_trials);

            let mut reporter = TrialReporter {
                number,
                pruner: &self.pruner,
                history: &self.trials,
                intermediate: Vec::new(),
                pruned: false,
            };
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| objective(&params, &mut reporter)));
            let pruned = reporter.is_pruned();
            let intermediate = std::mem::take(&mut reporter.intermediate);

            let (state, value, error) = match outcome {
                Ok(Ok(value)) if pruned => (TrialState::Pruned, value, None),
                Ok(Ok(value)) => (TrialState::Complete, value, None),
                Ok(Err(e)) => (TrialState::Failed, f64::NEG_INFINITY, Some(e.to_string())),
                Err(payload) => (
                    TrialState::Failed,
                    f64::NEG_INFINITY,
                    Some(panic_message(payload.as_ref())),
                ),
            };
            match &error {
                Some(msg) => tracing::warn!("trial {} failed: {}", number, msg),
                None => tracing::info!("trial {} {} with value {:.4}", number, state, value),
            }
            self.trials.push(TrialRecord {
                number,
                params,
                state,
                value,
                intermediate,
                error,
            });
        }
        self.best()
    }

    pub fn print_best(&self) {
        match self.best() {
            Some(best) => {
                println!("Best trial:");
                println!("Value:  {}", best.value);
                println!("Params: ");
                for (key, value) in best.params.entries() {
                    println!("{key}: {value}");
                }
            }
            None => println!("No trial completed."),
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("panicked: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("panicked: {s}")
    } else {
        "panicked".to_string()
    }
}

/// Builds fresh loaders, model and trainer for one trial. Checkpoints and
/// logs go to `trial_NNN` sub-directories of the configured paths.
pub fn run_trial(
    base: &Config,
    params: &TrialParams,
    reporter: &mut TrialReporter<'_>,
    device: Device,
) -> Result<f64> {
    let mut config = params.apply(base);
    let trial_dir = format!("trial_{:03}", reporter.number());
    config.paths.models_dir = base.paths.models_dir.join(&trial_dir);
    config.paths.logs_dir = base.paths.logs_dir.join(&trial_dir);
    config.validate()?;

    tch::manual_seed(config.training.seed);
    let mut loaders = split_loaders(
        &config,
        &config.augmentation,
        config.data.batch_size,
        Category::COUNT,
    )?;
    let mut model = build_model(&ModelSpec::from_config(&config.model)?, device)?;
    let mut sink = TensorBoardWriter::create(&config.paths.logs_dir, 1)?;
    let mut trainer = TwoStageTrainer::new(TrainerOptions::from_config(&config));

    let outcome = trainer.run(&mut model, &mut loaders, &mut sink, reporter)?;
    Ok(outcome.final_val_accuracy().unwrap_or(0.0))
}

/// Runs the configured number of trials and prints the best one.
pub fn tune(base: &Config, device: Device) -> SearchController {
    let mut controller = SearchController::new(&base.search);
    controller.run(|params, reporter| run_trial(base, params, reporter, device));
    controller.print_best();
    controller
}
