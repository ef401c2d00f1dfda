// trainer.rs

use crate::checkpoint::{stage_checkpoint, RunningBest};
use crate::config::{Config, OptimizerKind, PlateauConfig, StageConfig};
use crate::error::{Error, Result};
use crate::loader::{DataLoader, SplitLoaders};
use crate::metrics::{EpochRecord, MetricsSink, TrainingStats};
use crate::model::WasteModel;
use crate::scheduler::ReduceLrOnPlateau;
use indicatif::{ProgressBar, ProgressStyle};
use std::ops::ControlFlow;
use std::path::PathBuf;
use tch::nn::{self, OptimizerConfig};
use tch::Kind;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrainerState {
    /// Backbone frozen, head trainable.
    Stage1Warmup,
    /// Every parameter trainable, plateau schedule active.
    Stage2Finetune,
    Done,
}

impl TrainerState {
    fn name(self) -> &'static str {
        match self {
            TrainerState::Stage1Warmup => "stage1-warmup",
            TrainerState::Stage2Finetune => "stage2-finetune",
            TrainerState::Done => "done",
        }
    }
}

#[derive(Debug, Clone)]
pub struct TrainerOptions {
    pub optimizer: OptimizerKind,
    pub weight_decay: f64,
    pub stage1: StageConfig,
    pub stage2: StageConfig,
    pub plateau: PlateauConfig,
    pub models_dir: PathBuf,
    pub logs_dir: PathBuf,
    pub progress: bool,
}

impl TrainerOptions {
    pub fn from_config(config: &Config) -> Self {
        let t = &config.training;
        Self {
            optimizer: t.optimizer,
            weight_decay: t.weight_decay,
            stage1: t.stage1.clone(),
            stage2: t.stage2.clone(),
            plateau: t.plateau.clone(),
            models_dir: config.paths.models_dir.clone(),
            logs_dir: config.paths.logs_dir.clone(),
            progress: t.progress,
        }
    }
}

/// Summary of one finished epoch, handed to the observer.
#[derive(Debug, Clone, Copy)]
pub struct EpochReport {
    pub stage: u8,
    /// 1-based within the stage.
    pub epoch: usize,
    pub epochs: usize,
    /// 0-based across both stages.
    pub global_step: usize,
    pub train_loss: f64,
    pub train_accuracy: f64,
    pub val_loss: f64,
    pub val_accuracy: f64,
    pub learning_rate: f64,
    pub checkpoint_written: bool,
}

/// Called after every epoch; `Break` stops training before the next one.
pub trait EpochObserver {
    fn on_epoch_end(&mut self, report: &EpochReport) -> ControlFlow<()>;
}

impl<F> EpochObserver for F
where
    F: FnMut(&EpochReport) -> ControlFlow<()>,
{
    fn on_epoch_end(&mut self, report: &EpochReport) -> ControlFlow<()> {
        self(report)
    }
}

/// Observer that never interrupts.
#[derive(Debug, Default)]
pub struct RunToEnd;

impl EpochObserver for RunToEnd {
    fn on_epoch_end(&mut self, _report: &EpochReport) -> ControlFlow<()> {
        ControlFlow::Continue(())
    }
}

#[derive(Debug, Clone)]
pub struct StageOutcome {
    pub stage: u8,
    pub stats: TrainingStats,
    /// Running best after this stage, to be passed to the next one.
    pub best: RunningBest,
    pub final_val_accuracy: Option<f64>,
    pub checkpoint_written: bool,
    pub stopped_early: bool,
}

#[derive(Debug, Clone)]
pub struct TrainingOutcome {
    pub stage1: StageOutcome,
    /// Absent when the observer stopped training during stage 1.
    pub stage2: Option<StageOutcome>,
}

impl TrainingOutcome {
    pub fn best_val_loss(&self) -> f64 {
        self.stage2
            .as_ref()
            .unwrap_or(&self.stage1)
            .best
            .loss()
    }

    /// Validation accuracy of the last epoch that ran.
    pub fn final_val_accuracy(&self) -> Option<f64> {
        self.stage2
            .as_ref()
            .and_then(|s| s.final_val_accuracy)
            .or(self.stage1.final_val_accuracy)
    }

    pub fn stopped_early(&self) -> bool {
        self.stage1.stopped_early || self.stage2.as_ref().map_or(false, |s| s.stopped_early)
    }
}

/// Frozen-backbone warmup followed by full fine-tuning.
#[derive(Debug)]
pub struct TwoStageTrainer {
    options: TrainerOptions,
    state: TrainerState,
    global_step: usize,
}

impl TwoStageTrainer {
    pub fn new(options: TrainerOptions) -> Self {
        Self {
            options,
            state: TrainerState::Stage1Warmup,
            global_step: 0,
        }
    }

    pub fn state(&self) -> TrainerState {
        self.state
    }

    fn expect_state(&self, expected: TrainerState, action: &'static str) -> Result<()> {
        if self.state == expected {
            Ok(())
        } else {
            Err(Error::TrainerState {
                state: self.state.name(),
                action,
            })
        }
    }

    /// Runs both stages with a fresh running best.
    pub fn run(
        &mut self,
        model: &mut WasteModel,
        loaders: &mut SplitLoaders,
        sink: &mut dyn MetricsSink,
        observer: &mut dyn EpochObserver,
    ) -> Result<TrainingOutcome> {
        let stage1 = self.run_stage1(model, loaders, sink, observer, RunningBest::new())?;
        if stage1.stopped_early {
            self.state = TrainerState::Done;
            return Ok(TrainingOutcome {
                stage1,
                stage2: None,
            });
        }
        let stage2 = self.run_stage2(model, loaders, sink, observer, stage1.best)?;
        Ok(TrainingOutcome {
            stage1,
            stage2: Some(stage2),
        })
    }

    pub fn run_stage1(
        &mut self,
        model: &mut WasteModel,
        loaders: &mut SplitLoaders,
        sink: &mut dyn MetricsSink,
        observer: &mut dyn EpochObserver,
        best: RunningBest,
    ) -> Result<StageOutcome> {
        self.expect_state(TrainerState::Stage1Warmup, "run stage 1")?;
        let frozen = model.freeze_backbone();
        tracing::info!(
            "stage 1: {} backbone tensors frozen, {} trainable parameters",
            frozen,
            model.trainable_count()
        );
        let settings = self.options.stage1.clone();
        let outcome = self.run_stage(1, &settings, model, loaders, sink, observer, best)?;
        self.state = if outcome.stopped_early {
            TrainerState::Done
        } else {
            TrainerState::Stage2Finetune
        };
        Ok(outcome)
    }

    pub fn run_stage2(
        &mut self,
        model: &mut WasteModel,
        loaders: &mut SplitLoaders,
        sink: &mut dyn MetricsSink,
        observer: &mut dyn EpochObserver,
        best: RunningBest,
    ) -> Result<StageOutcome> {
        self.expect_state(TrainerState::Stage2Finetune, "run stage 2")?;
        model.unfreeze_all();
        tracing::info!(
            "stage 2: all {} parameters trainable",
            model.trainable_count()
        );
        let settings = self.options.stage2.clone();
        let outcome = self.run_stage(2, &settings, model, loaders, sink, observer, best)?;
        self.state = TrainerState::Done;
        Ok(outcome)
    }

    #[allow(clippy::too_many_arguments)]
    fn run_stage(
        &mut self,
        stage: u8,
        settings: &StageConfig,
        model: &mut WasteModel,
        loaders: &mut SplitLoaders,
        sink: &mut dyn MetricsSink,
        observer: &mut dyn EpochObserver,
        mut best: RunningBest,
    ) -> Result<StageOutcome> {
        let mut optimizer = build_optimizer(
            self.options.optimizer,
            model.var_store(),
            settings.learning_rate,
            self.options.weight_decay,
        )?;
        // the plateau schedule only drives fine-tuning
        let mut scheduler =
            (stage == 2).then(|| ReduceLrOnPlateau::new(&self.options.plateau, settings.learning_rate));
        let checkpoint = stage_checkpoint(&self.options.models_dir, stage);

        // Initialize statistics tracking
        let mut stats = TrainingStats::new();
        let mut checkpoint_written = false;
        let mut stopped_early = false;

        for epoch in 1..=settings.epochs {
            let learning_rate = scheduler
                .as_ref()
                .map_or(settings.learning_rate, |s| s.lr());

            // ── 1. training phase ───────────────────────────────────────────
            let progress = self.progress_bar(stage, epoch, settings.epochs, loaders.train.num_batches());
            let (train_loss, train_accuracy) =
                train_epoch(model, &mut loaders.train, &mut optimizer, progress)?;
            if !train_loss.is_finite() {
                return Err(Error::NonFiniteLoss {
                    stage,
                    epoch,
                    phase: "training",
                });
            }

            // ── 2. validation phase ─────────────────────────────────────────
            let (val_loss, val_accuracy) = validate_epoch(model, &mut loaders.validation)?;
            if !val_loss.is_finite() {
                return Err(Error::NonFiniteLoss {
                    stage,
                    epoch,
                    phase: "validation",
                });
            }

            // ── 3. metrics and progress line ────────────────────────────────
            let step = (epoch - 1) as i64;
            sink.scalar(&format!("Loss/train_stage{stage}"), step, train_loss)?;
            sink.scalar(&format!("Loss/validation_stage{stage}"), step, val_loss)?;
            sink.scalar(&format!("Accuracy/validation_stage{stage}"), step, val_accuracy)?;
            sink.scalar(&format!("LearningRate/stage{stage}"), step, learning_rate)?;

            println!(
                "[STAGE {}] Epoch {}/{}: Train Loss: {:.4}, Validation Loss: {:.4}, Validation Accuracy: {:.2}%",
                stage, epoch, settings.epochs, train_loss, val_loss, val_accuracy
            );

            // ── 4. checkpoint on a new running best ─────────────────────────
            let improved = best.consider(val_loss, model.var_store(), &checkpoint)?;
            if improved {
                checkpoint_written = true;
                tracing::info!(
                    "validation loss improved to {:.4}; saved {}",
                    val_loss,
                    checkpoint.display()
                );
            }

            // Learning rate scheduling
            if let Some(s) = scheduler.as_mut() {
                s.step(val_loss, &mut optimizer);
            }

            stats.push(EpochRecord {
                epoch,
                train_loss,
                train_accuracy,
                val_loss,
                val_accuracy,
                learning_rate,
            });

            // ── 5. observer may stop the run between epochs ─────────────────
            let report = EpochReport {
                stage,
                epoch,
                epochs: settings.epochs,
                global_step: self.global_step,
                train_loss,
                train_accuracy,
                val_loss,
                val_accuracy,
                learning_rate,
                checkpoint_written: improved,
            };
            self.global_step += 1;
            if observer.on_epoch_end(&report).is_break() {
                tracing::info!("stage {} stopped after epoch {}", stage, epoch);
                stopped_early = true;
                break;
            }
        }

        // Save training statistics
        sink.flush()?;
        stats.save_to_csv(&self.options.logs_dir.join(format!("stage{stage}_metrics.csv")))?;

        Ok(StageOutcome {
            stage,
            final_val_accuracy: stats.last().map(|r| r.val_accuracy),
            stats,
            best,
            checkpoint_written,
            stopped_early,
        })
    }

    fn progress_bar(&self, stage: u8, epoch: usize, epochs: usize, len: usize) -> Option<ProgressBar> {
        if !self.options.progress {
            return None;
        }
        let pb = ProgressBar::new(len as u64);
        let style = ProgressStyle::with_template(
            "  [stage {prefix}] {elapsed_precise} │{bar:40.green/blue}│ {pos}/{len} batches • {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▓░");
        pb.set_style(style);
        pb.set_prefix(format!("{stage} ep {epoch}/{epochs}"));
        Some(pb)
    }
}

pub fn build_optimizer(
    kind: OptimizerKind,
    vs: &nn::VarStore,
    learning_rate: f64,
    weight_decay: f64,
) -> Result<nn::Optimizer> {
    let optimizer = match kind {
        OptimizerKind::AdamW => nn::AdamW {
            wd: weight_decay,
            ..Default::default()
        }
        .build(vs, learning_rate)?,
        OptimizerKind::RmsProp => nn::RmsProp {
            wd: weight_decay,
            ..Default::default()
        }
        .build(vs, learning_rate)?,
    };
    Ok(optimizer)
}

/// One optimisation pass. Returns the sample-weighted mean loss and the
/// accuracy in percent.
pub fn train_epoch(
    model: &WasteModel,
    loader: &mut DataLoader,
    optimizer: &mut nn::Optimizer,
    progress: Option<ProgressBar>,
) -> Result<(f64, f64)> {
    let device = model.device();
    let mut total_loss = 0.0;
    let mut total_samples = 0i64;
    let mut total_correct = 0i64;

    for batch in loader.iter()? {
        let batch = batch?;
        let images = batch.images.to_device(device);
        let labels = batch.labels.to_device(device);

        // Forward pass
        optimizer.zero_grad();
        let outputs = model.forward_t(&images, true);
        let loss = outputs.cross_entropy_for_logits(&labels);
        let loss_value = loss.double_value(&[]);
        if !loss_value.is_finite() {
            if let Some(pb) = &progress {
                pb.finish_and_clear();
            }
            return Ok((loss_value, 0.0));
        }
        // Backward pass
        loss.backward();
        optimizer.step();

        let batch_size = images.size()[0];
        total_loss += loss_value * batch_size as f64;
        total_samples += batch_size;
        let correct = outputs
            .argmax(-1, false)
            .eq_tensor(&labels)
            .to_kind(Kind::Int64)
            .sum(Kind::Int64);
        total_correct += correct.int64_value(&[]);

        if let Some(pb) = &progress {
            pb.set_message(format!("loss {:.4}", total_loss / total_samples as f64));
            pb.inc(1);
        }
    }
    if let Some(pb) = progress {
        pb.finish_and_clear();
    }

    let samples = total_samples.max(1) as f64;
    Ok((total_loss / samples, total_correct as f64 / samples * 100.0))
}

/// Validation pass under `no_grad`.
pub fn validate_epoch(model: &WasteModel, loader: &mut DataLoader) -> Result<(f64, f64)> {
    let device = model.device();
    let mut total_loss = 0.0;
    let mut total_samples = 0i64;
    let mut total_correct = 0i64;

    tch::no_grad(|| -> Result<()> {
        for batch in loader.iter()? {
            let batch = batch?;
            let images = batch.images.to_device(device);
            let labels = batch.labels.to_device(device);

            let outputs = model.forward_t(&images, false);
            let loss = outputs.cross_entropy_for_logits(&labels);

            let batch_size = images.size()[0];
            total_loss += loss.double_value(&[]) * batch_size as f64;
            total_samples += batch_size;
            let correct = outputs
                .argmax(-1, false)
                .eq_tensor(&labels)
                .to_kind(Kind::Int64)
                .sum(Kind::Int64);
            total_correct += correct.int64_value(&[]);
        }
        Ok(())
    })?;

    let samples = total_samples.max(1) as f64;
    Ok((total_loss / samples, total_correct as f64 / samples * 100.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn options_follow_config() {
        let mut config = Config::default();
        config.training.optimizer = OptimizerKind::RmsProp;
        config.training.stage2.epochs = 7;
        let opts = TrainerOptions::from_config(&config);
        assert_eq!(opts.optimizer, OptimizerKind::RmsProp);
        assert_eq!(opts.stage1.learning_rate, 1e-3);
        assert_eq!(opts.stage2.epochs, 7);
        assert_eq!(opts.models_dir, PathBuf::from("models"));
    }

    #[test]
    fn stage2_cannot_run_first() {
        let trainer = TwoStageTrainer::new(TrainerOptions::from_config(&Config::default()));
        assert_eq!(trainer.state(), TrainerState::Stage1Warmup);
        assert!(matches!(
            trainer.expect_state(TrainerState::Stage2Finetune, "run stage 2"),
            Err(Error::TrainerState { state: "stage1-warmup", .. })
        ));
    }

    #[test]
    fn closures_are_observers() {
        let mut seen = Vec::new();
        let mut observer = |r: &EpochReport| {
            seen.push(r.global_step);
            if r.global_step >= 1 {
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            }
        };
        let mut report = EpochReport {
            stage: 1,
            epoch: 1,
            epochs: 2,
            global_step: 0,
            train_loss: 1.0,
            train_accuracy: 10.0,
            val_loss: 1.0,
            val_accuracy: 10.0,
            learning_rate: 1e-3,
            checkpoint_written: false,
        };
        assert!(observer.on_epoch_end(&report).is_continue());
        report.global_step = 1;
        assert!(observer.on_epoch_end(&report).is_break());
        assert_eq!(seen, vec![0, 1]);
    }
}
