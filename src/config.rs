// config.rs

use crate::error::{Error, IoContext, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Complete run configuration. Every section has defaults so the basic
/// `train` command works without a config file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub paths: PathsConfig,
    pub split: SplitConfig,
    pub data: DataConfig,
    pub augmentation: AugmentationConfig,
    pub model: ModelConfig,
    pub training: TrainingConfig,
    pub search: SearchConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub data_dir: PathBuf,
    /// Raw pool organised as `<raw_dir>/<class>/*`.
    pub raw_dir: PathBuf,
    pub models_dir: PathBuf,
    pub logs_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            raw_dir: PathBuf::from("data/raw"),
            models_dir: PathBuf::from("models"),
            logs_dir: PathBuf::from("logs"),
        }
    }
}

impl PathsConfig {
    pub fn train_dir(&self) -> PathBuf {
        self.data_dir.join("train")
    }

    pub fn validation_dir(&self) -> PathBuf {
        self.data_dir.join("validation")
    }

    pub fn test_dir(&self) -> PathBuf {
        self.data_dir.join("test")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SplitConfig {
    pub test_fraction: f64,
    /// Applied to what remains after the test share is removed.
    pub val_fraction: f64,
    pub seed: u64,
}

impl Default for SplitConfig {
    fn default() -> Self {
        Self {
            test_fraction: 0.1,
            val_fraction: 0.1,
            seed: 42,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DataConfig {
    pub image_size: u32,
    pub batch_size: usize,
    pub train_workers: usize,
    pub validation_workers: usize,
    pub test_workers: usize,
    pub prefetch_depth: usize,
    pub shuffle_seed: u64,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            image_size: 224,
            batch_size: 32,
            train_workers: 12,
            validation_workers: 8,
            test_workers: 4,
            prefetch_depth: 4,
            shuffle_seed: 42,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AugmentationStrategy {
    /// Resize and horizontal flip only.
    Basic,
    /// Geometric and photometric perturbations, each gated by a probability.
    Extended,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AugmentationConfig {
    pub strategy: AugmentationStrategy,
    pub rotate90_p: f64,
    pub shift_scale_rotate_p: f64,
    /// Degrees.
    pub rotate_limit: f64,
    /// Fraction of the image side.
    pub shift_limit: f64,
    pub scale_limit: f64,
    pub hflip_p: f64,
    pub vflip_p: f64,
    pub color_jitter_p: f64,
    pub brightness: f64,
    pub contrast: f64,
    pub saturation: f64,
    /// Fraction of the hue circle, at most 0.5.
    pub hue: f64,
    pub blur_p: f64,
    pub blur_sigma: (f32, f32),
}

impl Default for AugmentationConfig {
    fn default() -> Self {
        Self {
            strategy: AugmentationStrategy::Extended,
            rotate90_p: 0.5,
            shift_scale_rotate_p: 0.5,
            rotate_limit: 30.0,
            shift_limit: 0.0625,
            scale_limit: 0.1,
            hflip_p: 0.5,
            vflip_p: 0.5,
            color_jitter_p: 0.5,
            brightness: 0.2,
            contrast: 0.2,
            saturation: 0.2,
            hue: 0.1,
            blur_p: 0.2,
            blur_sigma: (0.1, 2.0),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub backbone: String,
    pub pretrained: bool,
    /// `.safetensors` or `.ot` file holding backbone weights.
    pub pretrained_weights: Option<PathBuf>,
    pub dropout: f64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            backbone: "resnet18".to_string(),
            // set to true once weights/resnet18.ot is in place
            pretrained: false,
            pretrained_weights: Some(PathBuf::from("weights/resnet18.ot")),
            dropout: 0.2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptimizerKind {
    AdamW,
    RmsProp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceChoice {
    Auto,
    Cpu,
}

/// Both fields are required when a stage table is given.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageConfig {
    pub epochs: usize,
    pub learning_rate: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlateauConfig {
    pub factor: f64,
    pub patience: usize,
    pub threshold: f64,
    pub min_lr: f64,
}

impl Default for PlateauConfig {
    fn default() -> Self {
        Self {
            factor: 0.5,
            patience: 3,
            threshold: 1e-4,
            min_lr: 0.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    pub optimizer: OptimizerKind,
    pub weight_decay: f64,
    pub stage1: StageConfig,
    pub stage2: StageConfig,
    pub plateau: PlateauConfig,
    pub device: DeviceChoice,
    pub seed: i64,
    pub progress: bool,
}

impl Default for StageConfig {
    fn default() -> Self {
        Self {
            epochs: 15,
            learning_rate: 1e-3,
        }
    }
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            optimizer: OptimizerKind::AdamW,
            weight_decay: 1e-4,
            stage1: StageConfig::default(),
            stage2: StageConfig {
                epochs: 30,
                learning_rate: 1e-5,
            },
            plateau: PlateauConfig::default(),
            device: DeviceChoice::Auto,
            seed: 42,
            progress: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    pub n_trials: usize,
    pub seed: u64,
    /// Completed trials required before pruning starts.
    pub startup_trials: usize,
    /// Steps within a trial before it can be pruned.
    pub warmup_steps: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            n_trials: 3,
            seed: 42,
            startup_trials: 5,
            warmup_steps: 0,
        }
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).at(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        tracing::debug!("loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Loads `path` when given, defaults otherwise.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(p) => Self::load(p),
            None => {
                let config = Config::default();
                config.validate()?;
                Ok(config)
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();

        let open_unit = |v: f64| v > 0.0 && v < 1.0;
        if !open_unit(self.split.test_fraction) {
            errors.push("split.test_fraction must be in (0, 1)".to_string());
        }
        if !open_unit(self.split.val_fraction) {
            errors.push("split.val_fraction must be in (0, 1)".to_string());
        }

        if self.data.image_size < 8 {
            errors.push("data.image_size must be at least 8".to_string());
        }
        if self.data.batch_size == 0 {
            errors.push("data.batch_size must be greater than 0".to_string());
        }
        if self.data.prefetch_depth == 0 {
            errors.push("data.prefetch_depth must be greater than 0".to_string());
        }
        for (name, workers) in [
            ("train_workers", self.data.train_workers),
            ("validation_workers", self.data.validation_workers),
            ("test_workers", self.data.test_workers),
        ] {
            if workers == 0 {
                errors.push(format!("data.{name} must be greater than 0"));
            }
        }

        let aug = &self.augmentation;
        for (name, p) in [
            ("rotate90_p", aug.rotate90_p),
            ("shift_scale_rotate_p", aug.shift_scale_rotate_p),
            ("hflip_p", aug.hflip_p),
            ("vflip_p", aug.vflip_p),
            ("color_jitter_p", aug.color_jitter_p),
            ("blur_p", aug.blur_p),
        ] {
            if !(0.0..=1.0).contains(&p) {
                errors.push(format!("augmentation.{name} must be a probability"));
            }
        }
        if !(0.0..=0.5).contains(&aug.hue) {
            errors.push("augmentation.hue must be in [0, 0.5]".to_string());
        }
        if aug.brightness < 0.0 || aug.contrast < 0.0 || aug.saturation < 0.0 {
            errors.push("augmentation color jitter bounds must be non-negative".to_string());
        }
        if !(0.0..1.0).contains(&aug.scale_limit) {
            errors.push("augmentation.scale_limit must be in [0, 1)".to_string());
        }
        if aug.shift_limit < 0.0 || aug.rotate_limit < 0.0 {
            errors.push("augmentation shift/rotate limits must be non-negative".to_string());
        }
        if aug.blur_sigma.0 <= 0.0 || aug.blur_sigma.1 < aug.blur_sigma.0 {
            errors.push("augmentation.blur_sigma must be a positive ascending range".to_string());
        }

        if self.model.pretrained && self.model.pretrained_weights.is_none() {
            errors.push("model.pretrained requires model.pretrained_weights".to_string());
        }
        if !(0.0..1.0).contains(&self.model.dropout) {
            errors.push("model.dropout must be in [0, 1)".to_string());
        }

        let t = &self.training;
        if t.stage1.learning_rate <= 0.0 || t.stage2.learning_rate <= 0.0 {
            errors.push("training learning rates must be greater than 0".to_string());
        }
        if t.stage1.epochs == 0 || t.stage2.epochs == 0 {
            errors.push("training stage epochs must be greater than 0".to_string());
        }
        if t.weight_decay < 0.0 {
            errors.push("training.weight_decay must be non-negative".to_string());
        }
        if !(t.plateau.factor > 0.0 && t.plateau.factor < 1.0) {
            errors.push("training.plateau.factor must be in (0, 1)".to_string());
        }

        if self.search.n_trials == 0 {
            errors.push("search.n_trials must be greater than 0".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(Error::Config(errors))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let cfg: Config = toml::from_str(
            r#"
            [model]
            backbone = "simple_cnn"
            pretrained = false

            [training]
            optimizer = "rmsprop"

            [training.stage2]
            epochs = 4
            learning_rate = 2e-5
            "#,
        )
        .unwrap();
        assert_eq!(cfg.model.backbone, "simple_cnn");
        assert_eq!(cfg.training.optimizer, OptimizerKind::RmsProp);
        assert_eq!(cfg.training.stage2.epochs, 4);
        assert_eq!(cfg.data.batch_size, 32);
        assert_eq!(cfg.augmentation.strategy, AugmentationStrategy::Extended);
        cfg.validate().unwrap();
    }

    #[test]
    fn validation_collects_every_violation() {
        let mut cfg = Config::default();
        cfg.split.test_fraction = 1.5;
        cfg.data.batch_size = 0;
        cfg.augmentation.hue = 0.9;
        match cfg.validate() {
            Err(Error::Config(msgs)) => assert_eq!(msgs.len(), 3),
            other => panic!("expected config error, got {other:?}"),
        }
    }
}
