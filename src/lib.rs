//! Two-stage transfer-learning pipeline for classifying waste photographs
//! into six material categories.

pub mod augment;
pub mod category;
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod evaluate;
pub mod loader;
pub mod metrics;
pub mod model;
pub mod partition;
pub mod scheduler;
pub mod search;
pub mod trainer;
pub mod visualize;

pub use category::Category;
pub use config::Config;
pub use error::{Error, Result};
pub use evaluate::{evaluate_test_set, predict, Prediction, Predictor};
pub use model::{build_model, Backbone, ModelSpec, WasteModel};
pub use partition::{partition_dataset, PartitionReport, SplitFractions};
pub use trainer::{EpochObserver, TrainerState, TwoStageTrainer};
