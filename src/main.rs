// main.rs

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use waste_sort::checkpoint;
use waste_sort::config::Config;
use waste_sort::loader::{split_loaders, test_loader};
use waste_sort::metrics::TensorBoardWriter;
use waste_sort::model::{build_model, select_device, ModelSpec};
use waste_sort::partition::{partition_dataset, Split, SplitFractions};
use waste_sort::search;
use waste_sort::trainer::{RunToEnd, TrainerOptions, TwoStageTrainer};
use waste_sort::visualize::visualize_batch;
use waste_sort::{evaluate, Category};

#[derive(Parser, Debug)]
#[command(
    name = "waste-sort",
    version,
    about = "Train, tune and run a six-class waste image classifier."
)]
struct Cli {
    /// TOML configuration; built-in defaults are used when omitted
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Copy the raw pool into train/validation/test directories
    Partition,

    /// Partition, then run the frozen-backbone and fine-tuning stages
    Train {
        /// Reuse existing split directories
        #[arg(long)]
        skip_partition: bool,
    },

    /// Partition, then run hyperparameter trials and print the best one
    Search {
        #[arg(long)]
        trials: Option<usize>,

        #[arg(long)]
        skip_partition: bool,
    },

    /// Report accuracy and the confusion matrix on the test split
    Evaluate {
        /// Defaults to the newest stage checkpoint in the models directory
        #[arg(long)]
        checkpoint: Option<PathBuf>,

        /// Also write per-sample predictions here
        #[arg(long)]
        predictions: Option<PathBuf>,
    },

    /// Classify one image
    Predict {
        image: PathBuf,

        #[arg(long)]
        checkpoint: Option<PathBuf>,
    },

    /// Save a grid of one augmented training batch as PNG
    Preview {
        #[arg(long, default_value = "logs/batch_preview.png")]
        output: PathBuf,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("waste_sort=info")),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::load_or_default(cli.config.as_deref())
        .with_context(|| match &cli.config {
            Some(p) => format!("loading configuration from {}", p.display()),
            None => "validating default configuration".to_string(),
        })?;

    match cli.command {
        Command::Partition => partition(&config),
        Command::Train { skip_partition } => {
            if !skip_partition {
                partition(&config)?;
            }
            run_training(&config)
        }
        Command::Search {
            trials,
            skip_partition,
        } => {
            let mut config = config;
            if let Some(n) = trials {
                config.search.n_trials = n;
            }
            config.validate()?;
            if !skip_partition {
                partition(&config)?;
            }
            let device = select_device(config.training.device);
            let controller = search::tune(&config, device);
            if controller.best().is_none() {
                bail!("all {} trials failed", controller.trials().len());
            }
            Ok(())
        }
        Command::Evaluate {
            checkpoint,
            predictions,
        } => run_evaluation(&config, checkpoint, predictions),
        Command::Predict { image, checkpoint } => run_prediction(&config, &image, checkpoint),
        Command::Preview { output } => {
            let loaders = split_loaders(
                &config,
                &config.augmentation,
                config.data.batch_size,
                Category::COUNT,
            )?;
            let mut train = loaders.train;
            let n = visualize_batch(&mut train, &output)?;
            println!("Batch visualization ({n} images) saved to {}", output.display());
            Ok(())
        }
    }
}

fn partition(config: &Config) -> Result<()> {
    let report = partition_dataset(
        &config.paths.raw_dir,
        &config.paths.data_dir,
        SplitFractions {
            test: config.split.test_fraction,
            validation: config.split.val_fraction,
        },
        config.split.seed,
    )
    .context("partitioning the raw dataset")?;
    println!(
        "Partitioned: train={} validation={} test={}",
        report.total(Split::Train),
        report.total(Split::Validation),
        report.total(Split::Test)
    );
    Ok(())
}

fn run_training(config: &Config) -> Result<()> {
    let device = select_device(config.training.device);
    tch::manual_seed(config.training.seed);

    let mut loaders = split_loaders(
        config,
        &config.augmentation,
        config.data.batch_size,
        Category::COUNT,
    )?;
    let spec = ModelSpec::from_config(&config.model)?;
    let mut model = build_model(&spec, device)?;
    let mut sink = TensorBoardWriter::create(&config.paths.logs_dir, 1)?;
    let mut trainer = TwoStageTrainer::new(TrainerOptions::from_config(config));

    let outcome = trainer.run(&mut model, &mut loaders, &mut sink, &mut RunToEnd)?;
    println!(
        "Training finished: best validation loss {:.4}, final validation accuracy {:.2}%",
        outcome.best_val_loss(),
        outcome.final_val_accuracy().unwrap_or(0.0)
    );
    Ok(())
}

fn resolve_checkpoint(config: &Config, explicit: Option<PathBuf>) -> Result<PathBuf> {
    match explicit {
        Some(p) => Ok(p),
        None => checkpoint::best_available(&config.paths.models_dir).with_context(|| {
            format!(
                "no stage checkpoint in {}; run `train` first",
                config.paths.models_dir.display()
            )
        }),
    }
}

fn run_evaluation(
    config: &Config,
    checkpoint: Option<PathBuf>,
    predictions: Option<PathBuf>,
) -> Result<()> {
    let device = select_device(config.training.device);
    let checkpoint = resolve_checkpoint(config, checkpoint)?;
    let spec = ModelSpec::from_config(&config.model)?;
    let mut loader = test_loader(config, Category::COUNT)?;

    let results = evaluate::evaluate_test_set(&spec, &checkpoint, &mut loader, device)
        .with_context(|| format!("evaluating {}", checkpoint.display()))?;

    let names = Category::names();
    let confusion_csv = config.paths.logs_dir.join("confusion_matrix.csv");
    evaluate::save_confusion_matrix_csv(&results.confusion, &names, &confusion_csv)?;
    println!("Confusion matrix saved to {}", confusion_csv.display());
    if let Some(path) = predictions {
        evaluate::save_predictions_csv(&results, &path)?;
        println!("Predictions saved to {}", path.display());
    }
    Ok(())
}

fn run_prediction(config: &Config, image: &Path, checkpoint: Option<PathBuf>) -> Result<()> {
    let device = select_device(config.training.device);
    let checkpoint = resolve_checkpoint(config, checkpoint)?;
    let spec = ModelSpec::from_config(&config.model)?;
    let prediction = evaluate::predict(image, &checkpoint, &spec, config.data.image_size, device)
        .with_context(|| format!("classifying {}", image.display()))?;

    println!(
        "{}: {} ({:.2}%)",
        image.display(),
        prediction.category,
        prediction.confidence * 100.0
    );
    println!("{}", prediction.category.disposal_hint());
    Ok(())
}
