//! Eye Condition CNN CLI
//!
//! Entry point for training the fundus classifier, inspecting a dataset
//! root, and running single-image predictions.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use tracing::info;

use eye_condition_cnn::backend::{backend_name, default_device, DefaultBackend, TrainingBackend};
use eye_condition_cnn::config::{AppConfig, ConfigOverrides, DataConfig};
use eye_condition_cnn::dataset::{AugmentationConfig, DatasetGenerators};
use eye_condition_cnn::inference::{Predictor, DEFAULT_TOP_K};
use eye_condition_cnn::training::run_training;
use eye_condition_cnn::utils::logging::{init_logging, LogConfig};

/// Transfer-learning classifier for eye-fundus images
#[derive(Parser, Debug)]
#[command(name = "eye_condition_cnn")]
#[command(version)]
#[command(about = "Train an eye-condition classifier on a folder-per-class fundus dataset", long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, default_value = "false")]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Train the classifier and export its checkpoints
    Train {
        /// TOML configuration file; flags below override it
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Dataset root with one subdirectory per class
        #[arg(short, long)]
        data_dir: Option<PathBuf>,

        #[arg(short, long)]
        epochs: Option<usize>,

        #[arg(short, long)]
        batch_size: Option<usize>,

        #[arg(short, long)]
        learning_rate: Option<f64>,

        /// Fraction of each class held out for validation
        #[arg(long)]
        validation_split: Option<f64>,

        #[arg(long)]
        seed: Option<u64>,

        /// Epochs without val_accuracy improvement before stopping
        #[arg(long)]
        patience: Option<usize>,

        /// Directory for checkpoints, labels and history
        #[arg(short, long)]
        output_dir: Option<PathBuf>,

        /// ImageNet EfficientNet-B0 weights (.safetensors from torchvision or timm)
        #[arg(long)]
        backbone_weights: Option<PathBuf>,

        /// Train without pretrained weights on a randomly initialised backbone
        #[arg(long, default_value = "false")]
        random_backbone: bool,
    },

    /// Show the class mapping and per-class split of a dataset root
    Classes {
        #[arg(short, long, default_value = "dataset")]
        data_dir: PathBuf,

        #[arg(long, default_value = "0.2")]
        validation_split: f64,

        #[arg(long, default_value = "42")]
        seed: u64,
    },

    /// Classify one image with a saved checkpoint
    Predict {
        /// Checkpoint stem or its .mpk/.json file
        #[arg(short, long, default_value = "eye_condition_model")]
        checkpoint: PathBuf,

        /// Image to classify
        #[arg(short, long)]
        image: PathBuf,

        /// Number of classes to print
        #[arg(short = 'k', long, default_value_t = DEFAULT_TOP_K)]
        top_k: usize,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_config = if cli.verbose {
        LogConfig::verbose()
    } else {
        LogConfig::default()
    };
    let _ = init_logging(&log_config);

    print_banner();

    match cli.command {
        Commands::Train {
            config,
            data_dir,
            epochs,
            batch_size,
            learning_rate,
            validation_split,
            seed,
            patience,
            output_dir,
            backbone_weights,
            random_backbone,
        } => {
            let base = match &config {
                Some(path) => AppConfig::from_toml_file(path)?,
                None => AppConfig::default(),
            };
            let overrides = ConfigOverrides {
                data_dir,
                validation_split,
                epochs,
                batch_size,
                learning_rate,
                patience,
                seed,
                output_dir,
                backbone_weights,
                random_backbone,
            };
            cmd_train(base.apply_overrides(&overrides))?;
        }

        Commands::Classes {
            data_dir,
            validation_split,
            seed,
        } => {
            cmd_classes(data_dir, validation_split, seed)?;
        }

        Commands::Predict {
            checkpoint,
            image,
            top_k,
        } => {
            cmd_predict(&checkpoint, &image, top_k)?;
        }
    }

    Ok(())
}

fn print_banner() {
    println!(
        "{}",
        r#"
 ╔══════════════════════════════════════════════════════════════╗
 ║   Eye Condition CNN                                          ║
 ║   Fundus image classification with Burn + Rust               ║
 ╚══════════════════════════════════════════════════════════════╝
  "#
        .green()
    );
}

fn cmd_train(config: AppConfig) -> Result<()> {
    info!("Backend: {}", backend_name());
    info!("Dataset root: {}", config.data.root.display());

    run_training::<TrainingBackend>(&config, default_device())
        .context("training failed")?;
    Ok(())
}

fn cmd_classes(root: PathBuf, validation_split: f64, seed: u64) -> Result<()> {
    let data = DataConfig {
        root,
        validation_split,
        ..DataConfig::default()
    };
    let generators = DatasetGenerators::from_directory(&data, &AugmentationConfig::none(), seed)
        .with_context(|| format!("cannot read dataset root {}", data.root.display()))?;

    generators.print_summary();
    println!();
    generators.print_split_table();
    Ok(())
}

fn cmd_predict(checkpoint: &Path, image: &Path, top_k: usize) -> Result<()> {
    let predictor = Predictor::<DefaultBackend>::from_checkpoint(checkpoint, default_device())
        .with_context(|| format!("cannot load checkpoint {}", checkpoint.display()))?;
    let result = predictor.predict_path(image)?;

    println!("{}", "Prediction:".cyan().bold());
    println!("{}", result.display_top_k(top_k.max(1)));
    Ok(())
}
