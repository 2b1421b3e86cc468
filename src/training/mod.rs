//! Training pipeline for the eye-condition classifier
//!
//! - `loss`: categorical cross-entropy and accuracy
//! - `callbacks`: checkpoint and early-stopping policies
//! - `history`: per-epoch metrics
//! - `checkpoint`: weights, optimizer state and sidecar files
//! - `trainer`: the epoch loop

pub mod callbacks;
pub mod checkpoint;
pub mod history;
pub mod loss;
pub mod trainer;

use std::path::PathBuf;
use std::time::Instant;

use burn::optim::AdamConfig;
use burn::tensor::backend::AutodiffBackend;
use colored::Colorize;
use tracing::info;

use crate::config::AppConfig;
use crate::dataset::generator::DatasetGenerators;
use crate::model::classifier::{log_parameter_split, EyeConditionCnnConfig};
use crate::model::summary::ModelSummary;
use crate::utils::error::Result;
use crate::utils::format_duration;

pub use callbacks::{BestSnapshot, EarlyStopping, EarlyStoppingDecision, ModelCheckpoint};
pub use checkpoint::{
    load_checkpoint, load_training_state, CheckpointKind, CheckpointMetadata, CheckpointWriter,
};
pub use history::{EpochMetrics, TrainingHistory};
pub use trainer::{FitOutcome, Trainer};

/// Artifacts and headline numbers of a finished run
#[derive(Debug, Clone)]
pub struct TrainingReport {
    pub best_checkpoint: PathBuf,
    pub final_checkpoint: PathBuf,
    pub labels: PathBuf,
    pub history_csv: PathBuf,
    pub history: TrainingHistory,
    pub best_epoch: usize,
    pub best_val_accuracy: f64,
    pub stopped_early: bool,
    pub elapsed_secs: f64,
}

/// Run the whole pipeline: data, model, fit, export
pub fn run_training<B: AutodiffBackend>(
    config: &AppConfig,
    device: B::Device,
) -> Result<TrainingReport> {
    config.validate()?;
    config.ensure_dataset_root()?;
    config.ensure_backbone_weights()?;
    let started = Instant::now();

    println!("{}", "Loading Dataset...".cyan());
    let generators =
        DatasetGenerators::from_directory(&config.data, &config.augmentation, config.seed)?;
    generators.print_summary();

    println!();
    println!("{}", "Creating Model...".cyan());
    let model_config = EyeConditionCnnConfig::new(generators.num_classes())
        .with_feature_units(config.model.feature_units)
        .with_dropout(config.model.dropout);
    model_config.validate()?;

    let model = model_config
        .init::<B>(&device)
        .with_backbone_weights(config.model.pretrained_backbone(), &device)?;
    println!("{}", ModelSummary::from_model(&model, config.data.image_size));
    log_parameter_split(&model);

    std::fs::create_dir_all(&config.output.dir)?;

    let optimizer = AdamConfig::new().init();
    let writer = CheckpointWriter::new(&config.output);
    let metadata = CheckpointMetadata::new(
        CheckpointKind::Best,
        &model_config,
        generators.classes.names().to_vec(),
        config.data.image_size,
    );

    println!("{}", "Training Configuration:".cyan().bold());
    println!("  Training samples:   {}", generators.split.training.len());
    println!("  Validation samples: {}", generators.split.validation.len());
    println!("  Epochs:             {}", config.training.epochs);
    println!("  Batch size:         {}", config.training.batch_size);
    println!("  Learning rate:      {}", config.training.learning_rate);
    println!("  Device:             {:?}", device);
    println!();

    let outcome = Trainer::<B>::new(config.training.clone(), config.seed, device).fit(
        model,
        optimizer,
        &generators,
        &writer,
        &metadata,
    )?;

    let last = outcome.history.epochs.last().copied();
    let final_metadata = match last {
        Some(m) => metadata.at_epoch(m.epoch, m.val_accuracy, m.val_loss),
        None => metadata.clone(),
    };
    writer.save_final(&outcome.model, &final_metadata)?;

    let labels = config.output.labels_path();
    checkpoint::write_labels(&labels, generators.classes.names())?;

    let history_csv = config.output.history_path();
    outcome.history.write_csv(&history_csv)?;

    let elapsed_secs = started.elapsed().as_secs_f64();
    println!();
    println!(
        "{} Best model saved as {}",
        "Training complete.".green().bold(),
        writer.best_weights().display()
    );
    println!(
        "  Best val_accuracy: {:.4} (epoch {}){}",
        outcome.best_val_accuracy,
        outcome.best_epoch,
        if outcome.stopped_early {
            " - stopped early".yellow().to_string()
        } else {
            String::new()
        }
    );
    println!("  Elapsed: {}", format_duration(elapsed_secs));
    info!("Final model saved as {}", writer.final_weights().display());

    Ok(TrainingReport {
        best_checkpoint: writer.best_weights(),
        final_checkpoint: writer.final_weights(),
        labels,
        history_csv,
        history: outcome.history,
        best_epoch: outcome.best_epoch,
        best_val_accuracy: outcome.best_val_accuracy,
        stopped_early: outcome.stopped_early,
        elapsed_secs,
    })
}
