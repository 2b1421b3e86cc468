//! The fit loop.
//!
//! Each epoch reshuffles the training subset, runs one optimiser step per
//! batch on the trainable head, then evaluates on the validation subset.
//! At the end of the epoch the checkpoint policy runs first and early
//! stopping second.

use std::time::Instant;

use burn::data::dataloader::batcher::Batcher;
use burn::module::AutodiffModule;
use burn::optim::{GradientsParams, Optimizer};
use burn::tensor::backend::AutodiffBackend;
use burn::tensor::ElementConversion;
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tracing::{debug, info};

use crate::config::TrainingConfig;
use crate::dataset::burn_dataset::{FundusBatch, FundusBatcher, FundusDataset, FundusItem};
use crate::dataset::generator::DatasetGenerators;
use crate::model::classifier::EyeConditionCnn;
use crate::training::callbacks::{
    BestSnapshot, CheckpointWrite, EarlyStopping, EarlyStoppingDecision, ModelCheckpoint,
};
use crate::training::checkpoint::{CheckpointMetadata, CheckpointWriter};
use crate::training::history::{EpochMetrics, TrainingHistory};
use crate::training::loss::{categorical_cross_entropy, count_correct};
use crate::utils::error::{EyeConditionError, Result};

/// Result of [`Trainer::fit`]
#[derive(Debug)]
pub struct FitOutcome<B: AutodiffBackend> {
    /// Best weights when early stopping fired, last-epoch weights otherwise
    pub model: EyeConditionCnn<B>,
    pub history: TrainingHistory,
    pub best_epoch: usize,
    pub best_val_accuracy: f64,
    pub stopped_early: bool,
    pub checkpoint_writes: Vec<CheckpointWrite>,
}

/// Loss and accuracy over one pass of a subset
#[derive(Debug, Clone, Copy, Default)]
struct PassStats {
    loss_sum: f64,
    correct: usize,
    seen: usize,
}

impl PassStats {
    fn record(&mut self, batch_loss: f64, batch_size: usize, correct: usize) {
        self.loss_sum += batch_loss * batch_size as f64;
        self.correct += correct;
        self.seen += batch_size;
    }

    fn loss(&self) -> f64 {
        self.loss_sum / self.seen.max(1) as f64
    }

    fn accuracy(&self) -> f64 {
        self.correct as f64 / self.seen.max(1) as f64
    }
}

pub struct Trainer<B: AutodiffBackend> {
    config: TrainingConfig,
    seed: u64,
    device: B::Device,
    show_progress: bool,
}

impl<B: AutodiffBackend> Trainer<B> {
    pub fn new(config: TrainingConfig, seed: u64, device: B::Device) -> Self {
        Self {
            config,
            seed,
            device,
            show_progress: true,
        }
    }

    /// Toggle the per-batch progress bar
    pub fn with_progress(mut self, show_progress: bool) -> Self {
        self.show_progress = show_progress;
        self
    }

    /// Train `model` until the last epoch or early stopping fires.
    ///
    /// `metadata` is the template stamped onto every best-checkpoint write.
    pub fn fit<O>(
        &self,
        mut model: EyeConditionCnn<B>,
        mut optimizer: O,
        generators: &DatasetGenerators,
        writer: &CheckpointWriter,
        metadata: &CheckpointMetadata,
    ) -> Result<FitOutcome<B>>
    where
        O: Optimizer<EyeConditionCnn<B>, B>,
    {
        let epochs = self.config.epochs;
        let batch_size = self.config.batch_size.max(1);
        let batcher = generators.batcher();
        let steps = generators.steps_per_epoch(batch_size);

        let mut checkpoint = ModelCheckpoint::new();
        let mut early_stopping = EarlyStopping::new(self.config.early_stopping_patience);
        let mut snapshot = BestSnapshot::new();
        let mut history = TrainingHistory::default();
        let mut stopped_early = false;
        let mut rng = ChaCha8Rng::seed_from_u64(self.seed);

        for epoch in 1..=epochs {
            println!("{}", format!("Epoch {}/{}", epoch, epochs).yellow().bold());
            let started = Instant::now();
            generators.training.set_epoch(epoch - 1);

            let progress = self.progress_bar(steps);
            let mut train = PassStats::default();

            let mut indices: Vec<usize> = (0..generators.training.images().len()).collect();
            indices.shuffle(&mut rng);

            for chunk in indices.chunks(batch_size) {
                let items = load_items(&generators.training, chunk)?;
                if items.is_empty() {
                    continue;
                }
                let batch: FundusBatch<B> = batcher.batch(items, &self.device);
                let size = chunk.len();

                let logits = model.forward_training(batch.images);
                let loss = categorical_cross_entropy(logits.clone(), batch.one_hot);
                let loss_value: f64 = loss.clone().into_scalar().elem();
                train.record(loss_value, size, count_correct(logits, batch.targets));

                let grads = GradientsParams::from_grads(loss.backward(), &model);
                model = optimizer.step(self.config.learning_rate, model, grads);

                progress.inc(1);
                progress.set_message(format!(
                    "loss: {:.4} - accuracy: {:.4}",
                    train.loss(),
                    train.accuracy()
                ));
            }
            progress.finish_and_clear();

            let val = evaluate(&model, &generators.validation, &batcher, batch_size, &self.device)?;

            let metrics = EpochMetrics {
                epoch,
                train_loss: train.loss(),
                train_accuracy: train.accuracy(),
                val_loss: val.loss(),
                val_accuracy: val.accuracy(),
                duration_secs: started.elapsed().as_secs_f64(),
            };
            println!("{}/{} - {}", steps, steps, metrics);
            history.push(metrics);

            if checkpoint.should_save(epoch, metrics.val_accuracy) {
                writer.save_best(
                    &model,
                    &optimizer,
                    &metadata.at_epoch(epoch, metrics.val_accuracy, metrics.val_loss),
                )?;
            }

            match early_stopping.on_epoch_end(epoch, metrics.val_accuracy) {
                EarlyStoppingDecision::Improved => snapshot.store(epoch, model.clone()),
                EarlyStoppingDecision::Continue { wait } => {
                    debug!("Epoch {}: {} epoch(s) without improvement", epoch, wait);
                }
                EarlyStoppingDecision::Stop => {
                    stopped_early = true;
                    if let Some((best_epoch, best_model)) = snapshot.take() {
                        info!("Restoring model weights from the end of epoch {}", best_epoch);
                        model = best_model;
                    }
                    break;
                }
            }
        }

        let best = history.best().copied().ok_or_else(|| {
            EyeConditionError::Training("no epoch was run; epochs must be at least 1".into())
        })?;

        Ok(FitOutcome {
            model,
            history,
            best_epoch: best.epoch,
            best_val_accuracy: best.val_accuracy,
            stopped_early,
            checkpoint_writes: checkpoint.writes().to_vec(),
        })
    }

    fn progress_bar(&self, steps: usize) -> ProgressBar {
        if !self.show_progress {
            return ProgressBar::hidden();
        }
        let pb = ProgressBar::new(steps as u64);
        let style = ProgressStyle::default_bar()
            .template("  {pos}/{len} [{bar:30.cyan/blue}] {elapsed_precise} - {msg}")
            .map(|style| style.progress_chars("=>."))
            .unwrap_or_else(|_| ProgressStyle::default_bar());
        pb.set_style(style);
        pb
    }
}

fn load_items(dataset: &FundusDataset, indices: &[usize]) -> Result<Vec<FundusItem>> {
    let mut items = Vec::with_capacity(indices.len());
    for &index in indices {
        if let Some(item) = dataset.load(index)? {
            items.push(item);
        }
    }
    Ok(items)
}

/// Validation pass in inference mode: dropout off, no autodiff graph
fn evaluate<B: AutodiffBackend>(
    model: &EyeConditionCnn<B>,
    dataset: &FundusDataset,
    batcher: &FundusBatcher,
    batch_size: usize,
    device: &B::Device,
) -> Result<PassStats> {
    let model = model.valid();
    let mut stats = PassStats::default();
    let indices: Vec<usize> = (0..dataset.images().len()).collect();

    for chunk in indices.chunks(batch_size) {
        let items = load_items(dataset, chunk)?;
        if items.is_empty() {
            continue;
        }
        let batch: FundusBatch<B> = batcher.batch(items, device);

        let logits = model.forward_logits(batch.images.inner());
        let loss = categorical_cross_entropy(logits.clone(), batch.one_hot.inner());
        let loss_value: f64 = loss.into_scalar().elem();
        stats.record(loss_value, chunk.len(), count_correct(logits, batch.targets.inner()));
    }

    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DataConfig, OutputConfig};
    use crate::dataset::augmentation::AugmentationConfig;
    use crate::dataset::loader::tests::write_class;
    use crate::model::classifier::EyeConditionCnnConfig;
    use crate::training::checkpoint::{load_checkpoint, CheckpointKind};
    use burn::backend::{Autodiff, NdArray};
    use burn::optim::AdamConfig;
    use burn::tensor::Tensor;

    type TestAutodiffBackend = Autodiff<NdArray>;

    struct Fixture {
        _data: tempfile::TempDir,
        output: tempfile::TempDir,
        generators: DatasetGenerators,
    }

    fn fixture() -> Fixture {
        let data = tempfile::tempdir().unwrap();
        write_class(data.path(), "Glaucoma", 5);
        write_class(data.path(), "Healthy", 5);

        let data_config = DataConfig {
            root: data.path().to_path_buf(),
            image_size: [32, 32],
            validation_split: 0.2,
        };
        let generators =
            DatasetGenerators::from_directory(&data_config, &AugmentationConfig::default(), 7)
                .unwrap();

        Fixture {
            _data: data,
            output: tempfile::tempdir().unwrap(),
            generators,
        }
    }

    fn training_config(epochs: usize, learning_rate: f64, patience: usize) -> TrainingConfig {
        TrainingConfig {
            batch_size: 4,
            epochs,
            learning_rate,
            early_stopping_patience: patience,
        }
    }

    fn run(
        fixture: &Fixture,
        config: TrainingConfig,
    ) -> (FitOutcome<TestAutodiffBackend>, EyeConditionCnn<TestAutodiffBackend>) {
        let device = Default::default();
        let model_config = EyeConditionCnnConfig::new(2);
        let model = model_config.init::<TestAutodiffBackend>(&device);
        let initial = model.clone();

        let writer = CheckpointWriter::new(&OutputConfig {
            dir: fixture.output.path().to_path_buf(),
            ..OutputConfig::default()
        });
        let metadata = CheckpointMetadata::new(
            CheckpointKind::Best,
            &model_config,
            fixture.generators.classes.names().to_vec(),
            [32, 32],
        );
        let optimizer = AdamConfig::new().init();

        let outcome = Trainer::<TestAutodiffBackend>::new(config, 7, device)
            .with_progress(false)
            .fit(model, optimizer, &fixture.generators, &writer, &metadata)
            .unwrap();
        (outcome, initial)
    }

    fn values<const D: usize>(tensor: Tensor<TestAutodiffBackend, D>) -> Vec<f32> {
        tensor.into_data().to_vec::<f32>().unwrap()
    }

    #[test]
    fn test_only_head_is_updated() {
        let fixture = fixture();
        let (outcome, initial) = run(&fixture, training_config(1, 1e-2, 3));

        assert_eq!(outcome.history.len(), 1);
        assert_eq!(
            values(outcome.model.backbone.stem.conv_weight()),
            values(initial.backbone.stem.conv_weight())
        );
        assert_ne!(
            values(outcome.model.predictions.weight.val()),
            values(initial.predictions.weight.val())
        );
    }

    #[test]
    fn test_plateau_stops_early() {
        let fixture = fixture();
        // a zero learning rate keeps validation accuracy constant
        let (outcome, _) = run(&fixture, training_config(5, 0.0, 1));

        assert!(outcome.stopped_early);
        assert_eq!(outcome.history.len(), 2);
        assert_eq!(outcome.best_epoch, 1);
        assert_eq!(outcome.checkpoint_writes.len(), 1);
        assert!(fixture.output.path().join("eye_condition_model.mpk").exists());
        assert!(!fixture
            .output
            .path()
            .join("eye_condition_model_optimizer.mpk")
            .exists());
    }

    #[test]
    fn test_early_stop_restores_best_checkpoint_weights() {
        let fixture = fixture();
        // two validation images allow at most three distinct accuracies, so
        // patience 1 must fire well before the last epoch
        let (outcome, _) = run(&fixture, training_config(10, 5e-2, 1));

        assert!(outcome.stopped_early);
        assert!(outcome.history.len() > outcome.best_epoch);
        assert_eq!(
            outcome.checkpoint_writes.last().map(|w| w.epoch),
            Some(outcome.best_epoch)
        );

        let best_path = fixture.output.path().join("eye_condition_model.mpk");
        let (best, metadata) =
            load_checkpoint::<TestAutodiffBackend>(&best_path, &Default::default()).unwrap();
        assert_eq!(metadata.epoch, outcome.best_epoch);
        assert_eq!(
            values(outcome.model.predictions.weight.val()),
            values(best.predictions.weight.val())
        );
        assert_eq!(
            values(outcome.model.feature_vector.weight.val()),
            values(best.feature_vector.weight.val())
        );
    }

    #[test]
    fn test_checkpoint_writes_strictly_improve() {
        let fixture = fixture();
        let (outcome, _) = run(&fixture, training_config(3, 1e-2, 3));

        assert!(!outcome.stopped_early);
        assert_eq!(outcome.history.len(), 3);
        assert!(!outcome.checkpoint_writes.is_empty());
        assert!(outcome
            .checkpoint_writes
            .windows(2)
            .all(|w| w[1].val_accuracy > w[0].val_accuracy));
    }

    #[test]
    fn test_zero_epochs_is_an_error() {
        let fixture = fixture();
        let device = Default::default();
        let model_config = EyeConditionCnnConfig::new(2);
        let writer = CheckpointWriter::new(&OutputConfig {
            dir: fixture.output.path().to_path_buf(),
            ..OutputConfig::default()
        });
        let metadata =
            CheckpointMetadata::new(CheckpointKind::Best, &model_config, vec![], [32, 32]);

        let result = Trainer::<TestAutodiffBackend>::new(training_config(0, 1e-3, 3), 7, device)
            .with_progress(false)
            .fit(
                model_config.init(&Default::default()),
                AdamConfig::new().init(),
                &fixture.generators,
                &writer,
                &metadata,
            );
        assert!(matches!(result, Err(EyeConditionError::Training(_))));
    }
}
