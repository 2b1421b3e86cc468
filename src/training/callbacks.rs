//! Epoch-end policies that steer the training loop.
//!
//! Both policies monitor validation accuracy and treat only a strict
//! increase as an improvement.

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// One write of the best checkpoint
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CheckpointWrite {
    pub epoch: usize,
    pub val_accuracy: f64,
}

/// Decides when the best checkpoint is overwritten
#[derive(Debug, Clone, Default)]
pub struct ModelCheckpoint {
    best: Option<f64>,
    writes: Vec<CheckpointWrite>,
}

impl ModelCheckpoint {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true when `val_accuracy` beats every earlier epoch
    pub fn should_save(&mut self, epoch: usize, val_accuracy: f64) -> bool {
        match self.best {
            Some(best) if val_accuracy <= best => {
                info!(
                    "Epoch {}: val_accuracy did not improve from {:.5}",
                    epoch, best
                );
                false
            }
            previous => {
                match previous {
                    Some(best) => info!(
                        "Epoch {}: val_accuracy improved from {:.5} to {:.5}",
                        epoch, best, val_accuracy
                    ),
                    None => info!("Epoch {}: val_accuracy is {:.5}", epoch, val_accuracy),
                }
                self.best = Some(val_accuracy);
                self.writes.push(CheckpointWrite {
                    epoch,
                    val_accuracy,
                });
                true
            }
        }
    }

    pub fn best(&self) -> Option<f64> {
        self.best
    }

    pub fn writes(&self) -> &[CheckpointWrite] {
        &self.writes
    }
}

/// Outcome of [`EarlyStopping::on_epoch_end`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EarlyStoppingDecision {
    /// New best value; snapshot the weights
    Improved,
    /// Keep training; `wait` epochs without improvement so far
    Continue { wait: usize },
    /// Patience exhausted
    Stop,
}

/// Stops training once validation accuracy plateaus
#[derive(Debug, Clone)]
pub struct EarlyStopping {
    patience: usize,
    best: Option<f64>,
    best_epoch: Option<usize>,
    wait: usize,
    stopped_epoch: Option<usize>,
}

impl EarlyStopping {
    pub fn new(patience: usize) -> Self {
        Self {
            patience,
            best: None,
            best_epoch: None,
            wait: 0,
            stopped_epoch: None,
        }
    }

    pub fn on_epoch_end(&mut self, epoch: usize, val_accuracy: f64) -> EarlyStoppingDecision {
        let improved = self.best.map_or(true, |best| val_accuracy > best);
        if improved {
            self.best = Some(val_accuracy);
            self.best_epoch = Some(epoch);
            self.wait = 0;
            return EarlyStoppingDecision::Improved;
        }

        self.wait += 1;
        if self.wait >= self.patience {
            warn!(
                "Epoch {}: early stopping, no val_accuracy improvement for {} epochs",
                epoch, self.wait
            );
            self.stopped_epoch = Some(epoch);
            EarlyStoppingDecision::Stop
        } else {
            EarlyStoppingDecision::Continue { wait: self.wait }
        }
    }

    pub fn best_epoch(&self) -> Option<usize> {
        self.best_epoch
    }

    pub fn best(&self) -> Option<f64> {
        self.best
    }

    pub fn stopped_epoch(&self) -> Option<usize> {
        self.stopped_epoch
    }
}

/// Keeps a copy of whatever state produced the best epoch
#[derive(Debug, Clone)]
pub struct BestSnapshot<T> {
    slot: Option<(usize, T)>,
}

impl<T> Default for BestSnapshot<T> {
    fn default() -> Self {
        Self { slot: None }
    }
}

impl<T> BestSnapshot<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store(&mut self, epoch: usize, state: T) {
        self.slot = Some((epoch, state));
    }

    pub fn epoch(&self) -> Option<usize> {
        self.slot.as_ref().map(|(epoch, _)| *epoch)
    }

    /// Take the stored state, leaving the snapshot empty
    pub fn take(&mut self) -> Option<(usize, T)> {
        self.slot.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_epoch_always_saves() {
        let mut checkpoint = ModelCheckpoint::new();
        assert!(checkpoint.should_save(1, 0.0));
        assert_eq!(checkpoint.best(), Some(0.0));
    }

    #[test]
    fn test_checkpoint_only_on_strict_improvement() {
        let mut checkpoint = ModelCheckpoint::new();
        let accs = [0.50, 0.60, 0.60, 0.55, 0.70, 0.70, 0.65];
        let saved: Vec<bool> = accs
            .iter()
            .enumerate()
            .map(|(i, &acc)| checkpoint.should_save(i + 1, acc))
            .collect();

        assert_eq!(saved, vec![true, true, false, false, true, false, false]);
        let epochs: Vec<usize> = checkpoint.writes().iter().map(|w| w.epoch).collect();
        assert_eq!(epochs, vec![1, 2, 5]);
    }

    #[test]
    fn test_checkpoint_writes_are_strictly_increasing() {
        let mut checkpoint = ModelCheckpoint::new();
        for (i, acc) in [0.3, 0.2, 0.4, 0.4, 0.1, 0.9, 0.5].into_iter().enumerate() {
            checkpoint.should_save(i + 1, acc);
        }
        assert!(checkpoint
            .writes()
            .windows(2)
            .all(|w| w[1].val_accuracy > w[0].val_accuracy));
    }

    #[test]
    fn test_early_stopping_after_patience() {
        let mut early = EarlyStopping::new(3);
        assert_eq!(early.on_epoch_end(1, 0.5), EarlyStoppingDecision::Improved);
        assert_eq!(early.on_epoch_end(2, 0.6), EarlyStoppingDecision::Improved);
        assert_eq!(early.on_epoch_end(3, 0.6), EarlyStoppingDecision::Continue { wait: 1 });
        assert_eq!(early.on_epoch_end(4, 0.55), EarlyStoppingDecision::Continue { wait: 2 });
        assert_eq!(early.on_epoch_end(5, 0.58), EarlyStoppingDecision::Stop);
        assert_eq!(early.best_epoch(), Some(2));
        assert_eq!(early.stopped_epoch(), Some(5));
    }

    #[test]
    fn test_improvement_resets_wait() {
        let mut early = EarlyStopping::new(2);
        early.on_epoch_end(1, 0.5);
        assert_eq!(early.on_epoch_end(2, 0.4), EarlyStoppingDecision::Continue { wait: 1 });
        assert_eq!(early.on_epoch_end(3, 0.7), EarlyStoppingDecision::Improved);
        assert_eq!(early.on_epoch_end(4, 0.7), EarlyStoppingDecision::Continue { wait: 1 });
        assert_eq!(early.on_epoch_end(5, 0.6), EarlyStoppingDecision::Stop);
        assert_eq!(early.best_epoch(), Some(3));
    }

    #[test]
    fn test_plateau_shorter_than_patience_never_stops() {
        // patience 3 over 3 epochs cannot trigger
        let mut early = EarlyStopping::new(3);
        let decisions: Vec<_> = [0.4, 0.4, 0.4]
            .iter()
            .enumerate()
            .map(|(i, &acc)| early.on_epoch_end(i + 1, acc))
            .collect();
        assert!(!decisions.contains(&EarlyStoppingDecision::Stop));
    }

    #[test]
    fn test_snapshot_restores_best_state() {
        let mut early = EarlyStopping::new(2);
        let mut snapshot = BestSnapshot::new();
        let mut state = 0u32;
        let mut stopped = false;

        for (epoch, acc) in [(1, 0.3), (2, 0.8), (3, 0.7), (4, 0.75), (5, 0.9)] {
            state += 10;
            match early.on_epoch_end(epoch, acc) {
                EarlyStoppingDecision::Improved => snapshot.store(epoch, state),
                EarlyStoppingDecision::Continue { .. } => {}
                EarlyStoppingDecision::Stop => {
                    stopped = true;
                    break;
                }
            }
        }

        assert!(stopped);
        assert_eq!(state, 40);
        let (epoch, restored) = snapshot.take().unwrap();
        assert_eq!(epoch, 2);
        assert_eq!(restored, 20);
        assert!(snapshot.take().is_none());
    }
}
