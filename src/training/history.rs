//! Per-epoch metrics and their CSV export.

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::utils::error::Result;

/// Metrics recorded at the end of one epoch
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EpochMetrics {
    /// 1-based
    pub epoch: usize,
    pub train_loss: f64,
    pub train_accuracy: f64,
    pub val_loss: f64,
    pub val_accuracy: f64,
    pub duration_secs: f64,
}

impl fmt::Display for EpochMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:.1}s - loss: {:.4} - accuracy: {:.4} - val_loss: {:.4} - val_accuracy: {:.4}",
            self.duration_secs,
            self.train_loss,
            self.train_accuracy,
            self.val_loss,
            self.val_accuracy
        )
    }
}

/// Ordered metrics of a whole run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrainingHistory {
    pub epochs: Vec<EpochMetrics>,
}

impl TrainingHistory {
    pub fn push(&mut self, metrics: EpochMetrics) {
        self.epochs.push(metrics);
    }

    pub fn len(&self) -> usize {
        self.epochs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.epochs.is_empty()
    }

    /// Epoch with the highest validation accuracy; ties go to the earliest
    pub fn best(&self) -> Option<&EpochMetrics> {
        self.epochs.iter().fold(None, |best: Option<&EpochMetrics>, m| match best {
            Some(b) if m.val_accuracy <= b.val_accuracy => Some(b),
            _ => Some(m),
        })
    }

    pub fn to_csv(&self) -> String {
        let mut csv =
            String::from("epoch,train_loss,train_accuracy,val_loss,val_accuracy,duration_secs\n");
        for m in &self.epochs {
            csv.push_str(&format!(
                "{},{:.6},{:.6},{:.6},{:.6},{:.3}\n",
                m.epoch, m.train_loss, m.train_accuracy, m.val_loss, m.val_accuracy, m.duration_secs
            ));
        }
        csv
    }

    pub fn write_csv(&self, path: &Path) -> Result<()> {
        std::fs::write(path, self.to_csv())?;
        info!("Training history saved to: {}", path.display());
        Ok(())
    }
}
