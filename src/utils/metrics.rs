//! Evaluation metrics.

use serde::{Deserialize, Serialize};

/// Accuracy and mean loss over an evaluation set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EvalReport {
    /// Fraction of correctly classified examples
    pub accuracy: f64,
    /// Mean cross-entropy over the evaluated batches
    pub mean_loss: f64,
    /// Number of examples scored
    pub samples: usize,
}

impl EvalReport {
    /// Accumulate predictions against targets.
    pub fn from_counts(correct: usize, total: usize, loss_sum: f64, batches: usize) -> Self {
        Self {
            accuracy: if total > 0 {
                correct as f64 / total as f64
            } else {
                0.0
            },
            mean_loss: if batches > 0 {
                loss_sum / batches as f64
            } else {
                0.0
            },
            samples: total,
        }
    }
}

impl std::fmt::Display for EvalReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "accuracy = {:.2}%, loss = {:.4}, samples = {}",
            self.accuracy * 100.0,
            self.mean_loss,
            self.samples
        )
    }
}
