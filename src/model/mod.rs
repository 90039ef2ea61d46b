//! Classifier network and its forward contract.
//!
//! The network is invoked in an explicit [`Mode`]: training-mode forwards
//! normalize with batch statistics and *return* the pending running-stat
//! updates instead of mutating hidden state; evaluation-mode forwards
//! consume the stored running statistics. The caller decides which (if any)
//! of the returned updates to apply, and when.

pub mod cnn;
pub mod norm;

pub use cnn::ImageClassifier;
pub use norm::{NormLayer, NormUpdate};

use burn::prelude::*;

/// Whether a forward pass normalizes with batch statistics (training) or
/// stored running statistics (evaluation).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Train,
    Eval,
}

/// Result of one classifier invocation: logits plus the normalization
/// updates the pass produced (empty in evaluation mode).
#[derive(Debug, Clone)]
pub struct ForwardPass<B: Backend> {
    /// Logits of shape [batch_size, num_classes]
    pub logits: Tensor<B, 2>,
    /// Pending running-statistics updates, one per normalization layer, in
    /// layer order
    pub norm_updates: Vec<NormUpdate<B>>,
}
