//! Labeled / unlabeled / test pools for semi-supervised training.
//!
//! A fixed number of examples per class keep their labels; the remainder of
//! the train split becomes the unlabeled pool. The unlabeled pool retains
//! its true label as a hidden field for offline diagnostics only; nothing
//! on the training path reads it.

use rand::prelude::*;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::loader::ImageItem;

/// An unlabeled example. `hidden_label` exists for evaluation tooling and
/// must never feed the training objective.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UnlabeledItem {
    pub image: Vec<f32>,
    pub hidden_label: usize,
    pub path: String,
}

impl From<ImageItem> for UnlabeledItem {
    fn from(item: ImageItem) -> Self {
        Self {
            image: item.image,
            hidden_label: item.label,
            path: item.path,
        }
    }
}

/// Split parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SplitConfig {
    /// Examples that keep their labels, per class
    pub labeled_per_class: usize,
    /// Fraction of the dataset held out for evaluation
    pub test_fraction: f64,
    /// Shuffle seed
    pub seed: u64,
}

impl Default for SplitConfig {
    fn default() -> Self {
        Self {
            labeled_per_class: 250,
            test_fraction: 0.1,
            seed: 42,
        }
    }
}

/// The three pools a run trains and evaluates on.
#[derive(Debug, Clone)]
pub struct DatasetSplits {
    pub labeled: Vec<ImageItem>,
    pub unlabeled: Vec<UnlabeledItem>,
    pub test: Vec<ImageItem>,
}

impl DatasetSplits {
    /// Partition `items` according to `config`.
    pub fn new(mut items: Vec<ImageItem>, num_classes: usize, config: &SplitConfig) -> Self {
        let mut rng = ChaCha8Rng::seed_from_u64(config.seed);
        items.shuffle(&mut rng);

        let test_len = ((items.len() as f64) * config.test_fraction) as usize;
        let test: Vec<ImageItem> = items.split_off(items.len() - test_len);

        let mut labeled = Vec::new();
        let mut unlabeled = Vec::new();
        let mut kept_per_class = vec![0usize; num_classes];

        for item in items {
            if item.label < num_classes && kept_per_class[item.label] < config.labeled_per_class {
                kept_per_class[item.label] += 1;
                labeled.push(item);
            } else {
                unlabeled.push(item.into());
            }
        }

        info!(
            "split: {} labeled, {} unlabeled, {} test",
            labeled.len(),
            unlabeled.len(),
            test.len()
        );

        Self {
            labeled,
            unlabeled,
            test,
        }
    }
}
