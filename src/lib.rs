//! # selftrain_ssl
//!
//! Semi-supervised image classification via confidence-masked pseudo-label
//! self-training, built on the Burn framework.
//!
//! A small labeled pool trains a classifier the ordinary way; a much larger
//! unlabeled pool contributes through the model's own predictions. Each
//! step forms three stochastic views of the unlabeled batch, scores each
//! view's confidence, and folds the trusted predictions back into the
//! objective under a warmup schedule, while an exponential moving average
//! of the parameters serves as the stabilized inference model.
//!
//! ## Modules
//!
//! - `model`: convolutional classifier with explicit normalization updates
//! - `dataset`: image-folder loading, labeled/unlabeled/test splits, batching
//! - `training`: the step engine, its loss components, and the outer loop
//! - `utils`: logging and metrics
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use selftrain_ssl::backend::TrainingBackend;
//! use selftrain_ssl::config::TrainConfig;
//! use selftrain_ssl::training::run_training;
//!
//! let config = TrainConfig::default();
//! let outcome = run_training::<TrainingBackend>(
//!     &config,
//!     std::path::Path::new("data/images"),
//!     Default::default(),
//! )?;
//! ```

pub mod backend;
pub mod config;
pub mod dataset;
pub mod model;
pub mod training;
pub mod utils;

pub use config::{DistillStrategy, EngineConfig, ModelConfig, TrainConfig, NUM_VIEWS};
pub use dataset::{DatasetSplits, FolderDataset, LabeledBatch, SplitConfig, UnlabeledBatch};
pub use model::{ImageClassifier, Mode};
pub use training::{DistillEngine, StepOutcome, StepReport, TrainOutcome};
pub use utils::EvalReport;

/// Default confidence threshold for trusting a view's prediction.
pub const DEFAULT_CONFIDENCE_THRESHOLD: f64 = 0.95;

/// Version of the library.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
