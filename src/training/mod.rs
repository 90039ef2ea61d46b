//! Self-training: confidence gating, view formation, pseudo-label
//! aggregation, the warmup schedule, the shadow-parameter tracker, the
//! step engine, and the outer loop driving it.
//!
//! A step flows as: form views of the unlabeled batch -> forward every
//! classifier against one parameter snapshot -> gate/aggregate the view
//! predictions into a pseudo-label signal -> compose the objective with
//! the supervised term -> commit all parameter effects together.

pub mod confidence;
pub mod ema;
pub mod engine;
pub mod pseudo_label;
pub mod trainer;
pub mod views;
pub mod warmup;

pub use confidence::confidence_mask;
pub use ema::EmaTracker;
pub use engine::{DistillEngine, StepOutcome, StepReport};
pub use pseudo_label::{masked_view_losses, vote_labels, MaskedViewLosses};
pub use trainer::{evaluate, run_training, TrainOutcome};
pub use views::{make_view, ViewPolicy};
pub use warmup::WarmupSchedule;
