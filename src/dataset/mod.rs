//! Dataset loading, splitting, and batching.
//!
//! The loader scans an image-folder layout (one subdirectory per class);
//! the split keeps a small labeled pool and hides the labels of the rest;
//! batchers assemble Burn tensors; cycling samplers keep step-driven
//! training supplied with batches indefinitely.

pub mod batch;
pub mod loader;
pub mod split;

pub use batch::{BatchCycler, LabeledBatch, LabeledBatcher, UnlabeledBatch, UnlabeledBatcher};
pub use loader::{FolderDataset, ImageItem};
pub use split::{DatasetSplits, SplitConfig, UnlabeledItem};
