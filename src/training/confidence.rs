//! Confidence gating of per-view predictions.

use burn::prelude::*;

/// Per-example confidence decision over a batch of probability vectors.
///
/// An example passes iff its peak class probability is strictly greater
/// than `threshold`; a peak exactly at the threshold fails. The decision
/// reads nothing but the example's own distribution. Returns a float mask
/// of shape [batch_size, 1] with entries 0.0 or 1.0, ready to multiply
/// into a per-example loss.
///
/// A threshold >= 1 can never be exceeded, so the mask is all zeros and any
/// loss it gates vanishes; that is an accepted configuration, not an error.
pub fn confidence_mask<B: Backend>(probs: Tensor<B, 2>, threshold: f64) -> Tensor<B, 2> {
    probs.max_dim(1).greater_elem(threshold).float()
}
