//! Pseudo-label aggregation over the three unlabeled views.
//!
//! Two strategies exist. The masked strategy lets every view self-label
//! from its own arg-max, zeroes the loss of low-confidence examples, and
//! averages the three per-view scalars. The voted strategy collapses the
//! three arg-max labels into one pseudo-label per example (floor of the
//! mean class index) and folds the pseudo-labeled examples into the
//! supervised batch for a single joint cross-entropy.

use burn::prelude::*;
use burn::tensor::activation::{log_softmax, softmax};

use super::confidence::confidence_mask;

/// Losses of the masked per-view strategy for one step.
#[derive(Debug, Clone)]
pub struct MaskedViewLosses<B: Backend> {
    /// Unweighted mean of the three per-view scalars
    pub combined: Tensor<B, 1>,
    /// Fraction of (example, view) pairs that passed the confidence gate
    pub confident_fraction: Tensor<B, 1>,
    /// The three per-view scalars, in view order
    pub per_view: Vec<Tensor<B, 1>>,
}

/// Self-distillation loss of a single view, gated by its own confidence.
///
/// The target is the view's own arg-max, taken from the same forward pass
/// that produces the loss. Examples failing the confidence gate contribute
/// an exact zero while staying in the denominator: the reduction is a mean
/// over the whole batch, not over the passing subset, so a view cannot be
/// rewarded for being confident on almost nothing.
pub fn masked_self_distill<B: Backend>(
    logits: &Tensor<B, 2>,
    threshold: f64,
) -> (Tensor<B, 1>, Tensor<B, 1>) {
    let mask = confidence_mask(softmax(logits.clone(), 1), threshold);

    let self_labels = logits.clone().argmax(1);
    let nll = log_softmax(logits.clone(), 1).gather(1, self_labels).neg();

    ((nll * mask.clone()).mean(), mask.mean())
}

/// Masked strategy: three independent per-view losses, averaged. No
/// information crosses views before the final scalar merge.
pub fn masked_view_losses<B: Backend>(
    views: &[Tensor<B, 2>; 3],
    threshold: f64,
) -> MaskedViewLosses<B> {
    let (loss_1, frac_1) = masked_self_distill(&views[0], threshold);
    let (loss_2, frac_2) = masked_self_distill(&views[1], threshold);
    let (loss_3, frac_3) = masked_self_distill(&views[2], threshold);

    let combined = (loss_1.clone() + loss_2.clone() + loss_3.clone()).div_scalar(3.0);
    let confident_fraction = (frac_1 + frac_2 + frac_3).div_scalar(3.0);

    MaskedViewLosses {
        combined,
        confident_fraction,
        per_view: vec![loss_1, loss_2, loss_3],
    }
}

/// Voted strategy label merge: per-view arg-max indices are summed and
/// integer-divided by three. For non-negative class indices this is the
/// floor of the mean index, not a vote over class identity: three views
/// predicting classes 1, 2 and 9 merge to class 4, which none of them
/// predicted. This exact merge is load-bearing for reproducibility and
/// must not be "fixed" into a true majority vote.
pub fn vote_labels<B: Backend>(views: &[Tensor<B, 2>; 3]) -> Tensor<B, 1, Int> {
    let labels_1 = views[0].clone().argmax(1).squeeze::<1>(1);
    let labels_2 = views[1].clone().argmax(1).squeeze::<1>(1);
    let labels_3 = views[2].clone().argmax(1).squeeze::<1>(1);

    (labels_1 + labels_2 + labels_3).div_scalar(3)
}

/// One-hot encode integer labels as float rows.
pub fn one_hot<B: Backend>(labels: Tensor<B, 1, Int>, num_classes: usize) -> Tensor<B, 2> {
    let [batch] = labels.dims();
    let device = labels.device();

    Tensor::zeros([batch, num_classes], &device).scatter(
        1,
        labels.reshape([batch, 1]),
        Tensor::ones([batch, 1], &device),
    )
}

/// Uniformly smooth one-hot target rows.
pub fn smooth_targets<B: Backend>(targets: Tensor<B, 2>, smoothing: f64) -> Tensor<B, 2> {
    if smoothing <= 0.0 {
        return targets;
    }
    let [_, num_classes] = targets.dims();
    targets
        .mul_scalar(1.0 - smoothing)
        .add_scalar(smoothing / num_classes as f64)
}

/// Mean cross-entropy between probabilistic target rows and logits.
pub fn soft_cross_entropy<B: Backend>(
    logits: Tensor<B, 2>,
    targets: Tensor<B, 2>,
) -> Tensor<B, 1> {
    (targets * log_softmax(logits, 1)).sum_dim(1).neg().mean()
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use burn::tensor::TensorData;

    type TestBackend = NdArray;

    fn logits_from(rows: Vec<f32>, cols: usize) -> Tensor<TestBackend, 2> {
        let device = Default::default();
        let batch = rows.len() / cols;
        Tensor::from_floats(TensorData::new(rows, [batch, cols]), &device)
    }

    fn scalar(tensor: Tensor<TestBackend, 1>) -> f32 {
        tensor.into_data().to_vec::<f32>().unwrap()[0]
    }

    #[test]
    fn test_all_views_unconfident_gives_exact_zero() {
        // Uniform logits: peak softmax probability is 1/3, far below 0.95.
        let uniform = logits_from(vec![0.0; 12], 3);
        let views = [uniform.clone(), uniform.clone(), uniform];

        let losses = masked_view_losses(&views, 0.95);
        assert_eq!(scalar(losses.combined), 0.0);
        assert_eq!(scalar(losses.confident_fraction), 0.0);
    }

    #[test]
    fn test_identical_confident_views_equal_single_view_loss() {
        // softmax([4, 0, 0]) peaks at ~0.965 > 0.95, so the gate passes and
        // the self-distillation loss is ln(1 + 2 * exp(-4)).
        let confident = logits_from(vec![4.0, 0.0, 0.0, 4.0, 0.0, 0.0], 3);
        let views = [confident.clone(), confident.clone(), confident.clone()];

        let losses = masked_view_losses(&views, 0.95);
        let (single, _) = masked_self_distill(&confident, 0.95);

        let expected = (1.0f64 + 2.0 * (-4.0f64).exp()).ln() as f32;
        assert!((scalar(losses.combined.clone()) - expected).abs() < 1e-5);
        assert!((scalar(losses.combined) - scalar(single)).abs() < 1e-6);
    }

    #[test]
    fn test_masked_examples_stay_in_denominator() {
        // Two confident examples, two uniform ones. The uniform half must
        // contribute an exact zero while still dividing the mean by four.
        let mixed = logits_from(
            vec![
                8.0, 0.0, 0.0, //
                8.0, 0.0, 0.0, //
                0.0, 0.0, 0.0, //
                0.0, 0.0, 0.0,
            ],
            3,
        );
        let views = [mixed.clone(), mixed.clone(), mixed];

        let losses = masked_view_losses(&views, 0.95);

        let nll_confident = (1.0f64 + 2.0 * (-8.0f64).exp()).ln();
        let expected = (2.0 * nll_confident / 4.0) as f32;
        assert!((scalar(losses.combined) - expected).abs() < 1e-6);
        assert!((scalar(losses.confident_fraction) - 0.5).abs() < 1e-6);
    }

    fn one_hot_logits(indices: [usize; 3], num_classes: usize) -> [Tensor<TestBackend, 2>; 3] {
        let make = |index: usize| {
            let mut row = vec![0.0f32; num_classes];
            row[index] = 5.0;
            logits_from(row, num_classes)
        };
        [make(indices[0]), make(indices[1]), make(indices[2])]
    }

    #[test]
    fn test_vote_merges_across_classes() {
        // (1, 2, 9) -> floor(12 / 3) = 4: a class none of the views chose.
        let views = one_hot_logits([1, 2, 9], 10);
        let voted: Vec<i64> = vote_labels(&views).into_data().to_vec().unwrap();
        assert_eq!(voted, vec![4]);
    }

    #[test]
    fn test_vote_agreement_is_identity() {
        let views = one_hot_logits([2, 2, 2], 10);
        let voted: Vec<i64> = vote_labels(&views).into_data().to_vec().unwrap();
        assert_eq!(voted, vec![2]);
    }

    #[test]
    fn test_one_hot_rows() {
        let device = Default::default();
        let labels = Tensor::<TestBackend, 1, Int>::from_data(
            TensorData::new(vec![2i64, 0], [2]),
            &device,
        );
        let encoded: Vec<f32> = one_hot(labels, 4).into_data().to_vec().unwrap();
        assert_eq!(encoded, vec![0.0, 0.0, 1.0, 0.0, 1.0, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_smooth_targets_sums_to_one() {
        let device = Default::default();
        let labels = Tensor::<TestBackend, 1, Int>::from_data(
            TensorData::new(vec![1i64], [1]),
            &device,
        );
        let smoothed: Vec<f32> = smooth_targets(one_hot(labels, 4), 0.1)
            .into_data()
            .to_vec()
            .unwrap();

        let sum: f32 = smoothed.iter().sum();
        assert!((sum - 1.0).abs() < 1e-6);
        assert!((smoothed[1] - 0.925).abs() < 1e-6);
        assert!((smoothed[0] - 0.025).abs() < 1e-6);
    }

    #[test]
    fn test_soft_cross_entropy_matches_nll_for_one_hot() {
        let device = Default::default();
        let logits = logits_from(vec![2.0, 1.0, 0.0], 3);
        let labels = Tensor::<TestBackend, 1, Int>::from_data(
            TensorData::new(vec![0i64], [1]),
            &device,
        );

        let loss = scalar(soft_cross_entropy(logits, one_hot(labels, 3)));
        // -log softmax([2,1,0])[0]
        let z: f64 = (0.0f64).exp() + (1.0f64).exp() + (2.0f64).exp();
        let expected = (z.ln() - 2.0) as f32;
        assert!((loss - expected).abs() < 1e-5);
    }
}
