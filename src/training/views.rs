//! Stochastic view formation for unlabeled batches.
//!
//! A view is a cheap transform of the unlabeled images, realized fresh
//! every step. The masked-views strategy feeds all three classifiers the
//! identity view; the voted-views strategy flips the first and third view
//! horizontally, per example, with probability one half.

use burn::prelude::*;
use rand::Rng;
use rand_chacha::ChaCha8Rng;

/// Transform applied to form one view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewPolicy {
    Identity,
    RandomFlip,
}

/// Produce one view of `images` ([batch, channels, height, width]).
pub fn make_view<B: Backend>(
    images: &Tensor<B, 4>,
    policy: ViewPolicy,
    rng: &mut ChaCha8Rng,
) -> Tensor<B, 4> {
    match policy {
        ViewPolicy::Identity => images.clone(),
        ViewPolicy::RandomFlip => random_flip(images, rng),
    }
}

/// Per-example horizontal flip with probability 0.5.
fn random_flip<B: Backend>(images: &Tensor<B, 4>, rng: &mut ChaCha8Rng) -> Tensor<B, 4> {
    let [batch, _, _, _] = images.dims();
    let device = images.device();

    let coins: Vec<f32> = (0..batch)
        .map(|_| if rng.gen_bool(0.5) { 1.0 } else { 0.0 })
        .collect();
    let mask = Tensor::<B, 1>::from_floats(burn::tensor::TensorData::new(coins, [batch]), &device)
        .reshape([batch, 1, 1, 1]);

    let flipped = images.clone().flip([3]);
    images.clone() * (mask.ones_like() - mask.clone()) + flipped * mask
}
