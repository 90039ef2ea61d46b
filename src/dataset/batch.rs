//! Batch tensors, batchers, and the cycling sampler driving step-based
//! training.

use burn::data::dataloader::batcher::Batcher;
use burn::prelude::*;
use burn::tensor::TensorData;
use rand::prelude::*;
use rand_chacha::ChaCha8Rng;

use super::loader::ImageItem;
use super::split::UnlabeledItem;

/// A batch of labeled images.
#[derive(Clone, Debug)]
pub struct LabeledBatch<B: Backend> {
    /// Images with shape [batch_size, channels, height, width]
    pub images: Tensor<B, 4>,
    /// Class labels with shape [batch_size]
    pub targets: Tensor<B, 1, Int>,
}

/// A batch of unlabeled images.
#[derive(Clone, Debug)]
pub struct UnlabeledBatch<B: Backend> {
    /// Images with shape [batch_size, channels, height, width]
    pub images: Tensor<B, 4>,
}

fn stack_images<B: Backend>(
    images: Vec<&[f32]>,
    image_size: usize,
    device: &B::Device,
) -> Tensor<B, 4> {
    let batch_size = images.len();
    let channels = 3;
    let data: Vec<f32> = images.into_iter().flatten().copied().collect();

    Tensor::from_floats(
        TensorData::new(data, [batch_size, channels, image_size, image_size]),
        device,
    )
}

/// Batcher for labeled items.
#[derive(Clone, Debug)]
pub struct LabeledBatcher<B: Backend> {
    device: B::Device,
    image_size: usize,
}

impl<B: Backend> LabeledBatcher<B> {
    pub fn new(device: B::Device, image_size: usize) -> Self {
        Self { device, image_size }
    }
}

impl<B: Backend> Batcher<ImageItem, LabeledBatch<B>> for LabeledBatcher<B> {
    fn batch(&self, items: Vec<ImageItem>) -> LabeledBatch<B> {
        let images = stack_images(
            items.iter().map(|item| item.image.as_slice()).collect(),
            self.image_size,
            &self.device,
        );

        let targets_data: Vec<i64> = items.iter().map(|item| item.label as i64).collect();
        let targets = Tensor::from_data(TensorData::new(targets_data, [items.len()]), &self.device);

        LabeledBatch { images, targets }
    }
}

/// Batcher for unlabeled items. Hidden labels are dropped here; the batch
/// carries images only.
#[derive(Clone, Debug)]
pub struct UnlabeledBatcher<B: Backend> {
    device: B::Device,
    image_size: usize,
}

impl<B: Backend> UnlabeledBatcher<B> {
    pub fn new(device: B::Device, image_size: usize) -> Self {
        Self { device, image_size }
    }
}

impl<B: Backend> Batcher<UnlabeledItem, UnlabeledBatch<B>> for UnlabeledBatcher<B> {
    fn batch(&self, items: Vec<UnlabeledItem>) -> UnlabeledBatch<B> {
        let images = stack_images(
            items.iter().map(|item| item.image.as_slice()).collect(),
            self.image_size,
            &self.device,
        );

        UnlabeledBatch { images }
    }
}

/// Endless shuffled index stream. Step-driven training draws a batch of
/// indices every step; the order reshuffles whenever the pool is exhausted.
#[derive(Debug)]
pub struct BatchCycler {
    order: Vec<usize>,
    cursor: usize,
    rng: ChaCha8Rng,
}

impl BatchCycler {
    pub fn new(len: usize, seed: u64) -> Self {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let mut order: Vec<usize> = (0..len).collect();
        order.shuffle(&mut rng);

        Self {
            order,
            cursor: 0,
            rng,
        }
    }

    /// Draw the next `n` indices, wrapping (and reshuffling) as needed.
    pub fn next_indices(&mut self, n: usize) -> Vec<usize> {
        let mut indices = Vec::with_capacity(n);
        for _ in 0..n {
            if self.cursor >= self.order.len() {
                self.order.shuffle(&mut self.rng);
                self.cursor = 0;
            }
            indices.push(self.order[self.cursor]);
            self.cursor += 1;
        }
        indices
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray;

    fn item(label: usize) -> ImageItem {
        ImageItem {
            image: vec![0.5; 3 * 4 * 4],
            label,
            path: format!("{}.png", label),
        }
    }

    #[test]
    fn test_labeled_batch_shapes() {
        let device = Default::default();
        let batcher = LabeledBatcher::<TestBackend>::new(device, 4);

        let batch = batcher.batch(vec![item(0), item(1), item(2)]);
        assert_eq!(batch.images.dims(), [3, 3, 4, 4]);
        assert_eq!(batch.targets.dims(), [3]);

        let labels: Vec<i64> = batch.targets.into_data().to_vec().unwrap();
        assert_eq!(labels, vec![0, 1, 2]);
    }

    #[test]
    fn test_cycler_covers_pool_before_repeating() {
        let mut cycler = BatchCycler::new(6, 3);
        let mut seen: Vec<usize> = cycler.next_indices(6);
        seen.sort();
        assert_eq!(seen, vec![0, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_cycler_wraps() {
        let mut cycler = BatchCycler::new(4, 3);
        let indices = cycler.next_indices(10);
        assert_eq!(indices.len(), 10);
        assert!(indices.iter().all(|&i| i < 4));
    }
}
