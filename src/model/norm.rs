//! Batch normalization with explicit, caller-applied running statistics.
//!
//! Unlike an ordinary batch-norm layer, a training-mode forward does not
//! touch the stored running mean/variance. It normalizes with the batch
//! statistics and hands back a [`NormUpdate`] carrying the blended running
//! values; the owner applies it (or drops it) later. This keeps every
//! side effect of a training step visible to the step logic.

use burn::module::Param;
use burn::prelude::*;

use super::Mode;

/// A pending running-statistics update produced by one training-mode
/// forward through one normalization layer.
#[derive(Debug, Clone)]
pub struct NormUpdate<B: Backend> {
    /// New running mean, shape [channels]
    pub mean: Tensor<B, 1>,
    /// New running variance, shape [channels]
    pub var: Tensor<B, 1>,
}

/// Channel-wise batch normalization over [batch, channels, height, width].
#[derive(Module, Debug)]
pub struct NormLayer<B: Backend> {
    /// Learned scale, shape [channels]
    gamma: Param<Tensor<B, 1>>,
    /// Learned shift, shape [channels]
    beta: Param<Tensor<B, 1>>,
    /// Running mean, only ever replaced through [`NormLayer::apply_update`]
    running_mean: Tensor<B, 1>,
    /// Running variance, only ever replaced through [`NormLayer::apply_update`]
    running_var: Tensor<B, 1>,
    /// Fraction of the batch statistic blended into the running value
    momentum: f64,
    epsilon: f64,
}

impl<B: Backend> NormLayer<B> {
    pub fn new(channels: usize, device: &B::Device) -> Self {
        Self {
            gamma: Param::from_tensor(Tensor::ones([channels], device)),
            beta: Param::from_tensor(Tensor::zeros([channels], device)),
            running_mean: Tensor::zeros([channels], device),
            running_var: Tensor::ones([channels], device),
            momentum: 0.1,
            epsilon: 1e-5,
        }
    }

    /// Forward pass. In training mode the produced update is pushed onto
    /// `updates`; evaluation mode pushes nothing.
    pub fn forward(
        &self,
        x: Tensor<B, 4>,
        mode: Mode,
        updates: &mut Vec<NormUpdate<B>>,
    ) -> Tensor<B, 4> {
        let [_, channels, _, _] = x.dims();

        let (mean, var) = match mode {
            Mode::Train => {
                let mean = x
                    .clone()
                    .mean_dim(0)
                    .mean_dim(2)
                    .mean_dim(3)
                    .reshape([channels]);
                let centered = x.clone() - mean.clone().reshape([1, channels, 1, 1]);
                let var = (centered.clone() * centered)
                    .mean_dim(0)
                    .mean_dim(2)
                    .mean_dim(3)
                    .reshape([channels]);

                updates.push(NormUpdate {
                    mean: self.running_mean.clone().mul_scalar(1.0 - self.momentum)
                        + mean.clone().detach().mul_scalar(self.momentum),
                    var: self.running_var.clone().mul_scalar(1.0 - self.momentum)
                        + var.clone().detach().mul_scalar(self.momentum),
                });

                (mean, var)
            }
            Mode::Eval => (self.running_mean.clone(), self.running_var.clone()),
        };

        let mean = mean.reshape([1, channels, 1, 1]);
        let std = var.add_scalar(self.epsilon).sqrt().reshape([1, channels, 1, 1]);
        let normalized = (x - mean) / std;

        normalized * self.gamma.val().reshape([1, channels, 1, 1])
            + self.beta.val().reshape([1, channels, 1, 1])
    }

    /// Replace the running statistics with a previously returned update.
    pub fn apply_update(&mut self, update: NormUpdate<B>) {
        self.running_mean = update.mean;
        self.running_var = update.var;
    }

    /// Current running mean (for tests and diagnostics).
    pub fn running_mean(&self) -> Tensor<B, 1> {
        self.running_mean.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use burn::tensor::TensorData;

    type TestBackend = NdArray;

    fn sample_input(device: &<TestBackend as Backend>::Device) -> Tensor<TestBackend, 4> {
        Tensor::from_floats(
            TensorData::new(
                vec![1.0f32, 2.0, 3.0, 4.0, -1.0, -2.0, -3.0, -4.0],
                [2, 1, 2, 2],
            ),
            device,
        )
    }

    #[test]
    fn test_train_forward_is_standardized() {
        let device = Default::default();
        let layer = NormLayer::<TestBackend>::new(1, &device);
        let mut updates = Vec::new();

        let out = layer.forward(sample_input(&device), Mode::Train, &mut updates);
        let data: Vec<f32> = out.into_data().to_vec().unwrap();

        let mean: f32 = data.iter().sum::<f32>() / data.len() as f32;
        assert!(mean.abs() < 1e-4);
        assert_eq!(updates.len(), 1);
    }

    #[test]
    fn test_eval_forward_produces_no_updates() {
        let device = Default::default();
        let layer = NormLayer::<TestBackend>::new(1, &device);
        let mut updates = Vec::new();

        let _ = layer.forward(sample_input(&device), Mode::Eval, &mut updates);
        assert!(updates.is_empty());
    }

    #[test]
    fn test_running_stats_move_only_when_applied() {
        let device = Default::default();
        let mut layer = NormLayer::<TestBackend>::new(1, &device);
        let mut updates = Vec::new();

        let input = Tensor::from_floats(
            TensorData::new(vec![4.0f32, 4.0, 4.0, 4.0, 6.0, 6.0, 6.0, 6.0], [2, 1, 2, 2]),
            &device,
        );
        let _ = layer.forward(input, Mode::Train, &mut updates);
        let before: Vec<f32> = layer.running_mean().into_data().to_vec().unwrap();
        assert_eq!(before, vec![0.0]);

        layer.apply_update(updates.pop().unwrap());
        let after: Vec<f32> = layer.running_mean().into_data().to_vec().unwrap();
        // Batch mean is 5, momentum 0.1: running mean becomes 0.5.
        assert!((after[0] - 0.5).abs() < 1e-5);
    }
}
