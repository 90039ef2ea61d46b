//! Convolutional classifier with residual stages.
//!
//! Architecture: a 3x3 stem, `scales` stages of `repeat` residual units
//! (channels doubling per stage, 2x2 max-pool between stages), global
//! average pooling and a linear head. Every normalization layer is a
//! [`NormLayer`], so training-mode forwards surface their running-stat
//! updates through the returned [`ForwardPass`].

use burn::{
    nn::{
        conv::{Conv2d, Conv2dConfig},
        pool::{
            AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig, MaxPool2d, MaxPool2dConfig,
        },
        Linear, LinearConfig, PaddingConfig2d, Relu,
    },
    prelude::*,
};

use crate::config::ModelConfig;

use super::norm::{NormLayer, NormUpdate};
use super::{ForwardPass, Mode};

/// Two 3x3 convolutions with a skip connection; a 1x1 projection is added
/// when the channel count changes.
#[derive(Module, Debug)]
pub struct ResidualUnit<B: Backend> {
    conv1: Conv2d<B>,
    norm1: NormLayer<B>,
    conv2: Conv2d<B>,
    norm2: NormLayer<B>,
    project: Option<Conv2d<B>>,
    relu: Relu,
}

impl<B: Backend> ResidualUnit<B> {
    pub fn new(in_channels: usize, out_channels: usize, device: &B::Device) -> Self {
        let conv1 = Conv2dConfig::new([in_channels, out_channels], [3, 3])
            .with_padding(PaddingConfig2d::Same)
            .init(device);
        let conv2 = Conv2dConfig::new([out_channels, out_channels], [3, 3])
            .with_padding(PaddingConfig2d::Same)
            .init(device);

        let project = if in_channels != out_channels {
            Some(Conv2dConfig::new([in_channels, out_channels], [1, 1]).init(device))
        } else {
            None
        };

        Self {
            conv1,
            norm1: NormLayer::new(out_channels, device),
            conv2,
            norm2: NormLayer::new(out_channels, device),
            project,
            relu: Relu::new(),
        }
    }

    pub fn forward(
        &self,
        x: Tensor<B, 4>,
        mode: Mode,
        updates: &mut Vec<NormUpdate<B>>,
    ) -> Tensor<B, 4> {
        let y = self.conv1.forward(x.clone());
        let y = self.norm1.forward(y, mode, updates);
        let y = self.relu.forward(y);
        let y = self.conv2.forward(y);
        let y = self.norm2.forward(y, mode, updates);

        let skip = match &self.project {
            Some(project) => project.forward(x),
            None => x,
        };

        self.relu.forward(y + skip)
    }

    fn norm_layers_mut(&mut self) -> Vec<&mut NormLayer<B>> {
        vec![&mut self.norm1, &mut self.norm2]
    }
}

/// One resolution stage: `repeat` residual units followed by a 2x2 pool.
#[derive(Module, Debug)]
pub struct Stage<B: Backend> {
    units: Vec<ResidualUnit<B>>,
    pool: MaxPool2d,
}

impl<B: Backend> Stage<B> {
    pub fn new(in_channels: usize, out_channels: usize, repeat: usize, device: &B::Device) -> Self {
        let mut units = Vec::with_capacity(repeat);
        units.push(ResidualUnit::new(in_channels, out_channels, device));
        for _ in 1..repeat {
            units.push(ResidualUnit::new(out_channels, out_channels, device));
        }

        Self {
            units,
            pool: MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init(),
        }
    }

    pub fn forward(
        &self,
        x: Tensor<B, 4>,
        mode: Mode,
        updates: &mut Vec<NormUpdate<B>>,
    ) -> Tensor<B, 4> {
        let mut x = x;
        for unit in &self.units {
            x = unit.forward(x, mode, updates);
        }
        self.pool.forward(x)
    }
}

/// The image classifier.
#[derive(Module, Debug)]
pub struct ImageClassifier<B: Backend> {
    stem: Conv2d<B>,
    stem_norm: NormLayer<B>,
    stages: Vec<Stage<B>>,
    global_pool: AdaptiveAvgPool2d,
    head: Linear<B>,
    relu: Relu,
    num_classes: usize,
}

impl<B: Backend> ImageClassifier<B> {
    pub fn new(config: &ModelConfig, device: &B::Device) -> Self {
        let base = config.base_filters;
        let scales = config.effective_scales();

        let stem = Conv2dConfig::new([config.input_channels, base], [3, 3])
            .with_padding(PaddingConfig2d::Same)
            .init(device);
        let stem_norm = NormLayer::new(base, device);

        let mut stages = Vec::with_capacity(scales);
        let mut channels = base;
        for _ in 0..scales {
            let out_channels = channels * 2;
            stages.push(Stage::new(channels, out_channels, config.repeat, device));
            channels = out_channels;
        }

        Self {
            stem,
            stem_norm,
            stages,
            global_pool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
            head: LinearConfig::new(channels, config.num_classes).init(device),
            relu: Relu::new(),
            num_classes: config.num_classes,
        }
    }

    /// Forward pass. Training mode collects one pending update per
    /// normalization layer, in a fixed layer order.
    pub fn forward(&self, x: Tensor<B, 4>, mode: Mode) -> ForwardPass<B> {
        let mut updates = Vec::new();

        let x = self.stem.forward(x);
        let x = self.stem_norm.forward(x, mode, &mut updates);
        let mut x = self.relu.forward(x);

        for stage in &self.stages {
            x = stage.forward(x, mode, &mut updates);
        }

        let x = self.global_pool.forward(x);
        let [batch_size, channels, _, _] = x.dims();
        let x = x.reshape([batch_size, channels]);

        ForwardPass {
            logits: self.head.forward(x),
            norm_updates: updates,
        }
    }

    /// Forward pass returning only logits (updates dropped).
    pub fn logits(&self, x: Tensor<B, 4>, mode: Mode) -> Tensor<B, 2> {
        self.forward(x, mode).logits
    }

    /// Softmax probabilities in evaluation mode.
    pub fn predict(&self, x: Tensor<B, 4>) -> Tensor<B, 2> {
        burn::tensor::activation::softmax(self.logits(x, Mode::Eval), 1)
    }

    /// Apply a set of pending normalization updates, in the same layer
    /// order `forward` produced them. Extra or missing entries are ignored.
    pub fn apply_norm_updates(&mut self, updates: Vec<NormUpdate<B>>) {
        let mut layers = self.norm_layers_mut();
        for (layer, update) in layers.iter_mut().zip(updates) {
            layer.apply_update(update);
        }
    }

    fn norm_layers_mut(&mut self) -> Vec<&mut NormLayer<B>> {
        let mut layers = vec![&mut self.stem_norm];
        for stage in &mut self.stages {
            for unit in &mut stage.units {
                layers.extend(unit.norm_layers_mut());
            }
        }
        layers
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray;

    fn tiny_config() -> ModelConfig {
        ModelConfig {
            num_classes: 10,
            input_size: 8,
            input_channels: 3,
            base_filters: 4,
            scales: 2,
            repeat: 1,
        }
    }

    #[test]
    fn test_output_shape() {
        let device = Default::default();
        let model = ImageClassifier::<TestBackend>::new(&tiny_config(), &device);

        let input = Tensor::<TestBackend, 4>::zeros([2, 3, 8, 8], &device);
        let pass = model.forward(input, Mode::Train);

        assert_eq!(pass.logits.dims(), [2, 10]);
    }

    #[test]
    fn test_update_count_matches_norm_layers() {
        let device = Default::default();
        let model = ImageClassifier::<TestBackend>::new(&tiny_config(), &device);

        let input = Tensor::<TestBackend, 4>::zeros([2, 3, 8, 8], &device);
        let pass = model.forward(input.clone(), Mode::Train);
        // stem + 2 stages * 1 unit * 2 norms
        assert_eq!(pass.norm_updates.len(), 5);

        let pass = model.forward(input, Mode::Eval);
        assert!(pass.norm_updates.is_empty());
    }

    #[test]
    fn test_apply_norm_updates_changes_eval_output() {
        let device = Default::default();
        let mut model = ImageClassifier::<TestBackend>::new(&tiny_config(), &device);

        let input = Tensor::<TestBackend, 4>::random(
            [4, 3, 8, 8],
            burn::tensor::Distribution::Default,
            &device,
        );

        let before: Vec<f32> = model
            .logits(input.clone(), Mode::Eval)
            .into_data()
            .to_vec()
            .unwrap();

        let pass = model.forward(input.clone(), Mode::Train);
        model.apply_norm_updates(pass.norm_updates);

        let after: Vec<f32> = model
            .logits(input, Mode::Eval)
            .into_data()
            .to_vec()
            .unwrap();

        assert!(before
            .iter()
            .zip(after.iter())
            .any(|(b, a)| (b - a).abs() > 1e-7));
    }
}
