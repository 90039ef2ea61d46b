//! Exponential moving average of trainable parameters.
//!
//! The tracker owns a shadow copy of every trainable parameter, stored
//! flattened and keyed by parameter id. After each optimizer step the
//! shadow is pulled toward the post-update live value; nothing else writes
//! it. For evaluation, the shadow values can be overlaid onto a copy of the
//! inference-mode network, leaving the live network untouched.

use std::collections::HashMap;

use burn::module::{Module, ModuleMapper, ModuleVisitor, ParamId};
use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;

/// Shadow-parameter tracker.
pub struct EmaTracker<B: AutodiffBackend> {
    decay: f64,
    shadow: HashMap<ParamId, Tensor<B::InnerBackend, 1>>,
}

impl<B: AutodiffBackend> EmaTracker<B> {
    /// Initialize the shadow as a copy of the model's current parameters.
    pub fn new<M: Module<B>>(model: &M, decay: f64) -> Self {
        let mut tracker = Self {
            decay,
            shadow: HashMap::new(),
        };
        let mut visitor = ShadowBlend::<B> {
            shadow: &mut tracker.shadow,
            decay: 0.0,
        };
        model.visit(&mut visitor);
        tracker
    }

    /// Pull every shadow value toward the live value:
    /// `shadow = decay * shadow + (1 - decay) * live`.
    ///
    /// Call this after the optimizer step so the blend observes the
    /// post-update parameters.
    pub fn update<M: Module<B>>(&mut self, model: &M) {
        let mut visitor = ShadowBlend::<B> {
            shadow: &mut self.shadow,
            decay: self.decay,
        };
        model.visit(&mut visitor);
    }

    /// Return `model` with every tracked parameter replaced by its shadow
    /// value. Parameters the tracker has never seen are left as-is.
    pub fn overlay<M: Module<B::InnerBackend>>(&self, model: M) -> M {
        let mut mapper = ShadowOverlay::<B::InnerBackend> {
            shadow: &self.shadow,
        };
        model.map(&mut mapper)
    }

    pub fn decay(&self) -> f64 {
        self.decay
    }

    /// Number of tracked parameters.
    pub fn tracked(&self) -> usize {
        self.shadow.len()
    }
}

/// Visitor blending live values into the shadow map. With an empty map (or
/// decay 0) this degenerates to a plain copy.
struct ShadowBlend<'a, B: AutodiffBackend> {
    shadow: &'a mut HashMap<ParamId, Tensor<B::InnerBackend, 1>>,
    decay: f64,
}

impl<'a, B: AutodiffBackend> ModuleVisitor<B> for ShadowBlend<'a, B> {
    fn visit_float<const D: usize>(&mut self, id: ParamId, tensor: &Tensor<B, D>) {
        let live = tensor.clone().inner().flatten::<1>(0, D - 1);
        let next = match self.shadow.get(&id) {
            Some(previous) => {
                previous.clone().mul_scalar(self.decay) + live.mul_scalar(1.0 - self.decay)
            }
            None => live,
        };
        self.shadow.insert(id, next);
    }
}

/// Mapper substituting shadow values for live ones on an inference-mode
/// module.
struct ShadowOverlay<'a, B: Backend> {
    shadow: &'a HashMap<ParamId, Tensor<B, 1>>,
}

impl<'a, B: Backend> ModuleMapper<B> for ShadowOverlay<'a, B> {
    fn map_float<const D: usize>(&mut self, id: ParamId, tensor: Tensor<B, D>) -> Tensor<B, D> {
        match self.shadow.get(&id) {
            Some(flat) => flat.clone().reshape(tensor.shape()),
            None => tensor,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::{Autodiff, NdArray};
    use burn::module::{AutodiffModule, Param};
    use burn::tensor::TensorData;

    type TestBackend = Autodiff<NdArray>;

    #[derive(Module, Debug)]
    struct Probe<B: Backend> {
        w: Param<Tensor<B, 1>>,
    }

    impl<B: Backend> Probe<B> {
        fn new(values: Vec<f32>, device: &B::Device) -> Self {
            let len = values.len();
            Self {
                w: Param::from_tensor(Tensor::from_floats(
                    TensorData::new(values, [len]),
                    device,
                )),
            }
        }
    }

    /// Id-preserving in-place bump of every parameter.
    struct AddOne;
    impl<B: Backend> ModuleMapper<B> for AddOne {
        fn map_float<const D: usize>(&mut self, _id: ParamId, tensor: Tensor<B, D>) -> Tensor<B, D> {
            tensor.add_scalar(1.0)
        }
    }

    fn shadow_values(tracker: &EmaTracker<TestBackend>, probe: &Probe<TestBackend>) -> Vec<f32> {
        tracker
            .overlay(probe.valid())
            .w
            .val()
            .into_data()
            .to_vec()
            .unwrap()
    }

    #[test]
    fn test_initial_shadow_is_a_copy() {
        let device = Default::default();
        let probe = Probe::<TestBackend>::new(vec![1.0, 2.0], &device);
        let tracker = EmaTracker::new(&probe, 0.999);

        assert_eq!(tracker.tracked(), 1);
        assert_eq!(shadow_values(&tracker, &probe), vec![1.0, 2.0]);
    }

    #[test]
    fn test_decay_one_freezes_shadow() {
        let device = Default::default();
        let mut probe = Probe::<TestBackend>::new(vec![1.0, 2.0], &device);
        let mut tracker = EmaTracker::new(&probe, 1.0);

        probe = probe.map(&mut AddOne);
        tracker.update(&probe);

        assert_eq!(shadow_values(&tracker, &probe), vec![1.0, 2.0]);
    }

    #[test]
    fn test_decay_zero_tracks_live_exactly() {
        let device = Default::default();
        let mut probe = Probe::<TestBackend>::new(vec![1.0, 2.0], &device);
        let mut tracker = EmaTracker::new(&probe, 0.0);

        probe = probe.map(&mut AddOne);
        tracker.update(&probe);

        assert_eq!(shadow_values(&tracker, &probe), vec![2.0, 3.0]);
    }

    #[test]
    fn test_intermediate_decay_blends() {
        let device = Default::default();
        let mut probe = Probe::<TestBackend>::new(vec![0.0], &device);
        let mut tracker = EmaTracker::new(&probe, 0.9);

        probe = probe.map(&mut AddOne);
        tracker.update(&probe);

        let values = shadow_values(&tracker, &probe);
        // 0.9 * 0.0 + 0.1 * 1.0
        assert!((values[0] - 0.1).abs() < 1e-6);
    }

    #[test]
    fn test_overlay_leaves_live_model_untouched() {
        let device = Default::default();
        let mut probe = Probe::<TestBackend>::new(vec![5.0], &device);
        let mut tracker = EmaTracker::new(&probe, 1.0);

        probe = probe.map(&mut AddOne);
        tracker.update(&probe);

        let live: Vec<f32> = probe.w.val().into_data().to_vec().unwrap();
        assert_eq!(live, vec![6.0]);
        assert_eq!(shadow_values(&tracker, &probe), vec![5.0]);
    }
}
