//! The self-training step engine.
//!
//! Owns the student classifier, the three view classifiers, their
//! optimizers, the shadow-parameter tracker and the global step counter.
//! One call to [`DistillEngine::train_step`] runs every forward pass from a
//! single parameter snapshot, composes the objective for the selected
//! strategy, and only then commits all side effects together: optimizer
//! updates, shadow blend, kernel decay, retained normalization updates,
//! and the one step increment.

use burn::module::AutodiffModule;
use burn::nn::loss::CrossEntropyLossConfig;
use burn::optim::{adaptor::OptimizerAdaptor, Adam, AdamConfig, GradientsParams, Optimizer};
use burn::prelude::*;
use burn::tensor::activation::softmax;
use burn::tensor::backend::AutodiffBackend;
use burn::tensor::ElementConversion;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tracing::debug;

use crate::config::{DistillStrategy, EngineConfig, ModelConfig, NUM_VIEWS};
use crate::dataset::{LabeledBatch, UnlabeledBatch};
use crate::model::{ImageClassifier, Mode};

use super::confidence::confidence_mask;
use super::ema::EmaTracker;
use super::pseudo_label::{
    masked_view_losses, one_hot, smooth_targets, soft_cross_entropy, vote_labels,
};
use super::views::{make_view, ViewPolicy};
use super::warmup::WarmupSchedule;

type Optim<B> = OptimizerAdaptor<
    Adam<<B as AutodiffBackend>::InnerBackend>,
    ImageClassifier<B>,
    B,
>;

/// What the driver should do after a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Continue,
    /// The composed loss fell below the configured target. The step is
    /// abandoned before any parameter mutation and the driver is expected
    /// to stop feeding steps; the engine never exits the process.
    TargetReached,
}

/// Scalars of one committed step.
#[derive(Debug, Clone)]
pub struct StepReport {
    /// Index of the step that just committed (pre-increment value)
    pub step: u64,
    pub supervised_loss: f64,
    pub consistency_loss: f64,
    pub total_loss: f64,
    pub warmup: f64,
    /// Fraction of (example, view) pairs passing the confidence gate
    pub confident_fraction: f64,
    pub outcome: StepOutcome,
}

/// Loss-composition engine over one student and three view classifiers.
pub struct DistillEngine<B: AutodiffBackend> {
    student: ImageClassifier<B>,
    views: [ImageClassifier<B>; NUM_VIEWS],
    student_optimizer: Optim<B>,
    view_optimizers: [Optim<B>; NUM_VIEWS],
    ema: EmaTracker<B>,
    schedule: WarmupSchedule,
    config: EngineConfig,
    num_classes: usize,
    step: u64,
    rng: ChaCha8Rng,
}

impl<B: AutodiffBackend> DistillEngine<B> {
    /// Build the four independently initialized classifier instances and
    /// their optimizers. The instances are constructed once here and reused
    /// for every step.
    pub fn new(
        model: &ModelConfig,
        config: EngineConfig,
        total_steps: u64,
        seed: u64,
        device: &B::Device,
    ) -> Self {
        let student = ImageClassifier::new(model, device);
        let views = [
            ImageClassifier::new(model, device),
            ImageClassifier::new(model, device),
            ImageClassifier::new(model, device),
        ];

        let ema = EmaTracker::new(&student, config.ema_decay);
        let schedule = WarmupSchedule::new(config.warmup_pos, total_steps);

        Self {
            student,
            views,
            student_optimizer: AdamConfig::new().init(),
            view_optimizers: [
                AdamConfig::new().init(),
                AdamConfig::new().init(),
                AdamConfig::new().init(),
            ],
            ema,
            schedule,
            config,
            num_classes: model.num_classes,
            step: 0,
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }

    /// Steps committed so far. Incremented exactly once per completed
    /// [`train_step`], never by anything else.
    pub fn global_step(&self) -> u64 {
        self.step
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn student(&self) -> &ImageClassifier<B> {
        &self.student
    }

    /// Run one composed training step.
    pub fn train_step(
        &mut self,
        labeled: &LabeledBatch<B>,
        unlabeled: &UnlabeledBatch<B>,
    ) -> StepReport {
        match self.config.strategy {
            DistillStrategy::MaskedViews => self.step_masked(labeled, unlabeled),
            DistillStrategy::VotedViews => self.step_voted(labeled, unlabeled),
        }
    }

    /// Masked strategy: supervised cross-entropy plus the warmup-weighted
    /// mean of three confidence-masked self-distillation terms.
    fn step_masked(
        &mut self,
        labeled: &LabeledBatch<B>,
        unlabeled: &UnlabeledBatch<B>,
    ) -> StepReport {
        let warmup = self.schedule.weight(self.step);

        // Forward passes, all against the pre-step parameters. Only the
        // first call's normalization updates are retained.
        let student_pass = self.student.forward(labeled.images.clone(), Mode::Train);
        let view_logits = [
            self.views[0].logits(unlabeled.images.clone(), Mode::Train),
            self.views[1].logits(unlabeled.images.clone(), Mode::Train),
            self.views[2].logits(unlabeled.images.clone(), Mode::Train),
        ];

        let supervised = self.supervised_loss(student_pass.logits.clone(), labeled.targets.clone());
        let consistency = masked_view_losses(&view_logits, self.config.confidence_threshold);

        let consistency_weight = warmup * self.config.consistency_weight;
        let supervised_value = scalar_of(&supervised);
        let consistency_value = scalar_of(&consistency.combined);
        let total_value = supervised_value + consistency_value * consistency_weight;
        let confident_fraction = scalar_of(&consistency.confident_fraction);

        // Stage every gradient before any parameter moves. The graphs are
        // disjoint (no parameter sharing between instances), so the
        // per-model backwards are together equivalent to one backward
        // through `supervised + combined * consistency_weight`.
        let student_grads =
            GradientsParams::from_grads(supervised.backward(), &self.student);
        let view_grads: Vec<GradientsParams> = consistency
            .per_view
            .iter()
            .zip(self.views.iter())
            .map(|(loss, view)| {
                let scaled = loss.clone().mul_scalar(consistency_weight / 3.0);
                GradientsParams::from_grads(scaled.backward(), view)
            })
            .collect();

        self.commit(student_grads, Some(view_grads), student_pass.norm_updates);

        StepReport {
            step: self.step - 1,
            supervised_loss: supervised_value,
            consistency_loss: consistency_value,
            total_loss: total_value,
            warmup,
            confident_fraction,
            outcome: StepOutcome::Continue,
        }
    }

    /// Voted strategy: pseudo-labels from the cross-view index vote are
    /// concatenated onto the labeled batch and a single joint cross-entropy
    /// is minimized. No separate warmup factor applies.
    fn step_voted(
        &mut self,
        labeled: &LabeledBatch<B>,
        unlabeled: &UnlabeledBatch<B>,
    ) -> StepReport {
        let warmup = self.schedule.weight(self.step);

        // First call: the only one whose normalization updates survive.
        let student_pass = self.student.forward(labeled.images.clone(), Mode::Train);
        let student_unlabeled = self
            .student
            .logits(unlabeled.images.clone(), Mode::Train);

        let view_1 = make_view(&unlabeled.images, ViewPolicy::RandomFlip, &mut self.rng);
        let view_2 = make_view(&unlabeled.images, ViewPolicy::Identity, &mut self.rng);
        let view_3 = make_view(&unlabeled.images, ViewPolicy::RandomFlip, &mut self.rng);
        let view_logits = [
            self.views[0].logits(view_1, Mode::Train),
            self.views[1].logits(view_2, Mode::Train),
            self.views[2].logits(view_3, Mode::Train),
        ];

        // The per-view confidence gates are evaluated as a diagnostic only;
        // the joint loss below stays ungated.
        let confident_fraction = view_logits
            .iter()
            .map(|logits| {
                scalar_of(
                    &confidence_mask(
                        softmax(logits.clone(), 1),
                        self.config.confidence_threshold,
                    )
                    .mean(),
                )
            })
            .sum::<f64>()
            / 3.0;
        debug!(
            step = self.step,
            confident_fraction, "confidence gates (not applied to the joint loss)"
        );

        let voted = vote_labels(&view_logits);
        let pseudo_targets = one_hot(voted, self.num_classes);
        let supervised_targets = smooth_targets(
            one_hot(labeled.targets.clone(), self.num_classes),
            self.config.label_smoothing,
        );

        let joint_targets = Tensor::cat(vec![supervised_targets, pseudo_targets], 0);
        let joint_logits = Tensor::cat(
            vec![student_pass.logits.clone(), student_unlabeled],
            0,
        );
        let joint = soft_cross_entropy(joint_logits, joint_targets);
        let total_value = scalar_of(&joint);

        // Target reached: abandon the step before any parameter mutation.
        // The driver receives the signal; nothing else is flushed.
        if let Some(target) = self.config.target_loss {
            if total_value < target {
                return StepReport {
                    step: self.step,
                    supervised_loss: total_value,
                    consistency_loss: 0.0,
                    total_loss: total_value,
                    warmup,
                    confident_fraction,
                    outcome: StepOutcome::TargetReached,
                };
            }
        }

        // The pseudo-labels are arg-max derived, so no gradient reaches the
        // view classifiers here; only the student moves.
        let student_grads = GradientsParams::from_grads(joint.backward(), &self.student);

        self.commit(student_grads, None, student_pass.norm_updates);

        StepReport {
            step: self.step - 1,
            supervised_loss: total_value,
            consistency_loss: 0.0,
            total_loss: total_value,
            warmup,
            confident_fraction,
            outcome: StepOutcome::Continue,
        }
    }

    /// Commit phase: every side effect of a step happens here, in a fixed
    /// order, or not at all. Optimizer updates first, then the shadow blend
    /// (observing post-update values), then kernel decay, then the retained
    /// normalization updates, then the single step increment.
    fn commit(
        &mut self,
        student_grads: GradientsParams,
        view_grads: Option<Vec<GradientsParams>>,
        norm_updates: Vec<crate::model::NormUpdate<B>>,
    ) {
        let lr = self.config.learning_rate;

        self.student = self
            .student_optimizer
            .step(lr, self.student.clone(), student_grads);
        if let Some(view_grads) = view_grads {
            for (index, grads) in view_grads.into_iter().enumerate() {
                self.views[index] =
                    self.view_optimizers[index].step(lr, self.views[index].clone(), grads);
            }
        }

        self.ema.update(&self.student);

        // Decoupled weight decay: every convolution kernel, every instance,
        // scaled by (1 - lr * wd) from its post-gradient value.
        let factor = 1.0 - lr * self.config.weight_decay;
        let mut decay = KernelDecay { factor };
        self.student = self.student.clone().map(&mut decay);
        for index in 0..self.views.len() {
            self.views[index] = self.views[index].clone().map(&mut decay);
        }

        self.student.apply_norm_updates(norm_updates);

        self.step += 1;
    }

    /// Normalization-retuning pass: one training-mode forward on a labeled
    /// batch with only the running-statistics updates retained. Gradient
    /// parameters, the shadow, and the step counter are untouched.
    pub fn retune_norm(&mut self, labeled: &LabeledBatch<B>) {
        let pass = self.student.forward(labeled.images.clone(), Mode::Train);
        self.student.apply_norm_updates(pass.norm_updates);
    }

    /// Softmax probabilities from the shadow (EMA) parameters, the
    /// stabilized inference path.
    pub fn classify(&self, images: Tensor<B::InnerBackend, 4>) -> Tensor<B::InnerBackend, 2> {
        self.ema.overlay(self.student.valid()).predict(images)
    }

    /// Softmax probabilities from the live parameters, for debugging the
    /// raw network.
    pub fn classify_raw(&self, images: Tensor<B::InnerBackend, 4>) -> Tensor<B::InnerBackend, 2> {
        self.student.valid().predict(images)
    }

    fn supervised_loss(&self, logits: Tensor<B, 2>, targets: Tensor<B, 1, Int>) -> Tensor<B, 1> {
        let smoothing = if self.config.label_smoothing > 0.0 {
            Some(self.config.label_smoothing as f32)
        } else {
            None
        };
        CrossEntropyLossConfig::new()
            .with_smoothing(smoothing)
            .init(&logits.device())
            .forward(logits, targets)
    }
}

/// Scales every rank-4 parameter (the convolution kernels) and leaves
/// biases, normalization scale/shift, and the linear head alone.
struct KernelDecay {
    factor: f64,
}

impl<B: Backend> burn::module::ModuleMapper<B> for KernelDecay {
    fn map_float<const D: usize>(
        &mut self,
        _id: burn::module::ParamId,
        tensor: Tensor<B, D>,
    ) -> Tensor<B, D> {
        if D == 4 {
            tensor.mul_scalar(self.factor)
        } else {
            tensor
        }
    }
}

fn scalar_of<B: Backend>(tensor: &Tensor<B, 1>) -> f64 {
    tensor.clone().into_scalar().elem()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::{LabeledBatch, UnlabeledBatch};
    use burn::backend::{Autodiff, NdArray};
    use burn::tensor::TensorData;

    type TestBackend = Autodiff<NdArray>;

    fn tiny_model() -> ModelConfig {
        ModelConfig {
            num_classes: 3,
            input_size: 8,
            input_channels: 3,
            base_filters: 2,
            scales: 1,
            repeat: 1,
        }
    }

    fn tiny_engine(strategy: DistillStrategy, target_loss: Option<f64>) -> DistillEngine<TestBackend> {
        let config = EngineConfig {
            strategy,
            target_loss,
            ..Default::default()
        };
        DistillEngine::new(&tiny_model(), config, 100, 7, &Default::default())
    }

    fn batches() -> (LabeledBatch<TestBackend>, UnlabeledBatch<TestBackend>) {
        let device = Default::default();
        let images = Tensor::random([2, 3, 8, 8], burn::tensor::Distribution::Default, &device);
        let targets = Tensor::from_data(TensorData::new(vec![0i64, 2], [2]), &device);
        let unlabeled =
            Tensor::random([2, 3, 8, 8], burn::tensor::Distribution::Default, &device);
        (
            LabeledBatch { images, targets },
            UnlabeledBatch { images: unlabeled },
        )
    }

    #[test]
    fn test_masked_step_commits_once() {
        let mut engine = tiny_engine(DistillStrategy::MaskedViews, None);
        let (labeled, unlabeled) = batches();

        assert_eq!(engine.global_step(), 0);
        let report = engine.train_step(&labeled, &unlabeled);

        assert_eq!(engine.global_step(), 1);
        assert_eq!(report.step, 0);
        assert!(report.supervised_loss.is_finite());
        assert!(report.consistency_loss.is_finite());
        assert_eq!(report.outcome, StepOutcome::Continue);
        // Warmup starts at zero, so the consistency term carries no weight
        // on the first step.
        assert_eq!(report.warmup, 0.0);
        assert!((report.total_loss - report.supervised_loss).abs() < 1e-12);
    }

    #[test]
    fn test_voted_step_reports_joint_loss() {
        let mut engine = tiny_engine(DistillStrategy::VotedViews, None);
        let (labeled, unlabeled) = batches();

        let report = engine.train_step(&labeled, &unlabeled);
        assert_eq!(report.total_loss, report.supervised_loss);
        assert_eq!(report.consistency_loss, 0.0);
        assert!(report.total_loss.is_finite());
        assert_eq!(engine.global_step(), 1);
    }

    #[test]
    fn test_target_loss_signals_stop() {
        let mut engine = tiny_engine(DistillStrategy::VotedViews, Some(f64::MAX));
        let (labeled, unlabeled) = batches();

        let report = engine.train_step(&labeled, &unlabeled);
        assert_eq!(report.outcome, StepOutcome::TargetReached);
        // The step is abandoned: no parameter mutation, no step increment.
        assert_eq!(engine.global_step(), 0);
        assert_eq!(report.step, 0);
    }

    #[test]
    fn test_retune_norm_leaves_step_counter_alone() {
        let mut engine = tiny_engine(DistillStrategy::MaskedViews, None);
        let (labeled, unlabeled) = batches();
        engine.train_step(&labeled, &unlabeled);

        let before = engine.global_step();
        engine.retune_norm(&labeled);
        assert_eq!(engine.global_step(), before);
    }

    #[test]
    fn test_retune_norm_moves_eval_output() {
        let mut engine = tiny_engine(DistillStrategy::MaskedViews, None);
        let (labeled, _) = batches();

        let probe = labeled.images.clone().inner();
        let before: Vec<f32> = engine
            .classify_raw(probe.clone())
            .into_data()
            .to_vec()
            .unwrap();

        engine.retune_norm(&labeled);
        let after: Vec<f32> = engine.classify_raw(probe).into_data().to_vec().unwrap();

        assert!(before
            .iter()
            .zip(after.iter())
            .any(|(b, a)| (b - a).abs() > 1e-7));
    }

    #[test]
    fn test_ema_and_raw_paths_diverge_after_training() {
        let mut engine = tiny_engine(DistillStrategy::MaskedViews, None);
        let (labeled, unlabeled) = batches();

        for _ in 0..3 {
            engine.train_step(&labeled, &unlabeled);
        }

        let probe = labeled.images.clone().inner();
        let ema: Vec<f32> = engine.classify(probe.clone()).into_data().to_vec().unwrap();
        let raw: Vec<f32> = engine.classify_raw(probe).into_data().to_vec().unwrap();

        // With decay 0.999 the shadow lags the live parameters.
        assert!(ema
            .iter()
            .zip(raw.iter())
            .any(|(e, r)| (e - r).abs() > 1e-9));
    }
}
