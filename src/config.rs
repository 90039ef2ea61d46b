//! Configuration structures for the model, the training run, and the
//! self-training engine, with defaults matching the reference
//! hyperparameters (lr 0.002, wd 0.02, EMA 0.999, warmup at 40% of
//! training, threshold 0.95).

use serde::{Deserialize, Serialize};

/// Number of stochastic views formed per unlabeled example per step.
///
/// Both aggregation strategies are defined over exactly three views.
pub const NUM_VIEWS: usize = 3;

/// How pseudo-labels derived from the unlabeled views are folded back into
/// the optimization objective.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum DistillStrategy {
    /// Each view self-labels from its own arg-max, its loss is zeroed for
    /// low-confidence examples, and the three per-view scalars are averaged
    /// into a separate consistency term ramped in by the warmup schedule.
    MaskedViews,
    /// The three views vote (floor of the mean class index), the voted
    /// pseudo-labels are concatenated onto the labeled batch, and a single
    /// joint cross-entropy is minimized.
    VotedViews,
}

impl Default for DistillStrategy {
    fn default() -> Self {
        Self::MaskedViews
    }
}

/// Configuration for the classifier network architecture.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Number of output classes
    pub num_classes: usize,

    /// Input image size (width and height, assumed square)
    pub input_size: usize,

    /// Number of input channels (3 for RGB)
    pub input_channels: usize,

    /// Base number of convolutional filters
    pub base_filters: usize,

    /// Number of 2x2 downscalings; 0 selects log2(input_size) - 2
    pub scales: usize,

    /// Number of residual units per scale
    pub repeat: usize,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            num_classes: 10,
            input_size: 32,
            input_channels: 3,
            base_filters: 32,
            scales: 0,
            repeat: 4,
        }
    }
}

impl ModelConfig {
    pub fn new(num_classes: usize, input_size: usize) -> Self {
        Self {
            num_classes,
            input_size,
            ..Default::default()
        }
    }

    /// Effective number of downscaling stages.
    pub fn effective_scales(&self) -> usize {
        if self.scales > 0 {
            self.scales
        } else {
            (self.input_size as f64).log2() as usize - 2
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.num_classes == 0 {
            return Err("num_classes must be greater than 0".to_string());
        }
        if self.input_size < 8 || !self.input_size.is_power_of_two() {
            return Err("input_size must be a power of two >= 8".to_string());
        }
        if self.base_filters == 0 {
            return Err("base_filters must be greater than 0".to_string());
        }
        if self.repeat == 0 {
            return Err("repeat must be greater than 0".to_string());
        }
        Ok(())
    }
}

/// Hyperparameters of the self-training engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Pseudo-label aggregation strategy
    pub strategy: DistillStrategy,

    /// Adam learning rate
    pub learning_rate: f64,

    /// Decoupled weight decay coefficient (kernels are scaled by
    /// `1 - learning_rate * weight_decay` once per step)
    pub weight_decay: f64,

    /// Decay of the shadow parameter average
    pub ema_decay: f64,

    /// Fraction of total training at which the consistency term reaches
    /// full weight
    pub warmup_pos: f64,

    /// Weight of the consistency term once warmup saturates
    pub consistency_weight: f64,

    /// Minimum peak softmax probability for a view's prediction to count
    pub confidence_threshold: f64,

    /// Label smoothing applied to supervised targets
    pub label_smoothing: f64,

    /// Stop training once the composed loss drops below this value
    /// (voted-views strategy only)
    pub target_loss: Option<f64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            strategy: DistillStrategy::MaskedViews,
            learning_rate: 0.002,
            weight_decay: 0.02,
            ema_decay: 0.999,
            warmup_pos: 0.4,
            consistency_weight: 1.0,
            confidence_threshold: 0.95,
            label_smoothing: 0.1,
            target_loss: None,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.learning_rate <= 0.0 {
            return Err("learning_rate must be positive".to_string());
        }
        if !(0.0..=1.0).contains(&self.ema_decay) {
            return Err("ema_decay must be in [0, 1]".to_string());
        }
        if self.warmup_pos <= 0.0 || self.warmup_pos > 1.0 {
            return Err("warmup_pos must be in (0, 1]".to_string());
        }
        if !(0.0..1.0).contains(&self.label_smoothing) {
            return Err("label_smoothing must be in [0, 1)".to_string());
        }
        // A threshold outside (0, 1] is accepted on purpose: tau >= 1 yields
        // an always-empty mask and the consistency term degenerates to zero.
        Ok(())
    }
}

/// Configuration of a full training run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainConfig {
    /// Total optimizer steps
    pub total_steps: u64,

    /// Labeled and unlabeled batch size
    pub batch_size: usize,

    /// Examples kept labeled per class; the rest of the train split feeds
    /// the unlabeled pool
    pub labeled_per_class: usize,

    /// Evaluate and log aggregates every this many steps
    pub report_every: u64,

    /// Random seed for splits, samplers and view augmentation
    pub seed: u64,

    /// Run the normalization-retuning pass on this many labeled batches
    /// after the main loop (0 disables it)
    pub retune_batches: usize,

    /// Directory for checkpoints and the run manifest
    pub output_dir: String,

    pub engine: EngineConfig,
    pub model: ModelConfig,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            total_steps: 1 << 16,
            batch_size: 64,
            labeled_per_class: 250,
            report_every: 1024,
            seed: 42,
            retune_batches: 0,
            output_dir: "output/runs".to_string(),
            engine: EngineConfig::default(),
            model: ModelConfig::default(),
        }
    }
}

impl TrainConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.total_steps == 0 {
            return Err("total_steps must be greater than 0".to_string());
        }
        if self.batch_size == 0 {
            return Err("batch_size must be greater than 0".to_string());
        }
        if self.labeled_per_class == 0 {
            return Err("labeled_per_class must be greater than 0".to_string());
        }
        self.engine.validate()?;
        self.model.validate()
    }

    /// Save the config as a JSON run manifest.
    pub fn save(&self, path: &std::path::Path) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Load a config from a JSON manifest.
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&json)?)
    }
}
