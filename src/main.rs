//! Command-line interface for semi-supervised self-training.

use std::path::{Path, PathBuf};

use anyhow::Result;
use clap::{Parser, Subcommand};
use colored::Colorize;
use tracing::info;

use selftrain_ssl::backend::{backend_name, default_device, DefaultBackend, TrainingBackend};
use selftrain_ssl::config::{DistillStrategy, EngineConfig, ModelConfig, TrainConfig};
use selftrain_ssl::dataset::{FolderDataset, LabeledBatcher};
use selftrain_ssl::model::{ImageClassifier, Mode};
use selftrain_ssl::training::run_training;
use selftrain_ssl::utils::logging::{init_logging, LogConfig};
use selftrain_ssl::utils::metrics::EvalReport;

/// Semi-supervised image classification via pseudo-label self-training.
#[derive(Parser, Debug)]
#[command(name = "selftrain_ssl")]
#[command(version)]
#[command(about = "Train an image classifier from a small labeled set plus unlabeled data", long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, default_value = "false")]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Train with self-training on an image-folder dataset
    Train {
        /// Dataset root (one subdirectory per class)
        #[arg(short, long)]
        data_dir: String,

        /// Pseudo-label aggregation strategy
        #[arg(long, value_enum, default_value = "masked-views")]
        strategy: DistillStrategy,

        /// Total optimizer steps
        #[arg(long, default_value = "65536")]
        steps: u64,

        /// Batch size (labeled and unlabeled)
        #[arg(short, long, default_value = "64")]
        batch_size: usize,

        /// Learning rate
        #[arg(long, default_value = "0.002")]
        learning_rate: f64,

        /// Weight decay coefficient
        #[arg(long, default_value = "0.02")]
        weight_decay: f64,

        /// EMA decay of the shadow parameters
        #[arg(long, default_value = "0.999")]
        ema: f64,

        /// Fraction of training at which the consistency warmup saturates
        #[arg(long, default_value = "0.4")]
        warmup_pos: f64,

        /// Consistency weight at full warmup
        #[arg(long, default_value = "1.0")]
        consistency_weight: f64,

        /// Confidence threshold for trusting a view's prediction
        #[arg(long, default_value = "0.95")]
        threshold: f64,

        /// Label smoothing on supervised targets
        #[arg(long, default_value = "0.1")]
        smoothing: f64,

        /// Stop once the composed loss drops below this value
        #[arg(long)]
        target_loss: Option<f64>,

        /// Labeled examples kept per class
        #[arg(long, default_value = "250")]
        labeled_per_class: usize,

        /// Square input size images are resized to
        #[arg(long, default_value = "32")]
        image_size: usize,

        /// Base convolution filters
        #[arg(long, default_value = "32")]
        filters: usize,

        /// Residual units per scale
        #[arg(long, default_value = "4")]
        repeat: usize,

        /// Number of 2x2 downscalings (0 = derive from image size)
        #[arg(long, default_value = "0")]
        scales: usize,

        /// Evaluate and log every this many steps
        #[arg(long, default_value = "1024")]
        report_every: u64,

        /// Normalization-retuning batches after the main loop
        #[arg(long, default_value = "0")]
        retune_batches: usize,

        /// Output directory for checkpoints
        #[arg(short, long, default_value = "output/runs")]
        output_dir: String,

        /// Random seed
        #[arg(long, default_value = "42")]
        seed: u64,
    },

    /// Score a saved run on an image-folder dataset
    Eval {
        /// Run directory produced by `train` (contains config.json and student)
        #[arg(short, long)]
        run_dir: String,

        /// Dataset root to score
        #[arg(short, long)]
        data_dir: String,

        /// Re-derive normalization statistics on this many batches before
        /// scoring (saved checkpoints carry weights only)
        #[arg(long, default_value = "8")]
        retune_batches: usize,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_config = if cli.verbose {
        LogConfig::verbose()
    } else {
        LogConfig::default()
    };
    init_logging(&log_config).map_err(|e| anyhow::anyhow!(e))?;

    println!(
        "{} v{} [{}]",
        "selftrain_ssl".green().bold(),
        selftrain_ssl::VERSION,
        backend_name()
    );

    match cli.command {
        Commands::Train {
            data_dir,
            strategy,
            steps,
            batch_size,
            learning_rate,
            weight_decay,
            ema,
            warmup_pos,
            consistency_weight,
            threshold,
            smoothing,
            target_loss,
            labeled_per_class,
            image_size,
            filters,
            repeat,
            scales,
            report_every,
            retune_batches,
            output_dir,
            seed,
        } => {
            let config = TrainConfig {
                total_steps: steps,
                batch_size,
                labeled_per_class,
                report_every,
                seed,
                retune_batches,
                output_dir,
                engine: EngineConfig {
                    strategy,
                    learning_rate,
                    weight_decay,
                    ema_decay: ema,
                    warmup_pos,
                    consistency_weight,
                    confidence_threshold: threshold,
                    label_smoothing: smoothing,
                    target_loss,
                },
                model: ModelConfig {
                    num_classes: 0, // derived from the dataset
                    input_size: image_size,
                    input_channels: 3,
                    base_filters: filters,
                    scales,
                    repeat,
                },
            };

            let outcome = run_training::<TrainingBackend>(
                &config,
                Path::new(&data_dir),
                default_device(),
            )?;

            println!(
                "{} {} steps, ema {}, raw {}",
                "Done:".green().bold(),
                outcome.steps_run,
                outcome.eval_ema,
                outcome.eval_raw
            );
            if outcome.stopped_on_target {
                println!("{}", "Stopped early on target loss.".yellow());
            }
        }

        Commands::Eval {
            run_dir,
            data_dir,
            retune_batches,
        } => {
            let report = run_eval(
                Path::new(&run_dir),
                Path::new(&data_dir),
                retune_batches,
            )?;
            println!("{} {}", "Eval:".green().bold(), report);
        }
    }

    Ok(())
}

/// Reload a saved student and score a dataset with it.
fn run_eval(run_dir: &Path, data_dir: &Path, retune_batches: usize) -> Result<EvalReport> {
    use burn::data::dataloader::batcher::Batcher;
    use burn::module::Module;
    use burn::record::CompactRecorder;
    use burn::tensor::ElementConversion;

    let config = TrainConfig::load(&run_dir.join("config.json"))?;
    let device = default_device();

    let dataset = FolderDataset::scan(data_dir, config.model.input_size)?;
    if dataset.num_classes() != config.model.num_classes {
        anyhow::bail!(
            "dataset has {} classes but the checkpoint was trained with {}",
            dataset.num_classes(),
            config.model.num_classes
        );
    }
    let items = dataset.load_items()?;

    let mut model = ImageClassifier::<DefaultBackend>::new(&config.model, &device);
    model = model
        .load_file(
            run_dir.join("student"),
            &CompactRecorder::new(),
            &device,
        )
        .map_err(|e| anyhow::anyhow!("failed to load model: {:?}", e))?;

    let batcher = LabeledBatcher::<DefaultBackend>::new(device, config.model.input_size);

    // Checkpoints carry weights only; rebuild running statistics from a few
    // training-mode passes before scoring.
    for chunk in items.chunks(config.batch_size).take(retune_batches) {
        let batch = batcher.batch(chunk.to_vec());
        let pass = model.forward(batch.images, Mode::Train);
        model.apply_norm_updates(pass.norm_updates);
    }

    let mut correct = 0usize;
    let mut total = 0usize;
    for chunk in items.chunks(config.batch_size) {
        let batch = batcher.batch(chunk.to_vec());
        let predictions = model.predict(batch.images).argmax(1).squeeze::<1>(1);
        let batch_correct: i64 = predictions
            .equal(batch.targets)
            .int()
            .sum()
            .into_scalar()
            .elem::<i64>();
        correct += batch_correct as usize;
        total += chunk.len();
    }

    info!("scored {} examples from {:?}", total, data_dir);
    Ok(EvalReport::from_counts(correct, total, 0.0, 0))
}
