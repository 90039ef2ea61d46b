//! Step-driven training loop.
//!
//! Feeds the engine labeled/unlabeled batches for the configured number of
//! steps, logs aggregates at the report interval, evaluates the EMA and raw
//! inference paths on the held-out split, honors the engine's target-loss
//! stop signal, optionally retunes normalization statistics afterwards, and
//! saves the student network.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use burn::data::dataloader::batcher::Batcher;
use burn::module::{AutodiffModule, Module};
use burn::record::CompactRecorder;
use burn::tensor::backend::{AutodiffBackend, Backend};
use burn::tensor::ElementConversion;
use chrono::Local;
use colored::Colorize;
use tracing::{info, warn};

use crate::config::TrainConfig;
use crate::dataset::{
    BatchCycler, DatasetSplits, FolderDataset, ImageItem, LabeledBatcher, SplitConfig,
    UnlabeledBatcher,
};
use crate::training::engine::{DistillEngine, StepOutcome};
use crate::utils::metrics::EvalReport;

/// Result of a completed run.
#[derive(Debug, Clone)]
pub struct TrainOutcome {
    pub steps_run: u64,
    pub stopped_on_target: bool,
    /// Final accuracy/loss through the shadow (EMA) parameters
    pub eval_ema: EvalReport,
    /// Final accuracy/loss through the live parameters
    pub eval_raw: EvalReport,
    pub checkpoint: PathBuf,
}

/// Train on an image-folder dataset according to `config`.
pub fn run_training<B: AutodiffBackend>(
    config: &TrainConfig,
    data_dir: &Path,
    device: B::Device,
) -> Result<TrainOutcome> {
    let dataset = FolderDataset::scan(data_dir, config.model.input_size)?;
    let mut model_config = config.model.clone();
    model_config.num_classes = dataset.num_classes();

    let mut config = config.clone();
    config.model = model_config.clone();
    config.validate().map_err(|e| anyhow::anyhow!(e))?;
    let config = &config;

    let items = dataset.load_items()?;
    let splits = DatasetSplits::new(
        items,
        model_config.num_classes,
        &SplitConfig {
            labeled_per_class: config.labeled_per_class,
            test_fraction: 0.1,
            seed: config.seed,
        },
    );
    if splits.labeled.is_empty() || splits.unlabeled.is_empty() {
        bail!("dataset too small for the requested labeled/unlabeled split");
    }

    let labeled_batcher = LabeledBatcher::<B>::new(device.clone(), model_config.input_size);
    let unlabeled_batcher = UnlabeledBatcher::<B>::new(device.clone(), model_config.input_size);
    let inner_device = <B::InnerBackend as Backend>::Device::default();
    let eval_batcher = LabeledBatcher::<B::InnerBackend>::new(inner_device, model_config.input_size);

    let mut labeled_cycler = BatchCycler::new(splits.labeled.len(), config.seed.wrapping_add(1));
    let mut unlabeled_cycler =
        BatchCycler::new(splits.unlabeled.len(), config.seed.wrapping_add(2));

    let mut engine = DistillEngine::<B>::new(
        &model_config,
        config.engine.clone(),
        config.total_steps,
        config.seed.wrapping_add(3),
        &device,
    );

    println!(
        "{} {:?} strategy, {} steps, batch {}",
        "Training:".green().bold(),
        config.engine.strategy,
        config.total_steps,
        config.batch_size
    );

    let mut stopped_on_target = false;
    let mut window_supervised = 0.0;
    let mut window_consistency = 0.0;
    let mut window_steps = 0u64;

    while engine.global_step() < config.total_steps {
        let labeled_items: Vec<ImageItem> = labeled_cycler
            .next_indices(config.batch_size)
            .into_iter()
            .map(|i| splits.labeled[i].clone())
            .collect();
        let unlabeled_items = unlabeled_cycler
            .next_indices(config.batch_size)
            .into_iter()
            .map(|i| splits.unlabeled[i].clone())
            .collect();

        let labeled_batch = labeled_batcher.batch(labeled_items);
        let unlabeled_batch = unlabeled_batcher.batch(unlabeled_items);

        let report = engine.train_step(&labeled_batch, &unlabeled_batch);
        window_supervised += report.supervised_loss;
        window_consistency += report.consistency_loss;
        window_steps += 1;

        if report.outcome == StepOutcome::TargetReached {
            warn!(
                "target loss reached at step {} (loss = {:.4}); stopping",
                report.step, report.total_loss
            );
            stopped_on_target = true;
            break;
        }

        if engine.global_step() % config.report_every == 0 {
            let eval = evaluate(&engine, &splits.test, &eval_batcher, config.batch_size, true);
            info!(
                "step {}: xe = {:.4}, pl = {:.4}, warmup = {:.2}, confident = {:.1}%, ema {}",
                report.step,
                window_supervised / window_steps as f64,
                window_consistency / window_steps as f64,
                report.warmup,
                report.confident_fraction * 100.0,
                eval
            );
            window_supervised = 0.0;
            window_consistency = 0.0;
            window_steps = 0;
        }
    }

    if config.retune_batches > 0 {
        info!(
            "retuning normalization statistics on {} labeled batches",
            config.retune_batches
        );
        for _ in 0..config.retune_batches {
            let items: Vec<ImageItem> = labeled_cycler
                .next_indices(config.batch_size)
                .into_iter()
                .map(|i| splits.labeled[i].clone())
                .collect();
            engine.retune_norm(&labeled_batcher.batch(items));
        }
    }

    let eval_ema = evaluate(&engine, &splits.test, &eval_batcher, config.batch_size, true);
    let eval_raw = evaluate(&engine, &splits.test, &eval_batcher, config.batch_size, false);
    info!("final ema:  {}", eval_ema);
    info!("final raw:  {}", eval_raw);

    let checkpoint = save_run(config, &engine)?;

    Ok(TrainOutcome {
        steps_run: engine.global_step(),
        stopped_on_target,
        eval_ema,
        eval_raw,
        checkpoint,
    })
}

/// Score the test split through the EMA or the raw inference path.
pub fn evaluate<B: AutodiffBackend>(
    engine: &DistillEngine<B>,
    test: &[ImageItem],
    batcher: &LabeledBatcher<B::InnerBackend>,
    batch_size: usize,
    use_ema: bool,
) -> EvalReport {
    let mut correct = 0usize;
    let mut total = 0usize;
    let mut loss_sum = 0.0;
    let mut batches = 0usize;

    for chunk in test.chunks(batch_size) {
        let batch = batcher.batch(chunk.to_vec());
        let probs = if use_ema {
            engine.classify(batch.images)
        } else {
            engine.classify_raw(batch.images)
        };

        let nll = probs
            .clone()
            .clamp_min(1e-9)
            .log()
            .gather(1, batch.targets.clone().reshape([chunk.len(), 1]))
            .neg()
            .mean();
        let loss: f64 = nll.into_scalar().elem();
        loss_sum += loss;
        batches += 1;

        let predictions = probs.argmax(1).squeeze::<1>(1);
        let batch_correct: i64 = predictions
            .equal(batch.targets)
            .int()
            .sum()
            .into_scalar()
            .elem();
        correct += batch_correct as usize;
        total += chunk.len();
    }

    EvalReport::from_counts(correct, total, loss_sum, batches)
}

/// Write the run manifest and the student weights.
fn save_run<B: AutodiffBackend>(
    config: &TrainConfig,
    engine: &DistillEngine<B>,
) -> Result<PathBuf> {
    let run_dir = Path::new(&config.output_dir)
        .join(format!("run-{}", Local::now().format("%Y%m%d-%H%M%S")));
    std::fs::create_dir_all(&run_dir)
        .with_context(|| format!("failed to create run directory {:?}", run_dir))?;

    config.save(&run_dir.join("config.json"))?;

    let model_path = run_dir.join("student");
    engine
        .student()
        .clone()
        .valid()
        .save_file(model_path, &CompactRecorder::new())
        .map_err(|e| anyhow::anyhow!("failed to save model: {:?}", e))?;

    info!("checkpoint saved to {:?}", run_dir);
    Ok(run_dir)
}
