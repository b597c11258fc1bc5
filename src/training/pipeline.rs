//! One complete fine-tuning run
//!
//! Configuration is checked and transforms resolved before the data
//! directory is read. The architecture is then dispatched to a concrete
//! module type and trained; the best snapshot is saved, run over every split,
//! and reported.

use std::path::PathBuf;
use std::time::Instant;

use anyhow::Context;
use burn::module::AutodiffModule;
use burn::tensor::backend::AutodiffBackend;
use colored::Colorize;
use tracing::{info, warn};

use super::trainer::{train_model, TrainerConfig};
use crate::artifacts::{
    save_history_svg, save_metrics_json, save_predictions_csv, save_report_svg, PhaseReport, RunPaths,
    RunReport,
};
use crate::backend::{backend_name, default_device, TrainingBackend};
use crate::config::TrainingConfig;
use crate::dataset::{build_data_loaders, DataLoaders};
use crate::inference::Predictor;
use crate::model::factory::save_model;
use crate::model::registry::resolve;
use crate::model::{get_model, with_architecture, Architecture, ArchitectureSpec, ImageClassifier, ModelOptions};
use crate::transforms::resolve_transforms;
use crate::utils::{epoch_millis, format_duration};

/// Where a run left its results
#[derive(Debug, Clone)]
pub struct RunSummary {
    /// Architecture that was actually trained
    pub model_type: String,
    pub timestamp_ms: i64,
    pub weights: PathBuf,
    pub predictions: PathBuf,
    pub metrics: PathBuf,
    pub report: PathBuf,
    pub history: PathBuf,
    pub best_accuracy: f64,
    pub best_epoch: Option<usize>,
}

/// Train, save and report one model on the default backend
pub fn run(config: &TrainingConfig) -> anyhow::Result<RunSummary> {
    config.validate().context("invalid configuration")?;

    let spec = resolve(&config.model_type);
    let transforms =
        resolve_transforms(&config.transforms, spec.input_size).context("invalid transform configuration")?;

    let loaders = build_data_loaders(
        &config.data_dir,
        &transforms,
        config.batch_size,
        config.num_workers,
        config.seed,
    )
    .with_context(|| format!("cannot load images from {}", config.data_dir.display()))?;

    let timestamp_ms = epoch_millis();
    let paths = RunPaths::new(&config.output_dir, timestamp_ms, spec.name);
    paths
        .ensure_dir()
        .with_context(|| format!("cannot create {}", config.output_dir.display()))?;

    info!(
        "Fine-tuning {} on {} ({} classes, seed {}, backend {})",
        spec.name,
        config.data_dir.display(),
        loaders.num_classes(),
        config.seed,
        backend_name()
    );

    let device = default_device();
    with_architecture!(
        spec.family,
        TrainingBackend,
        run_with(config, spec, &loaders, &paths, &device)
    )
}

fn run_with<B, M>(
    config: &TrainingConfig,
    spec: &ArchitectureSpec,
    loaders: &DataLoaders,
    paths: &RunPaths,
    device: &B::Device,
) -> anyhow::Result<RunSummary>
where
    B: AutodiffBackend,
    M: Architecture<B> + AutodiffModule<B>,
    M::InnerModule: ImageClassifier<B::InnerBackend>,
{
    let start = Instant::now();
    B::seed(device, config.seed);

    let options = ModelOptions {
        num_classes: loaders.num_classes(),
        feature_extract: config.feature_extract,
        pretrained: config.pretrained,
        weights_dir: config.weights_dir.clone(),
    };
    let model = get_model::<B, M>(spec, &options, config.load_model.as_deref(), device)
        .with_context(|| format!("cannot build {}", spec.name))?;

    let trainer_config = TrainerConfig {
        epochs: config.epochs,
        optimizer: config.optimizer,
        scheduler: config.scheduler,
        feature_extract: config.feature_extract,
    };
    let outcome = train_model::<B, M>(model, loaders, &trainer_config, device).context("training failed")?;
    if outcome.best_epoch.is_none() {
        warn!("No epoch improved on the initial weights; saving those");
    }

    let weights = save_model::<B, M>(&outcome.model, &paths.weights_base())?;
    info!("Saved weights to {}", weights.display());

    let best = outcome.model.valid();
    let phases = Predictor::<B::InnerBackend, _>::new(&best, device.clone(), config.epochs)
        .predict_all(loaders)
        .context("prediction failed")?;

    save_predictions_csv(&paths.predictions(), &phases, loaders.num_classes())?;
    info!("Saved predictions to {}", paths.predictions().display());

    let reports: Vec<PhaseReport> = phases
        .iter()
        .map(|p| PhaseReport::from_predictions(p, &loaders.class_names))
        .collect();
    for report in &reports {
        info!("{}: {}", report.phase, report.metrics.summary());
    }

    let run_report = RunReport {
        model_type: spec.name.to_string(),
        timestamp_ms: paths.timestamp_ms(),
        class_names: loaders.class_names.clone(),
        best_test_accuracy: outcome.best_accuracy,
        best_epoch: outcome.best_epoch,
        elapsed_secs: outcome.elapsed.as_secs_f64(),
        history: outcome.history,
        phases: reports,
    };
    save_metrics_json(&paths.metrics(), &run_report)?;

    let title = format!("{} fine-tuned on {}", spec.name, config.data_dir.display());
    save_report_svg(
        &paths.report(),
        &title,
        &run_report.phases,
        &loaders.class_names,
        (config.figure.width, config.figure.height),
    )?;
    save_history_svg(&paths.history(), &title, &run_report.history)?;

    println!(
        "{} {} best test accuracy {:.2}% in {}",
        "Done:".green().bold(),
        spec.name,
        outcome.best_accuracy * 100.0,
        format_duration(start.elapsed().as_secs_f64())
    );
    println!("  {}", paths.dir().join(paths.stem()).display());

    Ok(RunSummary {
        model_type: spec.name.to_string(),
        timestamp_ms: run_report.timestamp_ms,
        weights,
        predictions: paths.predictions(),
        metrics: paths.metrics(),
        report: paths.report(),
        history: paths.history(),
        best_accuracy: outcome.best_accuracy,
        best_epoch: outcome.best_epoch,
    })
}
