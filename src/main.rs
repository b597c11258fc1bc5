//! vision-finetune CLI
//!
//! Fine-tunes one pretrained architecture on a `train`/`test`/`valid` image
//! folder and writes weights, predictions and metrics to the output directory.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use colored::Colorize;
use tracing::{debug, info};

use vision_finetune::backend::backend_name;
use vision_finetune::config::{
    resolve_seed, FigureSize, TrainingConfig, DEFAULT_OPTIMIZER_PARAMS, DEFAULT_SCHEDULER_PARAMS,
};
use vision_finetune::model::registry::names;
use vision_finetune::training::{run, SgdParams, StepLr};
use vision_finetune::transforms::TransformSpec;
use vision_finetune::utils::logging::{init_logging, LogConfig};

/// Fine-tune a pretrained CNN on an image-folder dataset
#[derive(Parser, Debug)]
#[command(name = "vision-finetune")]
#[command(version)]
#[command(about = "Fine-tune pretrained CNN image classifiers with Burn", long_about = None)]
struct Cli {
    /// Architecture to fine-tune (unknown names fall back to inception_v3)
    #[arg(short = 'm', long = "model_type")]
    model_type: String,

    /// Directory holding train, test and valid splits
    #[arg(short = 'd', long = "data_dir")]
    data_dir: PathBuf,

    /// Only train the new classification head
    #[arg(short = 'f', long = "feature_extract")]
    feature_extract: bool,

    /// Start from random weights instead of ImageNet weights
    #[arg(short = 'p', long = "no_pretrained", action = ArgAction::SetFalse)]
    pretrained: bool,

    /// Images per batch
    #[arg(short = 'b', long = "batch_size", default_value = "4")]
    batch_size: usize,

    /// Number of training epochs
    #[arg(short = 'e', long = "epochs", default_value = "25")]
    epochs: usize,

    /// Image decode threads (0 decodes on the training thread)
    #[arg(short = 'w', long = "num_workers", default_value = "4")]
    num_workers: usize,

    /// Random seed; negative values use the current time
    #[arg(short = 's', long = "seed", default_value = "1299827", allow_negative_numbers = true)]
    seed: i64,

    /// Where the run's files are written [default: system temp dir]
    #[arg(short = 'o', long = "output_dir")]
    output_dir: Option<PathBuf>,

    /// Weights saved by an earlier run to start from
    #[arg(short = 'l', long = "load_model")]
    load_model: Option<PathBuf>,

    /// Transform step: PHASE KIND NAME ORDER PARAMS (repeatable)
    #[arg(
        short = 't',
        long = "transform",
        num_args = 5,
        value_names = ["PHASE", "KIND", "NAME", "ORDER", "PARAMS"],
        allow_hyphen_values = true,
        action = ArgAction::Append
    )]
    transform: Vec<String>,

    /// SGD parameters as JSON
    #[arg(long = "optimizer_params", default_value = DEFAULT_OPTIMIZER_PARAMS)]
    optimizer_params: String,

    /// StepLR parameters as JSON
    #[arg(long = "scheduler_params", default_value = DEFAULT_SCHEDULER_PARAMS)]
    scheduler_params: String,

    /// Report width in hundreds of pixels
    #[arg(long = "figure_width", default_value = "20")]
    figure_width: u32,

    /// Report height in hundreds of pixels
    #[arg(long = "figure_height", default_value = "8")]
    figure_height: u32,

    /// Cache directory for pretrained checkpoints
    #[arg(long = "weights_dir")]
    weights_dir: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, default_value = "false")]
    verbose: bool,

    /// Only log errors
    #[arg(short, long, default_value = "false", conflicts_with = "verbose")]
    quiet: bool,
}

impl Cli {
    fn into_config(self) -> Result<TrainingConfig> {
        let optimizer = SgdParams::from_json(&self.optimizer_params)?;
        let scheduler = StepLr::from_json(&self.scheduler_params)?;
        let transforms = TransformSpec::parse_all(&self.transform)?;

        let config = TrainingConfig {
            model_type: self.model_type,
            data_dir: self.data_dir,
            feature_extract: self.feature_extract,
            pretrained: self.pretrained,
            batch_size: self.batch_size,
            epochs: self.epochs,
            optimizer,
            scheduler,
            num_workers: self.num_workers,
            seed: resolve_seed(self.seed),
            output_dir: self.output_dir.unwrap_or_else(std::env::temp_dir),
            load_model: self.load_model,
            transforms,
            figure: FigureSize {
                width: self.figure_width,
                height: self.figure_height,
            },
            weights_dir: self.weights_dir,
        };
        config.validate()?;
        Ok(config)
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_config = if cli.verbose {
        LogConfig::verbose()
    } else if cli.quiet {
        LogConfig::quiet()
    } else {
        LogConfig::default()
    };
    let _ = init_logging(&log_config);

    print_banner();

    let config = cli.into_config().context("invalid arguments")?;
    debug!("Supported architectures: {}", names().join(", "));
    info!("Backend: {}", backend_name());
    if let Ok(json) = serde_json::to_string(&config) {
        debug!("Configuration: {}", json);
    }

    let summary = run(&config)?;

    println!();
    println!("{}", "Artifacts:".cyan().bold());
    for path in [
        &summary.weights,
        &summary.predictions,
        &summary.metrics,
        &summary.report,
        &summary.history,
    ] {
        println!("  {}", path.display());
    }

    Ok(())
}

fn print_banner() {
    println!(
        "{}",
        r#"
 +--------------------------------------------------+
 |   vision-finetune                                |
 |   Pretrained CNN fine-tuning with Burn + Rust    |
 +--------------------------------------------------+
  "#
        .green()
    );
}
