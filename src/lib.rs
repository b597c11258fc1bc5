//! # vision_finetune
//!
//! Fine-tune ImageNet-pretrained CNN classifiers on image-folder datasets
//! with the Burn framework.
//!
//! A data directory holds `train`, `test` and `valid` splits with one
//! sub-directory per class. The chosen architecture gets a new head sized to
//! the classes found, is trained with SGD and a step learning-rate schedule,
//! and the weights with the best test accuracy are saved together with
//! per-image predictions and metrics for every split.
//!
//! ## Modules
//!
//! - `model`: architecture registry, the CNN families, pretrained import
//! - `transforms`: torchvision-style preprocessing and augmentation
//! - `dataset`: image-folder scanning and batched, seeded loading
//! - `training`: optimizer, scheduler, epoch loop and the run pipeline
//! - `inference`: prediction over whole splits
//! - `artifacts`: file naming and writers for CSV, JSON and SVG outputs
//! - `utils`: logging, metrics, charts and errors
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use vision_finetune::{run, TrainingConfig};
//!
//! let mut config = TrainingConfig::new("resnet18", "data/hymenoptera");
//! config.epochs = 5;
//! let summary = run(&config)?;
//! println!("best test accuracy {}", summary.best_accuracy);
//! ```

pub mod artifacts;
pub mod backend;
pub mod config;
pub mod dataset;
pub mod inference;
pub mod model;
pub mod training;
pub mod transforms;
pub mod utils;

pub use config::TrainingConfig;
pub use dataset::{build_data_loaders, DataLoaders, Phase};
pub use inference::Predictor;
pub use model::{ArchitectureSpec, ImageClassifier, ARCHITECTURES};
pub use training::{run, RunSummary, SgdParams, StepLr};
pub use transforms::{resolve_transforms, TransformSpec};
pub use utils::error::{FinetuneError, Result};
pub use utils::metrics::{ConfusionMatrix, Metrics};

/// Version of the library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
