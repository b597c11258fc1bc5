//! Run configuration
//!
//! Built once from the command line and validated before any data is read.

use std::path::PathBuf;

use serde::Serialize;

use crate::training::{SgdParams, StepLr};
use crate::transforms::TransformSpec;
use crate::utils::{epoch_millis, FinetuneError, Result};

pub const DEFAULT_SEED: i64 = 1299827;
pub const DEFAULT_BATCH_SIZE: usize = 4;
pub const DEFAULT_EPOCHS: usize = 25;
pub const DEFAULT_NUM_WORKERS: usize = 4;
pub const DEFAULT_OPTIMIZER_PARAMS: &str = r#"{"lr": 0.001, "momentum": 0.9}"#;
pub const DEFAULT_SCHEDULER_PARAMS: &str = r#"{"step_size": 7, "gamma": 0.1}"#;

/// Size of the confusion report, in units of 100 pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FigureSize {
    pub width: u32,
    pub height: u32,
}

impl Default for FigureSize {
    fn default() -> Self {
        Self { width: 20, height: 8 }
    }
}

/// Everything one fine-tuning run needs
#[derive(Debug, Clone, Serialize)]
pub struct TrainingConfig {
    /// Requested architecture name (unknown names fall back to inception_v3)
    pub model_type: String,
    /// Root holding `train`, `test` and `valid`
    pub data_dir: PathBuf,
    /// Train only the new classification head(s)
    pub feature_extract: bool,
    /// Start from ImageNet weights
    pub pretrained: bool,
    pub batch_size: usize,
    pub epochs: usize,
    pub optimizer: SgdParams,
    pub scheduler: StepLr,
    /// Decode threads; 0 decodes on the training thread
    pub num_workers: usize,
    /// Resolved, non-negative seed
    pub seed: u64,
    pub output_dir: PathBuf,
    /// Previously saved weights to start from
    pub load_model: Option<PathBuf>,
    /// User transform steps, in command-line order
    pub transforms: Vec<TransformSpec>,
    pub figure: FigureSize,
    /// Pretrained checkpoint cache override
    pub weights_dir: Option<PathBuf>,
}

impl TrainingConfig {
    /// Defaults for everything but the two required values
    pub fn new(model_type: impl Into<String>, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            model_type: model_type.into(),
            data_dir: data_dir.into(),
            feature_extract: false,
            pretrained: true,
            batch_size: DEFAULT_BATCH_SIZE,
            epochs: DEFAULT_EPOCHS,
            optimizer: SgdParams::default(),
            scheduler: StepLr::default(),
            num_workers: DEFAULT_NUM_WORKERS,
            seed: DEFAULT_SEED as u64,
            output_dir: std::env::temp_dir(),
            load_model: None,
            transforms: Vec::new(),
            figure: FigureSize::default(),
            weights_dir: None,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.model_type.trim().is_empty() {
            return Err(FinetuneError::Config("model type must not be empty".into()));
        }
        if self.batch_size == 0 {
            return Err(FinetuneError::Config("batch size must be at least 1".into()));
        }
        if self.figure.width == 0 || self.figure.height == 0 {
            return Err(FinetuneError::Config(format!(
                "figure size must be positive, got {}x{}",
                self.figure.width, self.figure.height
            )));
        }
        self.optimizer.validate()?;
        self.scheduler.validate()?;
        Ok(())
    }
}

/// Negative seeds are replaced by the current time in milliseconds
pub fn resolve_seed(seed: i64) -> u64 {
    if seed < 0 {
        epoch_millis().unsigned_abs()
    } else {
        seed.unsigned_abs()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = TrainingConfig::new("resnet18", "/data");
        assert!(config.validate().is_ok());
        assert_eq!(config.seed, 1299827);
        assert!(config.pretrained);
        assert_eq!(config.figure, FigureSize { width: 20, height: 8 });
        assert_eq!(config.optimizer, SgdParams::from_json(DEFAULT_OPTIMIZER_PARAMS).unwrap());
        assert_eq!(config.scheduler, StepLr::from_json(DEFAULT_SCHEDULER_PARAMS).unwrap());
    }

    #[test]
    fn test_invalid_values() {
        let mut config = TrainingConfig::new("resnet18", "/data");
        config.batch_size = 0;
        assert!(config.validate().is_err());

        let mut config = TrainingConfig::new("resnet18", "/data");
        config.figure.height = 0;
        assert!(config.validate().is_err());

        let config = TrainingConfig::new(" ", "/data");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_resolve_seed() {
        assert_eq!(resolve_seed(7), 7);
        assert_eq!(resolve_seed(0), 0);
        assert!(resolve_seed(-1) > 1_577_836_800_000);
    }

    #[test]
    fn test_serializes_to_json() {
        let config = TrainingConfig::new("alexnet", "/data");
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["model_type"], "alexnet");
        assert_eq!(json["optimizer"]["lr"], 0.001);
        assert_eq!(json["scheduler"]["step_size"], 7);
    }
}
