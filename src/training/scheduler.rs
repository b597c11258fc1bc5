//! Learning Rate Scheduler Module
//!
//! Step decay, stepped once per epoch: `lr = lr0 * gamma^(epoch / step_size)`.

use serde::{Deserialize, Serialize};

use crate::utils::{FinetuneError, Result};

/// Step decay schedule, parsed from `--scheduler_params`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StepLr {
    /// Epochs between two decays
    pub step_size: usize,
    /// Multiplicative decay factor
    #[serde(default = "default_gamma")]
    pub gamma: f64,
}

fn default_gamma() -> f64 {
    0.1
}

impl Default for StepLr {
    fn default() -> Self {
        Self {
            step_size: 7,
            gamma: default_gamma(),
        }
    }
}

impl StepLr {
    /// Parse the JSON object given on the command line
    pub fn from_json(json: &str) -> Result<Self> {
        let scheduler: Self = serde_json::from_str(json)
            .map_err(|e| FinetuneError::Config(format!("invalid scheduler parameters {}: {}", json, e)))?;
        scheduler.validate()?;
        Ok(scheduler)
    }

    pub fn validate(&self) -> Result<()> {
        if self.step_size == 0 {
            return Err(FinetuneError::Config("scheduler step_size must be at least 1".into()));
        }
        if !(self.gamma.is_finite() && self.gamma > 0.0) {
            return Err(FinetuneError::Config(format!(
                "scheduler gamma must be positive, got {}",
                self.gamma
            )));
        }
        Ok(())
    }

    /// Learning rate in effect during `epoch` (0-based)
    pub fn get_lr(&self, initial_lr: f64, epoch: usize) -> f64 {
        let decays = epoch / self.step_size.max(1);
        initial_lr * self.gamma.powi(decays as i32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_decay() {
        let scheduler = StepLr::default();
        assert!((scheduler.get_lr(0.001, 0) - 0.001).abs() < 1e-12);
        assert!((scheduler.get_lr(0.001, 6) - 0.001).abs() < 1e-12);
        assert!((scheduler.get_lr(0.001, 7) - 0.0001).abs() < 1e-12);
        assert!((scheduler.get_lr(0.001, 14) - 0.00001).abs() < 1e-12);
    }

    #[test]
    fn test_from_json() {
        let scheduler = StepLr::from_json(r#"{"step_size": 3, "gamma": 0.5}"#).unwrap();
        assert_eq!(scheduler, StepLr { step_size: 3, gamma: 0.5 });
        assert!((scheduler.get_lr(1.0, 7) - 0.25).abs() < 1e-12);
    }

    #[test]
    fn test_rejects_bad_parameters() {
        assert!(StepLr::from_json(r#"{"step_size": 0}"#).is_err());
        assert!(StepLr::from_json(r#"{"step_size": 7, "gamma": -1}"#).is_err());
        assert!(StepLr::from_json(r#"{"step_size": 7, "last_epoch": 2}"#).is_err());
        assert!(StepLr::from_json(r#"{"gamma": 0.1}"#).is_err());
        assert!(StepLr::from_json("7").is_err());
    }
}
