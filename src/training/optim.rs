//! SGD hyperparameters, parsed from `--optimizer_params`

use burn::optim::{decay::WeightDecayConfig, momentum::MomentumConfig, SgdConfig};
use serde::{Deserialize, Serialize};

use crate::utils::{FinetuneError, Result};

/// Parameters of stochastic gradient descent, named as in `torch.optim.SGD`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SgdParams {
    pub lr: f64,
    #[serde(default)]
    pub momentum: f64,
    #[serde(default)]
    pub dampening: f64,
    #[serde(default)]
    pub weight_decay: f64,
    #[serde(default)]
    pub nesterov: bool,
}

impl Default for SgdParams {
    fn default() -> Self {
        Self {
            lr: 0.001,
            momentum: 0.9,
            dampening: 0.0,
            weight_decay: 0.0,
            nesterov: false,
        }
    }
}

impl SgdParams {
    /// Parse the JSON object given on the command line
    pub fn from_json(json: &str) -> Result<Self> {
        let params: Self = serde_json::from_str(json)
            .map_err(|e| FinetuneError::Config(format!("invalid optimizer parameters {}: {}", json, e)))?;
        params.validate()?;
        Ok(params)
    }

    pub fn validate(&self) -> Result<()> {
        let non_negative = [
            ("lr", self.lr),
            ("momentum", self.momentum),
            ("dampening", self.dampening),
            ("weight_decay", self.weight_decay),
        ];
        for (name, value) in non_negative {
            if !(value.is_finite() && value >= 0.0) {
                return Err(FinetuneError::Config(format!(
                    "optimizer {} must be a non-negative number, got {}",
                    name, value
                )));
            }
        }
        if self.nesterov && (self.momentum <= 0.0 || self.dampening != 0.0) {
            return Err(FinetuneError::Config(
                "nesterov momentum requires a positive momentum and zero dampening".into(),
            ));
        }
        Ok(())
    }

    /// Burn optimizer configuration; the learning rate is passed per step
    pub fn to_config(&self) -> SgdConfig {
        let momentum = (self.momentum > 0.0).then(|| {
            MomentumConfig::new()
                .with_momentum(self.momentum)
                .with_dampening(self.dampening)
                .with_nesterov(self.nesterov)
        });
        let weight_decay = (self.weight_decay > 0.0).then(|| WeightDecayConfig::new(self.weight_decay as f32));

        SgdConfig::new()
            .with_momentum(momentum)
            .with_weight_decay(weight_decay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_for_missing_fields() {
        let params = SgdParams::from_json(r#"{"lr": 0.01}"#).unwrap();
        assert_eq!(params.momentum, 0.0);
        assert!(!params.nesterov);
        assert!(params.to_config().momentum.is_none());
    }

    #[test]
    fn test_full_parameters() {
        let params = SgdParams::from_json(
            r#"{"lr": 0.1, "momentum": 0.9, "dampening": 0, "weight_decay": 0.0001, "nesterov": true}"#,
        )
        .unwrap();
        let config = params.to_config();
        let momentum = config.momentum.unwrap();
        assert_eq!(momentum.momentum, 0.9);
        assert!(momentum.nesterov);
        assert!(config.weight_decay.is_some());
    }

    #[test]
    fn test_rejects_invalid() {
        assert!(SgdParams::from_json(r#"{"momentum": 0.9}"#).is_err());
        assert!(SgdParams::from_json(r#"{"lr": -0.1}"#).is_err());
        assert!(SgdParams::from_json(r#"{"lr": 0.1, "betas": [0.9, 0.99]}"#).is_err());
        assert!(SgdParams::from_json(r#"{"lr": 0.1, "nesterov": true}"#).is_err());
        assert!(SgdParams::from_json("{lr: 0.1}").is_err());
    }
}
