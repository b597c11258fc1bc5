//! User-supplied transform steps
//!
//! A step arrives on the command line as five values:
//! `PHASE KIND NAME ORDER PARAMS`, for example
//! `train RandomResizedCrop crop 0 '{"size": 224}'`.

use std::fmt;
use std::str::FromStr;

use serde::Serialize;

use crate::dataset::Phase;
use crate::utils::{FinetuneError, Result};

/// Order value that keeps a step out of the top-level pipeline while leaving
/// it addressable by name from composite steps
pub const EXCLUDED_ORDER: i64 = -1;

/// Kinds that exist in torchvision but cannot be expressed as a single-image
/// pipeline step here
const UNSUPPORTED_KINDS: &[&str] = &[
    "FiveCrop",
    "TenCrop",
    "RandomAffine",
    "RandomPerspective",
    "Lambda",
    "LinearTransformation",
    "ToPILImage",
    "PILToTensor",
    "ConvertImageDtype",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum TransformKind {
    Resize,
    CenterCrop,
    RandomCrop,
    RandomResizedCrop,
    RandomHorizontalFlip,
    RandomVerticalFlip,
    RandomRotation,
    ColorJitter,
    Grayscale,
    RandomGrayscale,
    Pad,
    GaussianBlur,
    ToTensor,
    Normalize,
    RandomErasing,
    Compose,
    RandomApply,
    RandomChoice,
    RandomOrder,
}

impl TransformKind {
    pub const ALL: [TransformKind; 19] = [
        TransformKind::Resize,
        TransformKind::CenterCrop,
        TransformKind::RandomCrop,
        TransformKind::RandomResizedCrop,
        TransformKind::RandomHorizontalFlip,
        TransformKind::RandomVerticalFlip,
        TransformKind::RandomRotation,
        TransformKind::ColorJitter,
        TransformKind::Grayscale,
        TransformKind::RandomGrayscale,
        TransformKind::Pad,
        TransformKind::GaussianBlur,
        TransformKind::ToTensor,
        TransformKind::Normalize,
        TransformKind::RandomErasing,
        TransformKind::Compose,
        TransformKind::RandomApply,
        TransformKind::RandomChoice,
        TransformKind::RandomOrder,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TransformKind::Resize => "Resize",
            TransformKind::CenterCrop => "CenterCrop",
            TransformKind::RandomCrop => "RandomCrop",
            TransformKind::RandomResizedCrop => "RandomResizedCrop",
            TransformKind::RandomHorizontalFlip => "RandomHorizontalFlip",
            TransformKind::RandomVerticalFlip => "RandomVerticalFlip",
            TransformKind::RandomRotation => "RandomRotation",
            TransformKind::ColorJitter => "ColorJitter",
            TransformKind::Grayscale => "Grayscale",
            TransformKind::RandomGrayscale => "RandomGrayscale",
            TransformKind::Pad => "Pad",
            TransformKind::GaussianBlur => "GaussianBlur",
            TransformKind::ToTensor => "ToTensor",
            TransformKind::Normalize => "Normalize",
            TransformKind::RandomErasing => "RandomErasing",
            TransformKind::Compose => "Compose",
            TransformKind::RandomApply => "RandomApply",
            TransformKind::RandomChoice => "RandomChoice",
            TransformKind::RandomOrder => "RandomOrder",
        }
    }
}

impl fmt::Display for TransformKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransformKind {
    type Err = FinetuneError;

    fn from_str(s: &str) -> Result<Self> {
        if let Some(kind) = TransformKind::ALL.iter().find(|k| k.as_str() == s) {
            return Ok(*kind);
        }
        if UNSUPPORTED_KINDS.contains(&s) {
            return Err(FinetuneError::Transform(format!(
                "transform kind '{}' is not supported",
                s
            )));
        }
        let known: Vec<&str> = TransformKind::ALL.iter().map(|k| k.as_str()).collect();
        Err(FinetuneError::Transform(format!(
            "unknown transform kind '{}', expected one of: {}",
            s,
            known.join(", ")
        )))
    }
}

/// One parsed `-t` step
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransformSpec {
    pub phase: Phase,
    pub kind: TransformKind,
    pub name: String,
    pub order: i64,
    pub params: serde_json::Value,
}

impl TransformSpec {
    /// Parse the five raw command-line values of one step
    pub fn parse(values: &[String]) -> Result<Self> {
        let [phase, kind, name, order, params] = values else {
            return Err(FinetuneError::Transform(format!(
                "a transform needs 5 values (phase kind name order params), got {}",
                values.len()
            )));
        };

        let phase: Phase = phase.parse()?;
        let kind: TransformKind = kind.parse()?;

        if name.is_empty() {
            return Err(FinetuneError::Transform("transform name must not be empty".into()));
        }

        let order: i64 = order.trim().parse().map_err(|_| {
            FinetuneError::Transform(format!(
                "transform '{}': order '{}' is not an integer",
                name, order
            ))
        })?;
        if order < EXCLUDED_ORDER {
            return Err(FinetuneError::Transform(format!(
                "transform '{}': order must be >= -1, got {}",
                name, order
            )));
        }

        let params: serde_json::Value = if params.trim().is_empty() {
            serde_json::Value::Object(Default::default())
        } else {
            serde_json::from_str(params).map_err(|e| {
                FinetuneError::Transform(format!(
                    "transform '{}': parameters are not valid JSON: {}",
                    name, e
                ))
            })?
        };
        if !params.is_object() {
            return Err(FinetuneError::Transform(format!(
                "transform '{}': parameters must be a JSON object",
                name
            )));
        }

        Ok(Self {
            phase,
            kind,
            name: name.clone(),
            order,
            params,
        })
    }

    /// Parse a flat list of values in groups of five
    pub fn parse_all(values: &[String]) -> Result<Vec<Self>> {
        if values.len() % 5 != 0 {
            return Err(FinetuneError::Transform(format!(
                "transform values must come in groups of 5, got {}",
                values.len()
            )));
        }
        values.chunks(5).map(Self::parse).collect()
    }

    pub fn is_excluded(&self) -> bool {
        self.order == EXCLUDED_ORDER
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_step() {
        let spec = TransformSpec::parse(&strings(&["train", "Resize", "r", "0", r#"{"size": 64}"#])).unwrap();
        assert_eq!(spec.phase, Phase::Train);
        assert_eq!(spec.kind, TransformKind::Resize);
        assert_eq!(spec.order, 0);
        assert_eq!(spec.params["size"], 64);
    }

    #[test]
    fn test_excluded_order() {
        let spec = TransformSpec::parse(&strings(&["test", "ColorJitter", "cj", "-1", "{}"])).unwrap();
        assert!(spec.is_excluded());
        assert!(TransformSpec::parse(&strings(&["test", "ColorJitter", "cj", "-2", "{}"])).is_err());
    }

    #[test]
    fn test_unknown_kind_is_descriptive() {
        let err = TransformSpec::parse(&strings(&["train", "Sharpen", "s", "0", "{}"])).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("Sharpen"));
        assert!(msg.contains("RandomResizedCrop"));
    }

    #[test]
    fn test_unsupported_kind() {
        let err = TransformSpec::parse(&strings(&["train", "FiveCrop", "f", "0", "{}"])).unwrap_err();
        assert!(err.to_string().contains("not supported"));
    }

    #[test]
    fn test_bad_json_and_order() {
        assert!(TransformSpec::parse(&strings(&["train", "Resize", "r", "0", "{size"])).is_err());
        assert!(TransformSpec::parse(&strings(&["train", "Resize", "r", "first", "{}"])).is_err());
        assert!(TransformSpec::parse(&strings(&["train", "Resize", "r", "0", "[1]"])).is_err());
        assert!(TransformSpec::parse(&strings(&["training", "Resize", "r", "0", "{}"])).is_err());
    }

    #[test]
    fn test_parse_all_groups_of_five() {
        let values = strings(&[
            "train", "Resize", "a", "0", r#"{"size": 8}"#,
            "valid", "ToTensor", "b", "1", "{}",
        ]);
        let specs = TransformSpec::parse_all(&values).unwrap();
        assert_eq!(specs.len(), 2);
        assert_eq!(specs[1].phase, Phase::Valid);

        assert!(TransformSpec::parse_all(&values[..7]).is_err());
    }
}
