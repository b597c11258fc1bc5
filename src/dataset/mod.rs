//! Image-folder dataset handling
//!
//! - `loader`: scans `{root}/{phase}/{class}/*` into labelled samples
//! - `burn_dataset`: Burn `Dataset` and `Batcher` implementations
//! - `dataloader`: seeded, parallel per-phase batch loading

pub mod burn_dataset;
pub mod dataloader;
pub mod loader;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub use burn_dataset::{ImageBatch, ImageFolderBatcher, ImageItem};
pub use dataloader::{build_data_loaders, DataLoaders, PhaseLoader};
pub use loader::{DatasetSplits, ImageFolder, ImageSample};

use crate::utils::FinetuneError;

/// A dataset split
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Train,
    Test,
    Valid,
}

impl Phase {
    pub const ALL: [Phase; 3] = [Phase::Train, Phase::Test, Phase::Valid];

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Train => "train",
            Phase::Test => "test",
            Phase::Valid => "valid",
        }
    }

    /// Train and test are reshuffled each epoch; valid keeps on-disk order
    pub fn shuffles(&self) -> bool {
        !matches!(self, Phase::Valid)
    }

    /// Stable per-phase salt for seed derivation
    pub(crate) fn salt(&self) -> u64 {
        match self {
            Phase::Train => 1,
            Phase::Test => 2,
            Phase::Valid => 3,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Phase {
    type Err = FinetuneError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "train" => Ok(Phase::Train),
            "test" => Ok(Phase::Test),
            "valid" => Ok(Phase::Valid),
            other => Err(FinetuneError::Transform(format!(
                "unknown phase '{}', expected one of train, test, valid",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_round_trip() {
        for phase in Phase::ALL {
            assert_eq!(phase.as_str().parse::<Phase>().unwrap(), phase);
        }
        assert!("validation".parse::<Phase>().is_err());
    }

    #[test]
    fn test_shuffle_policy() {
        assert!(Phase::Train.shuffles());
        assert!(Phase::Test.shuffles());
        assert!(!Phase::Valid.shuffles());
    }
}
