//! Inference Predictor Module
//!
//! Batched, un-shuffled prediction over image-folder splits.

use std::path::PathBuf;
use std::time::Instant;

use burn::tensor::{activation::softmax, backend::Backend};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::dataset::{DataLoaders, Phase, PhaseLoader};
use crate::model::ImageClassifier;
use crate::utils::metrics::Metrics;
use crate::utils::{FinetuneError, Result};

/// Prediction for one image
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Prediction {
    pub phase: Phase,
    /// Position of the image in its split
    pub index: usize,
    pub path: PathBuf,
    pub y_true: usize,
    pub y_pred: usize,
    /// Softmax over all classes
    pub probabilities: Vec<f32>,
}

impl Prediction {
    fn new(phase: Phase, index: usize, path: PathBuf, y_true: usize, probabilities: Vec<f32>) -> Self {
        let y_pred = probabilities
            .iter()
            .enumerate()
            .max_by(|(_, a), (_, b)| a.total_cmp(b))
            .map(|(class, _)| class)
            .unwrap_or(0);
        Self {
            phase,
            index,
            path,
            y_true,
            y_pred,
            probabilities,
        }
    }

    /// Probability of the predicted class
    pub fn confidence(&self) -> f32 {
        self.probabilities.get(self.y_pred).copied().unwrap_or(0.0)
    }

    pub fn is_correct(&self) -> bool {
        self.y_true == self.y_pred
    }
}

/// All predictions of one split, in on-disk order
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhasePredictions {
    pub phase: Phase,
    pub predictions: Vec<Prediction>,
}

impl PhasePredictions {
    pub fn y_true(&self) -> Vec<usize> {
        self.predictions.iter().map(|p| p.y_true).collect()
    }

    pub fn y_pred(&self) -> Vec<usize> {
        self.predictions.iter().map(|p| p.y_pred).collect()
    }

    pub fn metrics(&self, class_names: &[String]) -> Metrics {
        let probabilities: Vec<Vec<f32>> = self.predictions.iter().map(|p| p.probabilities.clone()).collect();
        Metrics::from_predictions_with_probs(&self.y_pred(), &probabilities, &self.y_true(), class_names)
    }
}

/// Runs a model over whole splits
pub struct Predictor<'a, B: Backend, M: ImageClassifier<B>> {
    model: &'a M,
    device: B::Device,
    /// Epoch index handed to the transform pipeline
    epoch: usize,
}

impl<'a, B: Backend, M: ImageClassifier<B>> Predictor<'a, B, M> {
    pub fn new(model: &'a M, device: B::Device, epoch: usize) -> Self {
        Self { model, device, epoch }
    }

    /// Predict every image of one split
    pub fn predict_phase(&self, loader: &PhaseLoader) -> Result<PhasePredictions> {
        let start = Instant::now();
        let phase = loader.phase();
        let mut predictions = Vec::with_capacity(loader.len());

        for indices in loader.ordered_batches() {
            let batch = loader.load_batch::<B>(&indices, self.epoch, &self.device)?;
            let batch_len = indices.len();
            let num_classes = self.model.num_classes();

            let probabilities: Vec<f32> = softmax(self.model.forward(batch.images), 1)
                .into_data()
                .convert::<f32>()
                .to_vec()
                .map_err(|e| FinetuneError::Training(format!("cannot read probabilities: {:?}", e)))?;
            if probabilities.len() != batch_len * num_classes {
                return Err(FinetuneError::Training(format!(
                    "expected {} x {} probabilities, got {}",
                    batch_len,
                    num_classes,
                    probabilities.len()
                )));
            }

            for (row, &index) in probabilities.chunks(num_classes).zip(&batch.indices) {
                let sample = &loader.samples()[index];
                predictions.push(Prediction::new(
                    phase,
                    index,
                    sample.path.clone(),
                    sample.label,
                    row.to_vec(),
                ));
            }
        }

        info!(
            "Predicted {} {} images in {:.2}s",
            predictions.len(),
            phase,
            start.elapsed().as_secs_f64()
        );
        Ok(PhasePredictions { phase, predictions })
    }

    /// Predict train, test and valid
    pub fn predict_all(&self, loaders: &DataLoaders) -> Result<Vec<PhasePredictions>> {
        Phase::ALL
            .iter()
            .map(|&phase| self.predict_phase(loaders.get(phase)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::build_data_loaders;
    use crate::dataset::loader::tests::write_image_folder;
    use crate::model::registry::lookup;
    use crate::model::squeezenet::SqueezeNet;
    use crate::model::{create_model, ModelOptions};
    use crate::transforms::resolve_transforms;
    use burn_ndarray::NdArray;
    use tempfile::TempDir;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_prediction_argmax() {
        let p = Prediction::new(Phase::Test, 0, PathBuf::from("x.png"), 1, vec![0.2, 0.5, 0.3]);
        assert_eq!(p.y_pred, 1);
        assert!(p.is_correct());
        assert_eq!(p.confidence(), 0.5);
    }

    #[test]
    fn test_predict_all_in_disk_order() {
        let dir = TempDir::new().unwrap();
        write_image_folder(dir.path(), &["a", "b", "c"], 2, 32);
        let transforms = resolve_transforms(&[], 32).unwrap();
        let loaders = build_data_loaders(dir.path(), &transforms, 4, 0, 3).unwrap();

        let device = Default::default();
        let options = ModelOptions {
            num_classes: 3,
            feature_extract: false,
            pretrained: false,
            weights_dir: None,
        };
        let model: SqueezeNet<TestBackend> =
            create_model(lookup("squeezenet1_1").unwrap(), &options, &device).unwrap();

        let all = Predictor::<TestBackend, _>::new(&model, device, 1).predict_all(&loaders).unwrap();
        assert_eq!(all.iter().map(|p| p.phase).collect::<Vec<_>>(), Phase::ALL.to_vec());

        for phase in &all {
            let indices: Vec<usize> = phase.predictions.iter().map(|p| p.index).collect();
            assert_eq!(indices, (0..6).collect::<Vec<_>>());
            assert_eq!(phase.y_true(), vec![0, 0, 1, 1, 2, 2]);
            for p in &phase.predictions {
                let total: f32 = p.probabilities.iter().sum();
                assert!((total - 1.0).abs() < 1e-4);
            }
        }
    }
}
