//! Metrics Module for Model Evaluation
//!
//! - Batch-size weighted loss and accuracy accumulation during training
//! - Multi-class confusion matrix
//! - One-vs-rest (multi-label) 2x2 confusion matrices per class
//! - Precision, recall, F1

use serde::{Deserialize, Serialize};

/// Running totals for one phase of one epoch.
///
/// Loss is accumulated as `mean_batch_loss * batch_len` and divided by the
/// number of items seen, so a short last batch weighs proportionally.
#[derive(Debug, Clone, Default)]
pub struct PhaseAccumulator {
    loss_sum: f64,
    correct: usize,
    seen: usize,
}

impl PhaseAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one batch
    pub fn add_batch(&mut self, mean_loss: f64, batch_len: usize, batch_correct: usize) {
        self.loss_sum += mean_loss * batch_len as f64;
        self.correct += batch_correct;
        self.seen += batch_len;
    }

    /// Epoch loss over the given phase size
    pub fn loss(&self, phase_size: usize) -> f64 {
        if phase_size == 0 {
            0.0
        } else {
            self.loss_sum / phase_size as f64
        }
    }

    /// Epoch accuracy over the given phase size
    pub fn accuracy(&self, phase_size: usize) -> f64 {
        if phase_size == 0 {
            0.0
        } else {
            self.correct as f64 / phase_size as f64
        }
    }

    pub fn seen(&self) -> usize {
        self.seen
    }

    pub fn correct(&self) -> usize {
        self.correct
    }
}

/// Evaluation metrics for one phase
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Metrics {
    /// Total number of samples evaluated
    pub total_samples: usize,

    /// Number of correct predictions
    pub correct_predictions: usize,

    /// Overall accuracy (correct / total)
    pub accuracy: f64,

    /// Top-5 accuracy, zero until probabilities are supplied
    pub top5_accuracy: f64,

    /// Macro-averaged precision over classes with support
    pub macro_precision: f64,

    /// Macro-averaged recall
    pub macro_recall: f64,

    /// Macro-averaged F1-score
    pub macro_f1: f64,

    /// Weighted F1-score (weighted by class frequency)
    pub weighted_f1: f64,

    /// Per-class metrics
    pub per_class: Vec<ClassMetrics>,

    /// Confusion matrix
    pub confusion_matrix: ConfusionMatrix,
}

impl Metrics {
    /// Build metrics from predictions and ground truth labels
    ///
    /// Pairs are truncated to the shorter slice.
    pub fn from_predictions(
        predictions: &[usize],
        ground_truth: &[usize],
        class_names: &[String],
    ) -> Self {
        let num_classes = class_names.len();
        let total_samples = predictions.len().min(ground_truth.len());

        let confusion_matrix =
            ConfusionMatrix::from_predictions(predictions, ground_truth, num_classes);

        let per_class: Vec<ClassMetrics> = class_names
            .iter()
            .enumerate()
            .map(|(class_idx, name)| {
                ClassMetrics::from_confusion_matrix(&confusion_matrix, class_idx).with_name(name)
            })
            .collect();

        if total_samples == 0 {
            return Self {
                per_class,
                confusion_matrix,
                ..Self::default()
            };
        }

        let correct_predictions = confusion_matrix.correct();
        let accuracy = correct_predictions as f64 / total_samples as f64;

        let supported: Vec<&ClassMetrics> = per_class.iter().filter(|m| m.support > 0).collect();
        let macro_avg = |f: fn(&ClassMetrics) -> f64| {
            if supported.is_empty() {
                0.0
            } else {
                supported.iter().map(|m| f(m)).sum::<f64>() / supported.len() as f64
            }
        };

        let macro_precision = macro_avg(|m| m.precision);
        let macro_recall = macro_avg(|m| m.recall);
        let macro_f1 = macro_avg(|m| m.f1);

        let total_support: usize = per_class.iter().map(|m| m.support).sum();
        let weighted_f1 = if total_support > 0 {
            per_class
                .iter()
                .map(|m| m.f1 * m.support as f64)
                .sum::<f64>()
                / total_support as f64
        } else {
            0.0
        };

        Self {
            total_samples,
            correct_predictions,
            accuracy,
            top5_accuracy: 0.0,
            macro_precision,
            macro_recall,
            macro_f1,
            weighted_f1,
            per_class,
            confusion_matrix,
        }
    }

    /// Same as [`Metrics::from_predictions`] plus top-5 accuracy
    pub fn from_predictions_with_probs(
        predictions: &[usize],
        probabilities: &[Vec<f32>],
        ground_truth: &[usize],
        class_names: &[String],
    ) -> Self {
        let mut metrics = Self::from_predictions(predictions, ground_truth, class_names);
        if metrics.total_samples == 0 {
            return metrics;
        }

        let top5_correct = probabilities
            .iter()
            .zip(ground_truth.iter())
            .filter(|(probs, &gt)| {
                let mut indexed: Vec<(usize, f32)> = probs.iter().copied().enumerate().collect();
                indexed.sort_by(|a, b| b.1.total_cmp(&a.1));
                indexed.iter().take(5).any(|(idx, _)| *idx == gt)
            })
            .count();

        metrics.top5_accuracy = top5_correct as f64 / metrics.total_samples as f64;
        metrics
    }

    /// One-vs-rest 2x2 matrices, one per class, as `[[tn, fp], [fn, tp]]`
    pub fn multilabel_confusion(&self) -> Vec<[[usize; 2]; 2]> {
        self.per_class.iter().map(ClassMetrics::binary_matrix).collect()
    }

    /// Short summary line
    pub fn summary(&self) -> String {
        format!(
            "acc {:.4} | macro F1 {:.4} | weighted F1 {:.4} | n = {}",
            self.accuracy, self.macro_f1, self.weighted_f1, self.total_samples
        )
    }
}

/// Per-class metrics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClassMetrics {
    pub class_idx: usize,
    pub class_name: Option<String>,
    pub true_positives: usize,
    pub false_positives: usize,
    pub false_negatives: usize,
    pub true_negatives: usize,

    /// TP / (TP + FP)
    pub precision: f64,

    /// TP / (TP + FN)
    pub recall: f64,

    pub f1: f64,

    /// Number of actual samples of this class
    pub support: usize,
}

impl ClassMetrics {
    /// Calculate metrics for a class from the multi-class confusion matrix
    pub fn from_confusion_matrix(cm: &ConfusionMatrix, class_idx: usize) -> Self {
        let true_positives = cm.get(class_idx, class_idx);

        // predicted as this class, actually another
        let false_positives: usize = (0..cm.num_classes)
            .filter(|&i| i != class_idx)
            .map(|i| cm.get(i, class_idx))
            .sum();

        // actually this class, predicted as another
        let false_negatives: usize = (0..cm.num_classes)
            .filter(|&i| i != class_idx)
            .map(|i| cm.get(class_idx, i))
            .sum();

        let true_negatives = cm.total() - true_positives - false_positives - false_negatives;
        let support = true_positives + false_negatives;

        let precision = ratio(true_positives, true_positives + false_positives);
        let recall = ratio(true_positives, support);
        let f1 = if precision + recall > 0.0 {
            2.0 * precision * recall / (precision + recall)
        } else {
            0.0
        };

        Self {
            class_idx,
            class_name: None,
            true_positives,
            false_positives,
            false_negatives,
            true_negatives,
            precision,
            recall,
            f1,
            support,
        }
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.class_name = Some(name.to_string());
        self
    }

    /// `[[tn, fp], [fn, tp]]`
    pub fn binary_matrix(&self) -> [[usize; 2]; 2] {
        [
            [self.true_negatives, self.false_positives],
            [self.false_negatives, self.true_positives],
        ]
    }
}

fn ratio(num: usize, den: usize) -> f64 {
    if den > 0 {
        num as f64 / den as f64
    } else {
        0.0
    }
}

/// Confusion Matrix for multi-class classification
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfusionMatrix {
    pub num_classes: usize,

    /// Row = actual, column = predicted, flat row-major
    pub matrix: Vec<usize>,
}

impl ConfusionMatrix {
    pub fn new(num_classes: usize) -> Self {
        Self {
            num_classes,
            matrix: vec![0; num_classes * num_classes],
        }
    }

    pub fn from_predictions(
        predictions: &[usize],
        ground_truth: &[usize],
        num_classes: usize,
    ) -> Self {
        let mut cm = Self::new(num_classes);

        for (&pred, &actual) in predictions.iter().zip(ground_truth.iter()) {
            cm.add(actual, pred);
        }

        cm
    }

    /// Add a single prediction, ignoring out-of-range labels
    pub fn add(&mut self, actual: usize, predicted: usize) {
        if actual < self.num_classes && predicted < self.num_classes {
            self.matrix[actual * self.num_classes + predicted] += 1;
        }
    }

    pub fn get(&self, actual: usize, predicted: usize) -> usize {
        if actual < self.num_classes && predicted < self.num_classes {
            self.matrix[actual * self.num_classes + predicted]
        } else {
            0
        }
    }

    pub fn total(&self) -> usize {
        self.matrix.iter().sum()
    }

    /// Diagonal sum
    pub fn correct(&self) -> usize {
        (0..self.num_classes).map(|i| self.get(i, i)).sum()
    }

    pub fn accuracy(&self) -> f64 {
        ratio(self.correct(), self.total())
    }

    /// Pretty print the matrix; large matrices only print totals
    pub fn display(&self, class_names: Option<&[String]>) -> String {
        let mut output = String::new();
        output.push_str("\nConfusion Matrix (rows=actual, cols=predicted):\n\n");

        let max_display = 20;
        if self.num_classes > max_display {
            output.push_str(&format!(
                "(Matrix too large to display: {}x{})\n",
                self.num_classes, self.num_classes
            ));
            output.push_str(&format!("Accuracy: {:.2}%\n", self.accuracy() * 100.0));
            return output;
        }

        let label = |i: usize, width: usize| -> String {
            match class_names.and_then(|names| names.get(i)) {
                Some(name) => name.chars().take(width).collect(),
                None => i.to_string(),
            }
        };

        output.push_str("          ");
        for col in 0..self.num_classes {
            output.push_str(&format!("{:>6}", label(col, 6)));
        }
        output.push('\n');

        for row in 0..self.num_classes {
            output.push_str(&format!("{:>8} ", label(row, 8)));
            for col in 0..self.num_classes {
                let count = self.get(row, col);
                if row == col {
                    output.push_str(&format!("[{:>4}]", count));
                } else if count > 0 {
                    output.push_str(&format!(" {:>4} ", count));
                } else {
                    output.push_str("    . ");
                }
            }
            output.push('\n');
        }

        output.push_str(&format!("\nAccuracy: {:.2}%\n", self.accuracy() * 100.0));
        output
    }
}

impl std::fmt::Display for ConfusionMatrix {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display(None))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("class_{}", i)).collect()
    }

    #[test]
    fn test_confusion_matrix() {
        let predictions = vec![0, 1, 2, 0, 1, 2, 0, 0, 2, 2];
        let ground_truth = vec![0, 1, 2, 0, 2, 2, 1, 0, 1, 2];

        let cm = ConfusionMatrix::from_predictions(&predictions, &ground_truth, 3);

        assert_eq!(cm.get(0, 0), 3);
        assert_eq!(cm.get(1, 1), 1);
        assert_eq!(cm.get(2, 2), 3);
        assert_eq!(cm.total(), 10);
        assert_eq!(cm.correct(), 7);
        assert!((cm.accuracy() - 0.7).abs() < 1e-9);
    }

    #[test]
    fn test_metrics_from_predictions() {
        let predictions = vec![0, 1, 2, 0, 1, 2, 0, 0, 2, 2];
        let ground_truth = vec![0, 1, 2, 0, 2, 2, 1, 0, 1, 2];

        let metrics = Metrics::from_predictions(&predictions, &ground_truth, &names(3));

        assert_eq!(metrics.total_samples, 10);
        assert_eq!(metrics.correct_predictions, 7);
        assert!((metrics.accuracy - 0.7).abs() < 1e-9);
        assert_eq!(metrics.per_class[2].class_name.as_deref(), Some("class_2"));
    }

    #[test]
    fn test_multilabel_confusion_matches_one_vs_rest() {
        let predictions = vec![0, 0, 0, 1, 1];
        let ground_truth = vec![0, 0, 1, 1, 0];

        let metrics = Metrics::from_predictions(&predictions, &ground_truth, &names(2));
        let mcm = metrics.multilabel_confusion();

        // class 0: TP=2, FP=1, FN=1, TN=1
        assert_eq!(mcm[0], [[1, 1], [1, 2]]);
        // class 1 is the mirror image
        assert_eq!(mcm[1], [[2, 1], [1, 1]]);
        for m in &mcm {
            assert_eq!(m[0][0] + m[0][1] + m[1][0] + m[1][1], 5);
        }
    }

    #[test]
    fn test_class_metrics() {
        let cm = ConfusionMatrix::from_predictions(&[0, 0, 0, 1, 1], &[0, 0, 1, 1, 0], 2);
        let class0 = ClassMetrics::from_confusion_matrix(&cm, 0);

        assert!((class0.precision - 2.0 / 3.0).abs() < 1e-9);
        assert!((class0.recall - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(class0.support, 3);
    }

    #[test]
    fn test_top5_with_few_classes_is_perfect() {
        let probs = vec![vec![0.1, 0.9], vec![0.8, 0.2]];
        let metrics =
            Metrics::from_predictions_with_probs(&[1, 0], &probs, &[0, 0], &names(2));
        assert!((metrics.top5_accuracy - 1.0).abs() < 1e-9);
        assert!((metrics.accuracy - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_empty_predictions() {
        let metrics = Metrics::from_predictions(&[], &[], &names(2));
        assert_eq!(metrics.total_samples, 0);
        assert_eq!(metrics.accuracy, 0.0);
        assert_eq!(metrics.per_class.len(), 2);
    }

    #[test]
    fn test_phase_accumulator_weights_by_batch_size() {
        let mut acc = PhaseAccumulator::new();
        acc.add_batch(1.0, 4, 3);
        acc.add_batch(2.0, 1, 0);

        assert_eq!(acc.seen(), 5);
        assert!((acc.loss(5) - 6.0 / 5.0).abs() < 1e-9);
        assert!((acc.accuracy(5) - 0.6).abs() < 1e-9);
        assert_eq!(acc.loss(0), 0.0);
    }
}
