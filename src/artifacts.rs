//! Run artifacts
//!
//! Every file of one run shares the stem `vision-finetune-{ms}-{model_type}`:
//! the weights (`.mpk`), per-image predictions (`-predictions.csv`), metrics
//! (`-metrics.json`), the one-vs-rest confusion report (`-report.svg`) and
//! the accuracy history (`-history.svg`).

use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::dataset::Phase;
use crate::inference::PhasePredictions;
use crate::training::EpochRecord;
use crate::utils::charts::{generate_history_chart, save_confusion_report, ConfusionPanel, DataSeries};
use crate::utils::metrics::Metrics;
use crate::utils::Result;

/// Prefix shared by all artifact names
pub const ARTIFACT_PREFIX: &str = "vision-finetune";

/// Paths of one run's artifacts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunPaths {
    dir: PathBuf,
    timestamp_ms: i64,
    stem: String,
}

impl RunPaths {
    pub fn new(output_dir: &Path, timestamp_ms: i64, model_type: &str) -> Self {
        Self {
            dir: output_dir.to_path_buf(),
            timestamp_ms,
            stem: format!("{}-{}-{}", ARTIFACT_PREFIX, timestamp_ms, model_type),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn stem(&self) -> &str {
        &self.stem
    }

    pub fn timestamp_ms(&self) -> i64 {
        self.timestamp_ms
    }

    /// Weights path without extension; the recorder adds `.mpk`
    pub fn weights_base(&self) -> PathBuf {
        self.dir.join(&self.stem)
    }

    fn with_suffix(&self, suffix: &str) -> PathBuf {
        self.dir.join(format!("{}{}", self.stem, suffix))
    }

    pub fn predictions(&self) -> PathBuf {
        self.with_suffix("-predictions.csv")
    }

    pub fn metrics(&self) -> PathBuf {
        self.with_suffix("-metrics.json")
    }

    pub fn report(&self) -> PathBuf {
        self.with_suffix("-report.svg")
    }

    pub fn history(&self) -> PathBuf {
        self.with_suffix("-history.svg")
    }

    /// Create the output directory if needed
    pub fn ensure_dir(&self) -> Result<()> {
        fs::create_dir_all(&self.dir)?;
        Ok(())
    }
}

fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

/// Render predictions as `phase,index,path,y_true,y_pred,p_0..p_{k-1}`
pub fn predictions_csv(phases: &[PhasePredictions], num_classes: usize) -> String {
    let mut content = String::from("phase,index,path,y_true,y_pred");
    for class in 0..num_classes {
        content.push_str(&format!(",p_{}", class));
    }
    content.push('\n');

    for prediction in phases.iter().flat_map(|p| &p.predictions) {
        content.push_str(&format!(
            "{},{},{},{},{}",
            prediction.phase,
            prediction.index,
            csv_field(&prediction.path.to_string_lossy()),
            prediction.y_true,
            prediction.y_pred
        ));
        for p in &prediction.probabilities {
            content.push_str(&format!(",{:.6}", p));
        }
        content.push('\n');
    }
    content
}

pub fn save_predictions_csv(path: &Path, phases: &[PhasePredictions], num_classes: usize) -> Result<()> {
    fs::write(path, predictions_csv(phases, num_classes))?;
    Ok(())
}

/// Metrics of one phase
#[derive(Debug, Clone, Serialize)]
pub struct PhaseReport {
    pub phase: Phase,
    pub metrics: Metrics,
    /// `[[tn, fp], [fn, tp]]` per class
    pub multilabel_confusion: Vec<[[usize; 2]; 2]>,
}

impl PhaseReport {
    pub fn from_predictions(predictions: &PhasePredictions, class_names: &[String]) -> Self {
        let metrics = predictions.metrics(class_names);
        Self {
            phase: predictions.phase,
            multilabel_confusion: metrics.multilabel_confusion(),
            metrics,
        }
    }
}

/// Contents of `-metrics.json`
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub model_type: String,
    pub timestamp_ms: i64,
    pub class_names: Vec<String>,
    pub best_test_accuracy: f64,
    /// `None` when no epoch beat the initial weights
    pub best_epoch: Option<usize>,
    pub elapsed_secs: f64,
    pub history: Vec<EpochRecord>,
    pub phases: Vec<PhaseReport>,
}

pub fn save_metrics_json(path: &Path, report: &RunReport) -> Result<()> {
    fs::write(path, serde_json::to_string_pretty(report)?)?;
    Ok(())
}

/// One-vs-rest confusion panels, one per phase
pub fn save_report_svg(
    path: &Path,
    title: &str,
    phases: &[PhaseReport],
    class_names: &[String],
    figure_size: (u32, u32),
) -> Result<()> {
    let panels: Vec<ConfusionPanel> = phases
        .iter()
        .map(|report| ConfusionPanel {
            title: format!("{} (accuracy {:.4})", report.phase, report.metrics.accuracy),
            matrices: report.multilabel_confusion.clone(),
        })
        .collect();
    save_confusion_report(title, &panels, class_names, figure_size.0, figure_size.1, path)?;
    Ok(())
}

/// Train and test accuracy per epoch
pub fn save_history_svg(path: &Path, title: &str, history: &[EpochRecord]) -> Result<()> {
    let points = |f: fn(&EpochRecord) -> f64| -> Vec<(f64, f64)> {
        history.iter().map(|r| ((r.epoch + 1) as f64, f(r))).collect()
    };
    let series = [
        DataSeries::primary("train", points(|r| r.train.accuracy)),
        DataSeries::secondary("test", points(|r| r.test.accuracy)),
    ];
    generate_history_chart(title, "Accuracy", &series, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::Prediction;

    fn prediction(phase: Phase, index: usize, path: &str, y_true: usize, probabilities: Vec<f32>) -> Prediction {
        let y_pred = if probabilities[0] >= probabilities[1] { 0 } else { 1 };
        Prediction {
            phase,
            index,
            path: PathBuf::from(path),
            y_true,
            y_pred,
            probabilities,
        }
    }

    #[test]
    fn test_run_paths() {
        let paths = RunPaths::new(Path::new("/tmp/out"), 1700000000123, "resnet18");
        assert_eq!(paths.stem(), "vision-finetune-1700000000123-resnet18");
        assert_eq!(paths.weights_base(), PathBuf::from("/tmp/out/vision-finetune-1700000000123-resnet18"));
        assert_eq!(
            paths.predictions(),
            PathBuf::from("/tmp/out/vision-finetune-1700000000123-resnet18-predictions.csv")
        );
        assert!(paths.metrics().to_string_lossy().ends_with("-metrics.json"));
    }

    #[test]
    fn test_predictions_csv_layout() {
        let phases = vec![PhasePredictions {
            phase: Phase::Valid,
            predictions: vec![
                prediction(Phase::Valid, 0, "/d/valid/a/1.png", 0, vec![0.75, 0.25]),
                prediction(Phase::Valid, 1, "/d/valid/b/odd,name.png", 1, vec![0.5, 0.5]),
            ],
        }];
        let csv = predictions_csv(&phases, 2);
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines[0], "phase,index,path,y_true,y_pred,p_0,p_1");
        assert_eq!(lines[1], "valid,0,/d/valid/a/1.png,0,0,0.750000,0.250000");
        assert_eq!(lines[2], "valid,1,\"/d/valid/b/odd,name.png\",1,0,0.500000,0.500000");
    }

    #[test]
    fn test_phase_report_multilabel() {
        let predictions = PhasePredictions {
            phase: Phase::Test,
            predictions: vec![
                prediction(Phase::Test, 0, "a", 0, vec![0.9, 0.1]),
                prediction(Phase::Test, 1, "b", 1, vec![0.8, 0.2]),
                prediction(Phase::Test, 2, "c", 1, vec![0.1, 0.9]),
            ],
        };
        let names = vec!["a".to_string(), "b".to_string()];
        let report = PhaseReport::from_predictions(&predictions, &names);
        // class 0: tp 1, fp 1, fn 0, tn 1
        assert_eq!(report.multilabel_confusion[0], [[1, 1], [0, 1]]);
        // class 1: tp 1, fp 0, fn 1, tn 1
        assert_eq!(report.multilabel_confusion[1], [[1, 0], [1, 1]]);
        assert!((report.metrics.accuracy - 2.0 / 3.0).abs() < 1e-9);
    }
}
