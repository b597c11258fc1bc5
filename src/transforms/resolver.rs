//! Turns default and user-supplied steps into one pipeline per phase

use std::collections::{BTreeMap, HashMap, HashSet};

use image::DynamicImage;
use rand_chacha::ChaCha8Rng;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::debug;

use crate::dataset::Phase;
use crate::transforms::ops::{
    CenterCrop, Flip, ImageTensor, Interpolation, Normalize, RandomResizedCrop, Resize, Sample,
    SizeParam, Transform,
};
use crate::transforms::spec::{TransformKind, TransformSpec};
use crate::utils::{FinetuneError, Result};

/// An ordered list of steps applied to every item of one phase
#[derive(Debug, Clone, PartialEq)]
pub struct Pipeline {
    steps: Vec<Transform>,
}

impl Pipeline {
    pub fn new(steps: Vec<Transform>) -> Result<Self> {
        check_stages(&steps)?;
        Ok(Self { steps })
    }

    pub fn steps(&self) -> &[Transform] {
        &self.steps
    }

    /// Run the steps; an image left at the end is converted with `ToTensor`
    pub fn apply(&self, image: DynamicImage, rng: &mut ChaCha8Rng) -> Result<ImageTensor> {
        let sample = self
            .steps
            .iter()
            .try_fold(Sample::Image(image), |sample, step| step.apply(sample, rng))?;

        Ok(match sample {
            Sample::Tensor(tensor) => tensor,
            Sample::Image(image) => ImageTensor::from_image(&image),
        })
    }
}

/// The resolved pipelines of all three phases
#[derive(Debug, Clone, PartialEq)]
pub struct PhaseTransforms {
    pub train: Pipeline,
    pub test: Pipeline,
    pub valid: Pipeline,
}

impl PhaseTransforms {
    pub fn get(&self, phase: Phase) -> &Pipeline {
        match phase {
            Phase::Train => &self.train,
            Phase::Test => &self.test,
            Phase::Valid => &self.valid,
        }
    }
}

/// Default pipeline for a phase at the model's input size
///
/// - train: RandomResizedCrop, RandomHorizontalFlip, ToTensor, Normalize
/// - test/valid: Resize, CenterCrop, ToTensor, Normalize
pub fn default_pipeline(phase: Phase, input_size: u32) -> Pipeline {
    let steps = match phase {
        Phase::Train => vec![
            Transform::RandomResizedCrop(RandomResizedCrop {
                size: SizeParam::Edge(input_size),
                scale: [0.08, 1.0],
                ratio: [3.0 / 4.0, 4.0 / 3.0],
                interpolation: Interpolation::Bilinear,
            }),
            Transform::RandomHorizontalFlip(Flip { p: 0.5 }),
            Transform::ToTensor,
            Transform::Normalize(Normalize::imagenet()),
        ],
        Phase::Test | Phase::Valid => vec![
            Transform::Resize(Resize {
                size: SizeParam::Edge(input_size),
                interpolation: Interpolation::Bilinear,
                max_size: None,
            }),
            Transform::CenterCrop(CenterCrop {
                size: SizeParam::Edge(input_size),
            }),
            Transform::ToTensor,
            Transform::Normalize(Normalize::imagenet()),
        ],
    };
    Pipeline { steps }
}

/// Resolve user steps against the defaults.
///
/// Steps are grouped by phase and sorted by order (ties keep command-line
/// order). Order `-1` steps are left out of the pipeline but can be referenced
/// by composite steps. A phase with any user step replaces its defaults
/// entirely; other phases keep theirs.
pub fn resolve_transforms(specs: &[TransformSpec], input_size: u32) -> Result<PhaseTransforms> {
    let mut by_phase: BTreeMap<Phase, Vec<&TransformSpec>> = BTreeMap::new();
    for spec in specs {
        by_phase.entry(spec.phase).or_default().push(spec);
    }

    let mut resolve = |phase: Phase| -> Result<Pipeline> {
        match by_phase.remove(&phase) {
            Some(steps) => {
                let pipeline = resolve_phase(phase, &steps)?;
                debug!("{} pipeline overridden with {} steps", phase, pipeline.steps.len());
                Ok(pipeline)
            }
            None => Ok(default_pipeline(phase, input_size)),
        }
    };

    Ok(PhaseTransforms {
        train: resolve(Phase::Train)?,
        test: resolve(Phase::Test)?,
        valid: resolve(Phase::Valid)?,
    })
}

fn resolve_phase(phase: Phase, specs: &[&TransformSpec]) -> Result<Pipeline> {
    let mut named: HashMap<&str, &TransformSpec> = HashMap::new();
    for spec in specs {
        if named.insert(spec.name.as_str(), *spec).is_some() {
            return Err(FinetuneError::Transform(format!(
                "{}: duplicate transform name '{}'",
                phase, spec.name
            )));
        }
    }

    // Excluded steps may go unreferenced; their parameters are still checked.
    for spec in specs.iter().filter(|s| s.is_excluded()) {
        build(spec, &named, &mut HashSet::new())?;
    }

    let mut top_level: Vec<&&TransformSpec> = specs.iter().filter(|s| !s.is_excluded()).collect();
    top_level.sort_by_key(|s| s.order);

    let mut steps = Vec::with_capacity(top_level.len());
    for spec in top_level {
        let mut visiting = HashSet::new();
        steps.push(build(*spec, &named, &mut visiting)?);
    }

    Pipeline::new(steps).map_err(|e| FinetuneError::Transform(format!("{}: {}", phase, e)))
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct ComposeParams {
    transforms: Vec<String>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RandomApplyParams {
    transforms: Vec<String>,
    #[serde(default = "half")]
    p: f64,
}

fn half() -> f64 {
    0.5
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RandomChoiceParams {
    transforms: Vec<String>,
    #[serde(default)]
    p: Option<Vec<f64>>,
}

fn params<T: DeserializeOwned>(spec: &TransformSpec) -> Result<T> {
    serde_json::from_value(spec.params.clone()).map_err(|e| {
        FinetuneError::Transform(format!(
            "{} '{}': invalid parameters {}: {}",
            spec.kind, spec.name, spec.params, e
        ))
    })
}

fn build<'a>(
    spec: &'a TransformSpec,
    named: &HashMap<&str, &'a TransformSpec>,
    visiting: &mut HashSet<&'a str>,
) -> Result<Transform> {
    if !visiting.insert(spec.name.as_str()) {
        return Err(FinetuneError::Transform(format!(
            "transform '{}' references itself",
            spec.name
        )));
    }

    let mut children = |names: &[String]| -> Result<Vec<Transform>> {
        names
            .iter()
            .map(|name| {
                let child = named.get(name.as_str()).ok_or_else(|| {
                    FinetuneError::Transform(format!(
                        "{} '{}' references unknown transform '{}'",
                        spec.kind, spec.name, name
                    ))
                })?;
                build(*child, named, visiting)
            })
            .collect()
    };

    let transform = match spec.kind {
        TransformKind::Resize => Transform::Resize(params(spec)?),
        TransformKind::CenterCrop => Transform::CenterCrop(params(spec)?),
        TransformKind::RandomCrop => Transform::RandomCrop(params(spec)?),
        TransformKind::RandomResizedCrop => Transform::RandomResizedCrop(params(spec)?),
        TransformKind::RandomHorizontalFlip => Transform::RandomHorizontalFlip(params(spec)?),
        TransformKind::RandomVerticalFlip => Transform::RandomVerticalFlip(params(spec)?),
        TransformKind::RandomRotation => Transform::RandomRotation(params(spec)?),
        TransformKind::ColorJitter => Transform::ColorJitter(params(spec)?),
        TransformKind::Grayscale => Transform::Grayscale(params(spec)?),
        TransformKind::RandomGrayscale => Transform::RandomGrayscale(params(spec)?),
        TransformKind::Pad => Transform::Pad(params(spec)?),
        TransformKind::GaussianBlur => Transform::GaussianBlur(params(spec)?),
        TransformKind::Normalize => Transform::Normalize(params(spec)?),
        TransformKind::RandomErasing => Transform::RandomErasing(params(spec)?),
        TransformKind::ToTensor => {
            let _: serde_json::Map<String, serde_json::Value> = params(spec)?;
            if !spec.params.as_object().map_or(true, |m| m.is_empty()) {
                return Err(FinetuneError::Transform(format!(
                    "ToTensor '{}' takes no parameters",
                    spec.name
                )));
            }
            Transform::ToTensor
        }
        TransformKind::Compose => {
            let p: ComposeParams = params(spec)?;
            Transform::Compose(children(&p.transforms)?)
        }
        TransformKind::RandomApply => {
            let p: RandomApplyParams = params(spec)?;
            Transform::RandomApply {
                transforms: children(&p.transforms)?,
                p: p.p,
            }
        }
        TransformKind::RandomChoice => {
            let p: RandomChoiceParams = params(spec)?;
            Transform::RandomChoice {
                transforms: children(&p.transforms)?,
                weights: p.p,
            }
        }
        TransformKind::RandomOrder => {
            let p: ComposeParams = params(spec)?;
            Transform::RandomOrder(children(&p.transforms)?)
        }
    };

    visiting.remove(spec.name.as_str());
    transform
        .validate()
        .map_err(|e| FinetuneError::Transform(format!("'{}': {}", spec.name, e)))?;
    Ok(transform)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Image,
    Tensor,
}

/// Check that image steps precede `ToTensor` and tensor steps follow it
fn check_stages(steps: &[Transform]) -> Result<()> {
    steps
        .iter()
        .try_fold(Stage::Image, |stage, step| stage_after(step, stage))
        .map(|_| ())
}

fn stage_after(step: &Transform, stage: Stage) -> Result<Stage> {
    let mismatch = |what: &str| {
        Err(FinetuneError::Transform(format!(
            "{} is applied at the wrong stage ({})",
            describe(step),
            what
        )))
    };

    match step {
        Transform::ToTensor => match stage {
            Stage::Image => Ok(Stage::Tensor),
            Stage::Tensor => mismatch("input is already a tensor"),
        },
        Transform::Normalize(_) | Transform::RandomErasing(_) => match stage {
            Stage::Tensor => Ok(Stage::Tensor),
            Stage::Image => mismatch("needs a tensor, add ToTensor before it"),
        },
        Transform::Compose(inner) => inner.iter().try_fold(stage, |s, t| stage_after(t, s)),
        Transform::RandomApply { transforms, .. } | Transform::RandomOrder(transforms) => {
            for t in transforms {
                if stage_after(t, stage)? != stage {
                    return mismatch("optional or reordered steps must not convert to a tensor");
                }
            }
            Ok(stage)
        }
        Transform::RandomChoice { transforms, .. } => {
            let mut result: Option<Stage> = None;
            for t in transforms {
                let out = stage_after(t, stage)?;
                if result.is_some_and(|r| r != out) {
                    return mismatch("choices end at different stages");
                }
                result = Some(out);
            }
            Ok(result.unwrap_or(stage))
        }
        _ => match stage {
            Stage::Image => Ok(Stage::Image),
            Stage::Tensor => mismatch("needs an image, move it before ToTensor"),
        },
    }
}

fn describe(step: &Transform) -> &'static str {
    match step {
        Transform::Resize(_) => "Resize",
        Transform::CenterCrop(_) => "CenterCrop",
        Transform::RandomCrop(_) => "RandomCrop",
        Transform::RandomResizedCrop(_) => "RandomResizedCrop",
        Transform::RandomHorizontalFlip(_) => "RandomHorizontalFlip",
        Transform::RandomVerticalFlip(_) => "RandomVerticalFlip",
        Transform::RandomRotation(_) => "RandomRotation",
        Transform::ColorJitter(_) => "ColorJitter",
        Transform::Grayscale(_) => "Grayscale",
        Transform::RandomGrayscale(_) => "RandomGrayscale",
        Transform::Pad(_) => "Pad",
        Transform::GaussianBlur(_) => "GaussianBlur",
        Transform::ToTensor => "ToTensor",
        Transform::Normalize(_) => "Normalize",
        Transform::RandomErasing(_) => "RandomErasing",
        Transform::Compose(_) => "Compose",
        Transform::RandomApply { .. } => "RandomApply",
        Transform::RandomChoice { .. } => "RandomChoice",
        Transform::RandomOrder(_) => "RandomOrder",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Rgb};
    use rand::SeedableRng;

    fn step(phase: &str, kind: &str, name: &str, order: &str, params: &str) -> TransformSpec {
        let values: Vec<String> = [phase, kind, name, order, params].iter().map(|s| s.to_string()).collect();
        TransformSpec::parse(&values).unwrap()
    }

    fn image(w: u32, h: u32) -> DynamicImage {
        DynamicImage::ImageRgb8(ImageBuffer::from_pixel(w, h, Rgb([10, 200, 30])))
    }

    #[test]
    fn test_defaults_without_overrides() {
        let resolved = resolve_transforms(&[], 224).unwrap();
        assert_eq!(resolved.train, default_pipeline(Phase::Train, 224));
        assert_eq!(resolved.test, default_pipeline(Phase::Test, 224));
        assert!(matches!(resolved.train.steps()[0], Transform::RandomResizedCrop(_)));
        assert!(matches!(resolved.valid.steps()[1], Transform::CenterCrop(_)));
        assert_eq!(resolved.valid.steps().len(), 4);
    }

    #[test]
    fn test_train_override_leaves_other_phases() {
        let specs = vec![
            step("train", "ToTensor", "t", "1", "{}"),
            step("train", "Resize", "r", "0", r#"{"size": [32, 32]}"#),
        ];
        let resolved = resolve_transforms(&specs, 299).unwrap();

        assert_eq!(resolved.train.steps().len(), 2);
        assert!(matches!(resolved.train.steps()[0], Transform::Resize(_)));
        assert!(matches!(resolved.train.steps()[1], Transform::ToTensor));
        assert_eq!(resolved.test, default_pipeline(Phase::Test, 299));
        assert_eq!(resolved.valid, default_pipeline(Phase::Valid, 299));
    }

    #[test]
    fn test_excluded_steps_only_reachable_by_name() {
        let specs = vec![
            step("train", "RandomHorizontalFlip", "flip", "-1", r#"{"p": 1.0}"#),
            step("train", "RandomVerticalFlip", "vflip", "-1", "{}"),
            step("train", "RandomApply", "maybe", "0", r#"{"transforms": ["flip", "vflip"], "p": 0.3}"#),
        ];
        let resolved = resolve_transforms(&specs, 224).unwrap();
        let steps = resolved.train.steps();
        assert_eq!(steps.len(), 1);
        match &steps[0] {
            Transform::RandomApply { transforms, p } => {
                assert_eq!(transforms.len(), 2);
                assert!((p - 0.3).abs() < 1e-9);
            }
            other => panic!("unexpected step {:?}", other),
        }
    }

    #[test]
    fn test_unreferenced_excluded_step_is_validated() {
        let bad = vec![
            step("train", "Resize", "r", "0", r#"{"size": 16}"#),
            step("train", "RandomHorizontalFlip", "unused", "-1", r#"{"p": "often"}"#),
        ];
        let err = resolve_transforms(&bad, 224).unwrap_err();
        assert!(err.to_string().contains("unused"));

        let dangling = vec![
            step("valid", "Resize", "r", "0", r#"{"size": 16}"#),
            step("valid", "Compose", "spare", "-1", r#"{"transforms": ["missing"]}"#),
        ];
        assert!(resolve_transforms(&dangling, 224).is_err());

        let fine = vec![
            step("test", "Resize", "r", "0", r#"{"size": 16}"#),
            step("test", "RandomVerticalFlip", "spare", "-1", "{}"),
        ];
        let resolved = resolve_transforms(&fine, 224).unwrap();
        assert_eq!(resolved.test.steps().len(), 1);
    }

    #[test]
    fn test_unknown_reference_and_cycle() {
        let missing = vec![step("test", "Compose", "c", "0", r#"{"transforms": ["nope"]}"#)];
        let err = resolve_transforms(&missing, 224).unwrap_err();
        assert!(err.to_string().contains("nope"));

        let cycle = vec![
            step("test", "Compose", "a", "0", r#"{"transforms": ["b"]}"#),
            step("test", "Compose", "b", "-1", r#"{"transforms": ["a"]}"#),
        ];
        assert!(resolve_transforms(&cycle, 224).is_err());
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let specs = vec![
            step("valid", "Resize", "x", "0", r#"{"size": 8}"#),
            step("valid", "CenterCrop", "x", "1", r#"{"size": 8}"#),
        ];
        assert!(resolve_transforms(&specs, 224).is_err());
    }

    #[test]
    fn test_parameter_errors_fail_resolution() {
        let bad = vec![step("train", "Resize", "r", "0", r#"{"size": "big"}"#)];
        let err = resolve_transforms(&bad, 224).unwrap_err();
        assert!(err.to_string().contains("Resize"));

        let unknown_field = vec![step("train", "RandomHorizontalFlip", "f", "0", r#"{"prob": 0.5}"#)];
        assert!(resolve_transforms(&unknown_field, 224).is_err());
    }

    #[test]
    fn test_stage_order_checked() {
        let wrong = vec![
            step("train", "Normalize", "n", "0", r#"{"mean": [0.5], "std": [0.5]}"#),
            step("train", "ToTensor", "t", "1", "{}"),
        ];
        assert!(resolve_transforms(&wrong, 224).is_err());

        let flip_after_tensor = vec![
            step("train", "ToTensor", "t", "0", "{}"),
            step("train", "RandomHorizontalFlip", "f", "1", "{}"),
        ];
        assert!(resolve_transforms(&flip_after_tensor, 224).is_err());
    }

    #[test]
    fn test_pipeline_appends_to_tensor() {
        let specs = vec![step("valid", "Resize", "r", "0", r#"{"size": [12, 16]}"#)];
        let resolved = resolve_transforms(&specs, 224).unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let tensor = resolved.valid.apply(image(40, 30), &mut rng).unwrap();
        assert_eq!(tensor.shape(), [3, 12, 16]);
    }

    #[test]
    fn test_default_eval_pipeline_output() {
        let pipeline = default_pipeline(Phase::Test, 32);
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let tensor = pipeline.apply(image(64, 48), &mut rng).unwrap();
        assert_eq!(tensor.shape(), [3, 32, 32]);
        // green channel of (10, 200, 30) after ImageNet normalization
        let expected = (200.0 / 255.0 - 0.456) / 0.224;
        assert!((tensor.data[32 * 32] - expected).abs() < 1e-3);
    }
}
