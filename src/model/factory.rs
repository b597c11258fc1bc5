//! Model construction
//!
//! Every model is built at ImageNet width first, optionally filled with the
//! torchvision checkpoint, optionally frozen, and only then given its new
//! classification head. The head is therefore the only part that still
//! requires gradients under `feature_extract`.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};

use burn::{
    module::{Module, ModuleVisitor, Param},
    record::{CompactRecorder, Recorder},
    tensor::{backend::Backend, Tensor},
};
use tracing::{info, warn};

use super::pretrained::{ensure_weights, load_pretrained, weights_dir};
use super::registry::ArchitectureSpec;
use super::Architecture;
use crate::utils::{FinetuneError, ModelLoadError, Result};

/// Width of the heads stored in the torchvision checkpoints
pub const IMAGENET_CLASSES: usize = 1000;

/// File extension appended by `CompactRecorder`
pub const RECORD_EXTENSION: &str = "mpk";

/// How to build a model
#[derive(Debug, Clone)]
pub struct ModelOptions {
    pub num_classes: usize,
    /// Freeze everything except the new head(s)
    pub feature_extract: bool,
    /// Start from the ImageNet checkpoint
    pub pretrained: bool,
    /// Checkpoint cache override
    pub weights_dir: Option<PathBuf>,
}

fn build_headless<B, M>(spec: &ArchitectureSpec, pretrained: bool, feature_extract: bool, device: &B::Device) -> Result<M>
where
    B: Backend,
    M: Architecture<B>,
{
    let model = M::build(spec, IMAGENET_CLASSES, pretrained, device)?;
    Ok(if feature_extract { model.no_grad() } else { model })
}

/// Build `spec` with a `num_classes` head
pub fn create_model<B, M>(spec: &ArchitectureSpec, options: &ModelOptions, device: &B::Device) -> Result<M>
where
    B: Backend,
    M: Architecture<B>,
{
    if options.num_classes == 0 {
        return Err(FinetuneError::Model("the number of classes must be positive".into()));
    }

    let model: M = build_headless(spec, options.pretrained, options.feature_extract, device)?;
    let model = if options.pretrained {
        let dir = weights_dir(options.weights_dir.as_deref())?;
        let path = ensure_weights(spec, &dir)?;
        load_pretrained(model, spec, &path, device)?
    } else {
        model
    };

    info!(
        "Created {} (pretrained: {}, feature extract: {}, {} classes, {} parameters)",
        spec.name,
        options.pretrained,
        options.feature_extract,
        options.num_classes,
        model.num_params()
    );
    Ok(model.replace_head(options.num_classes, device))
}

/// Shapes of every float parameter, in visit order
struct ShapeCollector {
    shapes: Vec<Vec<usize>>,
}

impl<B: Backend> ModuleVisitor<B> for ShapeCollector {
    fn visit_float<const D: usize>(&mut self, param: &Param<Tensor<B, D>>) {
        self.shapes.push(param.val().dims().to_vec());
    }
}

fn param_shapes<B: Backend, M: Module<B>>(model: &M) -> Vec<Vec<usize>> {
    let mut collector = ShapeCollector { shapes: Vec::new() };
    model.visit(&mut collector);
    collector.shapes
}

/// Restore a model saved by this tool.
///
/// The network is built without pretrained weights, with the same freezing
/// as [`create_model`], and the record is loaded over it. A record written
/// for another architecture or head width is rejected: every parameter must
/// keep the shape of the freshly built network.
pub fn load_model<B, M>(
    spec: &ArchitectureSpec,
    num_classes: usize,
    feature_extract: bool,
    path: &Path,
    device: &B::Device,
) -> std::result::Result<M, ModelLoadError>
where
    B: Backend,
    M: Architecture<B>,
{
    let record_path = path.with_extension(RECORD_EXTENSION);
    if !record_path.is_file() {
        return Err(ModelLoadError::NotFound(record_path));
    }
    let record_error = |reason: String| ModelLoadError::Record {
        path: record_path.clone(),
        reason,
    };

    let fresh: M = build_headless::<B, M>(spec, false, feature_extract, device)
        .map_err(|e| record_error(e.to_string()))?
        .replace_head(num_classes, device);
    let expected = param_shapes::<B, M>(&fresh);

    let record: <M as Module<B>>::Record = Recorder::<B>::load(&CompactRecorder::new(), path.to_path_buf(), device)
        .map_err(|e| record_error(format!("{:?}", e)))?;

    // Burn asserts on mismatched block counts while loading.
    let model = catch_unwind(AssertUnwindSafe(|| fresh.load_record(record)))
        .map_err(|_| record_error(format!("layer layout does not match {}", spec.name)))?;

    let found = param_shapes::<B, M>(&model);
    if found.len() != expected.len() {
        return Err(record_error(format!(
            "record has {} parameter tensors, {} expects {}",
            found.len(),
            spec.name,
            expected.len()
        )));
    }
    if let Some((index, (got, want))) = found
        .iter()
        .zip(&expected)
        .enumerate()
        .find(|(_, (got, want))| got != want)
    {
        return Err(record_error(format!(
            "parameter {} has shape {:?}, {} expects {:?}",
            index, got, spec.name, want
        )));
    }

    if model.num_classes() != num_classes {
        return Err(record_error(format!(
            "head has {} outputs, expected {}",
            model.num_classes(),
            num_classes
        )));
    }
    Ok(model)
}

/// Load from `load_path` when given, falling back to [`create_model`]
pub fn get_model<B, M>(
    spec: &ArchitectureSpec,
    options: &ModelOptions,
    load_path: Option<&Path>,
    device: &B::Device,
) -> Result<M>
where
    B: Backend,
    M: Architecture<B>,
{
    if let Some(path) = load_path {
        info!("Loading {} from {}", spec.name, path.display());
        match load_model(spec, options.num_classes, options.feature_extract, path, device) {
            Ok(model) => return Ok(model),
            Err(e) => warn!("{}; creating a new {} instead", e, spec.name),
        }
    } else {
        info!("Creating new {} (pretrained: {})", spec.name, options.pretrained);
    }
    create_model(spec, options, device)
}

/// Save with `CompactRecorder`; returns the path actually written
pub fn save_model<B, M>(model: &M, path: &Path) -> Result<PathBuf>
where
    B: Backend,
    M: Module<B>,
{
    model
        .clone()
        .save_file(path.to_path_buf(), &CompactRecorder::new())
        .map_err(|e| FinetuneError::Record(format!("cannot save {}: {:?}", path.display(), e)))?;
    Ok(path.with_extension(RECORD_EXTENSION))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::registry::lookup;
    use crate::model::resnet::ResNet;
    use crate::model::squeezenet::SqueezeNet;
    use crate::model::ImageClassifier;
    use burn_ndarray::NdArray;
    use tempfile::TempDir;

    type TestBackend = NdArray<f32>;

    fn options(num_classes: usize, feature_extract: bool) -> ModelOptions {
        ModelOptions {
            num_classes,
            feature_extract,
            pretrained: false,
            weights_dir: None,
        }
    }

    #[test]
    fn test_create_replaces_head() {
        let device = Default::default();
        let spec = lookup("squeezenet1_1").unwrap();
        let model: SqueezeNet<TestBackend> = create_model(spec, &options(3, false), &device).unwrap();
        assert_eq!(model.num_classes(), 3);
    }

    #[test]
    fn test_zero_classes_rejected() {
        let device = Default::default();
        let spec = lookup("squeezenet1_1").unwrap();
        let result: Result<SqueezeNet<TestBackend>> = create_model(spec, &options(0, false), &device);
        assert!(matches!(result, Err(FinetuneError::Model(_))));
    }

    #[test]
    fn test_missing_load_path_falls_back_to_new_model() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("nothing-here");
        let device = Default::default();
        let spec = lookup("squeezenet1_1").unwrap();

        let loaded: std::result::Result<SqueezeNet<TestBackend>, _> =
            load_model(spec, 2, false, &missing, &device);
        assert!(matches!(loaded, Err(ModelLoadError::NotFound(_))));

        let model: SqueezeNet<TestBackend> =
            get_model(spec, &options(2, false), Some(&missing), &device).unwrap();
        assert_eq!(model.num_classes(), 2);
    }

    #[test]
    fn test_save_then_load() {
        let dir = TempDir::new().unwrap();
        let device = Default::default();
        let spec = lookup("squeezenet1_1").unwrap();
        let model: SqueezeNet<TestBackend> = create_model(spec, &options(4, false), &device).unwrap();

        let written = save_model::<TestBackend, _>(&model, &dir.path().join("run")).unwrap();
        assert_eq!(written, dir.path().join("run.mpk"));

        let loaded: SqueezeNet<TestBackend> = load_model(spec, 4, false, &written, &device).unwrap();
        let before: Vec<f32> = model.classifier.weight.val().into_data().to_vec().unwrap();
        let after: Vec<f32> = loaded.classifier.weight.val().into_data().to_vec().unwrap();
        // the record is stored at half precision
        assert!(before.iter().zip(&after).all(|(a, b)| (a - b).abs() < 1e-3));
    }

    #[test]
    fn test_corrupt_record_is_reported() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("broken.mpk");
        std::fs::write(&path, b"garbage").unwrap();
        let device = Default::default();
        let spec = lookup("squeezenet1_1").unwrap();

        let loaded: std::result::Result<SqueezeNet<TestBackend>, _> =
            load_model(spec, 2, false, &path, &device);
        assert!(matches!(loaded, Err(ModelLoadError::Record { .. })));
    }

    #[test]
    fn test_record_of_other_variant_is_rejected() {
        let dir = TempDir::new().unwrap();
        let device = Default::default();
        let v1_0 = lookup("squeezenet1_0").unwrap();
        let v1_1 = lookup("squeezenet1_1").unwrap();
        let model: SqueezeNet<TestBackend> = create_model(v1_0, &options(2, false), &device).unwrap();
        let written = save_model::<TestBackend, _>(&model, &dir.path().join("v1_0")).unwrap();

        let loaded: std::result::Result<SqueezeNet<TestBackend>, _> =
            load_model(v1_1, 2, false, &written, &device);
        match loaded {
            Err(ModelLoadError::Record { reason, .. }) => assert!(reason.contains("shape"), "{}", reason),
            other => panic!("expected a record error, got {:?}", other.map(|m| m.num_classes())),
        }

        // a different head width is caught the same way
        let loaded: std::result::Result<SqueezeNet<TestBackend>, _> =
            load_model(v1_0, 3, false, &written, &device);
        assert!(matches!(loaded, Err(ModelLoadError::Record { .. })));
    }

    #[test]
    fn test_record_with_other_block_count_falls_back() {
        let dir = TempDir::new().unwrap();
        let device = Default::default();
        let resnet18 = lookup("resnet18").unwrap();
        let resnet34 = lookup("resnet34").unwrap();
        let model: ResNet<TestBackend> = create_model(resnet18, &options(2, false), &device).unwrap();
        let written = save_model::<TestBackend, _>(&model, &dir.path().join("r18")).unwrap();

        let loaded: std::result::Result<ResNet<TestBackend>, _> =
            load_model(resnet34, 2, false, &written, &device);
        assert!(matches!(loaded, Err(ModelLoadError::Record { .. })));

        let model: ResNet<TestBackend> =
            get_model(resnet34, &options(2, false), Some(&written), &device).unwrap();
        assert_eq!(model.layer1.len(), 3);
        assert_eq!(model.num_classes(), 2);
    }
}
