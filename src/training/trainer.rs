//! Training loop
//!
//! Each epoch runs a training phase over the train split followed by an
//! evaluation phase over the test split. The weights with the best test
//! accuracy are kept and returned once all epochs are done.

use std::time::{Duration, Instant};

use burn::{
    module::{AutodiffModule, ParamId},
    nn::loss::{CrossEntropyLoss, CrossEntropyLossConfig},
    optim::{GradientsParams, Optimizer},
    tensor::{
        backend::{AutodiffBackend, Backend},
        ElementConversion, Int, Tensor,
    },
};
use indicatif::{ProgressBar, ProgressStyle};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::optim::SgdParams;
use super::scheduler::StepLr;
use crate::dataset::{DataLoaders, Phase, PhaseLoader};
use crate::model::{ClassifierOutput, ImageClassifier};
use crate::utils::logging::TrainingLogger;
use crate::utils::metrics::PhaseAccumulator;
use crate::utils::{FinetuneError, Result};

/// Weight of the auxiliary classifier loss (inception_v3)
pub const AUX_LOSS_WEIGHT: f64 = 0.4;

/// Hyperparameters of one training run
#[derive(Debug, Clone)]
pub struct TrainerConfig {
    pub epochs: usize,
    pub optimizer: SgdParams,
    pub scheduler: StepLr,
    /// Only the classification head(s) receive updates
    pub feature_extract: bool,
}

/// Loss and accuracy of one phase in one epoch
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PhaseStats {
    pub loss: f64,
    pub accuracy: f64,
}

/// One line of the training history
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpochRecord {
    pub epoch: usize,
    pub learning_rate: f64,
    pub train: PhaseStats,
    pub test: PhaseStats,
}

/// Best weights seen so far.
///
/// Starts from the initial weights at accuracy 0 and is replaced only when
/// a strictly higher accuracy is offered.
#[derive(Debug, Clone)]
pub struct BestSnapshot<M> {
    model: M,
    accuracy: f64,
    epoch: Option<usize>,
}

impl<M> BestSnapshot<M> {
    pub fn new(initial: M) -> Self {
        Self {
            model: initial,
            accuracy: 0.0,
            epoch: None,
        }
    }

    /// Keep the weights produced by `snapshot` if `accuracy` beats the best
    pub fn offer(&mut self, epoch: usize, accuracy: f64, snapshot: impl FnOnce() -> M) -> bool {
        if accuracy > self.accuracy {
            self.model = snapshot();
            self.accuracy = accuracy;
            self.epoch = Some(epoch);
            true
        } else {
            false
        }
    }

    pub fn accuracy(&self) -> f64 {
        self.accuracy
    }

    /// Epoch that produced the snapshot, `None` for the initial weights
    pub fn epoch(&self) -> Option<usize> {
        self.epoch
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn into_model(self) -> M {
        self.model
    }
}

/// Training state carried across epochs
#[derive(Debug)]
pub struct TrainingState<M> {
    pub epoch: usize,
    pub history: Vec<EpochRecord>,
    pub best: BestSnapshot<M>,
}

impl<M> TrainingState<M> {
    pub fn new(initial: M) -> Self {
        Self {
            epoch: 0,
            history: Vec::new(),
            best: BestSnapshot::new(initial),
        }
    }
}

/// What a finished run hands back
#[derive(Debug)]
pub struct TrainingOutcome<M> {
    /// Weights with the best test accuracy
    pub model: M,
    pub best_accuracy: f64,
    pub best_epoch: Option<usize>,
    pub history: Vec<EpochRecord>,
    pub elapsed: Duration,
}

fn progress_bar(phase: Phase, epoch: usize, batches: usize) -> ProgressBar {
    let pb = ProgressBar::new(batches as u64);
    let style = ProgressStyle::default_bar()
        .template("  {prefix:>12} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
        .map(|style| style.progress_chars("#>-"))
        .unwrap_or_else(|_| ProgressStyle::default_bar());
    pb.set_style(style);
    pb.set_prefix(format!("{} {}", phase, epoch + 1));
    pb
}

/// Number of rows whose argmax equals the target
fn count_correct<B: Backend>(logits: Tensor<B, 2>, targets: Tensor<B, 1, Int>) -> usize {
    let [batch, _] = logits.dims();
    let correct: i64 = logits
        .argmax(1)
        .reshape([batch])
        .equal(targets)
        .int()
        .sum()
        .into_scalar()
        .elem();
    correct as usize
}

fn empty_split(loader: &PhaseLoader) -> FinetuneError {
    FinetuneError::Dataset(format!("the {} split has no images", loader.phase()))
}

/// Primary loss plus the weighted auxiliary loss, when there is one
fn training_loss<B: Backend>(
    loss_fn: &CrossEntropyLoss<B>,
    output: ClassifierOutput<B>,
    targets: Tensor<B, 1, Int>,
) -> Tensor<B, 1> {
    let loss = loss_fn.forward(output.logits, targets.clone());
    match output.aux_logits {
        Some(aux_logits) => loss + loss_fn.forward(aux_logits, targets).mul_scalar(AUX_LOSS_WEIGHT),
        None => loss,
    }
}

/// One pass over the train split
fn train_epoch<B, M, O>(
    mut model: M,
    optimizer: &mut O,
    loader: &PhaseLoader,
    epoch: usize,
    learning_rate: f64,
    head_params: Option<&[ParamId]>,
    device: &B::Device,
) -> Result<(M, PhaseStats)>
where
    B: AutodiffBackend,
    M: ImageClassifier<B> + AutodiffModule<B>,
    O: Optimizer<M, B>,
{
    if loader.is_empty() {
        return Err(empty_split(loader));
    }

    let loss_fn = CrossEntropyLossConfig::new().init(device);
    let mut totals = PhaseAccumulator::new();
    let batches = loader.epoch_batches(epoch);
    let pb = progress_bar(loader.phase(), epoch, batches.len());

    for indices in &batches {
        let batch = loader.load_batch::<B>(indices, epoch, device)?;
        let output = model.forward_train(batch.images);
        let logits = output.logits.clone();
        let loss = training_loss(&loss_fn, output, batch.targets.clone());

        let loss_value: f64 = loss.clone().into_scalar().elem();
        if !loss_value.is_finite() {
            return Err(FinetuneError::Training(format!(
                "loss became {} in epoch {}",
                loss_value,
                epoch + 1
            )));
        }
        let correct = count_correct(logits, batch.targets);
        totals.add_batch(loss_value, indices.len(), correct);

        let mut grads = loss.backward();
        let grads = match head_params {
            Some(ids) => GradientsParams::from_params(&mut grads, &model, ids),
            None => GradientsParams::from_grads(grads, &model),
        };
        model = optimizer.step(learning_rate, model, grads);

        pb.inc(1);
        pb.set_message(format!("loss {:.4}", loss_value));
    }
    pb.finish_and_clear();

    Ok((
        model,
        PhaseStats {
            loss: totals.loss(loader.len()),
            accuracy: totals.accuracy(loader.len()),
        },
    ))
}

/// Forward-only pass over one split in the order used for `epoch`
pub fn evaluate<B, M>(model: &M, loader: &PhaseLoader, epoch: usize, device: &B::Device) -> Result<PhaseStats>
where
    B: Backend,
    M: ImageClassifier<B>,
{
    if loader.is_empty() {
        return Err(empty_split(loader));
    }

    let loss_fn = CrossEntropyLossConfig::new().init(device);
    let mut totals = PhaseAccumulator::new();
    let batches = loader.epoch_batches(epoch);
    let pb = progress_bar(loader.phase(), epoch, batches.len());

    for indices in &batches {
        let batch = loader.load_batch::<B>(indices, epoch, device)?;
        let logits = model.forward(batch.images);
        let loss: f64 = loss_fn
            .forward(logits.clone(), batch.targets.clone())
            .into_scalar()
            .elem();
        totals.add_batch(loss, indices.len(), count_correct(logits, batch.targets));
        pb.inc(1);
    }
    pb.finish_and_clear();

    Ok(PhaseStats {
        loss: totals.loss(loader.len()),
        accuracy: totals.accuracy(loader.len()),
    })
}

/// Fine-tune `model` and return the best snapshot by test accuracy
pub fn train_model<B, M>(
    model: M,
    loaders: &DataLoaders,
    config: &TrainerConfig,
    device: &B::Device,
) -> Result<TrainingOutcome<M>>
where
    B: AutodiffBackend,
    M: ImageClassifier<B> + AutodiffModule<B>,
    M::InnerModule: ImageClassifier<B::InnerBackend>,
{
    let start = Instant::now();
    let mut optimizer = config.optimizer.to_config().init::<B, M>();
    let head_params = config.feature_extract.then(|| model.head_param_ids());
    if let Some(ids) = &head_params {
        debug!("Feature extraction: updating {} head parameter tensors", ids.len());
    }

    let mut logger = TrainingLogger::new(config.epochs);
    let mut state = TrainingState::new(model.clone());
    let mut model = model;

    while state.epoch < config.epochs {
        let epoch = state.epoch;
        let learning_rate = config.scheduler.get_lr(config.optimizer.lr, epoch);
        logger.start_epoch(epoch, learning_rate);

        let (trained, train) = train_epoch(
            model,
            &mut optimizer,
            &loaders.train,
            epoch,
            learning_rate,
            head_params.as_deref(),
            device,
        )?;
        model = trained;
        logger.end_phase(Phase::Train.as_str(), train.loss, train.accuracy);

        let test = evaluate(&model.valid(), &loaders.test, epoch, device)?;
        logger.end_phase(Phase::Test.as_str(), test.loss, test.accuracy);

        if state.best.offer(epoch, test.accuracy, || model.clone()) {
            logger.log_new_best(test.accuracy);
        }

        let record = EpochRecord {
            epoch,
            learning_rate,
            train,
            test,
        };
        logger.end_epoch(&record);
        state.history.push(record);
        state.epoch += 1;
    }

    logger.log_complete(state.best.accuracy());

    Ok(TrainingOutcome {
        best_accuracy: state.best.accuracy(),
        best_epoch: state.best.epoch(),
        model: state.best.into_model(),
        history: state.history,
        elapsed: start.elapsed(),
    })
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
    use burn::backend::Autodiff;
    use burn::module::Module;
    use burn::nn::{Linear, LinearConfig};
    use burn_ndarray::NdArray;
    use tempfile::TempDir;

    type TestBackend = Autodiff<NdArray<f32>>;

    /// Mean colour of each image fed to one linear layer
    #[derive(Module, Debug)]
    struct MeanColour<B: Backend> {
        fc: Linear<B>,
    }

    impl<B: Backend> ImageClassifier<B> for MeanColour<B> {
        fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
            self.fc.forward(images.mean_dim(3).mean_dim(2).flatten(1, 3))
        }

        fn forward_train(&self, _images: Tensor<B, 4>) -> ClassifierOutput<B> {
            panic!("training forward used outside training")
        }

        fn num_classes(&self) -> usize {
            2
        }

        fn head_param_ids(&self) -> Vec<ParamId> {
            vec![self.fc.weight.id]
        }
    }

    fn image_loaders(dir: &TempDir) -> DataLoaders {
        write_image_folder(dir.path(), &["a", "b"], 3, 32);
        let transforms = resolve_transforms(&[], 32).unwrap();
        build_data_loaders(dir.path(), &transforms, 2, 0, 11).unwrap()
    }

    fn weights(tensor: Tensor<TestBackend, 4>) -> Vec<f32> {
        tensor.into_data().to_vec().unwrap()
    }

    #[test]
    fn test_best_snapshot_keeps_highest_accuracy() {
        let mut best = BestSnapshot::new(usize::MAX);
        for (epoch, accuracy) in [0.5, 0.7, 0.6, 0.9, 0.8].into_iter().enumerate() {
            best.offer(epoch, accuracy, || epoch);
        }
        assert_eq!(*best.model(), 3);
        assert_eq!(best.epoch(), Some(3));
        assert_eq!(best.accuracy(), 0.9);
    }

    #[test]
    fn test_best_snapshot_requires_strict_improvement() {
        let mut best = BestSnapshot::new("initial");
        assert!(!best.offer(0, 0.0, || "epoch 0"));
        assert!(best.offer(1, 0.5, || "epoch 1"));
        assert!(!best.offer(2, 0.5, || "epoch 2"));
        assert_eq!(best.into_model(), "epoch 1");
    }

    #[test]
    fn test_count_correct() {
        let device = Default::default();
        let logits = Tensor::<NdArray<f32>, 2>::from_floats([[0.1, 0.9], [0.8, 0.2], [0.3, 0.7]], &device);
        let targets = Tensor::<NdArray<f32>, 1, Int>::from_ints([1, 1, 1], &device);
        assert_eq!(count_correct(logits, targets), 2);
    }

    #[test]
    fn test_aux_loss_is_weighted() {
        let device = Default::default();
        let loss_fn = CrossEntropyLossConfig::new().init(&device);
        let logits = Tensor::<NdArray<f32>, 2>::from_floats([[2.0, -1.0], [0.5, 0.5]], &device);
        let aux = Tensor::<NdArray<f32>, 2>::from_floats([[-1.0, 3.0], [1.0, 0.0]], &device);
        let targets = Tensor::<NdArray<f32>, 1, Int>::from_ints([0, 1], &device);

        let scalar = |t: Tensor<NdArray<f32>, 1>| -> f64 { t.into_scalar().elem() };
        let main = scalar(loss_fn.forward(logits.clone(), targets.clone()));
        let side = scalar(loss_fn.forward(aux.clone(), targets.clone()));

        let plain = ClassifierOutput {
            logits: logits.clone(),
            aux_logits: None,
        };
        assert!((scalar(training_loss(&loss_fn, plain, targets.clone())) - main).abs() < 1e-6);

        let with_aux = ClassifierOutput {
            logits,
            aux_logits: Some(aux),
        };
        let combined = scalar(training_loss(&loss_fn, with_aux, targets));
        assert!((combined - (main + 0.4 * side)).abs() < 1e-6);
    }

    #[test]
    fn test_evaluate_uses_primary_forward_only() {
        let dir = TempDir::new().unwrap();
        let loaders = image_loaders(&dir);
        let device = Default::default();
        let model = MeanColour::<NdArray<f32>> {
            fc: LinearConfig::new(3, 2).init(&device),
        };

        let stats = evaluate(&model, &loaders.test, 0, &device).unwrap();
        assert!(stats.loss.is_finite());
        assert!((0.0..=1.0).contains(&stats.accuracy));
    }

    #[test]
    fn test_feature_extract_updates_head_only() {
        let dir = TempDir::new().unwrap();
        let loaders = image_loaders(&dir);
        let device = Default::default();
        let spec = lookup("squeezenet1_1").unwrap();
        let options = ModelOptions {
            num_classes: 2,
            feature_extract: true,
            pretrained: false,
            weights_dir: None,
        };
        let model: SqueezeNet<TestBackend> = create_model(spec, &options, &device).unwrap();
        let head = model.head_param_ids();
        let conv1_before = weights(model.conv1.weight.val());
        let head_before = weights(model.classifier.weight.val());

        let mut optimizer = SgdParams::default().to_config().init::<TestBackend, SqueezeNet<TestBackend>>();
        let (trained, stats) =
            train_epoch(model, &mut optimizer, &loaders.train, 0, 0.1, Some(&head), &device).unwrap();

        assert!(stats.loss.is_finite());
        assert_eq!(weights(trained.conv1.weight.val()), conv1_before);
        assert_ne!(weights(trained.classifier.weight.val()), head_before);
    }

    #[test]
    fn test_short_run_records_history() {
        let dir = TempDir::new().unwrap();
        let loaders = image_loaders(&dir);

        let device = Default::default();
        let spec = lookup("squeezenet1_1").unwrap();
        let options = ModelOptions {
            num_classes: 2,
            feature_extract: true,
            pretrained: false,
            weights_dir: None,
        };
        let model: SqueezeNet<TestBackend> = create_model(spec, &options, &device).unwrap();

        let config = TrainerConfig {
            epochs: 2,
            optimizer: SgdParams::default(),
            scheduler: StepLr { step_size: 1, gamma: 0.5 },
            feature_extract: true,
        };
        let outcome = train_model(model, &loaders, &config, &device).unwrap();

        assert_eq!(outcome.history.len(), 2);
        assert!((outcome.history[1].learning_rate - 0.0005).abs() < 1e-12);
        for record in &outcome.history {
            assert!(record.train.loss.is_finite());
            assert!((0.0..=1.0).contains(&record.test.accuracy));
        }
        let best = outcome.history.iter().map(|r| r.test.accuracy).fold(0.0, f64::max);
        assert_eq!(outcome.best_accuracy, best);
    }
}
