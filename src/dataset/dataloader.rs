//! Seeded, parallel batch loading
//!
//! A [`PhaseLoader`] owns one split and its transform pipeline. Each epoch it
//! derives an item order (shuffled for train/test), cuts it into batches, and
//! decodes + transforms the items of a batch on a shared rayon pool. Every
//! item draws its augmentation randomness from its own RNG, seeded from
//! `(seed, phase, epoch, index)`, so results do not depend on the number of
//! workers or on scheduling.

use std::path::Path;
use std::sync::Arc;

use burn::data::dataloader::batcher::Batcher;
use burn::data::dataset::Dataset;
use burn::prelude::*;
use image::{DynamicImage, ImageReader};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use rayon::ThreadPool;
use tracing::{debug, info};

use super::burn_dataset::{check_batch_shapes, ImageBatch, ImageFolderBatcher, ImageItem};
use super::loader::{DatasetSplits, ImageFolder, ImageSample};
use super::Phase;
use crate::transforms::{PhaseTransforms, Pipeline};
use crate::utils::{mix_seed, FinetuneError, Result};

/// Salt offset separating shuffle streams from augmentation streams
const SHUFFLE_SALT: u64 = 0x5348_5546;

/// Decode an image file to RGB
pub fn decode_image(path: &Path) -> Result<DynamicImage> {
    let load_err = |e: &dyn std::fmt::Display| FinetuneError::ImageLoad(path.to_path_buf(), e.to_string());

    let img = ImageReader::open(path)
        .map_err(|e| load_err(&e))?
        .with_guessed_format()
        .map_err(|e| load_err(&e))?
        .decode()
        .map_err(|e| load_err(&e))?;

    Ok(DynamicImage::ImageRgb8(img.to_rgb8()))
}

/// Batches of one split
pub struct PhaseLoader {
    phase: Phase,
    folder: ImageFolder,
    pipeline: Pipeline,
    batch_size: usize,
    seed: u64,
    pool: Option<Arc<ThreadPool>>,
    batcher: ImageFolderBatcher,
}

impl std::fmt::Debug for PhaseLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PhaseLoader")
            .field("phase", &self.phase)
            .field("len", &self.folder.len())
            .field("batch_size", &self.batch_size)
            .field("parallel", &self.pool.is_some())
            .finish()
    }
}

impl PhaseLoader {
    pub fn new(
        phase: Phase,
        folder: ImageFolder,
        pipeline: Pipeline,
        batch_size: usize,
        seed: u64,
        pool: Option<Arc<ThreadPool>>,
    ) -> Self {
        Self {
            phase,
            folder,
            pipeline,
            batch_size: batch_size.max(1),
            seed,
            pool,
            batcher: ImageFolderBatcher::new(),
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Number of items in the split
    pub fn len(&self) -> usize {
        self.folder.len()
    }

    pub fn is_empty(&self) -> bool {
        self.folder.is_empty()
    }

    pub fn num_batches(&self) -> usize {
        self.len().div_ceil(self.batch_size)
    }

    pub fn samples(&self) -> &[ImageSample] {
        &self.folder.samples
    }

    pub fn class_names(&self) -> &[String] {
        &self.folder.class_names
    }

    /// Item order for an epoch; shuffled when the phase shuffles
    pub fn epoch_order(&self, epoch: usize) -> Vec<usize> {
        let mut order: Vec<usize> = (0..self.len()).collect();
        if self.phase.shuffles() {
            let stream = mix_seed(mix_seed(self.seed, SHUFFLE_SALT + self.phase.salt()), epoch as u64);
            let mut rng = ChaCha8Rng::seed_from_u64(stream);
            order.shuffle(&mut rng);
        }
        order
    }

    /// The epoch's item order cut into batches
    pub fn epoch_batches(&self, epoch: usize) -> Vec<Vec<usize>> {
        self.epoch_order(epoch)
            .chunks(self.batch_size)
            .map(|chunk| chunk.to_vec())
            .collect()
    }

    /// On-disk order cut into batches, regardless of the shuffle policy
    pub fn ordered_batches(&self) -> Vec<Vec<usize>> {
        (0..self.len())
            .collect::<Vec<_>>()
            .chunks(self.batch_size)
            .map(|chunk| chunk.to_vec())
            .collect()
    }

    fn item_rng(&self, epoch: usize, index: usize) -> ChaCha8Rng {
        let stream = mix_seed(mix_seed(self.seed, self.phase.salt()), epoch as u64);
        ChaCha8Rng::seed_from_u64(mix_seed(stream, index as u64))
    }

    /// Decode and transform one item
    pub fn load_item(&self, index: usize, epoch: usize) -> Result<ImageItem> {
        let sample = self.folder.get(index).ok_or_else(|| {
            FinetuneError::Dataset(format!(
                "index {} out of range for '{}' ({} items)",
                index,
                self.phase,
                self.len()
            ))
        })?;

        let image = decode_image(&sample.path)?;
        let mut rng = self.item_rng(epoch, index);
        let tensor = self.pipeline.apply(image, &mut rng).map_err(|e| {
            FinetuneError::Transform(format!("{} ({}): {}", sample.path.display(), self.phase, e))
        })?;

        Ok(ImageItem::new(tensor, sample.label, index))
    }

    /// Load items in the given order, in parallel when a pool is configured
    pub fn load_items(&self, indices: &[usize], epoch: usize) -> Result<Vec<ImageItem>> {
        match &self.pool {
            Some(pool) => pool.install(|| {
                indices
                    .par_iter()
                    .map(|&index| self.load_item(index, epoch))
                    .collect()
            }),
            None => indices
                .iter()
                .map(|&index| self.load_item(index, epoch))
                .collect(),
        }
    }

    /// Load and stack one batch on `device`
    pub fn load_batch<B: Backend>(
        &self,
        indices: &[usize],
        epoch: usize,
        device: &B::Device,
    ) -> Result<ImageBatch<B>> {
        let items = self.load_items(indices, epoch)?;
        check_batch_shapes(&items)?;
        Ok(self.batcher.batch(items, device))
    }
}

/// Loaders for all three phases
#[derive(Debug)]
pub struct DataLoaders {
    pub train: PhaseLoader,
    pub test: PhaseLoader,
    pub valid: PhaseLoader,
    /// Class names of the train split; defines the label space
    pub class_names: Vec<String>,
}

impl DataLoaders {
    pub fn get(&self, phase: Phase) -> &PhaseLoader {
        match phase {
            Phase::Train => &self.train,
            Phase::Test => &self.test,
            Phase::Valid => &self.valid,
        }
    }

    pub fn num_classes(&self) -> usize {
        self.class_names.len()
    }
}

/// Scan `data_dir` and build the per-phase loaders
pub fn build_data_loaders(
    data_dir: &Path,
    transforms: &PhaseTransforms,
    batch_size: usize,
    num_workers: usize,
    seed: u64,
) -> Result<DataLoaders> {
    if batch_size == 0 {
        return Err(FinetuneError::Config("batch size must be at least 1".into()));
    }

    let splits = DatasetSplits::load(data_dir)?;
    let class_names = splits.class_names().to_vec();

    let pool = if num_workers > 0 {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(num_workers)
            .thread_name(|i| format!("decode-{}", i))
            .build()
            .map_err(|e| FinetuneError::Config(format!("cannot start decode workers: {}", e)))?;
        Some(Arc::new(pool))
    } else {
        None
    };

    info!(
        "Data loaders: batch size {}, {} decode workers",
        batch_size, num_workers
    );

    let DatasetSplits { train, test, valid } = splits;
    let make = |phase: Phase, folder: ImageFolder| {
        debug!("{}: {} items, per class {:?}", phase, folder.len(), folder.class_distribution());
        PhaseLoader::new(
            phase,
            folder,
            transforms.get(phase).clone(),
            batch_size,
            seed,
            pool.clone(),
        )
    };

    Ok(DataLoaders {
        train: make(Phase::Train, train),
        test: make(Phase::Test, test),
        valid: make(Phase::Valid, valid),
        class_names,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::loader::tests::write_image_folder;
    use crate::transforms::{resolve_transforms, TransformSpec};
    use burn_ndarray::NdArray;
    use tempfile::TempDir;

    type TestBackend = NdArray<f32>;

    fn loaders(root: &Path, workers: usize, specs: &[TransformSpec]) -> DataLoaders {
        let transforms = resolve_transforms(specs, 8).unwrap();
        build_data_loaders(root, &transforms, 2, workers, 7).unwrap()
    }

    fn spec(values: &[&str]) -> TransformSpec {
        let values: Vec<String> = values.iter().map(|s| s.to_string()).collect();
        TransformSpec::parse(&values).unwrap()
    }

    #[test]
    fn test_batches_and_shapes() {
        let dir = TempDir::new().unwrap();
        write_image_folder(dir.path(), &["a", "b"], 3, 12);
        let loaders = loaders(dir.path(), 0, &[]);

        assert_eq!(loaders.class_names, vec!["a", "b"]);
        assert_eq!(loaders.train.len(), 6);
        assert_eq!(loaders.train.num_batches(), 3);

        let device = Default::default();
        let order = loaders.valid.epoch_batches(0);
        assert_eq!(order[0], vec![0, 1]);
        let batch = loaders.valid.load_batch::<TestBackend>(&order[0], 0, &device).unwrap();
        assert_eq!(batch.images.dims(), [2, 3, 8, 8]);
    }

    #[test]
    fn test_shuffle_is_seeded_per_epoch() {
        let dir = TempDir::new().unwrap();
        write_image_folder(dir.path(), &["a", "b"], 5, 4);
        let loaders = loaders(dir.path(), 0, &[]);

        assert_eq!(loaders.train.epoch_order(0), loaders.train.epoch_order(0));
        assert_ne!(loaders.train.epoch_order(0), loaders.train.epoch_order(1));
        assert_eq!(loaders.valid.epoch_order(3), (0..10).collect::<Vec<_>>());

        let mut sorted = loaders.test.epoch_order(2);
        sorted.sort();
        assert_eq!(sorted, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_worker_count_does_not_change_items() {
        let dir = TempDir::new().unwrap();
        write_image_folder(dir.path(), &["a", "b"], 3, 16);
        let serial = loaders(dir.path(), 0, &[]);
        let parallel = loaders(dir.path(), 3, &[]);

        let indices = serial.train.epoch_order(1);
        assert_eq!(indices, parallel.train.epoch_order(1));

        let a = serial.train.load_items(&indices, 1).unwrap();
        let b = parallel.train.load_items(&indices, 1).unwrap();
        for (x, y) in a.iter().zip(&b) {
            assert_eq!(x.index, y.index);
            assert_eq!(x.data, y.data);
        }
    }

    #[test]
    fn test_mixed_sizes_fail_to_batch() {
        let dir = TempDir::new().unwrap();
        write_image_folder(dir.path(), &["a"], 2, 6);
        image::RgbImage::new(9, 5)
            .save(dir.path().join("valid/a/002.png"))
            .unwrap();

        // A bare ToTensor keeps each image at its own size
        let loaders = loaders(dir.path(), 0, &[spec(&["valid", "ToTensor", "t", "0", "{}"])]);
        let device = Default::default();
        let result = loaders.valid.load_batch::<TestBackend>(&[1, 2], 0, &device);
        assert!(result.is_err());
    }

    #[test]
    fn test_unreadable_image_is_error() {
        let dir = TempDir::new().unwrap();
        write_image_folder(dir.path(), &["a"], 1, 4);
        std::fs::write(dir.path().join("test/a/broken.jpg"), b"not an image").unwrap();

        let loaders = loaders(dir.path(), 0, &[]);
        assert!(loaders.test.load_item(0, 0).is_ok());
        let err = loaders.test.load_item(1, 0).unwrap_err();
        assert!(matches!(err, FinetuneError::ImageLoad(..)));
    }
}
