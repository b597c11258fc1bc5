//! Image-folder loader
//!
//! Scans one split directory laid out as:
//! ```text
//! data_dir/
//! ├── train/
//! │   ├── cat/
//! │   │   ├── 001.jpg
//! │   │   └── 002.jpg
//! │   └── dog/
//! │       └── ...
//! ├── test/
//! └── valid/
//! ```
//! Classes are the sorted sub-directory names; labels are their indices.

use std::path::{Path, PathBuf};

use burn::data::dataset::Dataset;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use super::Phase;
use crate::utils::{FinetuneError, Result};

/// File extensions accepted as images (compared lowercase)
pub const IMAGE_EXTENSIONS: &[&str] = &[
    "jpg", "jpeg", "png", "ppm", "bmp", "pgm", "tif", "tiff", "webp",
];

/// A single image file with its label
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageSample {
    /// Path to the image file
    pub path: PathBuf,
    /// Class label index
    pub label: usize,
}

/// One split of an image-folder dataset, in on-disk (sorted) order
#[derive(Debug, Clone)]
pub struct ImageFolder {
    pub root: PathBuf,
    pub class_names: Vec<String>,
    pub samples: Vec<ImageSample>,
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .map(|ext| {
            let ext = ext.to_string_lossy().to_lowercase();
            IMAGE_EXTENSIONS.contains(&ext.as_str())
        })
        .unwrap_or(false)
}

impl ImageFolder {
    /// Scan a split directory
    pub fn new<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        if !root.is_dir() {
            return Err(FinetuneError::Dataset(format!(
                "split directory does not exist: {}",
                root.display()
            )));
        }

        let mut class_names: Vec<String> = Vec::new();
        for entry in std::fs::read_dir(&root)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                class_names.push(entry.file_name().to_string_lossy().to_string());
            }
        }
        class_names.sort();

        if class_names.is_empty() {
            return Err(FinetuneError::Dataset(format!(
                "no class directories in {}",
                root.display()
            )));
        }

        let mut samples = Vec::new();
        for (label, class_name) in class_names.iter().enumerate() {
            let class_dir = root.join(class_name);
            let mut files: Vec<PathBuf> = WalkDir::new(&class_dir)
                .min_depth(1)
                .follow_links(true)
                .into_iter()
                .filter_map(|e| e.ok())
                .filter(|e| e.file_type().is_file())
                .map(|e| e.into_path())
                .filter(|p| is_image(p))
                .collect();
            files.sort();

            if files.is_empty() {
                return Err(FinetuneError::Dataset(format!(
                    "class directory has no images: {}",
                    class_dir.display()
                )));
            }

            debug!("Class '{}' (label {}): {} images", class_name, label, files.len());
            samples.extend(files.into_iter().map(|path| ImageSample { path, label }));
        }

        Ok(Self {
            root,
            class_names,
            samples,
        })
    }

    pub fn num_classes(&self) -> usize {
        self.class_names.len()
    }

    /// Number of samples per class label
    pub fn class_distribution(&self) -> Vec<usize> {
        let mut counts = vec![0usize; self.num_classes()];
        for sample in &self.samples {
            counts[sample.label] += 1;
        }
        counts
    }
}

impl Dataset<ImageSample> for ImageFolder {
    fn get(&self, index: usize) -> Option<ImageSample> {
        self.samples.get(index).cloned()
    }

    fn len(&self) -> usize {
        self.samples.len()
    }
}

/// The three splits of a dataset root
#[derive(Debug, Clone)]
pub struct DatasetSplits {
    pub train: ImageFolder,
    pub test: ImageFolder,
    pub valid: ImageFolder,
}

impl DatasetSplits {
    /// Load `train`, `test` and `valid` below `data_dir`
    pub fn load<P: AsRef<Path>>(data_dir: P) -> Result<Self> {
        let data_dir = data_dir.as_ref();
        if !data_dir.is_dir() {
            return Err(FinetuneError::PathNotFound(data_dir.to_path_buf()));
        }
        info!("Loading image folders from: {:?}", data_dir);

        let train = ImageFolder::new(data_dir.join(Phase::Train.as_str()))?;
        let test = ImageFolder::new(data_dir.join(Phase::Test.as_str()))?;
        let valid = ImageFolder::new(data_dir.join(Phase::Valid.as_str()))?;

        for (phase, folder) in [(Phase::Test, &test), (Phase::Valid, &valid)] {
            if folder.class_names != train.class_names {
                warn!(
                    "Classes of '{}' differ from train ({:?} vs {:?}); labels follow each split's own order",
                    phase, folder.class_names, train.class_names
                );
            }
        }

        info!(
            "Found {} classes: {} train, {} test, {} valid images",
            train.num_classes(),
            train.len(),
            test.len(),
            valid.len()
        );

        Ok(Self { train, test, valid })
    }

    pub fn get(&self, phase: Phase) -> &ImageFolder {
        match phase {
            Phase::Train => &self.train,
            Phase::Test => &self.test,
            Phase::Valid => &self.valid,
        }
    }

    /// Class names, taken from the train split
    pub fn class_names(&self) -> &[String] {
        &self.train.class_names
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use image::{ImageBuffer, Rgb};
    use tempfile::TempDir;

    /// Write `per_class` small RGB images for each class into every split
    pub(crate) fn write_image_folder(
        root: &Path,
        classes: &[&str],
        per_class: usize,
        size: u32,
    ) {
        for phase in Phase::ALL {
            for (c, class) in classes.iter().enumerate() {
                let dir = root.join(phase.as_str()).join(class);
                std::fs::create_dir_all(&dir).unwrap();
                for i in 0..per_class {
                    let img = ImageBuffer::from_fn(size, size, |x, y| {
                        Rgb([
                            (x * 16 + c as u32 * 100) as u8,
                            (y * 16) as u8,
                            (i * 20) as u8,
                        ])
                    });
                    img.save(dir.join(format!("{:03}.png", i))).unwrap();
                }
            }
        }
    }

    #[test]
    fn test_scan_sorted_classes() {
        let dir = TempDir::new().unwrap();
        write_image_folder(dir.path(), &["zebra", "ant"], 3, 8);
        std::fs::write(dir.path().join("train/ant/notes.txt"), "skip").unwrap();

        let folder = ImageFolder::new(dir.path().join("train")).unwrap();
        assert_eq!(folder.class_names, vec!["ant", "zebra"]);
        assert_eq!(folder.len(), 6);
        assert_eq!(folder.class_distribution(), vec![3, 3]);
        assert_eq!(folder.get(0).unwrap().label, 0);
        assert!(folder.get(0).unwrap().path.ends_with("ant/000.png"));
        assert_eq!(folder.get(5).unwrap().label, 1);
    }

    #[test]
    fn test_missing_split_is_error() {
        let dir = TempDir::new().unwrap();
        write_image_folder(dir.path(), &["a", "b"], 1, 4);
        std::fs::remove_dir_all(dir.path().join("valid")).unwrap();

        let err = DatasetSplits::load(dir.path()).unwrap_err();
        assert!(matches!(err, FinetuneError::Dataset(_)));
    }

    #[test]
    fn test_empty_class_is_error() {
        let dir = TempDir::new().unwrap();
        write_image_folder(dir.path(), &["a"], 1, 4);
        std::fs::create_dir_all(dir.path().join("test/empty")).unwrap();

        assert!(ImageFolder::new(dir.path().join("test")).is_err());
    }

    #[test]
    fn test_splits_use_train_classes() {
        let dir = TempDir::new().unwrap();
        write_image_folder(dir.path(), &["a", "b"], 2, 4);

        let splits = DatasetSplits::load(dir.path()).unwrap();
        assert_eq!(splits.class_names(), &["a".to_string(), "b".to_string()]);
        assert_eq!(splits.get(Phase::Valid).len(), 4);
    }
}
