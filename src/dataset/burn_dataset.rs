//! Burn integration for transformed images
//!
//! Items reach the batcher already transformed (and normalised) by their
//! phase pipeline, so batching is only stacking plus label conversion.

use burn::data::dataloader::batcher::Batcher;
use burn::prelude::*;

use crate::transforms::ImageTensor;
use crate::utils::{FinetuneError, Result};

/// A single transformed image ready for Burn
#[derive(Clone, Debug)]
pub struct ImageItem {
    /// Pixel data in CHW order
    pub data: Vec<f32>,
    /// `[channels, height, width]`
    pub shape: [usize; 3],
    /// Class label
    pub label: usize,
    /// Position of the item in its split (on-disk order)
    pub index: usize,
}

impl ImageItem {
    pub fn new(tensor: ImageTensor, label: usize, index: usize) -> Self {
        let shape = tensor.shape();
        Self {
            data: tensor.data,
            shape,
            label,
            index,
        }
    }
}

/// A batch of images for training or evaluation
#[derive(Clone, Debug)]
pub struct ImageBatch<B: Backend> {
    /// `[batch_size, channels, height, width]`
    pub images: Tensor<B, 4>,
    /// `[batch_size]`
    pub targets: Tensor<B, 1, Int>,
    /// Split positions of the items, in batch order
    pub indices: Vec<usize>,
}

/// Fail if the items of one batch do not share a shape
pub fn check_batch_shapes(items: &[ImageItem]) -> Result<[usize; 3]> {
    let first = items
        .first()
        .ok_or_else(|| FinetuneError::Dataset("cannot batch zero items".into()))?;

    if let Some(other) = items.iter().find(|item| item.shape != first.shape) {
        return Err(FinetuneError::Dataset(format!(
            "images in one batch have different shapes: item {} is {:?}, item {} is {:?}; \
             add a Resize/CenterCrop step so every image ends up the same size",
            first.index, first.shape, other.index, other.shape
        )));
    }
    Ok(first.shape)
}

/// Stacks [`ImageItem`]s of identical shape
#[derive(Clone, Debug, Default)]
pub struct ImageFolderBatcher;

impl ImageFolderBatcher {
    pub fn new() -> Self {
        Self
    }
}

impl<B: Backend> Batcher<B, ImageItem, ImageBatch<B>> for ImageFolderBatcher {
    fn batch(&self, items: Vec<ImageItem>, device: &B::Device) -> ImageBatch<B> {
        let batch_size = items.len();
        let [channels, height, width] = items.first().map(|item| item.shape).unwrap_or([3, 0, 0]);

        let indices: Vec<usize> = items.iter().map(|item| item.index).collect();
        let targets_data: Vec<i64> = items.iter().map(|item| item.label as i64).collect();
        let images_data: Vec<f32> = items.into_iter().flat_map(|item| item.data).collect();

        let images = Tensor::<B, 4>::from_floats(
            TensorData::new(images_data, [batch_size, channels, height, width]),
            device,
        );
        let targets =
            Tensor::<B, 1, Int>::from_data(TensorData::new(targets_data, [batch_size]), device);

        ImageBatch {
            images,
            targets,
            indices,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    fn item(label: usize, index: usize, shape: [usize; 3]) -> ImageItem {
        let len = shape.iter().product();
        ImageItem {
            data: vec![index as f32; len],
            shape,
            label,
            index,
        }
    }

    #[test]
    fn test_batch_stacks_items() {
        let device = Default::default();
        let items = vec![item(1, 0, [3, 2, 2]), item(0, 1, [3, 2, 2])];
        check_batch_shapes(&items).unwrap();

        let batch: ImageBatch<TestBackend> = ImageFolderBatcher::new().batch(items, &device);
        assert_eq!(batch.images.dims(), [2, 3, 2, 2]);
        assert_eq!(batch.indices, vec![0, 1]);

        let targets: Vec<i64> = batch.targets.into_data().convert::<i64>().to_vec().unwrap();
        assert_eq!(targets, vec![1, 0]);

        let values: Vec<f32> = batch.images.into_data().to_vec().unwrap();
        assert_eq!(values[0], 0.0);
        assert_eq!(values[12], 1.0);
    }

    #[test]
    fn test_mismatched_shapes_rejected() {
        let items = vec![item(0, 0, [3, 4, 4]), item(0, 1, [3, 4, 5])];
        let err = check_batch_shapes(&items).unwrap_err();
        assert!(err.to_string().contains("different shapes"));
        assert!(check_batch_shapes(&[]).is_err());
    }
}
